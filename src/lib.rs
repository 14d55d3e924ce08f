//! Netxfer Core Library
//!
//! A multi-protocol transfer engine. A [`Session`] owns a bounded pool of
//! reusable connections and drives single transfers over HTTP(S), FTP(S),
//! TELNET, DICT, LDAP, GOPHER and local files through one per-protocol
//! operation table.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - Session options and their validation
//! - [`connection`] - Connection records, the pool and TLS state
//! - [`protocol`] - Protocol flags, handlers and the operation table
//! - [`transfer`] - Dispatcher, buffers, progress and caller hooks
//! - [`session`] - The owning handle that ties everything together
//! - [`resolve`] - Host name resolution seam
//! - [`target`] - Parsed URL descriptors and credentials
//! - [`error`] - Transfer error taxonomy

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod resolve;
pub mod session;
pub mod target;
pub mod transfer;
mod user_agent;

// Re-export commonly used types
pub use config::{ConfigError, FtpOptions, PoolConfig, ProxyConfig, RequestMethod, SessionConfig};
pub use connection::{ClosurePolicy, ConnectionPool, PoolStats, SslConfig, TlsVersion};
pub use error::{Phase, TransferError};
pub use protocol::{DoOutcome, Protocol, ProtocolError, ProtocolHandler, ProtocolRegistry};
pub use resolve::{AddressResolver, StaticResolver, SystemResolver};
pub use session::Session;
pub use target::{Credentials, Target};
pub use transfer::{CancelHandle, Milestone, ProgressSnapshot, TransferHooks, TransferOutcome};
