//! Protocol flags, per-connection protocol state and the operation table.
//!
//! # Architecture
//!
//! - [`Protocol`] - Flag naming the wire protocol a connection speaks
//! - [`ProtocolPayload`] - Per-connection protocol state, one variant per flag
//! - [`ProtocolHandler`] - Async trait with the five per-protocol operations
//! - [`ProtocolRegistry`] - Maps each flag to its handler
//!
//! The dispatcher invokes handler operations in a fixed order:
//! `connect` once per fresh connection, then `perform` and `done` once per
//! transfer, and `disconnect` followed by `close` at teardown.

mod dict;
mod error;
mod file;
mod ftp;
mod gopher;
mod http;
mod ldap;
mod registry;
mod telnet;
mod wire;

pub use dict::{DictHandler, DictState};
pub use error::{ProtocolError, SUBCODE_IO, SUBCODE_MALFORMED, SUBCODE_UNSUPPORTED};
pub use file::{FileHandler, FileState};
pub use ftp::{FtpHandler, FtpState};
pub use gopher::{GopherHandler, GopherState};
pub use http::{HttpHandler, HttpState};
pub use ldap::{LdapHandler, LdapState};
pub use registry::ProtocolRegistry;
pub use telnet::{TelnetHandler, TelnetState};

use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::transfer::TransferContext;

/// Wire protocol of a connection. Fixed when the connection is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTP/1.x over TCP.
    Http,
    /// HTTP/1.x over TLS.
    Https,
    /// FTP with a passive data connection.
    Ftp,
    /// FTP over implicit TLS.
    Ftps,
    /// TELNET raw relay.
    Telnet,
    /// DICT dictionary lookups.
    Dict,
    /// LDAP search.
    Ldap,
    /// GOPHER selector retrieval.
    Gopher,
    /// Local file access.
    File,
}

impl Protocol {
    /// Every protocol flag.
    pub const ALL: [Self; 9] = [
        Self::Http,
        Self::Https,
        Self::Ftp,
        Self::Ftps,
        Self::Telnet,
        Self::Dict,
        Self::Ldap,
        Self::Gopher,
        Self::File,
    ];

    /// Maps a URL scheme (case-insensitive) to its flag.
    #[must_use]
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.scheme().eq_ignore_ascii_case(scheme))
    }

    /// URL scheme for this flag.
    #[must_use]
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Ftp => "ftp",
            Self::Ftps => "ftps",
            Self::Telnet => "telnet",
            Self::Dict => "dict",
            Self::Ldap => "ldap",
            Self::Gopher => "gopher",
            Self::File => "file",
        }
    }

    /// Well-known port; 0 for local files.
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
            Self::Ftp => 21,
            Self::Ftps => 990,
            Self::Telnet => 23,
            Self::Dict => 2628,
            Self::Ldap => 389,
            Self::Gopher => 70,
            Self::File => 0,
        }
    }

    /// True when the primary channel runs over TLS.
    #[must_use]
    pub fn is_encrypted(self) -> bool {
        matches!(self, Self::Https | Self::Ftps)
    }

    /// False for protocols with no socket.
    #[must_use]
    pub fn uses_network(self) -> bool {
        !matches!(self, Self::File)
    }

    /// True when requests may be routed through an HTTP proxy.
    #[must_use]
    pub fn supports_proxy(self) -> bool {
        matches!(self, Self::Http)
    }

    /// Eviction priority under the protocol-aware closure policy.
    ///
    /// Lower ranks are evicted first; connections that are expensive to
    /// re-establish (login, handshake) rank higher.
    #[must_use]
    pub fn eviction_rank(self) -> u8 {
        match self {
            Self::File | Self::Telnet | Self::Dict | Self::Gopher | Self::Ldap => 0,
            Self::Http => 1,
            Self::Ftp => 2,
            Self::Https | Self::Ftps => 3,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.scheme().to_ascii_uppercase())
    }
}

/// Per-connection protocol state. The variant always matches the
/// connection's [`Protocol`] flag.
#[derive(Debug)]
pub enum ProtocolPayload {
    /// HTTP state.
    Http(HttpState),
    /// HTTPS state.
    Https(HttpState),
    /// FTP control-channel state.
    Ftp(FtpState),
    /// FTPS control-channel state.
    Ftps(FtpState),
    /// TELNET negotiation state.
    Telnet(TelnetState),
    /// DICT state.
    Dict(DictState),
    /// LDAP session state.
    Ldap(LdapState),
    /// GOPHER state.
    Gopher(GopherState),
    /// Open local file.
    File(FileState),
}

impl ProtocolPayload {
    /// Creates the initial payload for a protocol.
    #[must_use]
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Http => Self::Http(HttpState::default()),
            Protocol::Https => Self::Https(HttpState::default()),
            Protocol::Ftp => Self::Ftp(FtpState::default()),
            Protocol::Ftps => Self::Ftps(FtpState::default()),
            Protocol::Telnet => Self::Telnet(TelnetState::default()),
            Protocol::Dict => Self::Dict(DictState::default()),
            Protocol::Ldap => Self::Ldap(LdapState::default()),
            Protocol::Gopher => Self::Gopher(GopherState::default()),
            Protocol::File => Self::File(FileState::default()),
        }
    }

    /// Flag matching the live variant.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Http(_) => Protocol::Http,
            Self::Https(_) => Protocol::Https,
            Self::Ftp(_) => Protocol::Ftp,
            Self::Ftps(_) => Protocol::Ftps,
            Self::Telnet(_) => Protocol::Telnet,
            Self::Dict(_) => Protocol::Dict,
            Self::Ldap(_) => Protocol::Ldap,
            Self::Gopher(_) => Protocol::Gopher,
            Self::File(_) => Protocol::File,
        }
    }
}

/// What one `perform` produced besides the delivered payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DoOutcome {
    /// Protocol reply code (HTTP status, final FTP reply, DICT status).
    pub response_code: Option<u32>,
    /// Redirect location, when the reply carries one.
    pub location: Option<String>,
    /// Remote modification time, when requested and reported.
    pub filetime: Option<SystemTime>,
}

/// The per-protocol operation set.
///
/// `connect` and `perform` failures abort the transfer. Failures from
/// `done`, `disconnect` and `close` are logged by the caller and never
/// escalated.
#[async_trait]
pub trait ProtocolHandler: Send + Sync + fmt::Debug {
    /// Short handler name for logs.
    fn name(&self) -> &'static str;

    /// Runs once on a fresh connection after the socket (and TLS) is up.
    async fn connect(
        &self,
        _conn: &mut Connection,
        _ctx: &mut TransferContext<'_>,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Performs one request/response cycle.
    async fn perform(
        &self,
        conn: &mut Connection,
        ctx: &mut TransferContext<'_>,
    ) -> Result<DoOutcome, ProtocolError>;

    /// Finalizes the transfer. Runs exactly once after `perform`, whatever
    /// its result.
    async fn done(
        &self,
        _conn: &mut Connection,
        _ctx: &mut TransferContext<'_>,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Says goodbye to the peer before the connection is torn down.
    async fn disconnect(&self, _conn: &mut Connection) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Releases protocol resources after `disconnect`.
    async fn close(&self, _conn: &mut Connection) -> Result<(), ProtocolError> {
        Ok(())
    }
}
