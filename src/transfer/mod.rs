//! Transfer orchestration and per-transfer state.
//!
//! # Architecture
//!
//! - [`Dispatcher`] - Drives one transfer through resolve, connect, protocol
//!   connect, do and done, following redirects
//! - [`TransferContext`] - What protocol operations see of the transfer
//! - [`Progress`] / [`ProgressSnapshot`] - Byte counters, timings and speed
//! - [`TransferBuffers`] - Header buffer plus download and upload buffers
//! - [`TransferHooks`] - Caller callbacks
//! - [`CancelHandle`] - Aborts the in-flight transfer from another task

mod buffer;
mod context;
mod dispatch;
mod hooks;
mod progress;
mod request;

pub use buffer::{BufferOverflow, HeaderBuffer, PayloadBuffer, TransferBuffers};
pub use context::TransferContext;
pub use dispatch::{CancelHandle, Dispatcher, TransferOutcome};
pub use hooks::{PasswordFn, ProgressFn, ReadFn, TransferHooks, WriteFn};
pub use progress::{Milestone, Progress, ProgressSnapshot};
pub use request::HopRequest;

#[cfg(test)]
pub(crate) use context::bench;
