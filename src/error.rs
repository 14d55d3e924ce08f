//! Caller-visible error type for transfers.
//!
//! Every [`TransferError`] records the dispatcher [`Phase`] it happened in,
//! the [`Protocol`] involved when one is known, and a numeric subcode where
//! the underlying failure has one (protocol reply code, certificate
//! verification result, OS error number).

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::protocol::{Protocol, ProtocolError};
use crate::transfer::BufferOverflow;

/// Dispatcher states. Errors carry the state they were raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Target parsing, pool lookup and address resolution.
    Resolving,
    /// TCP connect and TLS handshake.
    Connecting,
    /// Protocol `connect` operation (login, greeting).
    ProtocolConnecting,
    /// Protocol `do` operation (one request/response cycle).
    Doing,
    /// Transfer finished; `done` is running.
    Done,
    /// Transfer failed; cleanup is running.
    Failed,
    /// Slot released.
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Resolving => "resolving",
            Self::Connecting => "connecting",
            Self::ProtocolConnecting => "protocol_connecting",
            Self::Doing => "doing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        write!(f, "{label}")
    }
}

/// Errors returned by session transfers and pool operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The target URL could not be parsed.
    #[error("invalid target {url}: {reason}")]
    InvalidTarget {
        /// The offending URL.
        url: String,
        /// Why parsing failed.
        reason: String,
    },

    /// The URL scheme has no protocol flag or no registered handler.
    #[error("unsupported protocol scheme '{scheme}'")]
    UnsupportedProtocol {
        /// The scheme as written in the URL.
        scheme: String,
    },

    /// Host name could not be resolved to any address.
    #[error("could not resolve host {host}:{port} ({protocol})")]
    Resolution {
        /// Host that failed to resolve.
        host: String,
        /// Port requested.
        port: u16,
        /// Protocol of the transfer.
        protocol: Protocol,
        /// Underlying resolver error, when there was one.
        #[source]
        source: Option<std::io::Error>,
    },

    /// TCP connection could not be established to any candidate address.
    #[error("failed to connect to {host}:{port} ({protocol}): {source}")]
    Connect {
        /// Host being connected to.
        host: String,
        /// Port being connected to.
        port: u16,
        /// Protocol of the transfer.
        protocol: Protocol,
        /// Last connect error.
        #[source]
        source: std::io::Error,
    },

    /// Trust anchors, client certificate or randomness source failed to load.
    #[error("TLS configuration error ({protocol}): {reason}")]
    TlsConfig {
        /// Protocol of the transfer.
        protocol: Protocol,
        /// What failed to load.
        reason: String,
    },

    /// TLS handshake failed (verification failure, protocol mismatch, peer abort).
    #[error("TLS handshake with {host} failed ({protocol}, verify result {verify_result}): {reason}")]
    TlsHandshake {
        /// Host the handshake was attempted with.
        host: String,
        /// Protocol of the transfer.
        protocol: Protocol,
        /// Certificate verification result code (0 when verification itself passed).
        verify_result: i64,
        /// Handshake failure description.
        reason: String,
    },

    /// The protocol `connect` operation failed.
    #[error("{protocol} connect failed: {source}")]
    ProtocolConnect {
        /// Protocol of the transfer.
        protocol: Protocol,
        /// Failure reported by the protocol handler.
        #[source]
        source: ProtocolError,
    },

    /// The protocol `do` operation failed.
    #[error("{protocol} transfer failed: {source}")]
    ProtocolDo {
        /// Protocol of the transfer.
        protocol: Protocol,
        /// Failure reported by the protocol handler.
        #[source]
        source: ProtocolError,
    },

    /// Every pool slot is busy; nothing can be evicted.
    #[error("connection pool exhausted: all {capacity} slots are busy")]
    PoolExhausted {
        /// Pool capacity at the time of the request.
        capacity: usize,
    },

    /// A connection index no longer refers to a busy slot.
    #[error("connection index {index} does not refer to a busy slot")]
    StaleIndex {
        /// The stale index.
        index: usize,
    },

    /// A single incoming chunk exceeded a buffer's hard cap.
    #[error("{protocol} buffer overflow: {source}")]
    BufferOverflow {
        /// Protocol of the transfer.
        protocol: Protocol,
        /// Sizes involved.
        #[source]
        source: BufferOverflow,
    },

    /// Redirect chain exceeded the configured maximum.
    #[error("maximum ({max}) redirects followed, refusing redirect to {url}")]
    TooManyRedirects {
        /// Configured maximum.
        max: u32,
        /// Location that would have been followed next.
        url: String,
    },

    /// A connect-phase, overall or low-speed timer expired.
    #[error("operation timed out after {limit:?} while {phase}")]
    Timeout {
        /// Phase that was running when the timer expired.
        phase: Phase,
        /// Protocol of the transfer, when known.
        protocol: Option<Protocol>,
        /// The limit that expired.
        limit: Duration,
    },

    /// The transfer was cancelled by the caller or by the progress callback.
    #[error("transfer cancelled while {phase}")]
    Cancelled {
        /// Phase that was running when cancellation was observed.
        phase: Phase,
        /// Protocol of the transfer, when known.
        protocol: Option<Protocol>,
    },
}

impl TransferError {
    /// Creates an invalid-target error.
    pub fn invalid_target(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an unsupported-protocol error.
    pub fn unsupported_protocol(scheme: impl Into<String>) -> Self {
        Self::UnsupportedProtocol {
            scheme: scheme.into(),
        }
    }

    /// Creates a resolution error.
    pub fn resolution(
        host: impl Into<String>,
        port: u16,
        protocol: Protocol,
        source: Option<std::io::Error>,
    ) -> Self {
        Self::Resolution {
            host: host.into(),
            port,
            protocol,
            source,
        }
    }

    /// Creates a connect error.
    pub fn connect(
        host: impl Into<String>,
        port: u16,
        protocol: Protocol,
        source: std::io::Error,
    ) -> Self {
        Self::Connect {
            host: host.into(),
            port,
            protocol,
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(phase: Phase, protocol: Option<Protocol>, limit: Duration) -> Self {
        Self::Timeout {
            phase,
            protocol,
            limit,
        }
    }

    /// Creates a cancellation error.
    pub fn cancelled(phase: Phase, protocol: Option<Protocol>) -> Self {
        Self::Cancelled { phase, protocol }
    }

    /// Wraps a protocol handler failure raised by `connect` or `do`.
    ///
    /// Buffer overflows, callback aborts and low-speed failures keep their own
    /// taxonomy entries instead of collapsing into a protocol error.
    pub fn from_protocol(phase: Phase, protocol: Protocol, error: ProtocolError) -> Self {
        match error {
            ProtocolError::Overflow(source) => Self::BufferOverflow { protocol, source },
            ProtocolError::Aborted => Self::cancelled(phase, Some(protocol)),
            ProtocolError::TooSlow { window, .. } => {
                Self::timeout(phase, Some(protocol), window)
            }
            source if phase == Phase::ProtocolConnecting => {
                Self::ProtocolConnect { protocol, source }
            }
            source => Self::ProtocolDo { protocol, source },
        }
    }

    /// Returns the dispatcher phase this error was raised in.
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::InvalidTarget { .. }
            | Self::UnsupportedProtocol { .. }
            | Self::Resolution { .. }
            | Self::TooManyRedirects { .. } => Phase::Resolving,
            Self::Connect { .. }
            | Self::TlsConfig { .. }
            | Self::TlsHandshake { .. }
            | Self::PoolExhausted { .. }
            | Self::StaleIndex { .. } => Phase::Connecting,
            Self::ProtocolConnect { .. } => Phase::ProtocolConnecting,
            Self::ProtocolDo { .. } | Self::BufferOverflow { .. } => Phase::Doing,
            Self::Timeout { phase, .. } | Self::Cancelled { phase, .. } => *phase,
        }
    }

    /// Returns the protocol involved, when known.
    #[must_use]
    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            Self::Resolution { protocol, .. }
            | Self::Connect { protocol, .. }
            | Self::TlsConfig { protocol, .. }
            | Self::TlsHandshake { protocol, .. }
            | Self::ProtocolConnect { protocol, .. }
            | Self::ProtocolDo { protocol, .. }
            | Self::BufferOverflow { protocol, .. } => Some(*protocol),
            Self::Timeout { protocol, .. } | Self::Cancelled { protocol, .. } => *protocol,
            Self::InvalidTarget { .. }
            | Self::UnsupportedProtocol { .. }
            | Self::PoolExhausted { .. }
            | Self::StaleIndex { .. }
            | Self::TooManyRedirects { .. } => None,
        }
    }

    /// Returns the numeric subcode of the underlying failure, when it has one.
    ///
    /// Protocol failures report their reply code (HTTP status, FTP reply,
    /// LDAP result code), TLS handshake failures their verification result,
    /// connect failures the OS error number.
    #[must_use]
    pub fn subcode(&self) -> Option<i64> {
        match self {
            Self::ProtocolConnect { source, .. } | Self::ProtocolDo { source, .. } => {
                Some(source.subcode())
            }
            Self::TlsHandshake { verify_result, .. } => Some(*verify_result),
            Self::Connect { source, .. } => source.raw_os_error().map(i64::from),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display_labels() {
        assert_eq!(Phase::Resolving.to_string(), "resolving");
        assert_eq!(Phase::ProtocolConnecting.to_string(), "protocol_connecting");
        assert_eq!(Phase::Closed.to_string(), "closed");
    }

    #[test]
    fn test_pool_exhausted_display_and_context() {
        let error = TransferError::PoolExhausted { capacity: 2 };
        let msg = error.to_string();
        assert!(msg.contains("exhausted"), "Expected 'exhausted' in: {msg}");
        assert!(msg.contains('2'), "Expected capacity in: {msg}");
        assert_eq!(error.phase(), Phase::Connecting);
        assert_eq!(error.protocol(), None);
        assert_eq!(error.subcode(), None);
    }

    #[test]
    fn test_protocol_do_carries_reply_subcode() {
        let error = TransferError::from_protocol(
            Phase::Doing,
            Protocol::Http,
            ProtocolError::reply(404, "Not Found"),
        );
        assert!(matches!(error, TransferError::ProtocolDo { .. }));
        assert_eq!(error.phase(), Phase::Doing);
        assert_eq!(error.protocol(), Some(Protocol::Http));
        assert_eq!(error.subcode(), Some(404));
    }

    #[test]
    fn test_protocol_connect_phase_mapping() {
        let error = TransferError::from_protocol(
            Phase::ProtocolConnecting,
            Protocol::Ftp,
            ProtocolError::reply(530, "Login incorrect"),
        );
        assert!(matches!(error, TransferError::ProtocolConnect { .. }));
        assert_eq!(error.phase(), Phase::ProtocolConnecting);
        assert_eq!(error.subcode(), Some(530));
    }

    #[test]
    fn test_overflow_keeps_own_taxonomy_entry() {
        let error = TransferError::from_protocol(
            Phase::Doing,
            Protocol::Http,
            ProtocolError::Overflow(BufferOverflow {
                requested: 200_000,
                hard_cap: 102_400,
            }),
        );
        assert!(matches!(error, TransferError::BufferOverflow { .. }));
        assert_eq!(error.phase(), Phase::Doing);
    }

    #[test]
    fn test_callback_abort_becomes_cancelled() {
        let error = TransferError::from_protocol(Phase::Doing, Protocol::Ftp, ProtocolError::Aborted);
        assert!(matches!(
            error,
            TransferError::Cancelled {
                phase: Phase::Doing,
                protocol: Some(Protocol::Ftp)
            }
        ));
    }

    #[test]
    fn test_tls_handshake_subcode_is_verify_result() {
        let error = TransferError::TlsHandshake {
            host: "example.com".to_string(),
            protocol: Protocol::Https,
            verify_result: 20,
            reason: "unknown issuer".to_string(),
        };
        assert_eq!(error.subcode(), Some(20));
        assert!(error.to_string().contains("verify result 20"));
    }

    #[test]
    fn test_too_many_redirects_display() {
        let error = TransferError::TooManyRedirects {
            max: 3,
            url: "http://example.com/r4".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains('3'), "Expected max in: {msg}");
        assert!(msg.contains("/r4"), "Expected URL in: {msg}");
        assert_eq!(error.phase(), Phase::Resolving);
    }
}
