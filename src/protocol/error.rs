//! Error type returned by protocol operations.

use std::time::Duration;

use thiserror::Error;

use crate::transfer::BufferOverflow;

/// Subcode reported for local I/O failures.
pub const SUBCODE_IO: i64 = -1;

/// Subcode reported for malformed or truncated peer responses.
pub const SUBCODE_MALFORMED: i64 = -2;

/// Subcode reported for requests the handler cannot express.
pub const SUBCODE_UNSUPPORTED: i64 = -3;

/// Failure raised by a [`ProtocolHandler`](super::ProtocolHandler) operation.
///
/// The dispatcher wraps these into [`TransferError`](crate::TransferError)
/// with phase and protocol context.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer answered with a reply code the operation cannot accept.
    #[error("unexpected reply {code}: {message}")]
    Reply {
        /// Protocol reply code (HTTP status, FTP reply, LDAP result code).
        code: u32,
        /// Reply text or description.
        message: String,
    },

    /// The peer sent something that does not parse.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The request cannot be expressed by this handler.
    #[error("unsupported request: {0}")]
    Unsupported(String),

    /// Socket or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An incoming chunk exceeded a buffer hard cap.
    #[error(transparent)]
    Overflow(#[from] BufferOverflow),

    /// A caller callback asked to abort the transfer.
    #[error("aborted by callback")]
    Aborted,

    /// Transfer speed stayed below the configured limit for too long.
    #[error("transfer slower than {limit} bytes/s for {window:?}")]
    TooSlow {
        /// Configured lower speed bound in bytes per second.
        limit: u64,
        /// How long the speed stayed below the bound.
        window: Duration,
    },
}

impl ProtocolError {
    /// Creates a reply-code error.
    pub fn reply(code: u32, message: impl Into<String>) -> Self {
        Self::Reply {
            code,
            message: message.into(),
        }
    }

    /// Creates a malformed-response error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Creates an unsupported-request error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    /// Creates the error raised when the peer closes a connection mid-response.
    ///
    /// Reported as I/O so a pooled connection the peer dropped while idle is
    /// recognized as stale.
    pub fn closed_early(what: &str) -> Self {
        Self::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("connection closed while reading {what}"),
        ))
    }

    /// Numeric subcode for this failure.
    #[must_use]
    pub fn subcode(&self) -> i64 {
        match self {
            Self::Reply { code, .. } => i64::from(*code),
            Self::Malformed(_) => SUBCODE_MALFORMED,
            Self::Unsupported(_) => SUBCODE_UNSUPPORTED,
            Self::Io(error) => error.raw_os_error().map_or(SUBCODE_IO, i64::from),
            Self::Overflow(_) | Self::Aborted | Self::TooSlow { .. } => SUBCODE_IO,
        }
    }

    /// Returns true when the failure is an I/O error on the socket.
    ///
    /// Used to detect a pooled connection the peer closed while it sat idle.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_subcode() {
        assert_eq!(ProtocolError::reply(550, "No such file").subcode(), 550);
    }

    #[test]
    fn test_malformed_subcode() {
        let error = ProtocolError::malformed("bad status line");
        assert_eq!(error.subcode(), SUBCODE_MALFORMED);
        assert!(!error.is_io());
    }

    #[test]
    fn test_closed_early_is_io() {
        let error = ProtocolError::closed_early("status line");
        assert!(error.is_io());
        assert_eq!(error.subcode(), SUBCODE_IO);
        assert!(error.to_string().contains("status line"));
    }

    #[test]
    fn test_io_error_is_io() {
        let error = ProtocolError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(error.is_io());
        assert_eq!(error.subcode(), SUBCODE_IO);
    }
}
