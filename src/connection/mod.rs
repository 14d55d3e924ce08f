//! Connection records and the pool that owns them.
//!
//! # Architecture
//!
//! - [`Connection`] - One network endpoint binding: sockets, protocol payload,
//!   flags, timestamps, TLS holder and the handler chosen at creation
//! - [`ReuseKey`] - Everything a later transfer must match to reuse a record
//! - [`ConnectionPool`] - Fixed-capacity slot table with reuse and eviction
//! - [`SslSession`] - Per-connection TLS state machine
//! - [`Stream`] - Plain or TLS socket

mod pool;
mod ssl;
mod stream;

pub use pool::{Acquisition, ClosurePolicy, ConnectionPool, PoolStats};
pub use ssl::{SslConfig, SslFingerprint, SslSession, SslState, TlsVersion};
pub use stream::Stream;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::config::ProxyConfig;
use crate::constants::TEARDOWN_TIMEOUT;
use crate::protocol::{
    DictState, FileState, FtpState, GopherState, HttpState, LdapState, Protocol, ProtocolError,
    ProtocolHandler, ProtocolPayload, TelnetState,
};
use crate::target::{CredentialSignature, Credentials, Target};

/// Stable index of a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionIndex(usize);

impl ConnectionIndex {
    /// Wraps a raw slot number.
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Raw slot number.
    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for ConnectionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Boolean state of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionBits {
    /// Tear the connection down after the current transfer.
    pub close: bool,
    /// The current transfer reuses this connection.
    pub reuse: bool,
    /// The last response used chunked transfer encoding.
    pub chunked: bool,
    /// Requests go through an HTTP proxy.
    pub via_proxy: bool,
    /// Credentials are bound to the connection.
    pub user_passwd: bool,
    /// Proxy credentials are bound to the connection.
    pub proxy_user_passwd: bool,
    /// The current transfer asked for a byte range.
    pub use_range: bool,
}

/// Identity a transfer must match to reuse a pooled connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReuseKey {
    /// Protocol flag.
    pub protocol: Protocol,
    /// Lowercased target host.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Proxy host and port, when proxied.
    pub proxy: Option<(String, u16)>,
    /// Target credential signature.
    pub credentials: CredentialSignature,
    /// Proxy credential signature.
    pub proxy_credentials: CredentialSignature,
    /// TLS configuration fingerprint, for encrypted protocols only.
    pub ssl: Option<SslFingerprint>,
}

impl ReuseKey {
    /// Builds the key for a transfer to `target`.
    ///
    /// The proxy is ignored for protocols that are never proxied, and the TLS
    /// fingerprint for plain protocols.
    #[must_use]
    pub fn for_target(
        target: &Target,
        credentials: Option<&Credentials>,
        proxy: Option<&ProxyConfig>,
        ssl: &SslConfig,
    ) -> Self {
        let protocol = target.protocol();
        let proxy = proxy.filter(|_| protocol.supports_proxy());
        Self {
            protocol,
            host: target.host().to_ascii_lowercase(),
            port: target.port(),
            proxy: proxy.map(|p| (p.host.to_ascii_lowercase(), p.port)),
            credentials: CredentialSignature::of(credentials),
            proxy_credentials: CredentialSignature::of(
                proxy.and_then(|p| p.credentials.as_ref()),
            ),
            ssl: protocol.is_encrypted().then(|| ssl.fingerprint()),
        }
    }

    /// Host and port the socket connects to: the proxy when proxied.
    #[must_use]
    pub fn connect_address(&self) -> (&str, u16) {
        match &self.proxy {
            Some((host, port)) => (host.as_str(), *port),
            None => (self.host.as_str(), self.port),
        }
    }
}

/// State for one physical endpoint binding.
///
/// Owned exclusively by its pool slot. The protocol flag and the payload
/// variant are fixed at creation.
#[derive(Debug)]
pub struct Connection {
    index: ConnectionIndex,
    protocol: Protocol,
    key: ReuseKey,
    remote_addr: Option<SocketAddr>,
    primary: Option<Stream>,
    secondary: Option<Stream>,
    payload: ProtocolPayload,
    ssl: SslSession,
    /// Boolean state; handlers set `close` when the connection cannot be reused.
    pub bits: ConnectionBits,
    created: Instant,
    last_used: Instant,
    bytes_down: u64,
    bytes_up: u64,
    transfers: u64,
    credentials: Option<Credentials>,
    proxy_credentials: Option<Credentials>,
    handler: Arc<dyn ProtocolHandler>,
    torn_down: bool,
}

impl Connection {
    /// Creates an unconnected record for `key`.
    #[must_use]
    pub fn new(
        index: ConnectionIndex,
        key: ReuseKey,
        handler: Arc<dyn ProtocolHandler>,
        credentials: Option<Credentials>,
        proxy_credentials: Option<Credentials>,
    ) -> Self {
        let protocol = key.protocol;
        let now = Instant::now();
        let bits = ConnectionBits {
            via_proxy: key.proxy.is_some(),
            user_passwd: credentials.is_some(),
            proxy_user_passwd: proxy_credentials.is_some(),
            ..ConnectionBits::default()
        };
        Self {
            index,
            protocol,
            key,
            remote_addr: None,
            primary: None,
            secondary: None,
            payload: ProtocolPayload::for_protocol(protocol),
            ssl: SslSession::for_protocol(protocol),
            bits,
            created: now,
            last_used: now,
            bytes_down: 0,
            bytes_up: 0,
            transfers: 0,
            credentials,
            proxy_credentials,
            handler,
            torn_down: false,
        }
    }

    /// Slot index.
    #[must_use]
    pub fn index(&self) -> ConnectionIndex {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: ConnectionIndex) {
        self.index = index;
    }

    /// Protocol flag.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Reuse identity.
    #[must_use]
    pub fn key(&self) -> &ReuseKey {
        &self.key
    }

    /// Handler bound at creation.
    #[must_use]
    pub fn handler(&self) -> Arc<dyn ProtocolHandler> {
        Arc::clone(&self.handler)
    }

    /// Peer address of the primary socket.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Credentials bound to this connection.
    #[must_use]
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Proxy credentials bound to this connection.
    #[must_use]
    pub fn proxy_credentials(&self) -> Option<&Credentials> {
        self.proxy_credentials.as_ref()
    }

    /// TLS holder.
    #[must_use]
    pub fn ssl(&self) -> &SslSession {
        &self.ssl
    }

    pub(crate) fn ssl_mut(&mut self) -> &mut SslSession {
        &mut self.ssl
    }

    /// True once the primary socket is attached.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.primary.is_some()
    }

    pub(crate) fn attach_primary(&mut self, stream: Stream, remote_addr: Option<SocketAddr>) {
        self.primary = Some(stream);
        self.remote_addr = remote_addr;
    }

    /// Primary socket.
    ///
    /// # Errors
    ///
    /// Returns a protocol I/O error when no socket is attached.
    pub fn stream_mut(&mut self) -> Result<&mut Stream, ProtocolError> {
        self.primary.as_mut().ok_or_else(|| {
            ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection has no socket",
            ))
        })
    }

    /// Attaches the secondary (data) socket.
    pub fn set_secondary(&mut self, stream: Stream) {
        self.secondary = Some(stream);
    }

    /// Detaches the secondary socket.
    pub fn take_secondary(&mut self) -> Option<Stream> {
        self.secondary.take()
    }

    /// Creation time.
    #[must_use]
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Time of the last completed transfer.
    #[must_use]
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
        self.transfers = self.transfers.saturating_add(1);
    }

    /// Transfers completed on this connection.
    #[must_use]
    pub fn transfers(&self) -> u64 {
        self.transfers
    }

    /// Bytes received over the connection's lifetime.
    #[must_use]
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down
    }

    /// Bytes sent over the connection's lifetime.
    #[must_use]
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up
    }

    pub(crate) fn add_transferred(&mut self, down: u64, up: u64) {
        self.bytes_down = self.bytes_down.saturating_add(down);
        self.bytes_up = self.bytes_up.saturating_add(up);
    }

    /// HTTP/HTTPS payload.
    pub fn http_state_mut(&mut self) -> Result<&mut HttpState, ProtocolError> {
        match &mut self.payload {
            ProtocolPayload::Http(state) | ProtocolPayload::Https(state) => Ok(state),
            other => Err(payload_mismatch("HTTP", other.protocol())),
        }
    }

    /// FTP/FTPS payload.
    pub fn ftp_state_mut(&mut self) -> Result<&mut FtpState, ProtocolError> {
        match &mut self.payload {
            ProtocolPayload::Ftp(state) | ProtocolPayload::Ftps(state) => Ok(state),
            other => Err(payload_mismatch("FTP", other.protocol())),
        }
    }

    /// TELNET payload.
    pub fn telnet_state_mut(&mut self) -> Result<&mut TelnetState, ProtocolError> {
        match &mut self.payload {
            ProtocolPayload::Telnet(state) => Ok(state),
            other => Err(payload_mismatch("TELNET", other.protocol())),
        }
    }

    /// DICT payload.
    pub fn dict_state_mut(&mut self) -> Result<&mut DictState, ProtocolError> {
        match &mut self.payload {
            ProtocolPayload::Dict(state) => Ok(state),
            other => Err(payload_mismatch("DICT", other.protocol())),
        }
    }

    /// LDAP payload.
    pub fn ldap_state_mut(&mut self) -> Result<&mut LdapState, ProtocolError> {
        match &mut self.payload {
            ProtocolPayload::Ldap(state) => Ok(state),
            other => Err(payload_mismatch("LDAP", other.protocol())),
        }
    }

    /// GOPHER payload.
    pub fn gopher_state_mut(&mut self) -> Result<&mut GopherState, ProtocolError> {
        match &mut self.payload {
            ProtocolPayload::Gopher(state) => Ok(state),
            other => Err(payload_mismatch("GOPHER", other.protocol())),
        }
    }

    /// FILE payload.
    pub fn file_state_mut(&mut self) -> Result<&mut FileState, ProtocolError> {
        match &mut self.payload {
            ProtocolPayload::File(state) => Ok(state),
            other => Err(payload_mismatch("FILE", other.protocol())),
        }
    }

    /// Read-only view of the payload.
    #[must_use]
    pub fn payload(&self) -> &ProtocolPayload {
        &self.payload
    }

    /// True when a later transfer with `key` may use this connection.
    #[must_use]
    pub fn can_reuse_for(&self, key: &ReuseKey) -> bool {
        !self.bits.close
            && !self.torn_down
            && self.ssl.state() != SslState::Failed
            && self.key == *key
    }

    /// Runs `disconnect` then `close`, shuts the sockets down and closes the
    /// TLS holder. Handler failures are logged. Each step is bounded by
    /// [`TEARDOWN_TIMEOUT`]. Safe to call twice.
    #[instrument(skip(self), fields(index = %self.index, protocol = %self.protocol))]
    pub(crate) async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.bits.close = true;

        let handler = Arc::clone(&self.handler);
        match timeout(TEARDOWN_TIMEOUT, handler.disconnect(self)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(error = %error, "Protocol disconnect failed"),
            Err(_) => warn!(limit = ?TEARDOWN_TIMEOUT, "Protocol disconnect timed out"),
        }
        match timeout(TEARDOWN_TIMEOUT, handler.close(self)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(error = %error, "Protocol close failed"),
            Err(_) => warn!(limit = ?TEARDOWN_TIMEOUT, "Protocol close timed out"),
        }

        for mut stream in [self.secondary.take(), self.primary.take()]
            .into_iter()
            .flatten()
        {
            match timeout(TEARDOWN_TIMEOUT, stream.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => debug!(error = %error, "Socket shutdown failed"),
                Err(_) => debug!("Socket shutdown timed out"),
            }
        }
        self.ssl.close();
        debug!(
            bytes_down = self.bytes_down,
            bytes_up = self.bytes_up,
            transfers = self.transfers,
            "Connection torn down"
        );
    }
}

fn payload_mismatch(expected: &str, actual: Protocol) -> ProtocolError {
    ProtocolError::unsupported(format!("{expected} handler used on a {actual} connection"))
}
