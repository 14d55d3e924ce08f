//! Transfer orchestration.
//!
//! The [`Dispatcher`] runs one transfer:
//!
//! 1. **Resolving** - parse the target, pick the handler, work out
//!    credentials and look for a reusable pooled connection. Name resolution
//!    only runs for fresh connections.
//! 2. **Connecting** - TCP connect across the candidates, TLS for encrypted
//!    protocols.
//! 3. **ProtocolConnecting** - the handler's `connect`.
//! 4. **Doing** - the handler's `perform`.
//! 5. **Done** - the handler's `done`, whatever `perform` returned.
//! 6. **Closed** - the slot is released, reusable only after a clean hop.
//!
//! Every phase before Done races the cancel signal and the applicable
//! deadline. Redirects restart the cycle at Resolving.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::SessionConfig;
use crate::connection::{
    Acquisition, Connection, ConnectionIndex, ConnectionPool, ReuseKey, Stream,
};
use crate::constants::{FTP_ANONYMOUS_PASSWORD, FTP_ANONYMOUS_USER, TEARDOWN_TIMEOUT};
use crate::error::{Phase, TransferError};
use crate::protocol::{DoOutcome, Protocol, ProtocolRegistry};
use crate::resolve::AddressResolver;
use crate::target::{Credentials, Target};

use super::context::prompt_password;
use super::{
    HopRequest, Milestone, Progress, ProgressSnapshot, TransferBuffers, TransferContext,
    TransferHooks,
};

/// Aborts the in-flight transfer of a session from any task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    /// Creates an untriggered handle.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Cancels the current transfer at its next await point.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// True once cancelled and not yet reset by a new transfer.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    pub(crate) fn reset(&self) {
        self.sender.send_replace(false);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

/// Result of a completed transfer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferOutcome {
    /// Reply code of the final hop.
    pub response_code: Option<u32>,
    /// URL of the final hop, without credentials.
    pub effective_url: String,
    /// Payload bytes received over all hops.
    pub bytes_down: u64,
    /// Payload bytes sent over all hops.
    pub bytes_up: u64,
    /// Redirects followed.
    pub redirects: u32,
    /// The final hop reused a pooled connection.
    pub connection_reused: bool,
    /// Slot used by the final hop.
    pub connection_index: Option<usize>,
    /// Remote file time, when requested and reported.
    pub filetime: Option<SystemTime>,
    /// Progress at completion.
    pub progress: ProgressSnapshot,
    /// Collected payload when no write callback is installed.
    #[serde(skip)]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    limit: Duration,
}

impl Deadline {
    fn after(limit: Duration) -> Self {
        Self {
            at: Instant::now() + limit,
            limit,
        }
    }

    fn earliest(a: Option<Self>, b: Option<Self>) -> Option<Self> {
        match (a, b) {
            (Some(a), Some(b)) => Some(if a.at <= b.at { a } else { b }),
            (a, b) => a.or(b),
        }
    }
}

struct HopResult {
    outcome: DoOutcome,
    index: ConnectionIndex,
    reused: bool,
}

enum HopFailure {
    /// A reused connection failed on I/O before any byte arrived.
    Stale(TransferError),
    Fatal(TransferError),
}

/// Drives transfers against a pool using a session's collaborators.
pub struct Dispatcher<'s> {
    config: &'s SessionConfig,
    registry: &'s ProtocolRegistry,
    resolver: &'s dyn AddressResolver,
    pool: &'s mut ConnectionPool,
    hooks: &'s mut TransferHooks,
    progress: &'s mut Progress,
    buffers: &'s mut TransferBuffers,
    cancel: watch::Receiver<bool>,
}

impl<'s> Dispatcher<'s> {
    /// Borrows everything one transfer needs.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'s SessionConfig,
        registry: &'s ProtocolRegistry,
        resolver: &'s dyn AddressResolver,
        pool: &'s mut ConnectionPool,
        hooks: &'s mut TransferHooks,
        progress: &'s mut Progress,
        buffers: &'s mut TransferBuffers,
        cancel: &CancelHandle,
    ) -> Self {
        Self {
            config,
            registry,
            resolver,
            pool,
            hooks,
            progress,
            buffers,
            cancel: cancel.subscribe(),
        }
    }

    /// Runs the configured transfer, following redirects when enabled.
    ///
    /// # Errors
    ///
    /// Any [`TransferError`]; the error carries the phase it happened in.
    #[instrument(skip(self), fields(url = self.config.url.as_deref().unwrap_or_default()))]
    pub async fn run(mut self) -> Result<TransferOutcome, TransferError> {
        let config = self.config;
        let raw = config
            .url
            .as_deref()
            .ok_or_else(|| TransferError::invalid_target("", "no URL set"))?;
        self.progress.reset();
        self.buffers.reset();

        let deadline = config.timeout().map(Deadline::after);
        let mut target = Target::parse(raw, config.port)?;
        let auth_host = target.host().to_string();
        let mut request = HopRequest::initial(config);
        let mut body = Vec::new();
        let mut redirects = 0u32;

        loop {
            let hop = self
                .run_hop(&target, &request, &auth_host, &mut body, deadline)
                .await?;
            self.progress.set_response_code(hop.outcome.response_code);
            self.progress.set_filetime(hop.outcome.filetime);

            if config.follow_location
                && let Some(location) = hop.outcome.location.as_deref()
            {
                let next = target.join(location)?;
                if let Some(max) = config.max_redirects
                    && redirects >= max
                {
                    return Err(TransferError::TooManyRedirects {
                        max,
                        url: next.display_url(),
                    });
                }
                let status = hop.outcome.response_code.unwrap_or(302);
                debug!(status, from = %target.display_url(), to = %next.display_url(), "Following redirect");
                request = request.follow(status, &target, config);
                target = next;
                redirects += 1;
                continue;
            }

            let snapshot = self.progress.snapshot();
            let outcome = TransferOutcome {
                response_code: hop.outcome.response_code,
                effective_url: target.display_url(),
                bytes_down: snapshot.downloaded,
                bytes_up: snapshot.uploaded,
                redirects,
                connection_reused: hop.reused,
                connection_index: Some(hop.index.get()),
                filetime: hop.outcome.filetime,
                progress: snapshot,
                body,
            };
            info!(
                url = %outcome.effective_url,
                response_code = ?outcome.response_code,
                bytes_down = outcome.bytes_down,
                bytes_up = outcome.bytes_up,
                redirects,
                reused = outcome.connection_reused,
                "Transfer complete"
            );
            return Ok(outcome);
        }
    }

    async fn run_hop(
        &mut self,
        target: &Target,
        request: &HopRequest,
        auth_host: &str,
        body: &mut Vec<u8>,
        deadline: Option<Deadline>,
    ) -> Result<HopResult, TransferError> {
        let protocol = target.protocol();
        let handler = self
            .registry
            .handler(protocol)
            .ok_or_else(|| TransferError::unsupported_protocol(protocol.scheme()))?;

        let credentials = resolve_credentials(self.config, self.hooks, target, auth_host);
        let proxy = self
            .config
            .proxy
            .as_ref()
            .filter(|_| protocol.supports_proxy());
        let proxy_credentials = proxy.and_then(|p| p.credentials.clone());
        let key = ReuseKey::for_target(target, credentials.as_ref(), proxy, &self.config.ssl);

        let mut force_fresh = self.config.reuse_fresh;
        loop {
            let acquisition = self
                .pool
                .acquire(&key, force_fresh, |index| {
                    Connection::new(
                        index,
                        key.clone(),
                        Arc::clone(&handler),
                        credentials.clone(),
                        proxy_credentials.clone(),
                    )
                })
                .await?;
            debug!(index = %acquisition.index, reused = acquisition.reused, "Acquired connection");

            match self
                .attempt(acquisition, target, request, body, deadline)
                .await
            {
                Ok(hop) => return Ok(hop),
                Err(HopFailure::Stale(error)) if !force_fresh => {
                    warn!(error = %error, "Pooled connection was stale; retrying on a fresh one");
                    force_fresh = true;
                }
                Err(HopFailure::Stale(error) | HopFailure::Fatal(error)) => return Err(error),
            }
        }
    }

    async fn attempt(
        &mut self,
        acquisition: Acquisition,
        target: &Target,
        request: &HopRequest,
        body: &mut Vec<u8>,
        deadline: Option<Deadline>,
    ) -> Result<HopResult, HopFailure> {
        let Self {
            config,
            resolver,
            pool,
            hooks,
            progress,
            buffers,
            cancel,
            ..
        } = self;
        let config: &SessionConfig = config;
        let index = acquisition.index;

        let result = {
            let conn = pool.get_mut(index).map_err(HopFailure::Fatal)?;
            let mut ctx =
                TransferContext::new(config, target, request, hooks, progress, buffers, body);
            drive(conn, &mut ctx, *resolver, cancel, acquisition.reused, deadline).await
        };

        let reusable = result.is_ok() && !config.reuse_forbid;
        if let Err(error) = pool.release(index, reusable).await {
            warn!(error = %error, "Failed to release connection");
        }
        debug!(phase = %Phase::Closed, index = %index, reusable, "Slot released");

        result.map(|outcome| HopResult {
            outcome,
            index,
            reused: acquisition.reused,
        })
    }
}

/// Runs the phases of one hop on an acquired connection.
async fn drive(
    conn: &mut Connection,
    ctx: &mut TransferContext<'_>,
    resolver: &dyn AddressResolver,
    cancel: &mut watch::Receiver<bool>,
    reused: bool,
    deadline: Option<Deadline>,
) -> Result<DoOutcome, HopFailure> {
    let protocol = conn.protocol();
    let handler = conn.handler();

    if reused {
        ctx.progress_mut().mark(Milestone::NameLookup);
        ctx.progress_mut().mark(Milestone::Connect);
    } else {
        establish(conn, ctx, resolver, cancel, deadline)
            .await
            .map_err(HopFailure::Fatal)?;

        debug!(phase = %Phase::ProtocolConnecting, handler = handler.name());
        guarded(
            Phase::ProtocolConnecting,
            Some(protocol),
            cancel,
            deadline,
            handler.connect(conn, ctx),
        )
        .await
        .and_then(|connected| {
            connected.map_err(|e| TransferError::from_protocol(Phase::ProtocolConnecting, protocol, e))
        })
        .map_err(HopFailure::Fatal)?;
    }

    debug!(phase = %Phase::Doing, reused);
    ctx.progress_mut().mark(Milestone::PreTransfer);
    let down_before = ctx.progress().downloaded();
    let up_before = ctx.progress().uploaded();

    let performed = guarded(
        Phase::Doing,
        Some(protocol),
        cancel,
        deadline,
        handler.perform(conn, ctx),
    )
    .await;

    debug!(phase = %Phase::Done);
    // Runs even after cancel or deadline expiry, so only the teardown bound applies.
    match tokio::time::timeout(TEARDOWN_TIMEOUT, handler.done(conn, ctx)).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(error = %error, "Protocol done failed"),
        Err(_) => {
            warn!(limit = ?TEARDOWN_TIMEOUT, "Protocol done timed out");
            conn.bits.close = true;
        }
    }
    conn.add_transferred(
        ctx.progress().downloaded().saturating_sub(down_before),
        ctx.progress().uploaded().saturating_sub(up_before),
    );

    match performed {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(error)) => {
            let stale = reused && error.is_io() && ctx.progress().downloaded() == down_before;
            let error = TransferError::from_protocol(Phase::Doing, protocol, error);
            debug!(phase = %Phase::Failed, error = %error);
            if stale {
                Err(HopFailure::Stale(error))
            } else {
                Err(HopFailure::Fatal(error))
            }
        }
        Err(error) => {
            debug!(phase = %Phase::Failed, error = %error);
            Err(HopFailure::Fatal(error))
        }
    }
}

/// Resolving and Connecting for a fresh connection.
async fn establish(
    conn: &mut Connection,
    ctx: &mut TransferContext<'_>,
    resolver: &dyn AddressResolver,
    cancel: &mut watch::Receiver<bool>,
    deadline: Option<Deadline>,
) -> Result<(), TransferError> {
    let protocol = conn.protocol();
    if !protocol.uses_network() {
        ctx.progress_mut().mark(Milestone::NameLookup);
        ctx.progress_mut().mark(Milestone::Connect);
        return Ok(());
    }

    let (host, port) = {
        let (host, port) = conn.key().connect_address();
        (host.to_string(), port)
    };

    debug!(phase = %Phase::Resolving, host = %host, port);
    let resolved = guarded(
        Phase::Resolving,
        Some(protocol),
        cancel,
        deadline,
        resolver.resolve(&host, port),
    )
    .await?;
    let addrs = match resolved {
        Ok(addrs) if !addrs.is_empty() => addrs,
        Ok(_) => return Err(TransferError::resolution(&host, port, protocol, None)),
        Err(error) => return Err(TransferError::resolution(&host, port, protocol, Some(error))),
    };
    ctx.progress_mut().mark(Milestone::NameLookup);

    debug!(phase = %Phase::Connecting, candidates = addrs.len());
    let connect_deadline = Deadline::earliest(
        deadline,
        ctx.config().connect_timeout().map(Deadline::after),
    );
    let (tcp, addr) = guarded(
        Phase::Connecting,
        Some(protocol),
        cancel,
        connect_deadline,
        connect_any(&addrs),
    )
    .await?
    .map_err(|error| TransferError::connect(&host, port, protocol, error))?;

    let stream = if protocol.is_encrypted() {
        let ssl_config = ctx.config().ssl.clone();
        let tls_host = ctx.target().host().to_string();
        guarded(
            Phase::Connecting,
            Some(protocol),
            cancel,
            connect_deadline,
            conn.ssl_mut().handshake(&ssl_config, protocol, &tls_host, tcp),
        )
        .await??
    } else {
        Stream::Plain(tcp)
    };
    conn.attach_primary(stream, Some(addr));
    ctx.progress_mut().mark(Milestone::Connect);
    Ok(())
}

async fn connect_any(addrs: &[SocketAddr]) -> io::Result<(TcpStream, SocketAddr)> {
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(tcp) => {
                if let Err(error) = tcp.set_nodelay(true) {
                    debug!(error = %error, "Failed to set TCP_NODELAY");
                }
                return Ok((tcp, *addr));
            }
            Err(error) => {
                debug!(addr = %addr, error = %error, "Connect attempt failed");
                last_error = Some(error);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no candidate addresses")
    }))
}

/// Races a phase future against cancellation and a deadline.
async fn guarded<F, T>(
    phase: Phase,
    protocol: Option<Protocol>,
    cancel: &mut watch::Receiver<bool>,
    deadline: Option<Deadline>,
    future: F,
) -> Result<T, TransferError>
where
    F: Future<Output = T>,
{
    if *cancel.borrow() {
        return Err(TransferError::cancelled(phase, protocol));
    }
    let expiry = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline.at).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        biased;
        () = cancelled(cancel) => Err(TransferError::cancelled(phase, protocol)),
        () = expiry => Err(TransferError::timeout(
            phase,
            protocol,
            deadline.map_or(Duration::ZERO, |d| d.limit),
        )),
        output = future => Ok(output),
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let closed = cancel.wait_for(|cancelled| *cancelled).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Credentials for a hop: URL user-info first, then configured credentials
/// when the hop stays on the authenticated host (or auth is unrestricted).
/// A missing password is asked from the password callback; FTP falls back
/// to anonymous login.
fn resolve_credentials(
    config: &SessionConfig,
    hooks: &mut TransferHooks,
    target: &Target,
    auth_host: &str,
) -> Option<Credentials> {
    let same_host = target.host().eq_ignore_ascii_case(auth_host) || config.unrestricted_auth;
    let mut credentials = target
        .url_credentials()
        .cloned()
        .or_else(|| config.credentials.clone().filter(|_| same_host));

    if let Some(creds) = credentials.as_mut()
        && creds.password.is_none()
    {
        creds.password = prompt_password(hooks, &creds.user);
    }

    if credentials.is_none() && matches!(target.protocol(), Protocol::Ftp | Protocol::Ftps) {
        credentials = Some(Credentials::new(FTP_ANONYMOUS_USER, FTP_ANONYMOUS_PASSWORD));
    }
    credentials
}
