//! The long-lived client handle.
//!
//! A [`Session`] owns its configuration, callbacks, progress, buffers and
//! connection pool. Transfers run one at a time through [`Session::perform`];
//! connections left idle by one transfer are offered to the next.
//!
//! # Example
//!
//! ```no_run
//! use netxfer_core::{Session, SessionConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = Session::new(SessionConfig::for_url("http://example.com/"))?;
//! let outcome = session.perform().await?;
//! println!("{:?} {} bytes", outcome.response_code, outcome.bytes_down);
//! session.close().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, SessionConfig};
use crate::connection::{ConnectionPool, PoolStats};
use crate::error::TransferError;
use crate::protocol::ProtocolRegistry;
use crate::resolve::{AddressResolver, SystemResolver};
use crate::transfer::{
    CancelHandle, Dispatcher, Progress, TransferBuffers, TransferHooks, TransferOutcome,
};

/// One client handle: configuration plus the pool it spawns connections into.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    registry: ProtocolRegistry,
    resolver: Arc<dyn AddressResolver>,
    hooks: TransferHooks,
    progress: Progress,
    buffers: TransferBuffers,
    pool: ConnectionPool,
    cancel: CancelHandle,
}

impl Session {
    /// Opens a session with the built-in protocol handlers and the system
    /// resolver.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `config` fails validation.
    pub fn new(config: SessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let pool = ConnectionPool::new(config.pool.capacity, config.pool.closure_policy);
        let buffers = TransferBuffers::new(&config.buffers);
        debug!(capacity = pool.capacity(), "Session opened");
        Ok(Self {
            config,
            registry: ProtocolRegistry::with_defaults(),
            resolver: Arc::new(SystemResolver),
            hooks: TransferHooks::new(),
            progress: Progress::new(),
            buffers,
            pool,
            cancel: CancelHandle::new(),
        })
    }

    /// Replaces the address resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replaces the protocol handler set.
    #[must_use]
    pub fn with_registry(mut self, registry: ProtocolRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Replaces the configuration. Pool and buffer changes take effect on
    /// the next transfer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `config` fails validation; the previous
    /// configuration is kept.
    pub fn set_config(&mut self, config: SessionConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Points the next transfer at `url`.
    pub fn set_url(&mut self, url: impl Into<String>) {
        self.config.url = Some(url.into());
    }

    /// Registered protocol handlers, mutable.
    pub fn registry_mut(&mut self) -> &mut ProtocolRegistry {
        &mut self.registry
    }

    /// Caller callbacks, mutable.
    pub fn hooks_mut(&mut self) -> &mut TransferHooks {
        &mut self.hooks
    }

    /// Progress of the current or last transfer.
    #[must_use]
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// The connection pool.
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Pool occupancy.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// A handle that cancels the in-flight transfer from another task.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Runs one transfer with the current configuration.
    ///
    /// # Errors
    ///
    /// Any [`TransferError`]. The pool is left consistent: the connection
    /// used by a failed transfer is torn down, never pooled.
    #[instrument(skip(self), fields(url = self.config.url.as_deref().unwrap_or_default()))]
    pub async fn perform(&mut self) -> Result<TransferOutcome, TransferError> {
        self.prepare().await?;
        Dispatcher::new(
            &self.config,
            &self.registry,
            self.resolver.as_ref(),
            &mut self.pool,
            &mut self.hooks,
            &mut self.progress,
            &mut self.buffers,
            &self.cancel,
        )
        .run()
        .await
    }

    /// Applies pending pool and buffer changes before a transfer.
    async fn prepare(&mut self) -> Result<(), TransferError> {
        let reclaimed = self.pool.reclaim_busy().await;
        if reclaimed > 0 {
            warn!(reclaimed, "Reclaimed connections left busy by an abandoned transfer");
        }

        let wanted = self.config.pool.capacity;
        if wanted != self.pool.capacity() {
            debug!(from = self.pool.capacity(), to = wanted, "Resizing pool");
            self.pool.resize(wanted).await?;
        }
        self.pool.set_policy(self.config.pool.closure_policy);

        if self.buffers.download_size() != self.config.buffers.download_size
            || self.buffers.header().hard_cap() != self.config.buffers.header_hard_cap
        {
            self.buffers = TransferBuffers::new(&self.config.buffers);
        }

        self.cancel.reset();
        Ok(())
    }

    /// Closes every pooled connection. The session stays usable; the next
    /// transfer connects afresh.
    pub async fn close(&mut self) {
        let stats = self.pool.stats();
        self.pool.close_all().await;
        info!(closed = stats.occupied, "Session closed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::PoolConfig;
    use crate::connection::ClosurePolicy;

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = SessionConfig {
            pool: PoolConfig {
                capacity: 0,
                closure_policy: ClosurePolicy::Oldest,
            },
            ..SessionConfig::default()
        };
        assert!(Session::new(config).is_err());
    }

    #[tokio::test]
    async fn test_perform_without_url_is_invalid_target() {
        let mut session = Session::new(SessionConfig::default()).unwrap();
        let error = session.perform().await.unwrap_err();
        assert!(matches!(error, TransferError::InvalidTarget { .. }));
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_unsupported() {
        let mut session = Session::new(SessionConfig::for_url("gemini://host/")).unwrap();
        let error = session.perform().await.unwrap_err();
        assert!(matches!(error, TransferError::UnsupportedProtocol { .. }));
    }

    #[tokio::test]
    async fn test_file_transfer_collects_body_and_releases_slot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"local bytes").unwrap();
        let url = url::Url::from_file_path(file.path()).unwrap();

        let mut session = Session::new(SessionConfig::for_url(url.as_str())).unwrap();
        let outcome = session.perform().await.unwrap();
        assert_eq!(outcome.body, b"local bytes");
        assert_eq!(outcome.bytes_down, 11);
        assert!(!outcome.connection_reused);
        assert_eq!(session.pool_stats().busy, 0);
        assert_eq!(session.pool_stats().idle, 0);
    }

    #[tokio::test]
    async fn test_pool_resize_applies_on_next_transfer() {
        let mut session = Session::new(SessionConfig::default()).unwrap();
        let mut config = session.config().clone();
        config.pool.capacity = 2;
        config.url = Some("gemini://host/".to_string());
        session.set_config(config).unwrap();
        let _ = session.perform().await;
        assert_eq!(session.pool().capacity(), 2);
    }

    #[tokio::test]
    async fn test_cancel_handle_is_reset_by_next_transfer() {
        let mut session = Session::new(SessionConfig::for_url("gemini://host/")).unwrap();
        let handle = session.cancel_handle();
        handle.cancel();
        let _ = session.perform().await;
        assert!(!handle.is_cancelled());
    }
}
