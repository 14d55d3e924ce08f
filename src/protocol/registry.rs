//! Protocol handler registry.
//!
//! The [`ProtocolRegistry`] maps each [`Protocol`] flag to the handler that
//! implements its operations. Connections capture the handler when they are
//! created, so re-registering a flag only affects connections made later.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::{
    DictHandler, FileHandler, FtpHandler, GopherHandler, HttpHandler, LdapHandler, Protocol,
    ProtocolHandler, TelnetHandler,
};

/// Flag-to-handler map.
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    handlers: HashMap<Protocol, Arc<dyn ProtocolHandler>>,
}

impl ProtocolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in handler for every protocol.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let http: Arc<dyn ProtocolHandler> = Arc::new(HttpHandler);
        let ftp: Arc<dyn ProtocolHandler> = Arc::new(FtpHandler);
        registry.register(Protocol::Http, Arc::clone(&http));
        registry.register(Protocol::Https, http);
        registry.register(Protocol::Ftp, Arc::clone(&ftp));
        registry.register(Protocol::Ftps, ftp);
        registry.register(Protocol::Telnet, Arc::new(TelnetHandler));
        registry.register(Protocol::Dict, Arc::new(DictHandler));
        registry.register(Protocol::Ldap, Arc::new(LdapHandler));
        registry.register(Protocol::Gopher, Arc::new(GopherHandler));
        registry.register(Protocol::File, Arc::new(FileHandler));
        registry
    }

    /// Registers (or replaces) the handler for a protocol.
    #[tracing::instrument(skip(self, handler), fields(handler_name = handler.name()))]
    pub fn register(&mut self, protocol: Protocol, handler: Arc<dyn ProtocolHandler>) {
        debug!(%protocol, "Registering protocol handler");
        self.handlers.insert(protocol, handler);
    }

    /// Handler for a protocol, if one is registered.
    #[must_use]
    pub fn handler(&self, protocol: Protocol) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.get(&protocol).cloned()
    }

    /// Number of registered protocols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self
            .handlers
            .iter()
            .map(|(protocol, handler)| format!("{protocol}={}", handler.name()))
            .collect();
        names.sort();
        f.debug_struct("ProtocolRegistry")
            .field("handlers", &names)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_protocol() {
        let registry = ProtocolRegistry::with_defaults();
        assert_eq!(registry.len(), Protocol::ALL.len());
        for protocol in Protocol::ALL {
            assert!(registry.handler(protocol).is_some(), "missing {protocol}");
        }
        assert_eq!(registry.handler(Protocol::Https).unwrap().name(), "http");
        assert_eq!(registry.handler(Protocol::Ftps).unwrap().name(), "ftp");
    }

    #[test]
    fn test_register_replaces_handler() {
        let mut registry = ProtocolRegistry::new();
        assert!(registry.is_empty());
        registry.register(Protocol::Dict, Arc::new(GopherHandler));
        assert_eq!(registry.handler(Protocol::Dict).unwrap().name(), "gopher");
        registry.register(Protocol::Dict, Arc::new(DictHandler));
        assert_eq!(registry.handler(Protocol::Dict).unwrap().name(), "dict");
        assert!(registry.handler(Protocol::Http).is_none());
    }
}
