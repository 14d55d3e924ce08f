//! Host name resolution.
//!
//! The dispatcher asks an [`AddressResolver`] for the ordered candidate
//! addresses of a host and tries them in turn. [`SystemResolver`] uses the
//! operating system; [`StaticResolver`] serves fixed entries, which is handy
//! for pinning hosts and for tests.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use tracing::debug;

/// Maps a host and port to candidate socket addresses.
#[async_trait]
pub trait AddressResolver: Send + Sync + fmt::Debug {
    /// Returns candidates in preference order.
    ///
    /// # Errors
    ///
    /// Returns an error when the host cannot be resolved. An empty list is
    /// treated the same way by the dispatcher.
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl AddressResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
        debug!(host, port, candidates = addrs.len(), "Resolved host");
        Ok(addrs)
    }
}

/// Resolver with fixed host entries.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an address for `host` (case-insensitive).
    #[must_use]
    pub fn with(mut self, host: &str, ip: IpAddr) -> Self {
        self.insert(host, ip);
        self
    }

    /// Adds an address for `host` (case-insensitive).
    pub fn insert(&mut self, host: &str, ip: IpAddr) {
        self.entries
            .entry(host.to_ascii_lowercase())
            .or_default()
            .push(ip);
    }
}

#[async_trait]
impl AddressResolver for StaticResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        self.entries
            .get(&host.to_ascii_lowercase())
            .map(|ips| ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no entry for host '{host}'"))
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[tokio::test]
    async fn test_system_resolver_passes_ip_literals_through() {
        let addrs = SystemResolver.resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse().unwrap()]);
        let v6 = SystemResolver.resolve("::1", 21).await.unwrap();
        assert_eq!(v6, vec!["[::1]:21".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_static_resolver_lookup_is_case_insensitive() {
        let resolver = StaticResolver::new()
            .with("Files.Example", IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with("files.example", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let addrs = resolver.resolve("FILES.example", 21).await.unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].port(), 21);
    }

    #[tokio::test]
    async fn test_static_resolver_unknown_host_is_not_found() {
        let error = StaticResolver::new().resolve("nowhere", 80).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::NotFound);
    }
}
