//! Environment id to backend address resolution.
//!
//! Every strategy implements one capability, [`Resolver`]: turn an environment
//! id into exactly one backend [`Target`]. When a strategy sees several
//! instances it takes the first usable one; there is no balancing.
//!
//! ## Strategies
//!
//! - [`DiscoveryResolver`]: service discovery registry query (`pr-<id>-service`
//!   in the configured namespace), healthy instances only
//! - [`DnsResolver`]: A-record lookup of `pr-<id>.<suffix>`
//!
//! [`CachedResolver`] sits in front of whichever strategy is configured.

mod cache;
mod credentials;
mod discovery;
mod dns;
mod sigv4;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Config, ResolverKind};
use crate::error::ResolveError;
use crate::relay::EnvironmentId;

pub use cache::{CacheStats, CachedResolver, DEFAULT_CACHE_TTL};
pub use discovery::{DiscoveryConfig, DiscoveryResolver};
pub use dns::DnsResolver;
pub use credentials::{ContainerAuth, CredentialProvider, CredentialSource, Credentials};

/// Default upper bound on a single resolver call.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);

/// A resolved backend address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: IpAddr,
    pub port: u16,
}

impl Target {
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self { host, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

impl From<SocketAddr> for Target {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

/// Resolution strategy.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve an environment to one backend. May suspend on network I/O.
    async fn resolve(&self, env: &EnvironmentId) -> Result<Target, ResolveError>;

    /// Strategy name for logs.
    fn name(&self) -> &'static str;
}

/// Build the configured strategy wrapped in the resolution cache.
pub fn from_config(config: &Config) -> anyhow::Result<CachedResolver> {
    let inner: Arc<dyn Resolver> = match config.resolver {
        ResolverKind::Discovery => Arc::new(DiscoveryResolver::new(DiscoveryConfig {
            endpoint: config.discovery_endpoint.clone(),
            region: config.region.clone(),
            namespace: config.namespace.clone(),
            default_port: config.target_port,
            credentials: CredentialSource::from_env(),
            request_timeout: config.resolve_timeout,
        })?),
        ResolverKind::Dns => Arc::new(DnsResolver::new(
            config.dns_suffix.clone(),
            config.target_port,
        )),
    };

    Ok(CachedResolver::new(inner, config.cache_ttl, config.resolve_timeout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_socket_addr() {
        let target = Target::new("10.0.0.5".parse().unwrap(), 8080);
        assert_eq!(target.socket_addr().to_string(), "10.0.0.5:8080");
        assert_eq!(target.to_string(), "10.0.0.5:8080");
    }

    #[test]
    fn test_target_from_socket_addr() {
        let addr: SocketAddr = "[fd00::1]:9000".parse().unwrap();
        let target = Target::from(addr);
        assert_eq!(target.port, 9000);
        assert_eq!(target.socket_addr(), addr);
    }
}
