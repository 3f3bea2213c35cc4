//! DNS strategy: A-record lookup of `pr-<id>.<suffix>`.

use async_trait::async_trait;
use tokio::net::lookup_host;
use tracing::debug;

use super::{Resolver, Target};
use crate::error::ResolveError;
use crate::relay::EnvironmentId;

/// Resolver that looks up a per-environment hostname.
pub struct DnsResolver {
    suffix: String,
    port: u16,
}

impl DnsResolver {
    /// `suffix` is appended to `pr-<id>`; `port` is the backend port.
    pub fn new(suffix: String, port: u16) -> Self {
        let suffix = suffix.trim_matches('.').to_string();
        Self { suffix, port }
    }

    /// Hostname queried for an environment.
    pub fn hostname(&self, env: &EnvironmentId) -> String {
        if self.suffix.is_empty() {
            env.host_label()
        } else {
            format!("{}.{}", env.host_label(), self.suffix)
        }
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, env: &EnvironmentId) -> Result<Target, ResolveError> {
        let hostname = self.hostname(env);

        let addrs: Vec<_> = lookup_host((hostname.as_str(), self.port))
            .await
            .map_err(|e| ResolveError::Lookup {
                name: hostname.clone(),
                detail: e.to_string(),
            })?
            .collect();

        // A records first, any address otherwise.
        let selected = addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .copied();

        match selected {
            Some(addr) => {
                debug!(
                    env_id = %env,
                    hostname = %hostname,
                    address_count = addrs.len(),
                    target = %addr,
                    "Resolved environment hostname"
                );
                Ok(Target::from(addr))
            }
            None => Err(ResolveError::NoHealthyInstance { service: hostname }),
        }
    }

    fn name(&self) -> &'static str {
        "dns"
    }
}
