//! Relay configuration.
//!
//! Everything comes from environment variables; every variable has a default
//! so the relay starts with no configuration at all.

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;

use crate::relay::{
    RelayConfig, SessionSettings, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_INFLIGHT,
    DEFAULT_MAX_SESSIONS, DEFAULT_REPLY_TIMEOUT,
};
use crate::resolver::{DEFAULT_CACHE_TTL, DEFAULT_RESOLVE_TIMEOUT};
use crate::shutdown::DEFAULT_SHUTDOWN_TIMEOUT;

/// Resolution strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverKind {
    /// Service discovery registry query.
    Discovery,
    /// A-record lookup of `pr-<id>.<suffix>`.
    Dns,
}

impl FromStr for ResolverKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discovery" | "cloudmap" => Ok(Self::Discovery),
            "dns" => Ok(Self::Dns),
            other => anyhow::bail!("Unknown resolver '{other}' (expected 'discovery' or 'dns')"),
        }
    }
}

/// Relay configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// UDP listen address.
    pub listen_addr: SocketAddr,

    /// TCP health check address.
    pub health_addr: SocketAddr,

    /// Strategy used to resolve environments.
    pub resolver: ResolverKind,

    /// Registry region.
    pub region: String,

    /// Registry namespace holding `pr-<id>-service` entries.
    pub namespace: String,

    /// Registry endpoint override (local emulators, VPC endpoints).
    pub discovery_endpoint: Option<String>,

    /// Domain appended to `pr-<id>` by the DNS strategy.
    pub dns_suffix: String,

    /// Backend port when the resolver does not supply one.
    pub target_port: u16,

    /// How long a successful resolution is reused.
    pub cache_ttl: Duration,

    /// Bound on one resolver call.
    pub resolve_timeout: Duration,

    /// Bound on one wait for a reply from the target.
    pub reply_timeout: Duration,

    /// Idle time before a session is evicted. `None` disables eviction.
    pub session_idle_timeout: Option<Duration>,

    /// Cap on concurrent sessions.
    pub max_sessions: usize,

    /// Datagrams handled concurrently.
    pub max_inflight: usize,

    /// Drain budget at shutdown.
    pub shutdown_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let listen_addr: SocketAddr = parse_or(
            &var,
            "RELAY_LISTEN_ADDR",
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
        )?;
        let health_addr: SocketAddr = parse_or(
            &var,
            "RELAY_HEALTH_ADDR",
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8081)),
        )?;
        let resolver = parse_or(&var, "RELAY_RESOLVER", ResolverKind::Discovery)?;

        let region = var("AWS_REGION")
            .or_else(|| var("RELAY_REGION"))
            .unwrap_or_else(|| "us-east-1".to_string());
        let namespace = var("RELAY_NAMESPACE").unwrap_or_else(|| "pr-env.local".to_string());
        let discovery_endpoint = var("RELAY_DISCOVERY_ENDPOINT");
        let dns_suffix = var("RELAY_DNS_SUFFIX").unwrap_or_else(|| "local".to_string());

        let target_port: u16 = parse_or(&var, "RELAY_TARGET_PORT", 8080)?;

        let cache_ttl = Duration::from_millis(parse_or(
            &var,
            "RELAY_CACHE_TTL_MS",
            millis(DEFAULT_CACHE_TTL),
        )?);
        let resolve_timeout = Duration::from_millis(
            parse_or(&var, "RELAY_RESOLVE_TIMEOUT_MS", millis(DEFAULT_RESOLVE_TIMEOUT))?.max(1),
        );
        let reply_timeout = Duration::from_millis(
            parse_or(&var, "RELAY_REPLY_TIMEOUT_MS", millis(DEFAULT_REPLY_TIMEOUT))?.max(1),
        );

        let idle_secs: u64 = parse_or(
            &var,
            "RELAY_SESSION_IDLE_TIMEOUT_SECS",
            DEFAULT_IDLE_TIMEOUT.as_secs(),
        )?;
        let session_idle_timeout = (idle_secs > 0).then(|| Duration::from_secs(idle_secs));

        let max_sessions: usize =
            parse_or(&var, "RELAY_MAX_SESSIONS", DEFAULT_MAX_SESSIONS)?.max(1);
        let max_inflight: usize = parse_or(&var, "RELAY_MAX_INFLIGHT", DEFAULT_MAX_INFLIGHT)?
            .clamp(1, u32::MAX as usize);

        let shutdown_timeout = Duration::from_millis(parse_or(
            &var,
            "RELAY_SHUTDOWN_TIMEOUT_MS",
            millis(DEFAULT_SHUTDOWN_TIMEOUT),
        )?);

        let log_level = var("RELAY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            health_addr,
            resolver,
            region,
            namespace,
            discovery_endpoint,
            dns_suffix,
            target_port,
            cache_ttl,
            resolve_timeout,
            reply_timeout,
            session_idle_timeout,
            max_sessions,
            max_inflight,
            shutdown_timeout,
            log_level,
        })
    }

    /// Listener settings derived from this configuration.
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            bind_addr: self.listen_addr,
            max_inflight: self.max_inflight,
            reply_timeout: self.reply_timeout,
            sessions: SessionSettings {
                idle_timeout: self.session_idle_timeout,
                max_sessions: self.max_sessions,
            },
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => {
            let raw = raw.trim();
            raw.parse()
                .map_err(|e| anyhow::anyhow!("{key} has an invalid value '{raw}': {e}"))
        }
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.listen_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.health_addr.to_string(), "0.0.0.0:8081");
        assert_eq!(config.resolver, ResolverKind::Discovery);
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.namespace, "pr-env.local");
        assert_eq!(config.target_port, 8080);
        assert_eq!(config.cache_ttl, Duration::from_secs(30));
        assert_eq!(config.session_idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.max_sessions, 65_536);
        assert!(config.discovery_endpoint.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("RELAY_LISTEN_ADDR", "127.0.0.1:9999"),
            ("RELAY_RESOLVER", "DNS"),
            ("RELAY_DNS_SUFFIX", "preview.internal"),
            ("AWS_REGION", "eu-west-1"),
            ("RELAY_REGION", "ignored"),
            ("RELAY_CACHE_TTL_MS", "500"),
        ])
        .unwrap();
        assert_eq!(config.listen_addr.port(), 9999);
        assert_eq!(config.resolver, ResolverKind::Dns);
        assert_eq!(config.dns_suffix, "preview.internal");
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.cache_ttl, Duration::from_millis(500));
    }

    #[test]
    fn test_zero_idle_timeout_disables_eviction() {
        let config = config(&[("RELAY_SESSION_IDLE_TIMEOUT_SECS", "0")]).unwrap();
        assert!(config.session_idle_timeout.is_none());
        assert!(config.relay_config().sessions.idle_timeout.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = config(&[("RELAY_TARGET_PORT", "70000")]).unwrap_err();
        assert!(err.to_string().contains("RELAY_TARGET_PORT"));

        assert!(config(&[("RELAY_LISTEN_ADDR", "nope")]).is_err());
        assert!(config(&[("RELAY_RESOLVER", "consul")]).is_err());
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = config(&[("RELAY_NAMESPACE", "  "), ("RELAY_MAX_SESSIONS", "")]).unwrap();
        assert_eq!(config.namespace, "pr-env.local");
        assert_eq!(config.max_sessions, 65_536);
    }
}
