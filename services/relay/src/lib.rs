pub mod config;
pub mod error;
pub mod health;
pub mod relay;
pub mod resolver;
pub mod shutdown;

pub use config::{Config, ResolverKind};
pub use error::{CredentialsError, RelayError, ResolveError};
pub use health::HealthListener;
pub use relay::{
    extract, ClientEndpoint, EnvironmentId, Forwarder, Relay, RelayConfig, RelayStats,
    SessionEntry, SessionSettings, SessionTable,
};
pub use resolver::{CachedResolver, DiscoveryResolver, DnsResolver, Resolver, Target};
pub use shutdown::Shutdown;
