//! UDP relay data path.
//!
//! This module provides:
//! - Environment id extraction from first packets
//! - The session table pinning each client endpoint to one target
//! - Upstream forwarding with reply relaying
//! - The UDP listener tying them together
//!
//! ## Architecture
//!
//! ```text
//! Client -> Relay -> Session Table --(miss)--> Extract -> Cached Resolver
//!                        |                                     |
//!                        +------------(hit)----> Forwarder <---+
//!                                                    |
//!                                        Target (replies back to Client)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use preview_relay::relay::{Relay, RelayConfig};
//!
//! let resolver = Arc::new(resolver::from_config(&config)?);
//! let relay = Arc::new(Relay::bind(RelayConfig::new("0.0.0.0:8080".parse()?), resolver).await?);
//! relay.run(shutdown_rx).await?;
//! ```

mod extract;
mod forward;
mod listener;
mod session;

pub use extract::{extract, EnvironmentId, MAX_ID_DIGITS};
pub use forward::{ForwardStats, Forwarder, DEFAULT_REPLY_TIMEOUT, MAX_DATAGRAM_SIZE};
pub use listener::{Relay, RelayConfig, RelayStats, DEFAULT_MAX_INFLIGHT};
pub use session::{
    ClientEndpoint, SessionEntry, SessionSettings, SessionStats, SessionTable,
    DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_SESSIONS,
};
