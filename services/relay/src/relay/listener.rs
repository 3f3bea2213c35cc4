//! UDP listener and per-datagram handling.
//!
//! Every datagram is handled on its own task:
//!
//! 1. Known client endpoint: forward to the pinned target
//! 2. Unknown endpoint: extract the environment id, resolve it, pin the
//!    session, then forward
//! 3. No id or failed resolution: drop silently, create nothing
//!
//! Nothing is ever sent back to a client on failure; UDP clients are
//! expected to retry.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use super::extract::extract;
use super::forward::{Forwarder, DEFAULT_REPLY_TIMEOUT, MAX_DATAGRAM_SIZE};
use super::session::{ClientEndpoint, SessionSettings, SessionTable};
use crate::error::RelayError;
use crate::resolver::CachedResolver;

/// Default limit on datagrams being handled at once.
pub const DEFAULT_MAX_INFLIGHT: usize = 10000;

/// Relay listener configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// Datagrams handled concurrently; excess datagrams are dropped.
    pub max_inflight: usize,
    /// Bound on one wait for a reply on an upstream channel.
    pub reply_timeout: Duration,
    pub sessions: SessionSettings,
}

impl RelayConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            sessions: SessionSettings::default(),
        }
    }
}

/// Data-path counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Datagrams read from the listener socket.
    pub datagrams_received: AtomicU64,
    /// Datagrams forwarded to a target.
    pub datagrams_forwarded: AtomicU64,
    /// First packets without an environment id.
    pub dropped_no_identifier: AtomicU64,
    /// First packets whose environment could not be resolved.
    pub dropped_resolve_failed: AtomicU64,
    /// First packets refused by the session limit.
    pub dropped_session_limit: AtomicU64,
    /// Datagrams dropped because too many were in flight.
    pub dropped_overload: AtomicU64,
    /// Sends to a target that failed.
    pub send_failures: AtomicU64,
    /// Sessions established by a first packet.
    pub sessions_created: AtomicU64,
}

/// The UDP relay.
pub struct Relay {
    config: RelayConfig,
    socket: Arc<UdpSocket>,
    resolver: Arc<CachedResolver>,
    sessions: Arc<SessionTable>,
    forwarder: Arc<Forwarder>,
    inflight: Arc<Semaphore>,
    stats: Arc<RelayStats>,
}

impl Relay {
    /// Bind the listener socket. Failure here is fatal to the process.
    pub async fn bind(config: RelayConfig, resolver: Arc<CachedResolver>) -> Result<Self, RelayError> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr().map_err(|source| RelayError::Bind {
            addr: config.bind_addr,
            source,
        })?;

        info!(
            bind_addr = %local_addr,
            resolver = resolver.strategy(),
            max_inflight = config.max_inflight,
            max_sessions = config.sessions.max_sessions,
            cache_ttl_ms = resolver.ttl().as_millis() as u64,
            idle_timeout_secs = config.sessions.idle_timeout.map(|t| t.as_secs()),
            "Relay bound"
        );

        Ok(Self {
            forwarder: Forwarder::new(
                Arc::clone(&socket),
                config.reply_timeout,
                config.sessions.idle_timeout,
            ),
            sessions: Arc::new(SessionTable::new(config.sessions.clone())),
            inflight: Arc::new(Semaphore::new(config.max_inflight)),
            stats: Arc::new(RelayStats::default()),
            socket,
            resolver,
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Data-path counters.
    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Session table pinning clients to targets.
    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Upstream channels and reply relaying.
    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    /// Cached resolver used for first packets.
    pub fn resolver(&self) -> &Arc<CachedResolver> {
        &self.resolver
    }

    /// Receive datagrams until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.socket.local_addr()?;
        info!(bind_addr = %local_addr, "Relay started");

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let received = tokio::select! {
                received = self.socket.recv_from(&mut buf) => received,
                _ = shutdown.changed() => {
                    info!(bind_addr = %local_addr, "Relay stopped accepting datagrams");
                    return Ok(());
                }
            };

            match received {
                Ok((len, peer_addr)) => {
                    self.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);

                    let permit = match Arc::clone(&self.inflight).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats.dropped_overload.fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Datagram dropped: too many in flight");
                            continue;
                        }
                    };

                    let payload = buf[..len].to_vec();
                    let relay = Arc::clone(&self);
                    tokio::spawn(
                        async move {
                            relay
                                .handle_datagram(payload, ClientEndpoint::new(peer_addr))
                                .await;
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("datagram", client = %peer_addr, len)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Receive error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle one datagram from `client`.
    pub async fn handle_datagram(&self, payload: Vec<u8>, client: ClientEndpoint) {
        let establish = || async {
            let env = extract(&payload).ok_or(RelayError::NoIdentifier)?;
            let target = self.resolver.resolve(&env).await?;
            info!(env_id = %env, target = %target, "Resolved environment for new session");
            Ok::<_, RelayError>(target)
        };

        let session = match self.sessions.get_or_establish(client, establish).await {
            Ok((session, created)) => {
                if created {
                    self.stats.sessions_created.fetch_add(1, Ordering::Relaxed);
                }
                session
            }
            Err(RelayError::NoIdentifier) => {
                self.stats
                    .dropped_no_identifier
                    .fetch_add(1, Ordering::Relaxed);
                debug!("No environment identifier in first packet; dropped");
                return;
            }
            Err(RelayError::Resolve(e)) => {
                self.stats
                    .dropped_resolve_failed
                    .fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, kind = e.kind(), "Resolution failed; dropped");
                return;
            }
            Err(RelayError::SessionLimit { limit }) => {
                self.stats
                    .dropped_session_limit
                    .fetch_add(1, Ordering::Relaxed);
                warn!(limit, "Session limit reached; dropped");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Session setup failed; dropped");
                return;
            }
        };

        match self
            .forwarder
            .forward(&payload, session.target(), client)
            .await
        {
            Ok(_) => {
                self.stats
                    .datagrams_forwarded
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // The session survives; the next datagram tries again.
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Forward failed");
            }
        }
    }

    /// Evict idle sessions and close their upstream channels.
    pub async fn evict_idle(&self) -> usize {
        let evicted = self.sessions.evict_idle().await;
        for client in &evicted {
            self.forwarder.close(*client).await;
        }
        evicted.len()
    }

    /// Periodic idle eviction and cache cleanup until shutdown.
    pub async fn run_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(idle_timeout) = self.sessions.settings().idle_timeout else {
            debug!("Session eviction disabled");
            return;
        };
        let period = (idle_timeout / 10).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            let evicted = self.evict_idle().await;
            let purged = self.resolver.purge_expired().await;
            if evicted > 0 || purged > 0 {
                debug!(evicted, purged, "Maintenance pass");
            }
        }
    }

    /// Wait for in-flight datagrams, then tear down sessions and upstreams.
    ///
    /// Returns false when the timeout expired with work still in flight.
    pub async fn drain(&self, drain_timeout: Duration) -> bool {
        let permits = self.config.max_inflight as u32;
        let drained = matches!(
            timeout(drain_timeout, Arc::clone(&self.inflight).acquire_many_owned(permits)).await,
            Ok(Ok(_))
        );
        if !drained {
            warn!(
                timeout_ms = drain_timeout.as_millis() as u64,
                inflight = self.config.max_inflight - self.inflight.available_permits(),
                "Drain timed out with datagrams in flight"
            );
        }

        let sessions = self.sessions.drain().await.len();
        let upstreams = self.forwarder.close_all().await;
        info!(sessions, upstreams, "Sessions closed");

        drained
    }

    /// Log counters. Called once at shutdown.
    pub async fn log_stats(&self) {
        let cache = self.resolver.stats().await;
        let forward = self.forwarder.stats().await;
        let sessions = self.sessions.stats().await;
        info!(
            datagrams_received = self.stats.datagrams_received.load(Ordering::Relaxed),
            datagrams_forwarded = self.stats.datagrams_forwarded.load(Ordering::Relaxed),
            dropped_no_identifier = self.stats.dropped_no_identifier.load(Ordering::Relaxed),
            dropped_resolve_failed = self.stats.dropped_resolve_failed.load(Ordering::Relaxed),
            dropped_session_limit = self.stats.dropped_session_limit.load(Ordering::Relaxed),
            dropped_overload = self.stats.dropped_overload.load(Ordering::Relaxed),
            send_failures = self.stats.send_failures.load(Ordering::Relaxed),
            sessions_created = sessions.created,
            sessions_evicted = sessions.evicted,
            replies_relayed = forward.replies_relayed,
            cache_hits = cache.hits,
            cache_misses = cache.misses,
            resolver_calls = cache.resolver_calls,
            "Relay statistics"
        );
    }
}
