//! Session table: client endpoint to pinned target.
//!
//! Only the first packet of a session pays for identifier extraction and
//! resolution. After that every packet from the same endpoint goes to the same
//! target, even if the environment would now resolve elsewhere.
//!
//! - At most one entry per client endpoint; the first established target wins
//! - Concurrent first packets from one endpoint run a single establishment,
//!   later arrivals wait for its outcome
//! - Entries are never mutated after creation apart from the activity clock
//!   used for idle eviction

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OnceCell, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::error::RelayError;
use crate::resolver::Target;

/// Default idle time after which a session is dropped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default cap on concurrent sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 65536;

/// Address and port identifying one client conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientEndpoint(SocketAddr);

impl ClientEndpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for ClientEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for ClientEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An established session.
#[derive(Debug)]
pub struct SessionEntry {
    client: ClientEndpoint,
    target: Target,
    created_at: Instant,
    /// Milliseconds after `created_at` of the latest packet.
    last_seen_ms: AtomicU64,
}

impl SessionEntry {
    fn new(client: ClientEndpoint, target: Target) -> Self {
        Self {
            client,
            target,
            created_at: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    pub fn client(&self) -> ClientEndpoint {
        self.client
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Record traffic on this session.
    pub fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_seen_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Time since the latest packet.
    pub fn idle_for(&self, now: Instant) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        now.saturating_duration_since(self.created_at)
            .saturating_sub(last_seen)
    }
}

/// Session table limits.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Idle time before eviction. `None` keeps sessions until shutdown.
    pub idle_timeout: Option<Duration>,
    /// Maximum concurrent sessions, including ones being established.
    pub max_sessions: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

#[derive(Debug, Default)]
struct SessionCounters {
    created: AtomicU64,
    evicted: AtomicU64,
    refused: AtomicU64,
}

/// Session table statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub active: usize,
    pub created: u64,
    pub evicted: u64,
    pub refused: u64,
}

/// Per-endpoint slot; empty while the first packet is being resolved.
type Slot = Arc<OnceCell<Arc<SessionEntry>>>;

/// Client endpoint to session mapping shared by all packet handlers.
pub struct SessionTable {
    slots: RwLock<HashMap<ClientEndpoint, Slot>>,
    settings: SessionSettings,
    counters: SessionCounters,
}

impl SessionTable {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            settings,
            counters: SessionCounters::default(),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Target pinned for a client, if a session is established.
    pub async fn lookup(&self, client: ClientEndpoint) -> Option<Target> {
        self.get(client).await.map(|entry| entry.target())
    }

    /// Established session for a client.
    pub async fn get(&self, client: ClientEndpoint) -> Option<Arc<SessionEntry>> {
        let slots = self.slots.read().await;
        slots.get(&client).and_then(|slot| slot.get().cloned())
    }

    /// Create a session unless one exists. The first target wins: when a
    /// session is already present (or being established and then succeeds)
    /// that entry is returned unchanged.
    pub async fn insert(
        &self,
        client: ClientEndpoint,
        target: Target,
    ) -> Result<Arc<SessionEntry>, RelayError> {
        let slot = self.slot(client).await?;
        let entry = slot
            .get_or_init(|| async {
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                Arc::new(SessionEntry::new(client, target))
            })
            .await;
        Ok(Arc::clone(entry))
    }

    /// Return the client's session, establishing it with `establish` if
    /// there is none.
    ///
    /// Callers racing on the same endpoint wait for the one establishment in
    /// progress. If it fails, the next waiter runs its own `establish`; a
    /// failure with no waiter left removes the slot. The returned flag is
    /// true when this call created the session.
    pub async fn get_or_establish<F, Fut>(
        &self,
        client: ClientEndpoint,
        establish: F,
    ) -> Result<(Arc<SessionEntry>, bool), RelayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Target, RelayError>>,
    {
        if let Some(entry) = self.get(client).await {
            entry.touch();
            return Ok((entry, false));
        }

        let slot = self.slot(client).await?;
        let created = AtomicBool::new(false);
        let created_ref = &created;
        let counters = &self.counters;

        let result = slot
            .get_or_try_init(|| async move {
                let target = establish().await?;
                created_ref.store(true, Ordering::Relaxed);
                counters.created.fetch_add(1, Ordering::Relaxed);
                Ok::<_, RelayError>(Arc::new(SessionEntry::new(client, target)))
            })
            .await
            .map(Arc::clone);

        match result {
            Ok(entry) => {
                entry.touch();
                let created = created.load(Ordering::Relaxed);
                if created {
                    debug!(client = %client, target = %entry.target(), "Session established");
                }
                Ok((entry, created))
            }
            Err(e) => {
                self.release_failed(client, slot).await;
                Err(e)
            }
        }
    }

    /// Remove a client's session.
    pub async fn remove(&self, client: ClientEndpoint) -> Option<Arc<SessionEntry>> {
        let mut slots = self.slots.write().await;
        slots.remove(&client).and_then(|slot| slot.get().cloned())
    }

    /// Remove sessions idle longer than the configured timeout.
    ///
    /// Returns the evicted endpoints so their upstream channels can be closed.
    pub async fn evict_idle(&self) -> Vec<ClientEndpoint> {
        let Some(timeout) = self.settings.idle_timeout else {
            return Vec::new();
        };

        let now = Instant::now();
        let mut evicted = Vec::new();
        let mut slots = self.slots.write().await;
        slots.retain(|client, slot| match slot.get() {
            Some(entry) if entry.idle_for(now) >= timeout => {
                debug!(
                    client = %entry.client(),
                    target = %entry.target(),
                    age_secs = now.saturating_duration_since(entry.created_at()).as_secs(),
                    "Session idle; evicting"
                );
                evicted.push(*client);
                false
            }
            _ => true,
        });
        drop(slots);

        if !evicted.is_empty() {
            self.counters
                .evicted
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            debug!(evicted = evicted.len(), "Evicted idle sessions");
        }

        evicted
    }

    /// Remove every session. Used by shutdown.
    pub async fn drain(&self) -> Vec<ClientEndpoint> {
        let mut slots = self.slots.write().await;
        slots.drain().map(|(client, _)| client).collect()
    }

    /// Number of slots, including sessions being established.
    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    pub async fn stats(&self) -> SessionStats {
        SessionStats {
            active: self.len().await,
            created: self.counters.created.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            refused: self.counters.refused.load(Ordering::Relaxed),
        }
    }

    /// Existing slot for a client, or a new empty one if capacity allows.
    async fn slot(&self, client: ClientEndpoint) -> Result<Slot, RelayError> {
        // Fast path: read lock
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(&client) {
                return Ok(Arc::clone(slot));
            }
        }

        // Slow path: write lock
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get(&client) {
            return Ok(Arc::clone(slot));
        }

        if slots.len() >= self.settings.max_sessions {
            self.counters.refused.fetch_add(1, Ordering::Relaxed);
            return Err(RelayError::SessionLimit {
                limit: self.settings.max_sessions,
            });
        }

        let slot = Slot::default();
        slots.insert(client, Arc::clone(&slot));
        Ok(slot)
    }

    async fn release_failed(&self, client: ClientEndpoint, slot: Slot) {
        let mut slots = self.slots.write().await;
        // The map and this caller are the only holders: no waiter will retry.
        let abandoned = slots.get(&client).is_some_and(|current| {
            Arc::ptr_eq(current, &slot)
                && !slot.initialized()
                && Arc::strong_count(&slot) == 2
        });
        if abandoned {
            slots.remove(&client);
        }
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new(SessionSettings::default())
    }
}
