//! Short-TTL memoization in front of a [`Resolver`].
//!
//! - A hit younger than the TTL is served without touching the resolver
//! - Concurrent misses for one environment share a single resolver call
//! - Failures are never cached

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{timeout, Instant};
use tracing::debug;

use super::{Resolver, Target};
use crate::error::ResolveError;
use crate::relay::EnvironmentId;

/// Default lifetime of a cached resolution.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// A memoized resolution.
#[derive(Debug, Clone)]
struct CacheEntry {
    target: Target,
    resolved_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.resolved_at.elapsed() < ttl
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    resolver_calls: AtomicU64,
    failures: AtomicU64,
}

/// Snapshot of cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub resolver_calls: u64,
    pub failures: u64,
    pub entries: usize,
}

/// Resolver wrapper that caches successful resolutions for a fixed TTL.
pub struct CachedResolver {
    inner: Arc<dyn Resolver>,
    ttl: Duration,
    resolve_timeout: Duration,
    entries: RwLock<HashMap<EnvironmentId, CacheEntry>>,
    /// Per-environment gates serializing misses.
    inflight: Mutex<HashMap<EnvironmentId, Arc<Mutex<()>>>>,
    counters: CacheCounters,
}

impl CachedResolver {
    pub fn new(inner: Arc<dyn Resolver>, ttl: Duration, resolve_timeout: Duration) -> Self {
        Self {
            inner,
            ttl,
            resolve_timeout,
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            counters: CacheCounters::default(),
        }
    }

    /// Resolve through the cache.
    pub async fn resolve(&self, env: &EnvironmentId) -> Result<Target, ResolveError> {
        if let Some(target) = self.cached(env).await {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(target);
        }

        let gate = self.gate(env).await;
        let result = {
            let _held = gate.lock().await;

            // Another caller may have filled the entry while we waited.
            match self.cached(env).await {
                Some(target) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    Ok(target)
                }
                None => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    self.fetch(env).await
                }
            }
        };
        self.release_gate(env, gate).await;

        result
    }

    async fn cached(&self, env: &EnvironmentId) -> Option<Target> {
        let entries = self.entries.read().await;
        entries
            .get(env)
            .filter(|entry| entry.is_fresh(self.ttl))
            .map(|entry| entry.target)
    }

    async fn fetch(&self, env: &EnvironmentId) -> Result<Target, ResolveError> {
        self.counters.resolver_calls.fetch_add(1, Ordering::Relaxed);

        let result = match timeout(self.resolve_timeout, self.inner.resolve(env)).await {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout {
                name: env.service_name(),
                timeout: self.resolve_timeout,
            }),
        };

        match &result {
            Ok(target) => {
                let mut entries = self.entries.write().await;
                entries.insert(
                    env.clone(),
                    CacheEntry {
                        target: *target,
                        resolved_at: Instant::now(),
                    },
                );
                debug!(
                    env_id = %env,
                    target = %target,
                    resolver = self.inner.name(),
                    "Resolution cached"
                );
            }
            Err(_) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        result
    }

    async fn gate(&self, env: &EnvironmentId) -> Arc<Mutex<()>> {
        let mut inflight = self.inflight.lock().await;
        Arc::clone(inflight.entry(env.clone()).or_default())
    }

    async fn release_gate(&self, env: &EnvironmentId, gate: Arc<Mutex<()>>) {
        let mut inflight = self.inflight.lock().await;
        // Only the map and this caller still hold it: nobody else is waiting.
        if inflight
            .get(env)
            .is_some_and(|current| Arc::ptr_eq(current, &gate) && Arc::strong_count(&gate) == 2)
        {
            inflight.remove(env);
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(self.ttl));
        before - entries.len()
    }

    /// Name of the wrapped strategy.
    pub fn strategy(&self) -> &'static str {
        self.inner.name()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            resolver_calls: self.counters.resolver_calls.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            entries: self.entries.read().await.len(),
        }
    }
}

#[async_trait]
impl Resolver for CachedResolver {
    async fn resolve(&self, env: &EnvironmentId) -> Result<Target, ResolveError> {
        CachedResolver::resolve(self, env).await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
