//! Stale-while-revalidate memoization with single-flight loads.
//!
//! Entries move through three windows:
//! - fresh (`now < stale_after`): served straight from the map
//! - stale (`stale_after <= now < expires_after`): served immediately, and the
//!   first caller to claim the key spawns one background reload
//! - expired: evicted, the next caller loads inline
//!
//! Cold loads and background refreshes claim the same per-key flight. The
//! claimant runs the loader; anyone needing the value meanwhile subscribes to
//! the flight's `watch` channel and receives its result, error included. A
//! flight held past the abandonment timeout is reclaimed.

use crate::error::MonitorError;
use crate::metrics::SharedMetrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default time after which an unreleased refresh marker is considered abandoned.
pub const DEFAULT_REFRESH_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone)]
struct StaleEntry<V> {
    value: V,
    /// Start of the load that produced `value`
    loaded_at: Instant,
    stale_after: Instant,
    expires_after: Instant,
}

type Published<V> = Option<Result<V, MonitorError>>;

/// A load or refresh in progress for one key
struct Flight<V> {
    id: u64,
    started_at: Instant,
    tx: Arc<watch::Sender<Published<V>>>,
}

enum Claim<K, V>
where
    K: Eq + Hash,
{
    Acquired(RefreshMarker<K, V>),
    Busy {
        rx: watch::Receiver<Published<V>>,
        deadline: Instant,
    },
}

/// Cumulative counters for a stale cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleCacheStats {
    /// Loads performed inline by a caller (cold or expired key)
    pub sync_loads: u64,
    /// Background refreshes that replaced an entry
    pub refresh_successes: u64,
    /// Background refreshes that failed and kept the previous value
    pub refresh_failures: u64,
    /// Refresh markers forcibly reclaimed after the abandonment timeout
    pub locks_healed: u64,
}

#[derive(Default)]
struct Counters {
    sync_loads: AtomicU64,
    refresh_successes: AtomicU64,
    refresh_failures: AtomicU64,
    locks_healed: AtomicU64,
}

struct Inner<K, V> {
    name: String,
    entries: DashMap<K, StaleEntry<V>>,
    flights: DashMap<K, Flight<V>>,
    next_flight_id: AtomicU64,
    refresh_lock_timeout: Duration,
    counters: Counters,
    metrics: Option<SharedMetrics>,
}

impl<K, V> Inner<K, V> {
    fn record(&self, counter: &AtomicU64, event: &str) {
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_stale_cache_event(&self.name, event);
        }
    }
}

/// Key-addressed stale-while-revalidate cache.
///
/// Cheap to clone; clones share the same entries.
pub struct StaleCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for StaleCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> StaleCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, refresh_lock_timeout: Duration) -> Self {
        Self::build(name.into(), refresh_lock_timeout, None)
    }

    pub fn with_metrics(
        name: impl Into<String>,
        refresh_lock_timeout: Duration,
        metrics: SharedMetrics,
    ) -> Self {
        Self::build(name.into(), refresh_lock_timeout, Some(metrics))
    }

    fn build(name: String, refresh_lock_timeout: Duration, metrics: Option<SharedMetrics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                entries: DashMap::new(),
                flights: DashMap::new(),
                next_flight_id: AtomicU64::new(1),
                refresh_lock_timeout,
                counters: Counters::default(),
                metrics,
            }),
        }
    }

    /// Return the cached value for `key`, loading or refreshing it as needed.
    ///
    /// `loader` receives the previous value when called for a background
    /// refresh and `None` for a cold load. Only cold-load failures reach the
    /// caller; a failed refresh keeps serving the old value.
    pub async fn get<F, Fut>(
        &self,
        key: K,
        loader: F,
        fresh_for: Duration,
        stale_grace: Duration,
    ) -> Result<V, MonitorError>
    where
        F: FnOnce(Option<V>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, MonitorError>> + Send + 'static,
    {
        let now = Instant::now();

        let existing = self.inner.entries.get(&key).map(|e| e.value().clone());
        if let Some(entry) = existing {
            if now < entry.stale_after {
                debug!(cache = %self.inner.name, key = ?key, "Cache HIT (fresh)");
                return Ok(entry.value);
            }

            if now < entry.expires_after {
                debug!(
                    cache = %self.inner.name,
                    key = ?key,
                    "Cache HIT (stale), attempting background refresh"
                );
                self.spawn_refresh(key, entry.value.clone(), loader, fresh_for, stale_grace);
                return Ok(entry.value);
            }

            self.inner
                .entries
                .remove_if(&key, |_, e| e.expires_after <= now);
        }

        debug!(cache = %self.inner.name, key = ?key, "Cache MISS, loading");
        self.load_coalesced(key, loader, fresh_for, stale_grace).await
    }

    async fn load_coalesced<F, Fut>(
        &self,
        key: K,
        loader: F,
        fresh_for: Duration,
        stale_grace: Duration,
    ) -> Result<V, MonitorError>
    where
        F: FnOnce(Option<V>) -> Fut,
        Fut: Future<Output = Result<V, MonitorError>>,
    {
        loop {
            let marker = match self.claim(&key) {
                Claim::Acquired(marker) => marker,
                Claim::Busy { rx, deadline } => {
                    match tokio::time::timeout_at(deadline, join_flight(rx)).await {
                        Ok(Some(result)) => return result,
                        // Claimant dropped without publishing, or overran the
                        // abandonment timeout: claim again.
                        Ok(None) | Err(_) => continue,
                    }
                }
            };

            // Another flight may have landed between the caller's lookup and the claim.
            let landed = self
                .inner
                .entries
                .get(&key)
                .filter(|e| Instant::now() < e.expires_after)
                .map(|e| e.value.clone());
            if let Some(value) = landed {
                let result = Ok(value);
                marker.publish(&result);
                return result;
            }

            let result = loader(None).await;
            match &result {
                Ok(value) => {
                    self.store(
                        key.clone(),
                        value.clone(),
                        marker.started_at,
                        fresh_for,
                        stale_grace,
                    );
                    self.inner
                        .record(&self.inner.counters.sync_loads, "sync_load");
                }
                Err(e) => {
                    warn!(cache = %self.inner.name, key = ?key, error = %e, "Cold load failed");
                }
            }

            marker.publish(&result);
            return result;
        }
    }

    fn spawn_refresh<F, Fut>(
        &self,
        key: K,
        previous: V,
        loader: F,
        fresh_for: Duration,
        stale_grace: Duration,
    ) where
        F: FnOnce(Option<V>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, MonitorError>> + Send + 'static,
    {
        let Some(marker) = self.try_begin_refresh(&key) else {
            debug!(cache = %self.inner.name, key = ?key, "Refresh already in progress");
            return;
        };

        let this = self.clone();
        tokio::spawn(async move {
            // Released on every exit path, unwinding included.
            let marker = marker;

            let result = loader(Some(previous)).await;
            match &result {
                Ok(value) => {
                    let stored = this.store(
                        key.clone(),
                        value.clone(),
                        marker.started_at,
                        fresh_for,
                        stale_grace,
                    );
                    if stored {
                        this.inner
                            .record(&this.inner.counters.refresh_successes, "refresh_ok");
                        debug!(cache = %this.inner.name, key = ?key, "Background refresh complete");
                    }
                }
                Err(e) => {
                    this.inner
                        .record(&this.inner.counters.refresh_failures, "refresh_failed");
                    warn!(
                        cache = %this.inner.name,
                        key = ?key,
                        error = %e,
                        "Background refresh failed, keeping previous value"
                    );
                }
            }
            marker.publish(&result);
        });
    }

    /// Try to become the refresher for `key`.
    ///
    /// Returns `None` while another load or refresh holds the key, unless it
    /// has held it longer than the abandonment timeout, in which case it is
    /// reclaimed.
    pub fn try_begin_refresh(&self, key: &K) -> Option<RefreshMarker<K, V>> {
        match self.claim(key) {
            Claim::Acquired(marker) => Some(marker),
            Claim::Busy { .. } => None,
        }
    }

    fn claim(&self, key: &K) -> Claim<K, V> {
        let now = Instant::now();
        let timeout = self.inner.refresh_lock_timeout;

        let (marker, healed) = match self.inner.flights.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let held_for = now.saturating_duration_since(occupied.get().started_at);
                if held_for < timeout {
                    let flight = occupied.get();
                    return Claim::Busy {
                        rx: flight.tx.subscribe(),
                        deadline: flight.started_at + timeout,
                    };
                }
                warn!(
                    cache = %self.inner.name,
                    key = ?key,
                    held_secs = held_for.as_secs(),
                    "Reclaiming abandoned refresh marker"
                );
                let (flight, marker) = self.new_flight(key, now);
                occupied.insert(flight);
                (marker, true)
            }
            Entry::Vacant(vacant) => {
                let (flight, marker) = self.new_flight(key, now);
                vacant.insert(flight);
                (marker, false)
            }
        };

        if healed {
            self.inner
                .record(&self.inner.counters.locks_healed, "lock_healed");
        }
        Claim::Acquired(marker)
    }

    fn new_flight(&self, key: &K, now: Instant) -> (Flight<V>, RefreshMarker<K, V>) {
        let id = self.inner.next_flight_id.fetch_add(1, Ordering::Relaxed);
        let (tx, _rx) = watch::channel(None);
        let tx = Arc::new(tx);
        let flight = Flight {
            id,
            started_at: now,
            tx: tx.clone(),
        };
        let marker = RefreshMarker {
            inner: self.inner.clone(),
            key: key.clone(),
            id,
            started_at: now,
            tx,
        };
        (flight, marker)
    }

    /// Insert `value` unless the entry already holds a value from a later load.
    fn store(
        &self,
        key: K,
        value: V,
        loaded_at: Instant,
        fresh_for: Duration,
        stale_grace: Duration,
    ) -> bool {
        let stale_after = Instant::now() + fresh_for;
        let entry = StaleEntry {
            value,
            loaded_at,
            stale_after,
            expires_after: stale_after + stale_grace,
        };

        match self.inner.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().loaded_at > loaded_at {
                    debug!(
                        cache = %self.inner.name,
                        key = ?occupied.key(),
                        "Discarding result superseded by a later load"
                    );
                    return false;
                }
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        true
    }

    /// Drop every entry past its grace window, returning how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, e| e.expires_after > now);
        before.saturating_sub(self.inner.entries.len())
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn stats(&self) -> StaleCacheStats {
        let c = &self.inner.counters;
        StaleCacheStats {
            sync_loads: c.sync_loads.load(Ordering::Relaxed),
            refresh_successes: c.refresh_successes.load(Ordering::Relaxed),
            refresh_failures: c.refresh_failures.load(Ordering::Relaxed),
            locks_healed: c.locks_healed.load(Ordering::Relaxed),
        }
    }
}

/// Wait for a flight's result. `None` if the claimant went away without publishing.
async fn join_flight<V: Clone>(
    mut rx: watch::Receiver<Published<V>>,
) -> Option<Result<V, MonitorError>> {
    loop {
        if let Some(result) = rx.borrow_and_update().clone() {
            return Some(result);
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}

/// Exclusive right to load or refresh one key. Released on drop.
pub struct RefreshMarker<K, V>
where
    K: Eq + Hash,
{
    inner: Arc<Inner<K, V>>,
    key: K,
    id: u64,
    started_at: Instant,
    tx: Arc<watch::Sender<Published<V>>>,
}

impl<K, V> RefreshMarker<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Hand the result to every caller waiting on this key.
    fn publish(&self, result: &Result<V, MonitorError>) {
        self.tx.send_replace(Some(result.clone()));
    }
}

impl<K, V> Drop for RefreshMarker<K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        // A flight reclaimed by someone else must not be cleared by its old owner.
        let id = self.id;
        self.inner
            .flights
            .remove_if(&self.key, |_, flight| flight.id == id);
    }
}
