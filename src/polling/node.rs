//! Monitored entities and their poll pacing.
//!
//! A `MonitorNode` is one logical backend (a Redis instance, a SQL server, a
//! CDN account) that owns a fixed set of caches, all constructed up front.
//! The node rolls their health into one status and decides how often each
//! cache may be polled, widening the interval while the backend is failing.

use crate::cache::{CacheInfo, DataCache, MonitorStatus, Poller};
use crate::error::MonitorError;
use serde::Serialize;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Default floor between two polls of the same cache
pub const DEFAULT_MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Exponential backoff applied once a node keeps failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Consecutive failures before backoff kicks in (0 disables backoff)
    pub after_failures: u32,
    /// Delay at the first backed-off poll, doubled per further failure
    pub base: Duration,
    /// Upper bound for the delay
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(after_failures: u32, base: Duration, max: Duration) -> Self {
        Self {
            after_failures,
            base,
            max,
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Delay to apply given the current run of failures
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        if self.after_failures == 0 || consecutive_failures < self.after_failures {
            return Duration::ZERO;
        }
        let doublings = (consecutive_failures - self.after_failures).min(16);
        self.base
            .saturating_mul(1u32 << doublings)
            .min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5), Duration::from_secs(300))
    }
}

type SelfCheckFn = Arc<dyn Fn(&MonitorNode) -> Result<(), MonitorError> + Send + Sync>;

/// Serializable node summary
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub key: String,
    pub node_type: String,
    pub status: MonitorStatus,
    pub consecutive_failures: u32,
    pub backoff_secs: u64,
    pub min_poll_interval_secs: u64,
    pub caches: Vec<CacheInfo>,
}

/// A monitored entity composed of independently polled caches.
///
/// Identity is the unique key (e.g. `host:port`).
pub struct MonitorNode {
    key: String,
    node_type: String,
    min_poll_interval: Duration,
    backoff: BackoffPolicy,
    caches: Vec<Arc<dyn Poller>>,
    self_check: Option<SelfCheckFn>,
}

impl MonitorNode {
    pub fn builder(key: impl Into<String>, node_type: impl Into<String>) -> MonitorNodeBuilder {
        MonitorNodeBuilder {
            key: key.into(),
            node_type: node_type.into(),
            min_poll_interval: DEFAULT_MIN_POLL_INTERVAL,
            backoff: BackoffPolicy::default(),
            caches: Vec::new(),
            self_check: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn min_poll_interval(&self) -> Duration {
        self.min_poll_interval
    }

    /// The caches registered for this node
    pub fn caches(&self) -> &[Arc<dyn Poller>] {
        &self.caches
    }

    pub fn cache(&self, key: &str) -> Option<&Arc<dyn Poller>> {
        self.caches.iter().find(|c| c.key() == key)
    }

    /// Worst status across all caches; `Unknown` until one has been polled.
    pub fn aggregate_status(&self) -> MonitorStatus {
        MonitorStatus::worst(self.caches.iter().map(|c| c.status()))
    }

    /// Longest current run of failures across the node's caches
    pub fn consecutive_failures(&self) -> u32 {
        self.caches
            .iter()
            .map(|c| c.consecutive_failures())
            .max()
            .unwrap_or(0)
    }

    /// Extra spacing between polls while the node is failing
    pub fn backoff(&self) -> Duration {
        self.backoff.delay_for(self.consecutive_failures())
    }

    /// When the node leaves backoff, if it is currently backing off
    pub fn backoff_until(&self) -> Option<Instant> {
        let backoff = self.backoff();
        if backoff.is_zero() {
            return None;
        }
        self.caches
            .iter()
            .filter_map(|c| c.last_poll_at())
            .max()
            .map(|last| last + backoff)
    }

    /// Minimum time between polls of `cache`, including any backoff
    pub fn effective_interval(&self, cache: &dyn Poller) -> Duration {
        self.min_poll_interval
            .max(cache.refresh_interval())
            .max(self.backoff())
    }

    /// Caches whose effective interval has elapsed since their last poll
    pub fn due_caches(&self) -> Vec<Arc<dyn Poller>> {
        let backoff = self.backoff();
        self.caches
            .iter()
            .filter(|c| {
                let interval = self
                    .min_poll_interval
                    .max(c.refresh_interval())
                    .max(backoff);
                c.is_due(interval)
            })
            .cloned()
            .collect()
    }

    /// Startup validation run before the node is registered.
    pub fn self_check(&self) -> Result<(), MonitorError> {
        if self.key.trim().is_empty() {
            return Err(MonitorError::Registration(format!(
                "{} node has an empty key",
                self.node_type
            )));
        }
        if self.caches.is_empty() {
            return Err(MonitorError::Registration(format!(
                "{} has no caches to poll",
                self.key
            )));
        }

        let mut seen = HashSet::new();
        for cache in &self.caches {
            if !seen.insert(cache.key()) {
                return Err(MonitorError::Registration(format!(
                    "{} declares cache {} twice",
                    self.key,
                    cache.key()
                )));
            }
        }

        match &self.self_check {
            Some(check) => check(self),
            None => Ok(()),
        }
    }

    /// Stop all polling for this node; results still in flight are dropped.
    pub fn detach(&self) {
        for cache in &self.caches {
            cache.detach();
        }
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            key: self.key.clone(),
            node_type: self.node_type.clone(),
            status: self.aggregate_status(),
            consecutive_failures: self.consecutive_failures(),
            backoff_secs: self.backoff().as_secs(),
            min_poll_interval_secs: self.min_poll_interval.as_secs(),
            caches: self.caches.iter().map(|c| c.info()).collect(),
        }
    }
}

impl PartialEq for MonitorNode {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for MonitorNode {}

impl Hash for MonitorNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl std::fmt::Debug for MonitorNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorNode")
            .field("key", &self.key)
            .field("node_type", &self.node_type)
            .field("caches", &self.caches.iter().map(|c| c.key()).collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`MonitorNode`]
pub struct MonitorNodeBuilder {
    key: String,
    node_type: String,
    min_poll_interval: Duration,
    backoff: BackoffPolicy,
    caches: Vec<Arc<dyn Poller>>,
    self_check: Option<SelfCheckFn>,
}

impl MonitorNodeBuilder {
    pub fn min_poll_interval(mut self, interval: Duration) -> Self {
        self.min_poll_interval = interval;
        self
    }

    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = policy;
        self
    }

    /// Register a cache. Callers keep their own clone for typed reads.
    pub fn cache<T>(mut self, cache: DataCache<T>) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.caches.push(Arc::new(cache));
        self
    }

    pub fn self_check(
        mut self,
        check: impl Fn(&MonitorNode) -> Result<(), MonitorError> + Send + Sync + 'static,
    ) -> Self {
        self.self_check = Some(Arc::new(check));
        self
    }

    pub fn build(self) -> MonitorNode {
        for cache in &self.caches {
            cache.set_owner(&self.key);
        }
        MonitorNode {
            key: self.key,
            node_type: self.node_type,
            min_poll_interval: self.min_poll_interval,
            backoff: self.backoff,
            caches: self.caches,
            self_check: self.self_check,
        }
    }
}
