//! Process-wide polling scheduler.
//!
//! The registry owns every `MonitorNode` and, once per tick, dispatches a
//! background task for each cache whose effective interval has elapsed.
//! Each fetch runs in its own task tracked by a `JoinSet`, so a hung or
//! panicking source never delays another node, and shutdown can either
//! wait for outstanding fetches or abandon them.

use crate::cache::Poller;
use crate::error::MonitorError;
use crate::metrics::SharedMetrics;
use crate::polling::node::MonitorNode;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default time between scheduling passes
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// What a forced poll applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTarget<'a> {
    Node(&'a str),
    All,
}

/// Outcome of [`PollingRegistry::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Fetch tasks that finished within the grace period
    pub completed: usize,
    /// Fetch tasks still running when the grace period ran out
    pub abandoned: usize,
}

/// Keeps `vigil_polls_in_flight` balanced even when a task is aborted.
struct InFlightMetric(Option<SharedMetrics>);

impl InFlightMetric {
    fn start(metrics: Option<SharedMetrics>) -> Self {
        if let Some(m) = &metrics {
            m.poll_started();
        }
        Self(metrics)
    }
}

impl Drop for InFlightMetric {
    fn drop(&mut self) {
        if let Some(m) = &self.0 {
            m.poll_finished();
        }
    }
}

/// Scheduler holding every registered node.
///
/// Constructed once at startup and shared by handle; there is no global instance.
pub struct PollingRegistry {
    nodes: RwLock<Vec<Arc<MonitorNode>>>,
    tick_interval: Duration,
    cancel: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    metrics: Option<SharedMetrics>,
}

impl PollingRegistry {
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            tick_interval,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(tick_interval: Duration, metrics: SharedMetrics) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::new(tick_interval)
        }
    }

    /// Register a node after its self-check passes.
    ///
    /// Returns `Ok(false)` when a node with the same key is already registered.
    pub fn try_add(&self, node: MonitorNode) -> Result<bool, MonitorError> {
        if let Err(e) = node.self_check() {
            error!(node = node.key(), node_type = node.node_type(), error = %e, "Node failed self-check, not registering");
            return Err(match e {
                MonitorError::Registration(_) => e,
                other => MonitorError::Registration(format!("{}: {}", node.key(), other)),
            });
        }

        let size = {
            let mut nodes = self.nodes.write();
            if nodes.iter().any(|n| n.key() == node.key()) {
                debug!(node = node.key(), "Node already registered");
                return Ok(false);
            }
            info!(
                node = node.key(),
                node_type = node.node_type(),
                caches = node.caches().len(),
                "Registered node"
            );
            nodes.push(Arc::new(node));
            nodes.len()
        };

        if let Some(m) = &self.metrics {
            m.set_registry_size(size);
        }
        Ok(true)
    }

    /// Deregister a node. Its caches are detached so late results are dropped.
    pub fn remove(&self, key: &str) -> Option<Arc<MonitorNode>> {
        let (removed, size) = {
            let mut nodes = self.nodes.write();
            let index = nodes.iter().position(|n| n.key() == key)?;
            (nodes.remove(index), nodes.len())
        };

        removed.detach();
        info!(node = key, "Deregistered node");

        if let Some(m) = &self.metrics {
            m.forget_node(key);
            m.set_registry_size(size);
        }
        Some(removed)
    }

    pub fn get(&self, key: &str) -> Option<Arc<MonitorNode>> {
        self.nodes.read().iter().find(|n| n.key() == key).cloned()
    }

    /// Snapshot of the registered nodes in registration order
    pub fn nodes(&self) -> Vec<Arc<MonitorNode>> {
        self.nodes.read().clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Fetch tasks dispatched and not yet reaped
    pub fn pending_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// One scheduling pass: dispatch every due cache that is not already
    /// fetching. Returns the number of fetches dispatched.
    pub fn tick(&self) -> usize {
        if self.cancel.is_cancelled() {
            return 0;
        }

        let nodes = self.nodes();
        let mut tasks = self.tasks.lock();
        reap_finished(&mut tasks);

        let mut dispatched = 0;
        for node in &nodes {
            for cache in node.due_caches() {
                if cache.is_in_flight() {
                    continue;
                }
                self.dispatch(&mut tasks, node.key(), cache, false);
                dispatched += 1;
            }

            if let Some(m) = &self.metrics {
                m.update_node_status(node.key(), node.aggregate_status());
            }
        }

        if dispatched > 0 {
            debug!(dispatched, pending = tasks.len(), "Dispatched polls");
        }
        dispatched
    }

    /// Poll now, ignoring refresh intervals and backoff.
    ///
    /// Caches already fetching are left alone, so this never starts a
    /// second concurrent fetch. Returns the number of fetches dispatched.
    pub fn force_poll(&self, target: PollTarget<'_>) -> Result<usize, MonitorError> {
        if self.cancel.is_cancelled() {
            return Err(MonitorError::Cancelled(
                "polling registry is shutting down".to_string(),
            ));
        }

        let nodes = match target {
            PollTarget::Node(key) => vec![self
                .get(key)
                .ok_or_else(|| MonitorError::NotFound(format!("node {}", key)))?],
            PollTarget::All => self.nodes(),
        };

        let mut tasks = self.tasks.lock();
        let mut dispatched = 0;
        for node in &nodes {
            for cache in node.caches() {
                if cache.is_in_flight() {
                    debug!(node = node.key(), cache = cache.key(), "Forced poll skipped, fetch in flight");
                    continue;
                }
                self.dispatch(&mut tasks, node.key(), cache.clone(), true);
                dispatched += 1;
            }
        }

        info!(poll_target = ?target, dispatched, "Forced poll");
        Ok(dispatched)
    }

    fn dispatch(
        &self,
        tasks: &mut JoinSet<()>,
        node: &str,
        cache: Arc<dyn Poller>,
        force: bool,
    ) {
        let node = node.to_string();
        let metrics = self.metrics.clone();

        tasks.spawn(async move {
            let _in_flight = InFlightMetric::start(metrics.clone());
            let started = Instant::now();
            let outcome = cache.poll(force).await;

            if let Some(m) = &metrics {
                if outcome.fetched() {
                    m.record_poll(
                        &node,
                        cache.key(),
                        outcome.label(),
                        started.elapsed().as_secs_f64(),
                    );
                }
            }
            debug!(node = %node, cache = cache.key(), outcome = outcome.label(), "Poll task finished");
        });
    }

    /// Drive `tick` until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            nodes = self.len(),
            tick_ms = self.tick_interval.as_millis() as u64,
            "Starting polling registry"
        );

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Polling registry received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }
    }

    /// Stop scheduling, then give in-flight fetches `grace` to finish.
    ///
    /// Fetches still running afterwards are aborted and every node is
    /// detached, so no result lands after shutdown returns.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.cancel.cancel();

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        info!(
            pending = tasks.len(),
            grace_ms = grace.as_millis() as u64,
            "Polling registry shutting down"
        );

        let mut completed = 0;
        let _ = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                log_join_error(result);
                completed += 1;
            }
        })
        .await;

        let abandoned = tasks.len();
        if abandoned > 0 {
            warn!(abandoned, "Abandoning fetches still running after grace period");
            for node in self.nodes() {
                node.detach();
            }
            tasks.shutdown().await;
        }

        let report = ShutdownReport {
            completed,
            abandoned,
        };
        info!(completed, abandoned, "Polling registry stopped");
        report
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(Some(result)) = tasks.join_next().now_or_never() {
        log_join_error(result);
    }
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Poll task panicked");
        }
    }
}
