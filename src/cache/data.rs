//! Per-source polling cache.
//!
//! A `DataCache<T>` wraps one async fetch function. It keeps the last value
//! that was fetched successfully, along with poll bookkeeping, and never
//! blocks readers on a fetch. At most one fetch runs at a time; a failed
//! fetch records the error but leaves the last good value in place.

use crate::cache::status::MonitorStatus;
use crate::error::MonitorError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default minimum time between fetch starts
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive failures after which a cache with data is reported critical
pub const CRITICAL_AFTER_FAILURES: u32 = 3;

/// Successful data older than this many refresh intervals is reported as a warning
const STALE_INTERVALS: u32 = 3;

pub type FetchFuture<T> = BoxFuture<'static, Result<T, MonitorError>>;
type FetchFn<T> = Arc<dyn Fn() -> FetchFuture<T> + Send + Sync>;
type AfterSuccessFn<T> = Arc<dyn Fn(&T) + Send + Sync>;
type EnrichErrorFn = Arc<dyn Fn(MonitorError) -> MonitorError + Send + Sync>;
type StatusFn<T> = Arc<dyn Fn(&T) -> MonitorStatus + Send + Sync>;

/// Why a refresh did not start a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A fetch for this cache is already running
    InFlight,
    /// The refresh interval has not elapsed since the last poll started
    NotDue,
    /// The owning node was deregistered
    Detached,
}

/// Result of a call to [`DataCache::refresh`]
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Skipped(SkipReason),
    Succeeded,
    Failed(MonitorError),
    /// The fetch finished or was cancelled after the cache was detached;
    /// nothing was applied.
    Discarded,
}

impl PollOutcome {
    /// Label used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            PollOutcome::Skipped(_) => "skipped",
            PollOutcome::Succeeded => "success",
            PollOutcome::Failed(_) => "error",
            PollOutcome::Discarded => "discarded",
        }
    }

    pub fn fetched(&self) -> bool {
        matches!(self, PollOutcome::Succeeded | PollOutcome::Failed(_))
    }
}

/// Serializable view of a cache's state
#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub key: String,
    pub status: MonitorStatus,
    pub has_data: bool,
    pub in_flight: bool,
    pub poll_count: u64,
    pub error_count: u64,
    pub consecutive_failures: u32,
    pub refresh_interval_secs: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_poll_duration_ms: Option<u64>,
    pub last_error: Option<String>,
}

struct PollState<T> {
    data: Option<Arc<T>>,
    last_poll_at: Option<Instant>,
    last_success_at: Option<Instant>,
    last_poll_wall: Option<DateTime<Utc>>,
    last_success_wall: Option<DateTime<Utc>>,
    last_poll_duration: Option<Duration>,
    last_error: Option<MonitorError>,
    poll_count: u64,
    error_count: u64,
    consecutive_failures: u32,
}

impl<T> Default for PollState<T> {
    fn default() -> Self {
        Self {
            data: None,
            last_poll_at: None,
            last_success_at: None,
            last_poll_wall: None,
            last_success_wall: None,
            last_poll_duration: None,
            last_error: None,
            poll_count: 0,
            error_count: 0,
            consecutive_failures: 0,
        }
    }
}

struct Inner<T> {
    key: String,
    owner: OnceLock<String>,
    fetch: FetchFn<T>,
    after_success: Option<AfterSuccessFn<T>>,
    enrich_error: Option<EnrichErrorFn>,
    status_fn: Option<StatusFn<T>>,
    refresh_interval: Duration,
    stale_after: Duration,
    fetch_timeout: Option<Duration>,
    state: RwLock<PollState<T>>,
    in_flight: AtomicBool,
    detached: AtomicBool,
    cancel: CancellationToken,
}

/// Polling cache for one kind of data from one source.
///
/// Cloning is cheap and yields a handle to the same cache.
pub struct DataCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DataCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Clears the in-flight flag on every exit path of a refresh.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl<T> DataCache<T>
where
    T: Send + Sync + 'static,
{
    pub fn builder<F, Fut>(key: impl Into<String>, fetch: F) -> DataCacheBuilder<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, MonitorError>> + Send + 'static,
    {
        DataCacheBuilder {
            key: key.into(),
            fetch: Arc::new(move || fetch().boxed()),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            after_success: None,
            enrich_error: None,
            status_fn: None,
            stale_after: None,
            fetch_timeout: None,
        }
    }

    /// Poll the source unless a fetch is already running or, when not
    /// forced, the refresh interval has not yet elapsed.
    pub async fn refresh(&self, force: bool) -> PollOutcome {
        let inner = &*self.inner;

        if inner.detached.load(Ordering::Acquire) {
            return PollOutcome::Skipped(SkipReason::Detached);
        }
        if !force && !self.is_due(inner.refresh_interval) {
            return PollOutcome::Skipped(SkipReason::NotDue);
        }
        let Some(_guard) = InFlightGuard::acquire(&inner.in_flight) else {
            debug!(cache = %inner.key, "Fetch already in flight, skipping");
            return PollOutcome::Skipped(SkipReason::InFlight);
        };
        // A fetch that held the guard may have just stamped this poll.
        if !force && !self.is_due(inner.refresh_interval) {
            return PollOutcome::Skipped(SkipReason::NotDue);
        }

        let started = Instant::now();
        debug!(node = self.owner(), cache = %inner.key, force, "Polling");

        let fetch = (inner.fetch)();
        let result = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => {
                debug!(cache = %inner.key, "Fetch cancelled");
                return PollOutcome::Discarded;
            }
            result = with_timeout(fetch, inner.fetch_timeout, &inner.key) => result,
        };

        self.apply(result, started)
    }

    fn apply(&self, result: Result<T, MonitorError>, started: Instant) -> PollOutcome {
        let inner = &*self.inner;
        let now = Instant::now();
        let wall = Utc::now();

        match result {
            Ok(value) => {
                let value = Arc::new(value);
                {
                    let mut state = inner.state.write();
                    if inner.detached.load(Ordering::Acquire) {
                        debug!(cache = %inner.key, "Cache detached during fetch, discarding result");
                        return PollOutcome::Discarded;
                    }
                    Self::stamp_poll(&mut state, started, now, wall);
                    state.data = Some(value.clone());
                    state.last_success_at = Some(now);
                    state.last_success_wall = Some(wall);
                    state.last_error = None;
                    state.consecutive_failures = 0;
                }

                if let Some(hook) = &inner.after_success {
                    hook(&value);
                }

                debug!(
                    node = self.owner(),
                    cache = %inner.key,
                    elapsed_ms = now.duration_since(started).as_millis() as u64,
                    "Poll succeeded"
                );
                PollOutcome::Succeeded
            }
            Err(err) => {
                let err = match &inner.enrich_error {
                    Some(enrich) => enrich(err),
                    None => err,
                };

                let (consecutive_failures, has_data) = {
                    let mut state = inner.state.write();
                    if inner.detached.load(Ordering::Acquire) {
                        debug!(cache = %inner.key, "Cache detached during fetch, discarding result");
                        return PollOutcome::Discarded;
                    }
                    Self::stamp_poll(&mut state, started, now, wall);
                    state.last_error = Some(err.clone());
                    state.error_count += 1;
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    (state.consecutive_failures, state.data.is_some())
                };

                warn!(
                    node = self.owner(),
                    cache = %inner.key,
                    error = %err,
                    consecutive_failures,
                    has_data,
                    "Poll failed, keeping last good data"
                );
                PollOutcome::Failed(err)
            }
        }
    }

    fn stamp_poll(state: &mut PollState<T>, started: Instant, now: Instant, wall: DateTime<Utc>) {
        state.poll_count += 1;
        state.last_poll_at = Some(match state.last_poll_at {
            Some(previous) => previous.max(started),
            None => started,
        });
        state.last_poll_wall = Some(wall);
        state.last_poll_duration = Some(now.duration_since(started));
    }

    /// Last successfully fetched value. Never triggers a fetch.
    ///
    /// With `allow_stale_on_failure` false, nothing is returned while the
    /// most recent poll is failing.
    pub fn read(&self, allow_stale_on_failure: bool) -> Option<Arc<T>> {
        let state = self.inner.state.read();
        if !allow_stale_on_failure && state.last_error.is_some() {
            return None;
        }
        state.data.clone()
    }

    /// Health derived from poll history, freshness and the payload itself.
    pub fn status(&self) -> MonitorStatus {
        let (poll_status, data) = {
            let state = self.inner.state.read();
            if state.poll_count == 0 {
                return MonitorStatus::Unknown;
            }

            let poll_status = if state.last_error.is_some() {
                if state.data.is_none() || state.consecutive_failures >= CRITICAL_AFTER_FAILURES {
                    MonitorStatus::Critical
                } else {
                    MonitorStatus::Warning
                }
            } else if state.last_success_at.is_some_and(|at| {
                // Zero disables the age check
                !self.inner.stale_after.is_zero() && at.elapsed() >= self.inner.stale_after
            }) {
                MonitorStatus::Warning
            } else {
                MonitorStatus::Good
            };
            (poll_status, state.data.clone())
        };

        let payload_status = match (&self.inner.status_fn, data) {
            (Some(status_fn), Some(data)) => status_fn(&data),
            _ => MonitorStatus::Unknown,
        };

        MonitorStatus::worst([poll_status, payload_status])
    }

    pub fn is_due(&self, interval: Duration) -> bool {
        match self.inner.state.read().last_poll_at {
            Some(at) => at.elapsed() >= interval,
            None => true,
        }
    }

    /// Stop polling: cancel any running fetch and discard late results.
    pub fn detach(&self) {
        {
            // Serializes with `apply`, which checks the flag under the same lock.
            let _state = self.inner.state.write();
            self.inner.detached.store(true, Ordering::Release);
        }
        self.inner.cancel.cancel();
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn owner(&self) -> &str {
        self.inner.owner.get().map(String::as_str).unwrap_or("-")
    }

    pub(crate) fn set_owner(&self, owner: &str) {
        let _ = self.inner.owner.set(owner.to_string());
    }

    pub fn refresh_interval(&self) -> Duration {
        self.inner.refresh_interval
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::Acquire)
    }

    pub fn last_poll_at(&self) -> Option<Instant> {
        self.inner.state.read().last_poll_at
    }

    pub fn last_success_at(&self) -> Option<Instant> {
        self.inner.state.read().last_success_at
    }

    pub fn last_error(&self) -> Option<MonitorError> {
        self.inner.state.read().last_error.clone()
    }

    pub fn poll_count(&self) -> u64 {
        self.inner.state.read().poll_count
    }

    pub fn error_count(&self) -> u64 {
        self.inner.state.read().error_count
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.state.read().consecutive_failures
    }

    pub fn info(&self) -> CacheInfo {
        let status = self.status();
        let state = self.inner.state.read();
        CacheInfo {
            key: self.inner.key.clone(),
            status,
            has_data: state.data.is_some(),
            in_flight: self.is_in_flight(),
            poll_count: state.poll_count,
            error_count: state.error_count,
            consecutive_failures: state.consecutive_failures,
            refresh_interval_secs: self.inner.refresh_interval.as_secs(),
            last_poll_at: state.last_poll_wall,
            last_success_at: state.last_success_wall,
            last_poll_duration_ms: state.last_poll_duration.map(|d| d.as_millis() as u64),
            last_error: state.last_error.as_ref().map(|e| e.to_string()),
        }
    }
}

async fn with_timeout<T>(
    fetch: FetchFuture<T>,
    timeout: Option<Duration>,
    key: &str,
) -> Result<T, MonitorError> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fetch).await {
            Ok(result) => result,
            Err(_) => Err(MonitorError::Timeout(format!(
                "{} did not respond within {}ms",
                key,
                limit.as_millis()
            ))),
        },
        None => fetch.await,
    }
}

/// Builder for [`DataCache`]
pub struct DataCacheBuilder<T> {
    key: String,
    fetch: FetchFn<T>,
    refresh_interval: Duration,
    after_success: Option<AfterSuccessFn<T>>,
    enrich_error: Option<EnrichErrorFn>,
    status_fn: Option<StatusFn<T>>,
    stale_after: Option<Duration>,
    fetch_timeout: Option<Duration>,
}

impl<T> DataCacheBuilder<T>
where
    T: Send + Sync + 'static,
{
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Hook run after each successful fetch, e.g. to recompute grouped summaries.
    pub fn after_success(mut self, hook: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.after_success = Some(Arc::new(hook));
        self
    }

    /// Attach source-identifying context to fetch errors before they are recorded.
    pub fn enrich_error(
        mut self,
        enrich: impl Fn(MonitorError) -> MonitorError + Send + Sync + 'static,
    ) -> Self {
        self.enrich_error = Some(Arc::new(enrich));
        self
    }

    /// Derive a status from the fetched payload itself.
    pub fn status_with(
        mut self,
        status_fn: impl Fn(&T) -> MonitorStatus + Send + Sync + 'static,
    ) -> Self {
        self.status_fn = Some(Arc::new(status_fn));
        self
    }

    /// Age after which a successful value is reported as a warning. Zero disables it.
    pub fn stale_after(mut self, age: Duration) -> Self {
        self.stale_after = Some(age);
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> DataCache<T> {
        let stale_after = self
            .stale_after
            .unwrap_or(self.refresh_interval * STALE_INTERVALS);

        DataCache {
            inner: Arc::new(Inner {
                key: self.key,
                owner: OnceLock::new(),
                fetch: self.fetch,
                after_success: self.after_success,
                enrich_error: self.enrich_error,
                status_fn: self.status_fn,
                refresh_interval: self.refresh_interval,
                stale_after,
                fetch_timeout: self.fetch_timeout,
                state: RwLock::new(PollState::default()),
                in_flight: AtomicBool::new(false),
                detached: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }
}

/// Type-erased view of a [`DataCache`] used by nodes and the registry,
/// which hold caches of different payload types side by side.
pub trait Poller: Send + Sync {
    fn key(&self) -> &str;
    fn refresh_interval(&self) -> Duration;
    fn is_due(&self, interval: Duration) -> bool;
    fn poll(&self, force: bool) -> BoxFuture<'static, PollOutcome>;
    fn status(&self) -> MonitorStatus;
    fn consecutive_failures(&self) -> u32;
    fn last_poll_at(&self) -> Option<Instant>;
    fn is_in_flight(&self) -> bool;
    fn info(&self) -> CacheInfo;
    fn set_owner(&self, owner: &str);
    fn detach(&self);
}

impl<T> Poller for DataCache<T>
where
    T: Send + Sync + 'static,
{
    fn key(&self) -> &str {
        DataCache::key(self)
    }

    fn refresh_interval(&self) -> Duration {
        DataCache::refresh_interval(self)
    }

    fn is_due(&self, interval: Duration) -> bool {
        DataCache::is_due(self, interval)
    }

    fn poll(&self, force: bool) -> BoxFuture<'static, PollOutcome> {
        let this = self.clone();
        async move { this.refresh(force).await }.boxed()
    }

    fn status(&self) -> MonitorStatus {
        DataCache::status(self)
    }

    fn consecutive_failures(&self) -> u32 {
        DataCache::consecutive_failures(self)
    }

    fn last_poll_at(&self) -> Option<Instant> {
        DataCache::last_poll_at(self)
    }

    fn is_in_flight(&self) -> bool {
        DataCache::is_in_flight(self)
    }

    fn info(&self) -> CacheInfo {
        DataCache::info(self)
    }

    fn set_owner(&self, owner: &str) {
        DataCache::set_owner(self, owner)
    }

    fn detach(&self) {
        DataCache::detach(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Fetcher that succeeds once with `1`, then fails with numbered errors.
    fn flaky(calls: Arc<AtomicUsize>) -> DataCache<u32> {
        DataCache::builder("flaky", move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Ok(1)
                } else {
                    Err(MonitorError::Upstream(format!("fail {}", n)))
                }
            }
        })
        .refresh_interval(Duration::from_secs(10))
        .build()
    }

    fn counting(calls: Arc<AtomicUsize>, delay: Duration) -> DataCache<u32> {
        DataCache::builder("counting", move || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) as u32;
                tokio::time::sleep(delay).await;
                Ok(n + 1)
            }
        })
        .refresh_interval(Duration::from_secs(10))
        .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_polled_is_unknown() {
        let cache = counting(Arc::new(AtomicUsize::new(0)), Duration::ZERO);
        assert_eq!(cache.status(), MonitorStatus::Unknown);
        assert!(cache.read(true).is_none());
        assert!(cache.is_due(Duration::from_secs(3600)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_poll() {
        let cache = counting(Arc::new(AtomicUsize::new(0)), Duration::ZERO);
        assert_eq!(cache.refresh(false).await, PollOutcome::Succeeded);

        assert_eq!(cache.read(false).as_deref(), Some(&1));
        assert_eq!(cache.status(), MonitorStatus::Good);
        assert!(cache.last_success_at().is_some());
        assert_eq!(cache.poll_count(), 1);
        assert!(!cache.is_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_good_value_survives_failures() {
        let cache = flaky(Arc::new(AtomicUsize::new(0)));
        assert_eq!(cache.refresh(true).await, PollOutcome::Succeeded);

        assert!(matches!(cache.refresh(true).await, PollOutcome::Failed(_)));
        assert_eq!(cache.status(), MonitorStatus::Warning);

        cache.refresh(true).await;
        cache.refresh(true).await;

        assert_eq!(cache.read(true).as_deref(), Some(&1));
        assert!(cache.read(false).is_none());
        assert_eq!(
            cache.last_error(),
            Some(MonitorError::Upstream("fail 3".into()))
        );
        assert_eq!(cache.error_count(), 3);
        assert_eq!(cache.consecutive_failures(), 3);
        assert_eq!(cache.status(), MonitorStatus::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_data_is_critical() {
        let cache: DataCache<u32> =
            DataCache::builder("down", || async { Err(MonitorError::fetch("db", "refused")) })
                .build();
        cache.refresh(false).await;
        assert_eq!(cache.status(), MonitorStatus::Critical);
        assert!(cache.read(true).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unforced_refresh_respects_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting(calls.clone(), Duration::ZERO);

        assert_eq!(cache.refresh(false).await, PollOutcome::Succeeded);
        assert_eq!(
            cache.refresh(false).await,
            PollOutcome::Skipped(SkipReason::NotDue)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.refresh(false).await, PollOutcome::Succeeded);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_unforced_refreshes_poll_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = {
            let calls = calls.clone();
            DataCache::builder("racy", move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    Ok(1u32)
                }
            })
            .refresh_interval(Duration::from_secs(3600))
            .build()
        };

        let polls: Vec<_> = (0..32)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.refresh(false).await })
            })
            .collect();
        for poll in polls {
            let outcome = poll.await.unwrap();
            assert!(matches!(
                outcome,
                PollOutcome::Succeeded
                    | PollOutcome::Skipped(SkipReason::InFlight)
                    | PollOutcome::Skipped(SkipReason::NotDue)
            ));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.poll_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_refresh_while_in_flight_is_noop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting(calls.clone(), Duration::from_secs(1));

        let running = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refresh(true).await })
        };
        tokio::task::yield_now().await;
        assert!(cache.is_in_flight());

        assert_eq!(
            cache.refresh(true).await,
            PollOutcome::Skipped(SkipReason::InFlight)
        );
        assert_eq!(running.await.unwrap(), PollOutcome::Succeeded);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_in_flight_cleared_when_fetch_panics() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache: DataCache<u32> = {
            let calls = calls.clone();
            DataCache::builder("panicky", move || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        panic!("fetch blew up");
                    }
                    Ok(5)
                }
            })
            .build()
        };

        let handle = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refresh(true).await })
        };
        assert!(handle.await.is_err());
        assert!(!cache.is_in_flight());

        assert_eq!(cache.refresh(true).await, PollOutcome::Succeeded);
        assert_eq!(cache.read(true).as_deref(), Some(&5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_poll_at_is_monotonic() {
        let cache = flaky(Arc::new(AtomicUsize::new(0)));
        let mut previous = None;

        for _ in 0..4 {
            cache.refresh(true).await;
            let current = cache.last_poll_at();
            assert!(current >= previous);
            previous = current;
            tokio::time::advance(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hooks() {
        let seen = Arc::new(AtomicUsize::new(0));
        let ok = {
            let seen = seen.clone();
            DataCache::builder("ok", || async { Ok(41u32) })
                .after_success(move |v| {
                    seen.store(*v as usize + 1, Ordering::SeqCst);
                })
                .build()
        };
        ok.refresh(false).await;
        assert_eq!(seen.load(Ordering::SeqCst), 42);

        let failing: DataCache<u32> =
            DataCache::builder("failing", || async { Err(MonitorError::fetch("redis", "refused")) })
                .enrich_error(|e| e.with_context("10.0.0.5:6379"))
                .build();
        failing.refresh(false).await;
        assert_eq!(
            failing.last_error().map(|e| e.to_string()),
            Some("Fetch failed for redis (10.0.0.5:6379): refused".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_status_and_staleness() {
        let cache = DataCache::builder("replication", || async { Ok(120u32) })
            .refresh_interval(Duration::from_secs(10))
            .status_with(|lag| {
                if *lag > 60 {
                    MonitorStatus::Critical
                } else {
                    MonitorStatus::Good
                }
            })
            .build();
        cache.refresh(false).await;
        assert_eq!(cache.status(), MonitorStatus::Critical);

        let plain = counting(Arc::new(AtomicUsize::new(0)), Duration::ZERO);
        plain.refresh(false).await;
        assert_eq!(plain.status(), MonitorStatus::Good);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(plain.status(), MonitorStatus::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout() {
        let cache = DataCache::builder("slow", || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(1u32)
        })
        .fetch_timeout(Duration::from_secs(1))
        .build();

        assert!(matches!(
            cache.refresh(false).await,
            PollOutcome::Failed(MonitorError::Timeout(_))
        ));
        assert!(!cache.is_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_discards_and_blocks_polls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting(calls.clone(), Duration::from_secs(5));

        let running = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refresh(true).await })
        };
        tokio::task::yield_now().await;

        cache.detach();
        assert_eq!(running.await.unwrap(), PollOutcome::Discarded);
        assert!(cache.read(true).is_none());
        assert_eq!(cache.poll_count(), 0);

        assert_eq!(
            cache.refresh(true).await,
            PollOutcome::Skipped(SkipReason::Detached)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_applied_after_detach_is_discarded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting(calls, Duration::ZERO);

        cache.detach();
        assert_eq!(cache.apply(Ok(1), Instant::now()), PollOutcome::Discarded);
        assert_eq!(
            cache.apply(Err(MonitorError::Timeout("late".into())), Instant::now()),
            PollOutcome::Discarded
        );
        assert!(cache.read(true).is_none());
        assert!(cache.last_error().is_none());
        assert_eq!(cache.poll_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_not_stale() {
        let cache = DataCache::builder("hot", || async { Ok(1u32) })
            .refresh_interval(Duration::ZERO)
            .build();

        assert_eq!(cache.refresh(false).await, PollOutcome::Succeeded);
        assert_eq!(cache.status(), MonitorStatus::Good);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(cache.status(), MonitorStatus::Good);
    }

    #[tokio::test(start_paused = true)]
    async fn test_erased_poller() {
        let cache = counting(Arc::new(AtomicUsize::new(0)), Duration::ZERO);
        let poller: Arc<dyn Poller> = Arc::new(cache.clone());

        assert_eq!(poller.poll(false).await, PollOutcome::Succeeded);
        assert_eq!(poller.status(), MonitorStatus::Good);
        assert_eq!(poller.info().poll_count, 1);
        assert_eq!(cache.read(true).as_deref(), Some(&1));
    }
}
