//! Host name resolution memoized through a `StaleCache`.
//!
//! Probes resolve their targets on every poll; the resolver keeps answers
//! fresh for a while, serves them stale during a grace window while a single
//! background lookup refreshes them, and only blocks a caller on a cold or
//! fully expired name.

use crate::cache::{StaleCache, StaleCacheStats};
use crate::error::MonitorError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type LookupFn = Arc<dyn Fn(String) -> BoxFuture<'static, Result<Vec<IpAddr>, MonitorError>> + Send + Sync>;

/// Cached host resolver shared by all probes
#[derive(Clone)]
pub struct HostResolver {
    cache: StaleCache<String, Vec<IpAddr>>,
    lookup: LookupFn,
    fresh_for: Duration,
    stale_grace: Duration,
}

impl HostResolver {
    /// Resolver backed by the system resolver
    pub fn new(cache: StaleCache<String, Vec<IpAddr>>, fresh_for: Duration, stale_grace: Duration) -> Self {
        Self {
            cache,
            lookup: Arc::new(|host| system_lookup(host).boxed()),
            fresh_for,
            stale_grace,
        }
    }

    /// Replace the lookup function, e.g. with a fixed table.
    pub fn with_lookup<F, Fut>(mut self, lookup: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<IpAddr>, MonitorError>> + Send + 'static,
    {
        self.lookup = Arc::new(move |host| lookup(host).boxed());
        self
    }

    /// Addresses for `host`. IP literals are returned without a lookup.
    pub async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, MonitorError> {
        if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let lookup = self.lookup.clone();
        let name = host.to_ascii_lowercase();
        let query = name.clone();
        self.cache
            .get(
                name,
                move |_previous| lookup(query),
                self.fresh_for,
                self.stale_grace,
            )
            .await
    }

    pub async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, MonitorError> {
        let ips = self.lookup(host).await?;
        Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
    }

    pub fn stats(&self) -> StaleCacheStats {
        self.cache.stats()
    }

    /// Drop names whose grace window has passed
    pub fn evict_expired(&self) -> usize {
        self.cache.evict_expired()
    }
}

async fn system_lookup(host: String) -> Result<Vec<IpAddr>, MonitorError> {
    let origin = format!("dns {}", host);
    let ips = unique(
        tokio::net::lookup_host((host.as_str(), 0))
            .await
            .map_err(|e| MonitorError::fetch(origin.as_str(), e))?
            .map(|addr| addr.ip()),
    );

    if ips.is_empty() {
        return Err(MonitorError::fetch(origin, "no addresses returned"));
    }
    debug!(host = %host, addresses = ips.len(), "Resolved host");
    Ok(ips)
}

/// Drop repeated addresses, keeping resolver order.
fn unique(ips: impl IntoIterator<Item = IpAddr>) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    ips.into_iter().filter(|ip| seen.insert(*ip)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::stale::DEFAULT_REFRESH_LOCK_TIMEOUT;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn resolver(calls: Arc<AtomicUsize>) -> HostResolver {
        HostResolver::new(
            StaleCache::new("dns", DEFAULT_REFRESH_LOCK_TIMEOUT),
            Duration::from_secs(60),
            Duration::from_secs(600),
        )
        .with_lookup(move |host: String| {
            let n = calls.fetch_add(1, Ordering::SeqCst) as u8;
            async move {
                if host == "missing.internal" {
                    return Err(MonitorError::fetch("dns", "NXDOMAIN"));
                }
                Ok(vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, n + 1))])
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookups_are_memoized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = resolver(calls.clone());

        let first = resolver.resolve("Redis-1.internal", 6379).await.unwrap();
        let second = resolver.resolve("redis-1.internal", 6380).await.unwrap();

        assert_eq!(first, vec!["10.0.0.1:6379".parse::<SocketAddr>().unwrap()]);
        assert_eq!(second, vec!["10.0.0.1:6380".parse::<SocketAddr>().unwrap()]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.stats().sync_loads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_answer_served_while_refreshing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = resolver(calls.clone());

        resolver.lookup("sql-1.internal").await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        let stale = resolver.lookup("sql-1.internal").await.unwrap();
        assert_eq!(stale, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))]);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let refreshed = resolver.lookup("sql-1.internal").await.unwrap();
        assert_eq!(refreshed, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ip_literals_skip_lookup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = resolver(calls.clone());

        let v4 = resolver.lookup("192.168.1.10").await.unwrap();
        let v6 = resolver.lookup("[::1]").await.unwrap();
        assert_eq!(v4, vec!["192.168.1.10".parse::<IpAddr>().unwrap()]);
        assert_eq!(v6, vec!["::1".parse::<IpAddr>().unwrap()]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_failure_reaches_caller() {
        let resolver = resolver(Arc::new(AtomicUsize::new(0)));
        assert!(matches!(
            resolver.lookup("missing.internal").await,
            Err(MonitorError::Fetch { .. })
        ));
    }

    #[test]
    fn test_unique_drops_non_adjacent_duplicates() {
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let v6 = "fd00::1".parse::<IpAddr>().unwrap();

        assert_eq!(unique([a, b, a, v6, b, a]), vec![a, b, v6]);
        assert!(unique(Vec::<IpAddr>::new()).is_empty());
    }
}
