//! TCP connect probe.

use crate::cache::{DataCache, MonitorStatus};
use crate::error::MonitorError;
use crate::sources::dns::HostResolver;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

/// Connects slower than this are reported as a warning
pub const SLOW_CONNECT: Duration = Duration::from_secs(1);

/// Result of one successful connect
#[derive(Debug, Clone, Serialize)]
pub struct TcpCheck {
    pub address: String,
    pub connected_to: SocketAddr,
    pub connect_ms: u64,
}

impl TcpCheck {
    pub fn status(&self) -> MonitorStatus {
        if self.connect_ms >= SLOW_CONNECT.as_millis() as u64 {
            MonitorStatus::Warning
        } else {
            MonitorStatus::Good
        }
    }
}

#[derive(Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    resolver: HostResolver,
    timeout: Duration,
}

impl TcpProbe {
    /// `address` is `host:port`; IPv6 literals go in brackets.
    pub fn new(address: &str, resolver: HostResolver, timeout: Duration) -> Result<Self, MonitorError> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| MonitorError::Config(format!("{} is not host:port", address)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| MonitorError::Config(format!("invalid port in {}: {}", address, e)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(MonitorError::Config(format!("{} has no host", address)));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            resolver,
            timeout,
        })
    }

    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Connect to the first reachable resolved address.
    pub async fn check(&self) -> Result<TcpCheck, MonitorError> {
        let addrs = self.resolver.resolve(&self.host, self.port).await?;

        let mut last_error = None;
        for addr in addrs {
            let started = Instant::now();
            match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_stream)) => {
                    let connect_ms = started.elapsed().as_millis() as u64;
                    debug!(host = %self.host, port = self.port, addr = %addr, connect_ms, "TCP connect succeeded");
                    return Ok(TcpCheck {
                        address: self.address(),
                        connected_to: addr,
                        connect_ms,
                    });
                }
                Ok(Err(e)) => {
                    debug!(host = %self.host, port = self.port, addr = %addr, error = %e, "TCP connect failed");
                    last_error = Some(MonitorError::fetch(format!("tcp {}", addr), e));
                }
                Err(_) => {
                    last_error = Some(MonitorError::Timeout(format!(
                        "connect to {} after {}ms",
                        addr,
                        self.timeout.as_millis()
                    )));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| MonitorError::fetch("tcp", "no addresses to connect to")))
    }

    /// A cache polling this probe
    pub fn cache(&self, key: &str, refresh_interval: Duration) -> DataCache<TcpCheck> {
        let probe = self.clone();
        let context = format!("host={} port={}", self.host, self.port);

        DataCache::builder(key, move || {
            let probe = probe.clone();
            async move { probe.check().await }
        })
        .refresh_interval(refresh_interval)
        .enrich_error(move |e| e.with_context(&context))
        .status_with(TcpCheck::status)
        .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::stale::DEFAULT_REFRESH_LOCK_TIMEOUT;
    use crate::cache::{PollOutcome, StaleCache};
    use tokio::net::TcpListener;

    fn resolver() -> HostResolver {
        HostResolver::new(
            StaleCache::new("dns", DEFAULT_REFRESH_LOCK_TIMEOUT),
            Duration::from_secs(60),
            Duration::from_secs(600),
        )
    }

    #[test]
    fn test_address_parsing() {
        let probe = TcpProbe::new("redis-1.internal:6379", resolver(), Duration::from_secs(1)).unwrap();
        assert_eq!(probe.address(), "redis-1.internal:6379");

        let v6 = TcpProbe::new("[::1]:5432", resolver(), Duration::from_secs(1)).unwrap();
        assert_eq!(v6.address(), "[::1]:5432");

        assert!(TcpProbe::new("no-port", resolver(), Duration::from_secs(1)).is_err());
        assert!(TcpProbe::new("host:99999", resolver(), Duration::from_secs(1)).is_err());
        assert!(TcpProbe::new(":80", resolver(), Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let probe = TcpProbe::new(&addr.to_string(), resolver(), Duration::from_secs(2)).unwrap();
        let check = probe.check().await.unwrap();
        assert_eq!(check.connected_to, addr);
        assert_eq!(check.status(), MonitorStatus::Good);
    }

    #[tokio::test]
    async fn test_refused_connection_is_recorded_with_context() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let probe = TcpProbe::new(&addr.to_string(), resolver(), Duration::from_secs(2)).unwrap();
        let cache = probe.cache("connect", Duration::from_secs(30));

        assert!(matches!(cache.refresh(false).await, PollOutcome::Failed(_)));
        assert_eq!(cache.status(), MonitorStatus::Critical);
        let message = cache.last_error().map(|e| e.to_string()).unwrap_or_default();
        assert!(message.contains(&format!("port={}", addr.port())));
    }
}
