//! Data sources that plug into `DataCache` as fetch functions.

pub mod dns;
pub mod http;
pub mod tcp;

pub use dns::HostResolver;
pub use http::{HttpCheck, HttpProbe};
pub use tcp::{TcpCheck, TcpProbe};

use crate::config::{PollingConfig, TargetConfig, TargetKind};
use crate::error::MonitorError;
use crate::polling::MonitorNode;

/// Build the node for one configured target.
pub fn node_for_target(
    target: &TargetConfig,
    polling: &PollingConfig,
    resolver: &HostResolver,
) -> Result<MonitorNode, MonitorError> {
    let builder = MonitorNode::builder(&target.name, target.kind.to_string())
        .min_poll_interval(polling.min_poll_interval)
        .backoff(polling.backoff);

    let builder = match target.kind {
        TargetKind::Http => {
            let probe = HttpProbe::new(&target.address, polling.fetch_timeout)?;
            builder.cache(probe.cache("http", polling.default_refresh))
        }
        TargetKind::Tcp => {
            let probe = TcpProbe::new(&target.address, resolver.clone(), polling.fetch_timeout)?;
            builder.cache(probe.cache("connect", polling.default_refresh))
        }
    };

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::stale::DEFAULT_REFRESH_LOCK_TIMEOUT;
    use crate::cache::StaleCache;
    use crate::config::Config;
    use std::time::Duration;

    #[test]
    fn test_nodes_from_targets() {
        let config = Config::from_lookup(|name| match name {
            "MONITOR_TARGETS" => Some("http:status=http://127.0.0.1:9/health,tcp:redis=127.0.0.1:6379,tcp:broken=nowhere".to_string()),
            "DEFAULT_REFRESH_SECS" => Some("15".to_string()),
            _ => None,
        })
        .unwrap();
        let resolver = HostResolver::new(
            StaleCache::new("dns", DEFAULT_REFRESH_LOCK_TIMEOUT),
            Duration::from_secs(60),
            Duration::from_secs(600),
        );

        let http = node_for_target(&config.targets[0], &config.polling, &resolver).unwrap();
        assert_eq!(http.key(), "status");
        assert_eq!(http.node_type(), "http");
        assert_eq!(http.caches()[0].key(), "http");
        assert_eq!(http.caches()[0].refresh_interval(), Duration::from_secs(15));
        assert!(http.self_check().is_ok());

        let tcp = node_for_target(&config.targets[1], &config.polling, &resolver).unwrap();
        assert_eq!(tcp.caches()[0].key(), "connect");

        assert!(matches!(
            node_for_target(&config.targets[2], &config.polling, &resolver),
            Err(MonitorError::Config(_))
        ));
    }
}
