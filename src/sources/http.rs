//! HTTP health-endpoint probe.

use crate::cache::{DataCache, MonitorStatus};
use crate::error::MonitorError;
use reqwest::{Client, Url};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Result of one HTTP check that reached the server
#[derive(Debug, Clone, Serialize)]
pub struct HttpCheck {
    pub url: String,
    pub status: u16,
    pub latency_ms: u64,
}

impl HttpCheck {
    /// 2xx and 3xx are good; a 4xx means the endpoint answered but is misconfigured.
    pub fn status(&self) -> MonitorStatus {
        if self.status >= 400 {
            MonitorStatus::Warning
        } else {
            MonitorStatus::Good
        }
    }
}

#[derive(Clone)]
pub struct HttpProbe {
    client: Client,
    url: Url,
    host: String,
}

impl HttpProbe {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, MonitorError> {
        let url = Url::parse(url).map_err(|e| MonitorError::Config(format!("invalid URL {}: {}", url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(MonitorError::Config(format!("unsupported scheme in {}", url)));
        }
        let host = match (url.host_str(), url.port_or_known_default()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(MonitorError::Config(format!("{} has no host", url))),
        };

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MonitorError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self { client, url, host })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// `host:port` of the endpoint
    pub fn host(&self) -> &str {
        &self.host
    }

    /// GET the endpoint. Server errors fail the check; other statuses are reported.
    pub async fn check(&self) -> Result<HttpCheck, MonitorError> {
        let start = Instant::now();
        let resp = self.client.get(self.url.clone()).send().await?;
        let status = resp.status();
        let elapsed = start.elapsed();

        debug!(
            url = %self.url,
            status = %status,
            elapsed_ms = elapsed.as_millis() as u64,
            "HTTP check completed"
        );

        if status.is_server_error() {
            return Err(MonitorError::Upstream(format!("HTTP {}", status)));
        }

        Ok(HttpCheck {
            url: self.url.to_string(),
            status: status.as_u16(),
            latency_ms: elapsed.as_millis() as u64,
        })
    }

    /// A cache polling this probe
    pub fn cache(&self, key: &str, refresh_interval: Duration) -> DataCache<HttpCheck> {
        let probe = self.clone();
        let context = format!("host={}", self.host);

        DataCache::builder(key, move || {
            let probe = probe.clone();
            async move { probe.check().await }
        })
        .refresh_interval(refresh_interval)
        .enrich_error(move |e| e.with_context(&context))
        .status_with(HttpCheck::status)
        .build()
    }
}
