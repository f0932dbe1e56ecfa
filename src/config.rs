use crate::error::MonitorError;
use crate::polling::BackoffPolicy;
use anyhow::{bail, Context, Result};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Time between scheduling passes
    pub tick_interval: Duration,
    /// Refresh interval given to each probe cache
    pub default_refresh: Duration,
    /// Per-node floor between polls of the same cache
    pub min_poll_interval: Duration,
    pub backoff: BackoffPolicy,
    pub fetch_timeout: Duration,
    /// How long shutdown waits for in-flight fetches
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct DnsConfig {
    pub fresh_for: Duration,
    pub stale_grace: Duration,
    /// Age after which an abandoned refresh marker is reclaimed
    pub refresh_lock_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Http,
    Tcp,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Http => f.write_str("http"),
            TargetKind::Tcp => f.write_str("tcp"),
        }
    }
}

/// One monitored endpoint, written as `kind:name=address`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    pub kind: TargetKind,
    pub name: String,
    pub address: String,
}

impl FromStr for TargetConfig {
    type Err = MonitorError;

    fn from_str(entry: &str) -> std::result::Result<Self, Self::Err> {
        let entry = entry.trim();
        let (kind, rest) = entry
            .split_once(':')
            .ok_or_else(|| MonitorError::Config(format!("target {:?} is missing a kind", entry)))?;
        let kind = match kind.trim().to_ascii_lowercase().as_str() {
            "http" => TargetKind::Http,
            "tcp" => TargetKind::Tcp,
            other => {
                return Err(MonitorError::Config(format!(
                    "target {:?} has unknown kind {:?}",
                    entry, other
                )))
            }
        };
        let (name, address) = rest
            .split_once('=')
            .ok_or_else(|| MonitorError::Config(format!("target {:?} is missing '=address'", entry)))?;
        let (name, address) = (name.trim(), address.trim());
        if name.is_empty() || address.is_empty() {
            return Err(MonitorError::Config(format!(
                "target {:?} needs both a name and an address",
                entry
            )));
        }

        Ok(Self {
            kind,
            name: name.to_string(),
            address: address.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub polling: PollingConfig,
    pub dns: DnsConfig,
    pub targets: Vec<TargetConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from any variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let tick_ms: u64 = parse_var(&get, "POLL_TICK_MS", 1000)?;
        if tick_ms == 0 {
            bail!("POLL_TICK_MS must be greater than zero");
        }

        let backoff = BackoffPolicy::new(
            parse_var(&get, "BACKOFF_AFTER_FAILURES", 3)?,
            secs(&get, "BACKOFF_BASE_SECS", 5)?,
            secs(&get, "BACKOFF_MAX_SECS", 300)?,
        );
        if backoff.max < backoff.base {
            bail!("BACKOFF_MAX_SECS must not be below BACKOFF_BASE_SECS");
        }

        let default_refresh = secs(&get, "DEFAULT_REFRESH_SECS", 30)?;
        if default_refresh.is_zero() {
            bail!("DEFAULT_REFRESH_SECS must be greater than zero");
        }

        let targets = get("MONITOR_TARGETS")
            .map(|raw| parse_targets(&raw))
            .unwrap_or_default();

        Ok(Self {
            server: ServerConfig {
                port: parse_var(&get, "PORT", 3000)?,
            },
            polling: PollingConfig {
                tick_interval: Duration::from_millis(tick_ms),
                default_refresh,
                min_poll_interval: secs(&get, "MIN_SECONDS_BETWEEN_POLLS", 5)?,
                backoff,
                fetch_timeout: secs(&get, "FETCH_TIMEOUT_SECS", 10)?,
                shutdown_grace: secs(&get, "SHUTDOWN_GRACE_SECS", 5)?,
            },
            dns: DnsConfig {
                fresh_for: secs(&get, "DNS_FRESH_SECS", 300)?,
                stale_grace: secs(&get, "DNS_GRACE_SECS", 3600)?,
                refresh_lock_timeout: secs(&get, "REFRESH_LOCK_TIMEOUT_SECS", 300)?,
            },
            targets,
        })
    }
}

/// Parse a comma-separated target list. Bad entries are logged and skipped.
pub fn parse_targets(raw: &str) -> Vec<TargetConfig> {
    raw.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .filter_map(|entry| match entry.parse::<TargetConfig>() {
            Ok(target) => Some(target),
            Err(e) => {
                warn!(entry = entry.trim(), error = %e, "Skipping invalid monitor target");
                None
            }
        })
        .collect()
}

fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} has invalid value {:?}", name, raw)),
        None => Ok(default),
    }
}

fn secs(get: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> Result<Duration> {
    parse_var(get, name, default).map(Duration::from_secs)
}
