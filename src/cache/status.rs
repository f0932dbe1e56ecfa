//! Health status shared by caches and nodes.

use serde::Serialize;
use std::fmt;

/// Health of a cache or node.
///
/// Variants are ordered from least to most severe so that the worst of a set
/// is simply its maximum. `Unknown` sorts lowest: it only wins when nothing
/// else has reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Unknown,
    Good,
    Warning,
    Critical,
}

impl MonitorStatus {
    /// Worst status among `statuses`, `Unknown` for an empty set.
    pub fn worst<I>(statuses: I) -> MonitorStatus
    where
        I: IntoIterator<Item = MonitorStatus>,
    {
        statuses
            .into_iter()
            .max()
            .unwrap_or(MonitorStatus::Unknown)
    }

    /// Numeric value exported as a gauge
    pub fn as_gauge(self) -> f64 {
        match self {
            MonitorStatus::Unknown => 0.0,
            MonitorStatus::Good => 1.0,
            MonitorStatus::Warning => 2.0,
            MonitorStatus::Critical => 3.0,
        }
    }
}

impl Default for MonitorStatus {
    fn default() -> Self {
        MonitorStatus::Unknown
    }
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MonitorStatus::Unknown => "unknown",
            MonitorStatus::Good => "good",
            MonitorStatus::Warning => "warning",
            MonitorStatus::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MonitorStatus::*;

    #[test]
    fn test_worst_of() {
        assert_eq!(MonitorStatus::worst([Good, Warning]), Warning);
        assert_eq!(MonitorStatus::worst([Good, Critical]), Critical);
        assert_eq!(MonitorStatus::worst([Critical, Warning, Good]), Critical);
    }

    #[test]
    fn test_unknown_only_when_nothing_reported() {
        assert_eq!(MonitorStatus::worst([Unknown, Unknown]), Unknown);
        assert_eq!(MonitorStatus::worst(Vec::new()), Unknown);
        assert_eq!(MonitorStatus::worst([Unknown, Good]), Good);
    }
}
