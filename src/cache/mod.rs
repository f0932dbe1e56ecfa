//! Cache module for vigil.
//!
//! This module provides the caching primitives every monitored source plugs into:
//! - `DataCache`: one polled value per source with last-known-good semantics
//! - `StaleCache`: keyed stale-while-revalidate memoization for auxiliary lookups
//! - `MonitorStatus`: the health scale both roll up into

pub mod data;
pub mod stale;
pub mod status;

pub use data::{CacheInfo, DataCache, PollOutcome, Poller, SkipReason};
pub use stale::{StaleCache, StaleCacheStats};
pub use status::MonitorStatus;
