//! Polling module for vigil.
//!
//! - `MonitorNode`: a monitored entity and the caches it owns
//! - `PollingRegistry`: the scheduler that decides what is due and dispatches fetches

pub mod node;
pub mod registry;

pub use node::{BackoffPolicy, MonitorNode, NodeInfo};
pub use registry::{PollTarget, PollingRegistry, ShutdownReport};
