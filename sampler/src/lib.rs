//! perfmon: agentless metrics sampling of SSH-reachable hosts.
//!
//! Each monitored host gets a [`cycle::HostCycle`] that periodically runs a
//! fixed battery of commands over one shared connection, parses the output
//! ([`collectors`]) and folds it into a per-host snapshot ([`aggregator`]).

pub mod aggregator;
pub mod backoff;
pub mod collectors;
pub mod config;
pub mod cycle;
pub mod error;
pub mod events;
pub mod report;
pub mod sampler;
pub mod transport;
