//! Spawn Admission Library
//!
//! Adaptive admission control for a game server's spawning pipeline.
//!
//! # Features
//!
//! - `host_probe` - CPU/memory sampling through sysinfo (enabled by default)
//! - `metrics_extended` - Per-tier queue gauges in the metrics export (enabled by default)

pub mod admission;
pub mod config;
pub mod metrics;
pub mod util;

pub use admission::{
    AdaptiveSpawnThrottler, CircuitState, ResourcePressure, SpawnPipeline, SpawnPriority,
    SpawnRequest, SpawnTarget,
};
pub use config::AdmissionConfig;
pub use metrics::AdmissionMetrics;
