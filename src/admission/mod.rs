//! Spawn admission control
//!
//! Decides when queued spawn requests may be resolved, based on host
//! resource pressure, recent spawn failures and recent spawn volume.

pub mod circuit_breaker;
pub mod pipeline;
pub mod priority_queue;
pub mod resource;
pub mod startup;
pub mod throttler;

pub use circuit_breaker::{CircuitState, SpawnCircuitBreaker};
pub use pipeline::SpawnPipeline;
pub use priority_queue::{
    InboxDrain, InboxError, QueueFull, SpawnPriority, SpawnPriorityQueue, SpawnRequest,
    SpawnRequestSender, SpawnTarget,
};
#[cfg(feature = "host_probe")]
pub use resource::HostResourceProbe;
pub use resource::{
    HostCounters, ProbeError, ResourceIndicator, ResourceMonitor, ResourcePressure,
    ResourceProbe, ResourceSnapshot,
};
pub use startup::{StartupSpawnOrchestrator, StartupStatus, SubmitError};
pub use throttler::{AdaptiveSpawnThrottler, BurstTracker, DenialReason, ThrottlerMetrics};
