//! Host resource pressure monitoring
//!
//! Samples cheap host indicators on a timer and folds them into a single
//! [`ResourcePressure`] level (worst indicator wins). Sampling never blocks:
//! probes read cached counters or `sysinfo` snapshots, never live DB queries.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ResourceThresholds;
use crate::util::clock::Clock;

/// Discrete load classification, ordered by severity
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourcePressure {
    #[default]
    Normal,
    Elevated,
    High,
    Critical,
}

impl ResourcePressure {
    pub const ALL: [ResourcePressure; 4] = [
        ResourcePressure::Normal,
        ResourcePressure::Elevated,
        ResourcePressure::High,
        ResourcePressure::Critical,
    ];

    /// Numeric level for gauges (0=Normal, 3=Critical)
    pub fn as_u64(&self) -> u64 {
        *self as u64
    }

    pub fn name(&self) -> &'static str {
        match self {
            ResourcePressure::Normal => "normal",
            ResourcePressure::Elevated => "elevated",
            ResourcePressure::High => "high",
            ResourcePressure::Critical => "critical",
        }
    }
}

impl fmt::Display for ResourcePressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tracked host indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceIndicator {
    Cpu,
    Memory,
    DbConnections,
    ActiveRegions,
}

impl fmt::Display for ResourceIndicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceIndicator::Cpu => "cpu",
            ResourceIndicator::Memory => "memory",
            ResourceIndicator::DbConnections => "db_connections",
            ResourceIndicator::ActiveRegions => "active_regions",
        };
        f.write_str(name)
    }
}

/// One reading of every indicator
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub db_connections_active: u32,
    pub db_connections_max: u32,
    pub active_regions: u32,
}

impl ResourceSnapshot {
    /// Share of the DB pool in use (0-100). An unsized pool reads as idle.
    pub fn db_saturation_percent(&self) -> f32 {
        if self.db_connections_max == 0 {
            return 0.0;
        }
        self.db_connections_active as f32 / self.db_connections_max as f32 * 100.0
    }

    /// Worst level across all indicators, with the indicator that produced it.
    /// `None` when every indicator is below its elevated threshold.
    pub fn classify(
        &self,
        thresholds: &ResourceThresholds,
    ) -> (ResourcePressure, Option<ResourceIndicator>) {
        let readings = [
            (ResourceIndicator::Cpu, thresholds.cpu_percent.classify(self.cpu_percent)),
            (ResourceIndicator::Memory, thresholds.memory_percent.classify(self.memory_percent)),
            (
                ResourceIndicator::DbConnections,
                thresholds.db_saturation_percent.classify(self.db_saturation_percent()),
            ),
            (
                ResourceIndicator::ActiveRegions,
                thresholds.active_regions.classify(self.active_regions as f32),
            ),
        ];

        let mut worst = (ResourcePressure::Normal, None);
        for (indicator, level) in readings {
            if level > worst.0 {
                worst = (level, Some(indicator));
            }
        }
        worst
    }
}

/// Errors from resource sampling
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("{0} indicator unavailable")]
    Unavailable(ResourceIndicator),
}

/// Source of resource readings. Must be cheap and non-blocking.
pub trait ResourceProbe: Send {
    fn sample(&mut self) -> Result<ResourceSnapshot, ProbeError>;
}

/// Counters owned by the host and updated from wherever it tracks them
#[derive(Debug, Default)]
pub struct HostCounters {
    db_connections_active: AtomicU32,
    db_connections_max: AtomicU32,
    active_regions: AtomicU32,
}

impl HostCounters {
    pub fn new(db_pool_size: u32) -> Self {
        Self {
            db_connections_max: AtomicU32::new(db_pool_size),
            ..Default::default()
        }
    }

    pub fn set_db_connections(&self, active: u32) {
        self.db_connections_active.store(active, Ordering::Relaxed);
    }

    pub fn set_db_pool_size(&self, max: u32) {
        self.db_connections_max.store(max, Ordering::Relaxed);
    }

    pub fn set_active_regions(&self, regions: u32) {
        self.active_regions.store(regions, Ordering::Relaxed);
    }

    pub fn db_connections(&self) -> (u32, u32) {
        (
            self.db_connections_active.load(Ordering::Relaxed),
            self.db_connections_max.load(Ordering::Relaxed),
        )
    }

    pub fn active_regions(&self) -> u32 {
        self.active_regions.load(Ordering::Relaxed)
    }
}

/// Probe reading CPU/memory through `sysinfo` and the rest from [`HostCounters`]
#[cfg(feature = "host_probe")]
pub struct HostResourceProbe {
    system: sysinfo::System,
    counters: Arc<HostCounters>,
}

#[cfg(feature = "host_probe")]
impl HostResourceProbe {
    pub fn new(counters: Arc<HostCounters>) -> Self {
        let mut system = sysinfo::System::new();
        // First CPU reading is always 0; prime it so the next refresh has a baseline
        system.refresh_cpu();
        system.refresh_memory();
        Self { system, counters }
    }
}

#[cfg(feature = "host_probe")]
impl ResourceProbe for HostResourceProbe {
    fn sample(&mut self) -> Result<ResourceSnapshot, ProbeError> {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let cpu_percent = self.system.global_cpu_info().cpu_usage();
        if !cpu_percent.is_finite() {
            return Err(ProbeError::Unavailable(ResourceIndicator::Cpu));
        }

        let total = self.system.total_memory();
        if total == 0 {
            return Err(ProbeError::Unavailable(ResourceIndicator::Memory));
        }
        let memory_percent = self.system.used_memory() as f32 / total as f32 * 100.0;

        let (db_connections_active, db_connections_max) = self.counters.db_connections();

        Ok(ResourceSnapshot {
            cpu_percent,
            memory_percent,
            db_connections_active,
            db_connections_max,
            active_regions: self.counters.active_regions(),
        })
    }
}

/// Classifies host load into a [`ResourcePressure`] level
pub struct ResourceMonitor {
    thresholds: ResourceThresholds,
    probe: Box<dyn ResourceProbe>,
    clock: Arc<dyn Clock>,
    pressure: ResourcePressure,
    dominant: Option<ResourceIndicator>,
    last_snapshot: Option<ResourceSnapshot>,
    last_sample_ms: Option<u64>,
    sample_count: u64,
    consecutive_failures: u32,
    total_failures: u64,
    pressure_changes: u64,
}

impl ResourceMonitor {
    pub fn new(
        thresholds: ResourceThresholds,
        probe: Box<dyn ResourceProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            thresholds,
            probe,
            clock,
            pressure: ResourcePressure::Normal,
            dominant: None,
            last_snapshot: None,
            last_sample_ms: None,
            sample_count: 0,
            consecutive_failures: 0,
            total_failures: 0,
            pressure_changes: 0,
        }
    }

    /// Sample if the sampling interval has elapsed. Returns true if a sample was taken.
    pub fn update(&mut self) -> bool {
        let now = self.clock.now_ms();
        let due = match self.last_sample_ms {
            Some(last) => now.saturating_sub(last) >= self.thresholds.sample_interval_ms,
            None => true,
        };
        if due {
            // Failure is already logged and absorbed
            let _ = self.sample();
        }
        due
    }

    /// Read every indicator now and reclassify.
    ///
    /// On failure the previous pressure is kept so a broken probe cannot mask
    /// a real overload.
    pub fn sample(&mut self) -> Result<ResourcePressure, ProbeError> {
        self.last_sample_ms = Some(self.clock.now_ms());

        match self.probe.sample() {
            Ok(snapshot) => {
                self.consecutive_failures = 0;
                self.sample_count += 1;
                self.last_snapshot = Some(snapshot);
                let (level, dominant) = snapshot.classify(&self.thresholds);
                self.set_pressure(level, dominant);
                Ok(level)
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.total_failures += 1;
                warn!(
                    error = %e,
                    consecutive = self.consecutive_failures,
                    pressure = %self.pressure,
                    "Resource sampling failed, keeping last known pressure"
                );
                Err(e)
            }
        }
    }

    fn set_pressure(&mut self, level: ResourcePressure, dominant: Option<ResourceIndicator>) {
        self.dominant = dominant;
        if level == self.pressure {
            return;
        }

        let previous = self.pressure;
        self.pressure = level;
        self.pressure_changes += 1;

        let indicator = dominant.map(|d| d.to_string()).unwrap_or_else(|| "none".into());
        if level > previous {
            warn!(from = %previous, to = %level, indicator = %indicator, "Resource pressure rising");
        } else {
            info!(from = %previous, to = %level, "Resource pressure easing");
        }
    }

    /// Last classified level
    pub fn get_pressure(&self) -> ResourcePressure {
        self.pressure
    }

    /// Indicator responsible for the current level
    pub fn dominant_indicator(&self) -> Option<ResourceIndicator> {
        self.dominant
    }

    pub fn last_snapshot(&self) -> Option<&ResourceSnapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    pub fn pressure_changes(&self) -> u64 {
        self.pressure_changes
    }

    pub fn thresholds(&self) -> &ResourceThresholds {
        &self.thresholds
    }

    /// Swap thresholds and reclassify the last snapshot immediately
    pub fn set_thresholds(&mut self, mut thresholds: ResourceThresholds) {
        thresholds.sanitize();
        self.thresholds = thresholds;
        if let Some(snapshot) = self.last_snapshot {
            let (level, dominant) = snapshot.classify(&self.thresholds);
            self.set_pressure(level, dominant);
        }
        debug!("Resource thresholds reloaded");
    }
}

/// Hand-driven probe for tests and simulations
pub mod mocks {
    use super::*;
    use parking_lot::Mutex;

    /// Probe whose reading is set from outside. Clones share the same reading.
    #[derive(Clone)]
    pub struct ManualProbe {
        reading: Arc<Mutex<Result<ResourceSnapshot, ProbeError>>>,
    }

    impl ManualProbe {
        pub fn new(snapshot: ResourceSnapshot) -> Self {
            Self {
                reading: Arc::new(Mutex::new(Ok(snapshot))),
            }
        }

        pub fn idle() -> Self {
            Self::new(ResourceSnapshot::default())
        }

        pub fn set(&self, snapshot: ResourceSnapshot) {
            *self.reading.lock() = Ok(snapshot);
        }

        pub fn set_cpu(&self, cpu_percent: f32) {
            let mut reading = self.reading.lock();
            let mut snapshot = reading.clone().unwrap_or_default();
            snapshot.cpu_percent = cpu_percent;
            *reading = Ok(snapshot);
        }

        pub fn fail(&self, indicator: ResourceIndicator) {
            *self.reading.lock() = Err(ProbeError::Unavailable(indicator));
        }
    }

    impl ResourceProbe for ManualProbe {
        fn sample(&mut self) -> Result<ResourceSnapshot, ProbeError> {
            self.reading.lock().clone()
        }
    }
}
