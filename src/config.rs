use std::fmt::Debug;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::admission::circuit_breaker::CircuitState;
use crate::admission::priority_queue::SpawnPriority;
use crate::admission::resource::ResourcePressure;

/// Errors raised while reading configuration from outside the process
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Full admission-control configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub throttler: ThrottlerConfig,
    pub resources: ResourceThresholds,
    pub circuit_breaker: CircuitBreakerConfig,
    pub queue: QueueConfig,
    pub startup: StartupConfig,
}

/// Spawn interval, burst and per-tick policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlerConfig {
    /// Interval between spawns under ideal conditions
    pub base_spawn_interval_ms: u64,
    /// Lower clamp for the computed interval
    pub min_spawn_interval_ms: u64,
    /// Upper clamp for the computed interval
    pub max_spawn_interval_ms: u64,
    pub pressure_multipliers: PressureMultipliers,
    pub circuit_multipliers: CircuitMultipliers,
    /// Applied while burst prevention is engaged
    pub burst_multiplier: f32,
    /// Sliding window for burst detection
    pub burst_window_ms: u64,
    /// Successful spawns tolerated inside one burst window
    pub max_bursts_per_window: u32,
    /// Hard cap on admitted spawns within one tick
    pub max_spawns_per_update_cycle: u32,
    pub enable_adaptive_throttling: bool,
    pub enable_circuit_breaker: bool,
    pub enable_burst_prevention: bool,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            base_spawn_interval_ms: 100,
            min_spawn_interval_ms: 50,
            max_spawn_interval_ms: 5000,
            pressure_multipliers: PressureMultipliers::default(),
            circuit_multipliers: CircuitMultipliers::default(),
            burst_multiplier: 0.5,
            burst_window_ms: 10_000,
            max_bursts_per_window: 50,
            max_spawns_per_update_cycle: 2,
            enable_adaptive_throttling: true,
            enable_circuit_breaker: true,
            enable_burst_prevention: true,
        }
    }
}

/// Spawn-rate damping per pressure level (1.0 = full speed, 0.0 = stop)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureMultipliers {
    pub normal: f32,
    pub elevated: f32,
    pub high: f32,
    pub critical: f32,
}

impl Default for PressureMultipliers {
    fn default() -> Self {
        Self {
            normal: 1.0,
            elevated: 0.5,
            high: 0.25,
            critical: 0.0,
        }
    }
}

impl PressureMultipliers {
    pub fn get(&self, pressure: ResourcePressure) -> f32 {
        match pressure {
            ResourcePressure::Normal => self.normal,
            ResourcePressure::Elevated => self.elevated,
            ResourcePressure::High => self.high,
            ResourcePressure::Critical => self.critical,
        }
    }
}

/// Spawn-rate damping per breaker state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitMultipliers {
    pub closed: f32,
    pub half_open: f32,
    pub open: f32,
}

impl Default for CircuitMultipliers {
    fn default() -> Self {
        Self {
            closed: 1.0,
            half_open: 0.5,
            open: 0.0,
        }
    }
}

impl CircuitMultipliers {
    pub fn get(&self, state: CircuitState) -> f32 {
        match state {
            CircuitState::Closed => self.closed,
            CircuitState::HalfOpen => self.half_open,
            CircuitState::Open => self.open,
        }
    }
}

/// Escalation points for one resource indicator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelThresholds {
    pub elevated: f32,
    pub high: f32,
    pub critical: f32,
}

impl LevelThresholds {
    pub const fn new(elevated: f32, high: f32, critical: f32) -> Self {
        Self {
            elevated,
            high,
            critical,
        }
    }

    /// Classify a reading. A threshold is crossed when the value reaches it.
    pub fn classify(&self, value: f32) -> ResourcePressure {
        if value >= self.critical {
            ResourcePressure::Critical
        } else if value >= self.high {
            ResourcePressure::High
        } else if value >= self.elevated {
            ResourcePressure::Elevated
        } else {
            ResourcePressure::Normal
        }
    }
}

/// Resource monitor thresholds and sampling cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceThresholds {
    /// Process/host CPU usage (0-100)
    pub cpu_percent: LevelThresholds,
    /// Host memory usage (0-100)
    pub memory_percent: LevelThresholds,
    /// Active DB connections as a share of the pool (0-100)
    pub db_saturation_percent: LevelThresholds,
    /// Number of live simulation regions
    pub active_regions: LevelThresholds,
    /// Minimum time between two samples
    pub sample_interval_ms: u64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: LevelThresholds::new(60.0, 75.0, 90.0),
            memory_percent: LevelThresholds::new(70.0, 80.0, 90.0),
            db_saturation_percent: LevelThresholds::new(60.0, 80.0, 95.0),
            active_regions: LevelThresholds::new(200.0, 400.0, 800.0),
            sample_interval_ms: 1000,
        }
    }
}

/// Spawn circuit breaker policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of most recent outcomes considered
    pub window_size: usize,
    /// Outcomes required before the breaker may trip
    pub min_samples: usize,
    /// Failure ratio that must be exceeded to open
    pub failure_threshold: f32,
    /// Time spent open before probing
    pub open_cooldown_ms: u64,
    /// Probe spawns admitted while half-open
    pub half_open_max_probes: u32,
    /// Probe successes needed to close again
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            min_samples: 10,
            failure_threshold: 0.10,
            open_cooldown_ms: 30_000,
            half_open_max_probes: 3,
            half_open_success_threshold: 3,
        }
    }
}

/// Priority queue limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum pending requests across all tiers
    pub max_queue_size: usize,
    /// Capacity of the cross-thread submission inbox
    pub inbox_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            inbox_capacity: 4096,
        }
    }
}

/// One step of the cold-start ramp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupPhase {
    /// Elapsed time since start when the phase begins
    pub start_ms: u64,
    /// Elapsed time since start when the phase ends
    pub end_ms: u64,
    /// Total released requests allowed by the end of this phase
    pub cumulative_target: u32,
    /// Tier assigned to requests released during this phase
    pub priority: SpawnPriority,
}

impl StartupPhase {
    pub const fn new(start_ms: u64, end_ms: u64, cumulative_target: u32, priority: SpawnPriority) -> Self {
        Self {
            start_ms,
            end_ms,
            cumulative_target,
            priority,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

const MINUTE_MS: u64 = 60_000;

/// Cold-start ramp configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    pub enabled: bool,
    pub phases: Vec<StartupPhase>,
    /// Upper bound on requests released by a single update
    pub max_releases_per_update: u32,
    /// Requests held back while the ramp is active
    pub max_backlog: usize,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            phases: vec![
                StartupPhase::new(0, 2 * MINUTE_MS, 100, SpawnPriority::Critical),
                StartupPhase::new(2 * MINUTE_MS, 5 * MINUTE_MS, 500, SpawnPriority::High),
                StartupPhase::new(5 * MINUTE_MS, 15 * MINUTE_MS, 3000, SpawnPriority::Normal),
                StartupPhase::new(15 * MINUTE_MS, 30 * MINUTE_MS, 5000, SpawnPriority::Low),
            ],
            max_releases_per_update: 25,
            max_backlog: 20_000,
        }
    }
}

impl AdmissionConfig {
    /// Load config from `SPAWN_CONFIG_FILE` (if set) and environment, or use defaults.
    /// The result is always sanitized.
    pub fn load_or_default() -> Self {
        let mut config = match std::env::var("SPAWN_CONFIG_FILE") {
            Ok(path) => Self::from_json_file(&path).unwrap_or_else(|e| {
                warn!("Failed to load SPAWN_CONFIG_FILE '{}': {}, using defaults", path, e);
                Self::default()
            }),
            Err(_) => Self::default(),
        };

        let t = &mut config.throttler;
        read_env("SPAWN_BASE_INTERVAL_MS", &mut t.base_spawn_interval_ms);
        read_env("SPAWN_MIN_INTERVAL_MS", &mut t.min_spawn_interval_ms);
        read_env("SPAWN_MAX_INTERVAL_MS", &mut t.max_spawn_interval_ms);
        read_env("SPAWN_BURST_WINDOW_MS", &mut t.burst_window_ms);
        read_env("SPAWN_MAX_BURSTS_PER_WINDOW", &mut t.max_bursts_per_window);
        read_env("SPAWN_MAX_PER_TICK", &mut t.max_spawns_per_update_cycle);
        read_env("SPAWN_ADAPTIVE", &mut t.enable_adaptive_throttling);
        read_env("SPAWN_CIRCUIT_BREAKER", &mut t.enable_circuit_breaker);
        read_env("SPAWN_BURST_PREVENTION", &mut t.enable_burst_prevention);

        read_env("SPAWN_MONITOR_INTERVAL_MS", &mut config.resources.sample_interval_ms);

        let cb = &mut config.circuit_breaker;
        read_env("SPAWN_BREAKER_THRESHOLD", &mut cb.failure_threshold);
        read_env("SPAWN_BREAKER_WINDOW", &mut cb.window_size);
        read_env("SPAWN_BREAKER_COOLDOWN_MS", &mut cb.open_cooldown_ms);

        read_env("SPAWN_QUEUE_SIZE", &mut config.queue.max_queue_size);
        read_env("SPAWN_STARTUP_RAMP", &mut config.startup.enabled);

        config.sanitize();
        config
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(json)?;
        config.sanitize();
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Clamp every section into its usable range. Returns the number of clamped values.
    pub fn sanitize(&mut self) -> usize {
        self.throttler.sanitize()
            + self.resources.sanitize()
            + self.circuit_breaker.sanitize()
            + self.queue.sanitize()
            + self.startup.sanitize()
    }
}

impl ThrottlerConfig {
    /// Clamp out-of-range values. Returns the number of clamped values.
    pub fn sanitize(&mut self) -> usize {
        let mut clamps = 0;

        clamp_min("min_spawn_interval_ms", &mut self.min_spawn_interval_ms, 1, &mut clamps);
        let min = self.min_spawn_interval_ms;
        clamp_min("max_spawn_interval_ms", &mut self.max_spawn_interval_ms, min, &mut clamps);
        let max = self.max_spawn_interval_ms;
        clamp_range("base_spawn_interval_ms", &mut self.base_spawn_interval_ms, min, max, &mut clamps);

        let p = &mut self.pressure_multipliers;
        clamp_unit("pressure_multipliers.normal", &mut p.normal, 1.0, &mut clamps);
        clamp_unit("pressure_multipliers.elevated", &mut p.elevated, p.normal, &mut clamps);
        clamp_unit("pressure_multipliers.high", &mut p.high, p.elevated, &mut clamps);
        clamp_unit("pressure_multipliers.critical", &mut p.critical, p.high, &mut clamps);

        let c = &mut self.circuit_multipliers;
        clamp_unit("circuit_multipliers.closed", &mut c.closed, 1.0, &mut clamps);
        clamp_unit("circuit_multipliers.half_open", &mut c.half_open, c.closed, &mut clamps);
        clamp_unit("circuit_multipliers.open", &mut c.open, c.half_open, &mut clamps);

        clamp_unit("burst_multiplier", &mut self.burst_multiplier, 1.0, &mut clamps);
        clamp_min("burst_window_ms", &mut self.burst_window_ms, 100, &mut clamps);
        clamp_min("max_bursts_per_window", &mut self.max_bursts_per_window, 1, &mut clamps);
        clamp_range(
            "max_spawns_per_update_cycle",
            &mut self.max_spawns_per_update_cycle,
            1,
            100,
            &mut clamps,
        );

        clamps
    }
}

impl ResourceThresholds {
    pub fn sanitize(&mut self) -> usize {
        let mut clamps = 0;
        for (name, levels) in [
            ("cpu_percent", &mut self.cpu_percent),
            ("memory_percent", &mut self.memory_percent),
            ("db_saturation_percent", &mut self.db_saturation_percent),
            ("active_regions", &mut self.active_regions),
        ] {
            if !levels.elevated.is_finite() || levels.elevated < 0.0 {
                warn!(field = name, value = levels.elevated, "Clamped elevated threshold to 0");
                levels.elevated = 0.0;
                clamps += 1;
            }
            if !(levels.high >= levels.elevated) {
                warn!(field = name, value = levels.high, "Clamped high threshold up to elevated");
                levels.high = levels.elevated;
                clamps += 1;
            }
            if !(levels.critical >= levels.high) {
                warn!(field = name, value = levels.critical, "Clamped critical threshold up to high");
                levels.critical = levels.high;
                clamps += 1;
            }
        }
        clamp_min("sample_interval_ms", &mut self.sample_interval_ms, 10, &mut clamps);
        clamps
    }
}

impl CircuitBreakerConfig {
    pub fn sanitize(&mut self) -> usize {
        let mut clamps = 0;
        clamp_min("window_size", &mut self.window_size, 1, &mut clamps);
        let window = self.window_size;
        clamp_range("min_samples", &mut self.min_samples, 1, window, &mut clamps);
        if !(self.failure_threshold > 0.0 && self.failure_threshold < 1.0) {
            warn!(
                value = self.failure_threshold,
                "Invalid failure_threshold, using 0.10"
            );
            self.failure_threshold = 0.10;
            clamps += 1;
        }
        clamp_min("open_cooldown_ms", &mut self.open_cooldown_ms, 100, &mut clamps);
        clamp_min("half_open_max_probes", &mut self.half_open_max_probes, 1, &mut clamps);
        let probes = self.half_open_max_probes;
        clamp_range(
            "half_open_success_threshold",
            &mut self.half_open_success_threshold,
            1,
            probes,
            &mut clamps,
        );
        clamps
    }
}

impl QueueConfig {
    pub fn sanitize(&mut self) -> usize {
        let mut clamps = 0;
        clamp_min("max_queue_size", &mut self.max_queue_size, 1, &mut clamps);
        clamp_min("inbox_capacity", &mut self.inbox_capacity, 1, &mut clamps);
        clamps
    }
}

impl StartupConfig {
    pub fn sanitize(&mut self) -> usize {
        let mut clamps = 0;

        if self.enabled && self.phases.is_empty() {
            warn!("Startup ramp enabled without phases, disabling ramp");
            self.enabled = false;
            clamps += 1;
        }

        self.phases.sort_by_key(|p| p.start_ms);
        let mut prev_end = 0;
        let mut prev_target = 0;
        for (i, phase) in self.phases.iter_mut().enumerate() {
            if phase.start_ms != prev_end {
                warn!(phase = i + 1, "Startup phase does not start where the previous one ended, realigning");
                phase.start_ms = prev_end;
                clamps += 1;
            }
            if phase.end_ms <= phase.start_ms {
                warn!(phase = i + 1, "Startup phase has no duration, extending to 1s");
                phase.end_ms = phase.start_ms + 1000;
                clamps += 1;
            }
            if phase.cumulative_target < prev_target {
                warn!(phase = i + 1, "Startup cumulative target decreased, raising to previous");
                phase.cumulative_target = prev_target;
                clamps += 1;
            }
            prev_end = phase.end_ms;
            prev_target = phase.cumulative_target;
        }

        clamp_min("max_releases_per_update", &mut self.max_releases_per_update, 1, &mut clamps);
        clamp_min("max_backlog", &mut self.max_backlog, 1, &mut clamps);
        clamps
    }

    /// Elapsed time at which the ramp is over
    pub fn ramp_end_ms(&self) -> u64 {
        self.phases.last().map(|p| p.end_ms).unwrap_or(0)
    }
}

fn read_env<T>(name: &str, target: &mut T)
where
    T: FromStr,
{
    if let Ok(raw) = std::env::var(name) {
        match raw.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!("Invalid {} '{}', using default", name, raw),
        }
    }
}

fn clamp_min<T>(name: &str, value: &mut T, lo: T, clamps: &mut usize)
where
    T: PartialOrd + Copy + Debug,
{
    if *value < lo {
        warn!("Config {} = {:?} below minimum, clamped to {:?}", name, value, lo);
        *value = lo;
        *clamps += 1;
    }
}

fn clamp_range<T>(name: &str, value: &mut T, lo: T, hi: T, clamps: &mut usize)
where
    T: PartialOrd + Copy + Debug,
{
    if *value < lo {
        warn!("Config {} = {:?} below range, clamped to {:?}", name, value, lo);
        *value = lo;
        *clamps += 1;
    } else if *value > hi {
        warn!("Config {} = {:?} above range, clamped to {:?}", name, value, hi);
        *value = hi;
        *clamps += 1;
    }
}

/// Clamp a multiplier into `[0, ceiling]`. NaN becomes 0.
fn clamp_unit(name: &str, value: &mut f32, ceiling: f32, clamps: &mut usize) {
    if value.is_nan() {
        warn!("Config {} is NaN, clamped to 0", name);
        *value = 0.0;
        *clamps += 1;
    } else if *value < 0.0 {
        warn!("Config {} = {} below 0, clamped to 0", name, value);
        *value = 0.0;
        *clamps += 1;
    } else if *value > ceiling {
        warn!("Config {} = {} above {}, clamped", name, value, ceiling);
        *value = ceiling;
        *clamps += 1;
    }
}
