//! Adaptive spawn throttling
//!
//! Folds resource pressure, breaker state and burst statistics into a single
//! spawn interval and a per-tick cap, and answers the one question the spawn
//! loop asks every tick: may a spawn happen right now?
//!
//! ```text
//! effective = pressure_mult × circuit_mult × burst_mult
//! interval  = clamp(base / effective, min, max)      (effective == 0 => max, deny)
//! ```
//!
//! Admission checks, in order (first failure wins):
//! 1. breaker admits (not open, half-open probe quota left)
//! 2. effective multiplier is not zero
//! 3. per-tick counter below `max_spawns_per_update_cycle`
//! 4. time since the last admission >= current interval
//! 5. burst prevention not engaged

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::admission::circuit_breaker::{CircuitState, SpawnCircuitBreaker};
use crate::admission::resource::{ResourceMonitor, ResourcePressure};
use crate::config::ThrottlerConfig;
use crate::util::clock::Clock;

/// Multipliers at or below this are treated as a hard stop
const MULTIPLIER_EPSILON: f32 = 1e-4;

/// Why the last admission check said no
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NotInitialized,
    CircuitOpen,
    PressureBlocked,
    TickCapReached,
    IntervalNotElapsed,
    BurstPrevention,
}

impl DenialReason {
    /// Denials caused by the breaker (or missing wiring) rather than rate shaping
    pub fn is_block(&self) -> bool {
        matches!(self, DenialReason::NotInitialized | DenialReason::CircuitOpen)
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DenialReason::NotInitialized => "throttler not initialized",
            DenialReason::CircuitOpen => "circuit breaker open",
            DenialReason::PressureBlocked => "resource pressure critical",
            DenialReason::TickCapReached => "per-tick spawn cap reached",
            DenialReason::IntervalNotElapsed => "spawn interval not elapsed",
            DenialReason::BurstPrevention => "burst prevention engaged",
        };
        f.write_str(text)
    }
}

/// Observable throttler state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThrottlerMetrics {
    pub current_interval_ms: u64,
    /// Spawns per second at the current interval (0 when hard-blocked)
    pub current_spawn_rate: f32,
    pub effective_multiplier: f32,
    pub pressure: ResourcePressure,
    pub circuit_state: CircuitState,
    pub in_burst_prevention: bool,
    pub burst_window_count: usize,
    pub burst_engagements: u64,
    pub spawns_this_tick: u32,
    pub time_until_next_spawn_ms: u64,
    pub total_spawns: u64,
    pub total_failures: u64,
    /// Denied by interval, per-tick cap, pressure or burst prevention
    pub throttled_spawns: u64,
    /// Denied by the breaker or because the throttler was not initialized
    pub blocked_spawns: u64,
}

/// Sliding window of successful-spawn timestamps
#[derive(Debug)]
pub struct BurstTracker {
    window_ms: u64,
    max_per_window: u32,
    timestamps: VecDeque<u64>,
    engaged: bool,
    engagements: u64,
}

impl BurstTracker {
    pub fn new(window_ms: u64, max_per_window: u32) -> Self {
        Self {
            window_ms,
            max_per_window,
            timestamps: VecDeque::with_capacity(max_per_window as usize + 1),
            engaged: false,
            engagements: 0,
        }
    }

    /// Append a success. Timestamps never go backwards.
    pub fn record(&mut self, now_ms: u64) {
        let ts = self.timestamps.back().map_or(now_ms, |&last| last.max(now_ms));
        self.timestamps.push_back(ts);
    }

    /// Drop entries that have aged out of the window
    pub fn prune(&mut self, now_ms: u64) {
        while let Some(&oldest) = self.timestamps.front() {
            if now_ms.saturating_sub(oldest) >= self.window_ms {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Prune, then decide whether burst prevention is engaged
    pub fn evaluate(&mut self, now_ms: u64) -> bool {
        self.prune(now_ms);
        let over = self.timestamps.len() > self.max_per_window as usize;

        if over && !self.engaged {
            self.engagements += 1;
            warn!(
                spawns = self.timestamps.len(),
                window_ms = self.window_ms,
                limit = self.max_per_window,
                "Spawn burst detected, burst prevention engaged"
            );
        } else if !over && self.engaged {
            info!(spawns = self.timestamps.len(), "Burst prevention released");
        }
        self.engaged = over;
        over
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn engagements(&self) -> u64 {
        self.engagements
    }

    fn reconfigure(&mut self, window_ms: u64, max_per_window: u32) {
        self.window_ms = window_ms;
        self.max_per_window = max_per_window;
    }
}

struct ThrottlerInputs {
    monitor: ResourceMonitor,
    breaker: SpawnCircuitBreaker,
}

/// Single point of truth for spawn admission
pub struct AdaptiveSpawnThrottler {
    config: ThrottlerConfig,
    clock: Arc<dyn Clock>,
    inputs: Option<ThrottlerInputs>,
    current_interval_ms: u64,
    effective_multiplier: f32,
    /// Admissions charge the interval and the per-tick cap whatever
    /// their outcome turns out to be
    last_admitted_ms: Option<u64>,
    spawns_this_tick: u32,
    burst: BurstTracker,
    ticks: u64,
    total_spawns: u64,
    total_failures: u64,
    throttled_spawns: u64,
    blocked_spawns: u64,
    last_denial: Option<DenialReason>,
    last_failure_reason: Option<String>,
}

impl AdaptiveSpawnThrottler {
    /// Create an uninitialized throttler. It denies every spawn until
    /// [`initialize`](Self::initialize) wires in its inputs.
    pub fn new(mut config: ThrottlerConfig, clock: Arc<dyn Clock>) -> Self {
        let clamps = config.sanitize();
        if clamps > 0 {
            warn!(clamps, "Throttler config contained out-of-range values");
        }
        let burst = BurstTracker::new(config.burst_window_ms, config.max_bursts_per_window);
        let current_interval_ms = config.base_spawn_interval_ms;
        Self {
            config,
            clock,
            inputs: None,
            current_interval_ms,
            effective_multiplier: 1.0,
            last_admitted_ms: None,
            spawns_this_tick: 0,
            burst,
            ticks: 0,
            total_spawns: 0,
            total_failures: 0,
            throttled_spawns: 0,
            blocked_spawns: 0,
            last_denial: None,
            last_failure_reason: None,
        }
    }

    /// Take ownership of the resource monitor and circuit breaker.
    /// Returns false (and keeps the existing inputs) if already initialized.
    pub fn initialize(&mut self, monitor: ResourceMonitor, breaker: SpawnCircuitBreaker) -> bool {
        if self.inputs.is_some() {
            warn!("Spawn throttler already initialized, ignoring");
            return false;
        }
        self.inputs = Some(ThrottlerInputs { monitor, breaker });
        self.recalculate_interval();
        info!(
            base_ms = self.config.base_spawn_interval_ms,
            min_ms = self.config.min_spawn_interval_ms,
            max_ms = self.config.max_spawn_interval_ms,
            per_tick = self.config.max_spawns_per_update_cycle,
            "Spawn throttler initialized"
        );
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.inputs.is_some()
    }

    /// Once per tick, before any admission check
    pub fn update(&mut self, diff_ms: u64) {
        self.ticks += 1;
        self.spawns_this_tick = 0;

        if let Some(inputs) = self.inputs.as_mut() {
            inputs.monitor.update();
            inputs.breaker.refresh();
        }
        let now = self.clock.now_ms();
        if self.config.enable_burst_prevention {
            self.burst.evaluate(now);
        } else {
            self.burst.prune(now);
        }
        self.recalculate_interval();

        debug!(
            tick = self.ticks,
            diff_ms,
            interval_ms = self.current_interval_ms,
            "Throttler updated"
        );
    }

    /// Force the interval to be re-derived from current inputs
    pub fn recalculate_interval(&mut self) {
        let multiplier = self.effective_multiplier_now();
        let interval = self.calculate_spawn_interval();

        if interval != self.current_interval_ms {
            debug!(
                from_ms = self.current_interval_ms,
                to_ms = interval,
                multiplier,
                pressure = %self.current_pressure(),
                circuit = %self.circuit_state(),
                "Spawn interval changed"
            );
        }
        self.effective_multiplier = multiplier;
        self.current_interval_ms = interval;
    }

    /// Interval implied by the current inputs. Always within `[min, max]`.
    pub fn calculate_spawn_interval(&self) -> u64 {
        let multiplier = self.effective_multiplier_now();
        if multiplier <= MULTIPLIER_EPSILON {
            return self.config.max_spawn_interval_ms;
        }

        let min = self.config.min_spawn_interval_ms as f64;
        let max = self.config.max_spawn_interval_ms as f64;
        let interval = self.config.base_spawn_interval_ms as f64 / multiplier as f64;
        interval.round().clamp(min, max) as u64
    }

    fn effective_multiplier_now(&self) -> f32 {
        self.pressure_multiplier() * self.circuit_multiplier() * self.burst_multiplier()
    }

    fn pressure_multiplier(&self) -> f32 {
        if !self.config.enable_adaptive_throttling {
            return 1.0;
        }
        self.config.pressure_multipliers.get(self.current_pressure())
    }

    fn circuit_multiplier(&self) -> f32 {
        if !self.config.enable_circuit_breaker {
            return 1.0;
        }
        self.config.circuit_multipliers.get(self.circuit_state())
    }

    fn burst_multiplier(&self) -> f32 {
        if self.config.enable_burst_prevention && self.burst.is_engaged() {
            self.config.burst_multiplier
        } else {
            1.0
        }
    }

    /// Admission decision. An admission counts against the interval and the
    /// per-tick cap immediately. Denials only bump counters.
    pub fn can_spawn_now(&mut self) -> bool {
        match self.check_admission() {
            Ok(()) => {
                self.last_denial = None;
                self.last_admitted_ms = Some(self.clock.now_ms());
                self.spawns_this_tick += 1;
                if let Some(inputs) = self.inputs.as_mut() {
                    inputs.breaker.note_admitted();
                }
                true
            }
            Err(reason) => {
                if reason.is_block() {
                    self.blocked_spawns += 1;
                } else {
                    self.throttled_spawns += 1;
                }
                if self.last_denial != Some(reason) {
                    debug!(reason = %reason, "Spawn denied");
                }
                self.last_denial = Some(reason);
                false
            }
        }
    }

    fn check_admission(&mut self) -> Result<(), DenialReason> {
        let now = self.clock.now_ms();

        let inputs = self.inputs.as_ref().ok_or(DenialReason::NotInitialized)?;
        if self.config.enable_circuit_breaker && !inputs.breaker.has_capacity() {
            return Err(DenialReason::CircuitOpen);
        }

        if self.effective_multiplier <= MULTIPLIER_EPSILON {
            return Err(DenialReason::PressureBlocked);
        }

        if self.spawns_this_tick >= self.config.max_spawns_per_update_cycle {
            return Err(DenialReason::TickCapReached);
        }

        if let Some(last) = self.last_admitted_ms {
            if now.saturating_sub(last) < self.current_interval_ms {
                return Err(DenialReason::IntervalNotElapsed);
            }
        }

        if self.config.enable_burst_prevention {
            let was_engaged = self.burst.is_engaged();
            let engaged = self.burst.evaluate(now);
            if engaged != was_engaged {
                self.recalculate_interval();
            }
            if engaged {
                return Err(DenialReason::BurstPrevention);
            }
        }

        Ok(())
    }

    /// The admitted spawn completed
    pub fn record_spawn_success(&mut self) {
        if self.config.enable_burst_prevention {
            self.burst.record(self.clock.now_ms());
        }
        self.total_spawns += 1;

        if self.report_to_breaker(true) {
            self.recalculate_interval();
        }
    }

    /// The admitted spawn failed. No retry happens here.
    pub fn record_spawn_failure(&mut self, reason: &str) {
        self.total_failures += 1;
        debug!(reason, total = self.total_failures, "Spawn failed");
        self.last_failure_reason = Some(reason.to_string());

        if self.report_to_breaker(false) {
            self.recalculate_interval();
        }
    }

    /// Returns true if the breaker changed state
    fn report_to_breaker(&mut self, success: bool) -> bool {
        match self.inputs.as_mut() {
            Some(inputs) => {
                let before = inputs.breaker.get_state();
                inputs.breaker.record_outcome(success);
                inputs.breaker.get_state() != before
            }
            None => false,
        }
    }

    pub fn get_current_spawn_interval(&self) -> u64 {
        self.current_interval_ms
    }

    /// Spawns per second at the current interval
    pub fn get_current_spawn_rate(&self) -> f32 {
        if self.effective_multiplier <= MULTIPLIER_EPSILON || self.current_interval_ms == 0 {
            return 0.0;
        }
        1000.0 / self.current_interval_ms as f32
    }

    /// Time until the interval gate opens (0 when it already is)
    pub fn get_time_until_next_spawn(&self) -> u64 {
        match self.last_admitted_ms {
            Some(last) => (last + self.current_interval_ms).saturating_sub(self.clock.now_ms()),
            None => 0,
        }
    }

    pub fn get_metrics(&self) -> ThrottlerMetrics {
        ThrottlerMetrics {
            current_interval_ms: self.current_interval_ms,
            current_spawn_rate: self.get_current_spawn_rate(),
            effective_multiplier: self.effective_multiplier,
            pressure: self.current_pressure(),
            circuit_state: self.circuit_state(),
            in_burst_prevention: self.burst.is_engaged(),
            burst_window_count: self.burst.len(),
            burst_engagements: self.burst.engagements(),
            spawns_this_tick: self.spawns_this_tick,
            time_until_next_spawn_ms: self.get_time_until_next_spawn(),
            total_spawns: self.total_spawns,
            total_failures: self.total_failures,
            throttled_spawns: self.throttled_spawns,
            blocked_spawns: self.blocked_spawns,
        }
    }

    /// Apply a new configuration (hot reload). Out-of-range values are clamped.
    pub fn reload_config(&mut self, mut config: ThrottlerConfig) -> usize {
        let clamps = config.sanitize();
        self.burst
            .reconfigure(config.burst_window_ms, config.max_bursts_per_window);
        self.config = config;
        self.recalculate_interval();
        info!(
            clamps,
            interval_ms = self.current_interval_ms,
            "Throttler config reloaded"
        );
        clamps
    }

    pub fn config(&self) -> &ThrottlerConfig {
        &self.config
    }

    /// Last classified pressure (Normal before initialization)
    pub fn current_pressure(&self) -> ResourcePressure {
        self.inputs
            .as_ref()
            .map(|i| i.monitor.get_pressure())
            .unwrap_or_default()
    }

    /// Breaker state (Closed before initialization)
    pub fn circuit_state(&self) -> CircuitState {
        self.inputs
            .as_ref()
            .map(|i| i.breaker.get_state())
            .unwrap_or_default()
    }

    pub fn last_denial(&self) -> Option<DenialReason> {
        self.last_denial
    }

    pub fn last_failure_reason(&self) -> Option<&str> {
        self.last_failure_reason.as_deref()
    }

    pub fn is_in_burst_prevention(&self) -> bool {
        self.burst.is_engaged()
    }

    pub fn burst_window_len(&self) -> usize {
        self.burst.len()
    }

    pub fn spawns_this_tick(&self) -> u32 {
        self.spawns_this_tick
    }

    pub fn resource_monitor(&self) -> Option<&ResourceMonitor> {
        self.inputs.as_ref().map(|i| &i.monitor)
    }

    pub fn resource_monitor_mut(&mut self) -> Option<&mut ResourceMonitor> {
        self.inputs.as_mut().map(|i| &mut i.monitor)
    }

    pub fn circuit_breaker(&self) -> Option<&SpawnCircuitBreaker> {
        self.inputs.as_ref().map(|i| &i.breaker)
    }

    pub fn circuit_breaker_mut(&mut self) -> Option<&mut SpawnCircuitBreaker> {
        self.inputs.as_mut().map(|i| &mut i.breaker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::resource::mocks::ManualProbe;
    use crate::config::{CircuitBreakerConfig, ResourceThresholds};
    use crate::util::clock::ManualClock;

    struct Harness {
        throttler: AdaptiveSpawnThrottler,
        probe: ManualProbe,
        clock: Arc<ManualClock>,
    }

    fn harness(config: ThrottlerConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let probe = ManualProbe::idle();
        let monitor = ResourceMonitor::new(
            ResourceThresholds::default(),
            Box::new(probe.clone()),
            clock.clone(),
        );
        let breaker = SpawnCircuitBreaker::new(CircuitBreakerConfig::default(), clock.clone());
        let mut throttler = AdaptiveSpawnThrottler::new(config, clock.clone());
        assert!(throttler.initialize(monitor, breaker));
        throttler.update(0);
        Harness {
            throttler,
            probe,
            clock,
        }
    }

    /// Advance past the monitor sampling interval so the next update resamples
    fn resample(h: &mut Harness) {
        h.clock.advance(1_000);
        h.throttler.update(1_000);
    }

    fn cpu_for(pressure: ResourcePressure) -> f32 {
        match pressure {
            ResourcePressure::Normal => 10.0,
            ResourcePressure::Elevated => 65.0,
            ResourcePressure::High => 80.0,
            ResourcePressure::Critical => 95.0,
        }
    }

    #[test]
    fn test_base_interval_when_idle() {
        let h = harness(ThrottlerConfig::default());
        assert_eq!(h.throttler.calculate_spawn_interval(), 100);
        assert_eq!(h.throttler.get_current_spawn_interval(), 100);
        assert_eq!(h.throttler.get_current_spawn_rate(), 10.0);
    }

    #[test]
    fn test_high_pressure_half_open_interval() {
        let mut h = harness(ThrottlerConfig::default());
        h.probe.set_cpu(cpu_for(ResourcePressure::High));
        h.throttler.circuit_breaker_mut().unwrap().force_open();
        h.clock.advance(30_000);
        h.throttler.update(30_000);

        assert_eq!(h.throttler.current_pressure(), ResourcePressure::High);
        assert_eq!(h.throttler.circuit_state(), CircuitState::HalfOpen);
        assert!((h.throttler.get_metrics().effective_multiplier - 0.125).abs() < 1e-6);
        assert_eq!(h.throttler.get_current_spawn_interval(), 800);
    }

    #[test]
    fn test_interval_monotone_in_pressure() {
        let mut h = harness(ThrottlerConfig::default());
        let mut previous = 0;
        for pressure in ResourcePressure::ALL {
            h.probe.set_cpu(cpu_for(pressure));
            resample(&mut h);
            assert_eq!(h.throttler.current_pressure(), pressure);
            let interval = h.throttler.get_current_spawn_interval();
            assert!(interval >= previous, "{:?} lowered interval", pressure);
            previous = interval;
        }
        assert_eq!(previous, 5000);
    }

    #[test]
    fn test_interval_always_within_bounds() {
        for (base, min, max) in [(100, 50, 5000), (10, 50, 60), (4000, 1, 4500), (1, 1, 1)] {
            let config = ThrottlerConfig {
                base_spawn_interval_ms: base,
                min_spawn_interval_ms: min,
                max_spawn_interval_ms: max,
                ..Default::default()
            };
            let mut h = harness(config);
            let (min, max) = (
                h.throttler.config().min_spawn_interval_ms,
                h.throttler.config().max_spawn_interval_ms,
            );
            for pressure in ResourcePressure::ALL {
                h.probe.set_cpu(cpu_for(pressure));
                resample(&mut h);
                let interval = h.throttler.calculate_spawn_interval();
                assert!(interval >= min && interval <= max, "{} outside [{}, {}]", interval, min, max);
            }
        }
    }

    #[test]
    fn test_critical_pressure_blocks() {
        let mut h = harness(ThrottlerConfig::default());
        h.probe.set_cpu(cpu_for(ResourcePressure::Critical));
        resample(&mut h);

        assert_eq!(h.throttler.get_current_spawn_interval(), 5000);
        assert_eq!(h.throttler.get_current_spawn_rate(), 0.0);
        assert!(!h.throttler.can_spawn_now());
        assert_eq!(h.throttler.last_denial(), Some(DenialReason::PressureBlocked));
    }

    #[test]
    fn test_adaptive_toggle_ignores_pressure() {
        let mut h = harness(ThrottlerConfig {
            enable_adaptive_throttling: false,
            ..Default::default()
        });
        h.probe.set_cpu(cpu_for(ResourcePressure::Critical));
        resample(&mut h);
        assert_eq!(h.throttler.get_current_spawn_interval(), 100);
        assert!(h.throttler.can_spawn_now());
    }

    #[test]
    fn test_open_circuit_denies_even_when_interval_elapsed() {
        let mut h = harness(ThrottlerConfig::default());
        for _ in 0..10 {
            h.throttler.record_spawn_failure("db timeout");
        }
        assert_eq!(h.throttler.circuit_state(), CircuitState::Open);
        assert_eq!(h.throttler.get_time_until_next_spawn(), 0);
        assert!(!h.throttler.can_spawn_now());
        assert_eq!(h.throttler.last_denial(), Some(DenialReason::CircuitOpen));
        assert_eq!(h.throttler.get_current_spawn_interval(), 5000);

        let metrics = h.throttler.get_metrics();
        assert_eq!(metrics.total_failures, 10);
        assert_eq!(metrics.blocked_spawns, 1);
        assert_eq!(h.throttler.last_failure_reason(), Some("db timeout"));
    }

    #[test]
    fn test_half_open_probe_quota_through_throttler() {
        let mut h = harness(ThrottlerConfig::default());
        h.throttler.circuit_breaker_mut().unwrap().force_open();
        h.clock.advance(30_000);
        h.throttler.update(30_000);
        assert_eq!(h.throttler.circuit_state(), CircuitState::HalfOpen);

        for _ in 0..3 {
            h.clock.advance(1_000);
            h.throttler.update(1_000);
            assert!(h.throttler.can_spawn_now());
        }
        h.clock.advance(1_000);
        h.throttler.update(1_000);
        assert!(!h.throttler.can_spawn_now());
        assert_eq!(h.throttler.last_denial(), Some(DenialReason::CircuitOpen));
    }

    #[test]
    fn test_interval_gate() {
        let mut h = harness(ThrottlerConfig::default());
        assert!(h.throttler.can_spawn_now());
        h.throttler.record_spawn_success();

        h.throttler.update(50);
        h.clock.advance(30);
        assert_eq!(h.throttler.get_time_until_next_spawn(), 70);
        assert!(!h.throttler.can_spawn_now());
        assert_eq!(h.throttler.last_denial(), Some(DenialReason::IntervalNotElapsed));

        h.clock.advance(70);
        assert!(h.throttler.can_spawn_now());
    }

    #[test]
    fn test_per_tick_cap() {
        let mut h = harness(ThrottlerConfig {
            base_spawn_interval_ms: 1,
            min_spawn_interval_ms: 1,
            max_spawns_per_update_cycle: 2,
            ..Default::default()
        });

        for _ in 0..2 {
            h.clock.advance(1);
            assert!(h.throttler.can_spawn_now());
            h.throttler.record_spawn_success();
        }
        h.clock.advance(1);
        assert!(!h.throttler.can_spawn_now());
        assert_eq!(h.throttler.last_denial(), Some(DenialReason::TickCapReached));

        h.throttler.update(1);
        assert_eq!(h.throttler.spawns_this_tick(), 0);
        assert!(h.throttler.can_spawn_now());
    }

    #[test]
    fn test_failed_spawns_still_count_against_tick_cap() {
        let mut h = harness(ThrottlerConfig {
            base_spawn_interval_ms: 1,
            min_spawn_interval_ms: 1,
            max_spawns_per_update_cycle: 2,
            enable_circuit_breaker: false,
            enable_burst_prevention: false,
            ..Default::default()
        });

        for _ in 0..10 {
            h.clock.advance(50);
            h.throttler.update(50);
            let mut admitted = 0;
            for _ in 0..20 {
                h.clock.advance(1);
                if h.throttler.can_spawn_now() {
                    h.throttler.record_spawn_failure("character creation failed");
                    admitted += 1;
                }
            }
            assert_eq!(admitted, 2);
        }
        assert_eq!(h.throttler.get_metrics().total_failures, 20);
    }

    #[test]
    fn test_unreported_admission_holds_interval() {
        let mut h = harness(ThrottlerConfig::default());
        assert!(h.throttler.can_spawn_now());
        assert_eq!(h.throttler.spawns_this_tick(), 1);

        // Outcome still pending
        h.clock.advance(60);
        assert!(!h.throttler.can_spawn_now());
        assert_eq!(h.throttler.last_denial(), Some(DenialReason::IntervalNotElapsed));
        assert_eq!(h.throttler.get_time_until_next_spawn(), 40);

        h.clock.advance(40);
        assert!(h.throttler.can_spawn_now());
        assert!(!h.throttler.can_spawn_now());
        assert_eq!(h.throttler.get_metrics().total_spawns, 0);
    }

    #[test]
    fn test_burst_window_bounded_when_disabled() {
        let mut h = harness(ThrottlerConfig {
            enable_burst_prevention: false,
            ..Default::default()
        });
        for _ in 0..1_000 {
            h.clock.advance(100);
            h.throttler.update(100);
            if h.throttler.can_spawn_now() {
                h.throttler.record_spawn_success();
            }
        }
        assert_eq!(h.throttler.get_metrics().total_spawns, 1_000);
        assert_eq!(h.throttler.burst_window_len(), 0);
    }

    #[test]
    fn test_burst_window_drains_after_disable() {
        let mut h = harness(ThrottlerConfig::default());
        for _ in 0..20 {
            h.clock.advance(100);
            h.throttler.update(100);
            assert!(h.throttler.can_spawn_now());
            h.throttler.record_spawn_success();
        }
        assert_eq!(h.throttler.burst_window_len(), 20);

        h.throttler.reload_config(ThrottlerConfig {
            enable_burst_prevention: false,
            ..Default::default()
        });
        h.throttler.record_spawn_success();
        assert_eq!(h.throttler.burst_window_len(), 20);

        h.clock.advance(10_000);
        h.throttler.update(10_000);
        assert_eq!(h.throttler.burst_window_len(), 0);
    }

    #[test]
    fn test_burst_prevention_engages_and_releases() {
        let mut h = harness(ThrottlerConfig::default());
        for _ in 0..51 {
            h.throttler.record_spawn_success();
        }

        h.clock.advance(1_000);
        h.throttler.update(1_000);
        assert!(h.throttler.is_in_burst_prevention());
        assert!(!h.throttler.can_spawn_now());
        assert_eq!(h.throttler.last_denial(), Some(DenialReason::BurstPrevention));
        assert_eq!(h.throttler.get_current_spawn_interval(), 200);
        assert_eq!(h.throttler.get_metrics().burst_engagements, 1);

        h.clock.advance(10_000);
        h.throttler.update(10_000);
        assert!(!h.throttler.is_in_burst_prevention());
        assert_eq!(h.throttler.burst_window_len(), 0);
        assert!(h.throttler.can_spawn_now());
        assert_eq!(h.throttler.get_current_spawn_interval(), 100);
    }

    #[test]
    fn test_burst_at_limit_not_engaged() {
        let mut h = harness(ThrottlerConfig::default());
        for _ in 0..50 {
            h.throttler.record_spawn_success();
        }
        h.clock.advance(1_000);
        h.throttler.update(1_000);
        assert!(!h.throttler.is_in_burst_prevention());
        assert!(h.throttler.can_spawn_now());
    }

    #[test]
    fn test_not_initialized_denies() {
        let clock = Arc::new(ManualClock::new(0));
        let mut throttler = AdaptiveSpawnThrottler::new(ThrottlerConfig::default(), clock);
        assert!(!throttler.is_initialized());
        assert!(!throttler.can_spawn_now());
        assert_eq!(throttler.last_denial(), Some(DenialReason::NotInitialized));
        assert_eq!(throttler.get_metrics().blocked_spawns, 1);
    }

    #[test]
    fn test_double_initialize_rejected() {
        let mut h = harness(ThrottlerConfig::default());
        let monitor = ResourceMonitor::new(
            ResourceThresholds::default(),
            Box::new(ManualProbe::idle()),
            h.clock.clone(),
        );
        let breaker = SpawnCircuitBreaker::new(CircuitBreakerConfig::default(), h.clock.clone());
        assert!(!h.throttler.initialize(monitor, breaker));
    }

    #[test]
    fn test_reload_config() {
        let mut h = harness(ThrottlerConfig::default());
        let clamps = h.throttler.reload_config(ThrottlerConfig {
            base_spawn_interval_ms: 250,
            ..Default::default()
        });
        assert_eq!(clamps, 0);
        assert_eq!(h.throttler.get_current_spawn_interval(), 250);

        let clamps = h.throttler.reload_config(ThrottlerConfig {
            base_spawn_interval_ms: 1,
            ..Default::default()
        });
        assert_eq!(clamps, 1);
        assert_eq!(h.throttler.get_current_spawn_interval(), 50);
    }

    #[test]
    fn test_metrics_snapshot() {
        let mut h = harness(ThrottlerConfig::default());
        assert!(h.throttler.can_spawn_now());
        h.throttler.record_spawn_success();
        assert!(!h.throttler.can_spawn_now());

        let metrics = h.throttler.get_metrics();
        assert_eq!(metrics.total_spawns, 1);
        assert_eq!(metrics.throttled_spawns, 1);
        assert_eq!(metrics.spawns_this_tick, 1);
        assert_eq!(metrics.burst_window_count, 1);
        assert_eq!(metrics.pressure, ResourcePressure::Normal);
        assert_eq!(metrics.circuit_state, CircuitState::Closed);

        let json = serde_json::to_string(&metrics).unwrap();
        assert!(json.contains("\"circuit_state\":\"closed\""));
    }

    #[test]
    fn test_burst_tracker_timestamps_monotone() {
        let mut tracker = BurstTracker::new(1_000, 2);
        tracker.record(500);
        tracker.record(400);
        tracker.prune(1_450);
        assert_eq!(tracker.len(), 2);
        tracker.prune(1_500);
        assert!(tracker.is_empty());
    }
}
