//! Failure-triggered circuit breaker for the spawn pipeline
//!
//! Tracks the last `window_size` spawn outcomes. When the failure ratio over
//! that window exceeds the configured threshold the breaker opens and every
//! spawn is refused until a cooldown has passed; then a few probe spawns are let
//! through (half-open) to decide whether to close again or reopen.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::util::clock::Clock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    /// Numeric state for gauges (0=Closed, 1=HalfOpen, 2=Open)
    pub fn as_u64(&self) -> u64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Open => "open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub struct SpawnCircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: CircuitState,
    /// Recent outcomes, `true` = failure
    outcomes: VecDeque<bool>,
    window_failures: usize,
    opened_at_ms: u64,
    probes_admitted: u32,
    /// Half-open outcomes matched to an admitted spawn so far
    half_open_outcomes: u32,
    probe_successes: u32,
    times_opened: u64,
    total_successes: u64,
    total_failures: u64,
}

impl SpawnCircuitBreaker {
    pub fn new(mut config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        config.sanitize();
        let window = config.window_size;
        Self {
            config,
            clock,
            state: CircuitState::Closed,
            outcomes: VecDeque::with_capacity(window),
            window_failures: 0,
            opened_at_ms: 0,
            probes_admitted: 0,
            half_open_outcomes: 0,
            probe_successes: 0,
            times_opened: 0,
            total_successes: 0,
            total_failures: 0,
        }
    }

    /// Record the result of one spawn attempt. May change state.
    ///
    /// Time-driven transitions are left to [`refresh`](Self::refresh). In
    /// half-open only as many outcomes count as spawns were admitted there;
    /// anything beyond that belongs to a spawn admitted before the trip.
    pub fn record_outcome(&mut self, success: bool) {
        if success {
            self.total_successes += 1;
        } else {
            self.total_failures += 1;
        }

        match self.state {
            CircuitState::Closed => {
                self.push_outcome(!success);
                if self.outcomes.len() >= self.config.min_samples
                    && self.failure_ratio() > self.config.failure_threshold
                {
                    self.trip();
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_outcomes >= self.probes_admitted {
                    debug!(success, "Outcome without a half-open admission, not counted");
                    return;
                }
                self.half_open_outcomes += 1;
                if success {
                    self.probe_successes += 1;
                    debug!(
                        successes = self.probe_successes,
                        needed = self.config.half_open_success_threshold,
                        "Spawn probe succeeded"
                    );
                    if self.probe_successes >= self.config.half_open_success_threshold {
                        self.close();
                    }
                } else {
                    warn!("Spawn probe failed, reopening circuit");
                    self.trip();
                }
            }
            CircuitState::Open => {
                // Late report from a spawn admitted before the trip
            }
        }
    }

    fn push_outcome(&mut self, failed: bool) {
        self.outcomes.push_back(failed);
        if failed {
            self.window_failures += 1;
        }
        while self.outcomes.len() > self.config.window_size {
            if self.outcomes.pop_front() == Some(true) {
                self.window_failures -= 1;
            }
        }
    }

    fn trip(&mut self) {
        let ratio = self.failure_ratio();
        self.state = CircuitState::Open;
        self.opened_at_ms = self.clock.now_ms();
        self.probes_admitted = 0;
        self.half_open_outcomes = 0;
        self.probe_successes = 0;
        self.times_opened += 1;
        warn!(
            failure_ratio = ratio,
            threshold = self.config.failure_threshold,
            cooldown_ms = self.config.open_cooldown_ms,
            "Spawn circuit opened"
        );
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.outcomes.clear();
        self.window_failures = 0;
        self.probes_admitted = 0;
        self.half_open_outcomes = 0;
        self.probe_successes = 0;
        info!("Spawn circuit closed");
    }

    /// Apply time-driven transitions (OPEN -> HALF_OPEN after cooldown)
    pub fn refresh(&mut self) -> CircuitState {
        if self.state == CircuitState::Open
            && self.clock.now_ms().saturating_sub(self.opened_at_ms) >= self.config.open_cooldown_ms
        {
            self.state = CircuitState::HalfOpen;
            self.probes_admitted = 0;
            self.half_open_outcomes = 0;
            self.probe_successes = 0;
            info!(
                probes = self.config.half_open_max_probes,
                "Spawn circuit half-open, probing"
            );
        }
        self.state
    }

    /// Whether a spawn may be attempted. Half-open admits only the probe quota.
    pub fn allows_spawn(&mut self) -> bool {
        self.refresh();
        self.has_capacity()
    }

    /// Same as [`allows_spawn`](Self::allows_spawn) without applying the cooldown
    /// transition, so every check within one tick sees the tick-start state.
    pub fn has_capacity(&self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => self.probes_admitted < self.config.half_open_max_probes,
            CircuitState::Open => false,
        }
    }

    /// Count an admitted spawn against the half-open probe quota
    pub fn note_admitted(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probes_admitted += 1;
        }
    }

    pub fn get_state(&self) -> CircuitState {
        self.state
    }

    /// Failure share of the current window (0.0 when empty)
    pub fn failure_ratio(&self) -> f32 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.window_failures as f32 / self.outcomes.len() as f32
    }

    /// Time left before an open breaker starts probing
    pub fn cooldown_remaining_ms(&self) -> u64 {
        if self.state != CircuitState::Open {
            return 0;
        }
        let elapsed = self.clock.now_ms().saturating_sub(self.opened_at_ms);
        self.config.open_cooldown_ms.saturating_sub(elapsed)
    }

    pub fn times_opened(&self) -> u64 {
        self.times_opened
    }

    pub fn total_successes(&self) -> u64 {
        self.total_successes
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    pub fn probes_admitted(&self) -> u32 {
        self.probes_admitted
    }

    /// Successes counted toward closing since the breaker went half-open
    pub fn half_open_successes(&self) -> u32 {
        self.probe_successes
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Operator override: open now and start a fresh cooldown
    pub fn force_open(&mut self) {
        if self.state != CircuitState::Open {
            self.trip();
        } else {
            self.opened_at_ms = self.clock.now_ms();
        }
    }

    /// Operator override: close and forget the window
    pub fn reset(&mut self) {
        self.close();
    }

    pub fn set_config(&mut self, mut config: CircuitBreakerConfig) {
        config.sanitize();
        self.config = config;
        while self.outcomes.len() > self.config.window_size {
            if self.outcomes.pop_front() == Some(true) {
                self.window_failures -= 1;
            }
        }
    }
}
