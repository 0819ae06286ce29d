//! Cold-start spawn ramp
//!
//! Holds spawn requests back right after process start and releases them into
//! the priority queue in time-boxed phases. Within a phase the allowed
//! cumulative count rises linearly towards the phase target, and a single
//! update never releases more than `max_releases_per_update`. Once the last
//! phase has elapsed the orchestrator becomes a pass-through.
//!
//! Ramp progress is not persisted: a restarted process starts again at phase 1.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::admission::priority_queue::{QueueFull, SpawnPriority, SpawnPriorityQueue, SpawnRequest};
use crate::config::{StartupConfig, StartupPhase};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Startup backlog full ({capacity} requests held back)")]
    BacklogFull {
        request: SpawnRequest,
        capacity: usize,
    },
    #[error(transparent)]
    QueueFull(#[from] QueueFull),
}

impl SubmitError {
    /// Recover the rejected request
    pub fn into_request(self) -> SpawnRequest {
        match self {
            SubmitError::BacklogFull { request, .. } => request,
            SubmitError::QueueFull(e) => e.request,
        }
    }
}

/// Serializable ramp progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartupStatus {
    /// 1-based phase number, `None` once the ramp is over
    pub phase: Option<usize>,
    pub elapsed_ms: u64,
    /// Cumulative target of the active phase
    pub cumulative_target: u32,
    /// Cumulative releases allowed at this instant
    pub allowed_now: u32,
    pub released: u32,
    pub backlog: usize,
    pub complete: bool,
}

pub struct StartupSpawnOrchestrator {
    config: StartupConfig,
    elapsed_ms: u64,
    phase_index: usize,
    released: u32,
    backlog: VecDeque<SpawnRequest>,
    complete: bool,
    queue_full_stalls: u64,
}

impl StartupSpawnOrchestrator {
    pub fn new(mut config: StartupConfig) -> Self {
        config.sanitize();
        let complete = !config.enabled;
        if complete {
            info!("Startup ramp disabled, requests pass straight through");
        } else {
            info!(
                phases = config.phases.len(),
                ramp_secs = config.ramp_end_ms() / 1000,
                "Startup ramp armed"
            );
        }
        Self {
            config,
            elapsed_ms: 0,
            phase_index: 0,
            released: 0,
            backlog: VecDeque::new(),
            complete,
            queue_full_stalls: 0,
        }
    }

    /// Hand a request to the ramp. Held back while the ramp runs, forwarded
    /// at `priority` once it is over.
    pub fn submit(
        &mut self,
        request: SpawnRequest,
        priority: SpawnPriority,
        queue: &mut SpawnPriorityQueue,
    ) -> Result<(), SubmitError> {
        if self.complete {
            queue.enqueue(request, priority)?;
            return Ok(());
        }

        if self.backlog.len() >= self.config.max_backlog {
            return Err(SubmitError::BacklogFull {
                request,
                capacity: self.config.max_backlog,
            });
        }
        self.backlog.push_back(request);
        Ok(())
    }

    /// Advance by one tick and release what the active phase allows.
    /// Returns the number of requests moved into the queue.
    pub fn update(&mut self, diff_ms: u64, queue: &mut SpawnPriorityQueue) -> usize {
        self.elapsed_ms = self.elapsed_ms.saturating_add(diff_ms);
        self.advance_phase();

        if self.backlog.is_empty() {
            return 0;
        }

        let (allowed, priority) = match self.config.phases.get(self.phase_index) {
            Some(phase) if !self.complete => (self.allowed_cumulative(), phase.priority),
            _ => {
                // Ramp over: drain leftovers at the last phase's tier
                let priority = self
                    .config
                    .phases
                    .last()
                    .map(|p| p.priority)
                    .unwrap_or(SpawnPriority::Low);
                (u32::MAX, priority)
            }
        };

        let budget = allowed
            .saturating_sub(self.released)
            .min(self.config.max_releases_per_update) as usize;

        let mut moved = 0;
        while moved < budget {
            let Some(request) = self.backlog.pop_front() else {
                break;
            };
            match queue.enqueue(request, priority) {
                Ok(()) => {
                    moved += 1;
                    self.released += 1;
                }
                Err(QueueFull { request, .. }) => {
                    self.backlog.push_front(request);
                    self.queue_full_stalls += 1;
                    warn!(
                        backlog = self.backlog.len(),
                        released = self.released,
                        "Spawn queue full, pausing startup release"
                    );
                    break;
                }
            }
        }

        if moved > 0 {
            debug!(
                moved,
                released = self.released,
                allowed,
                priority = %priority,
                "Startup ramp released requests"
            );
        }
        moved
    }

    fn advance_phase(&mut self) {
        while let Some(phase) = self.config.phases.get(self.phase_index) {
            if self.complete || self.elapsed_ms < phase.end_ms {
                break;
            }
            info!(
                phase = self.phase_index + 1,
                released = self.released,
                target = phase.cumulative_target,
                "Startup phase finished"
            );
            self.phase_index += 1;
            if let Some(next) = self.config.phases.get(self.phase_index) {
                info!(
                    phase = self.phase_index + 1,
                    target = next.cumulative_target,
                    priority = %next.priority,
                    "Startup phase started"
                );
            }
        }

        if !self.complete && self.phase_index >= self.config.phases.len() {
            self.complete = true;
            info!(
                released = self.released,
                backlog = self.backlog.len(),
                "Startup ramp complete, switching to pass-through"
            );
        }
    }

    /// Cumulative releases allowed now: linear from the previous phase's
    /// target to the active phase's target across the phase window.
    fn allowed_cumulative(&self) -> u32 {
        let Some(phase) = self.config.phases.get(self.phase_index) else {
            return u32::MAX;
        };
        let floor = self.phase_index
            .checked_sub(1)
            .and_then(|i| self.config.phases.get(i))
            .map(|p| p.cumulative_target)
            .unwrap_or(0);

        let into_phase = self.elapsed_ms.saturating_sub(phase.start_ms);
        let progress = (into_phase as f64 / phase.duration_ms().max(1) as f64).min(1.0);
        let span = phase.cumulative_target.saturating_sub(floor) as f64;
        floor + (span * progress).ceil() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn current_phase(&self) -> Option<&StartupPhase> {
        if self.complete {
            return None;
        }
        self.config.phases.get(self.phase_index)
    }

    /// Cumulative target of the active phase (the final target once complete)
    pub fn current_target(&self) -> u32 {
        match self.current_phase() {
            Some(phase) => phase.cumulative_target,
            None => self
                .config
                .phases
                .last()
                .map(|p| p.cumulative_target)
                .unwrap_or(0),
        }
    }

    pub fn released_count(&self) -> u32 {
        self.released
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn queue_full_stalls(&self) -> u64 {
        self.queue_full_stalls
    }

    pub fn status(&self) -> StartupStatus {
        StartupStatus {
            phase: self.current_phase().map(|_| self.phase_index + 1),
            elapsed_ms: self.elapsed_ms,
            cumulative_target: self.current_target(),
            allowed_now: if self.complete {
                self.released
            } else {
                self.allowed_cumulative()
            },
            released: self.released,
            backlog: self.backlog.len(),
            complete: self.complete,
        }
    }

    /// Drop held-back requests. Returns how many were dropped.
    pub fn clear_backlog(&mut self) -> usize {
        let dropped = self.backlog.len();
        self.backlog.clear();
        dropped
    }
}
