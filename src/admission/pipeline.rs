//! Composition root for spawn admission
//!
//! Owns every admission component for one spawning pipeline and fixes the
//! per-tick order: throttler update first, then inbox drain and startup
//! release, then any number of `next_admitted` calls.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::admission::circuit_breaker::SpawnCircuitBreaker;
use crate::admission::priority_queue::{
    InboxDrain, SpawnPriority, SpawnPriorityQueue, SpawnRequest, SpawnRequestSender,
};
use crate::admission::resource::{ResourceMonitor, ResourceProbe};
use crate::admission::startup::{StartupSpawnOrchestrator, SubmitError};
use crate::admission::throttler::AdaptiveSpawnThrottler;
use crate::config::AdmissionConfig;
use crate::metrics::AdmissionMetrics;
use crate::util::clock::Clock;

pub struct SpawnPipeline {
    config: AdmissionConfig,
    throttler: AdaptiveSpawnThrottler,
    queue: SpawnPriorityQueue,
    orchestrator: StartupSpawnOrchestrator,
    clock: Arc<dyn Clock>,
    /// Admitted spawns whose outcome has not been reported yet
    in_flight: u32,
    admitted_total: u64,
    shut_down: bool,
}

impl SpawnPipeline {
    /// Build and wire every component from one configuration
    pub fn initialize(
        mut config: AdmissionConfig,
        probe: Box<dyn ResourceProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let clamps = config.sanitize();
        if clamps > 0 {
            warn!(clamps, "Admission config clamped during initialization");
        }

        let monitor = ResourceMonitor::new(config.resources.clone(), probe, clock.clone());
        let breaker = SpawnCircuitBreaker::new(config.circuit_breaker.clone(), clock.clone());
        let mut throttler = AdaptiveSpawnThrottler::new(config.throttler.clone(), clock.clone());
        throttler.initialize(monitor, breaker);

        let queue = SpawnPriorityQueue::new(&config.queue).with_clock(clock.clone());
        let orchestrator = StartupSpawnOrchestrator::new(config.startup.clone());

        info!(
            queue_capacity = queue.capacity(),
            startup_ramp = !orchestrator.is_complete(),
            "Spawn pipeline initialized"
        );

        Self {
            config,
            throttler,
            queue,
            orchestrator,
            clock,
            in_flight: 0,
            admitted_total: 0,
            shut_down: false,
        }
    }

    /// Submit a request (through the startup ramp while it is active)
    pub fn submit(&mut self, request: SpawnRequest, priority: SpawnPriority) -> Result<(), SubmitError> {
        self.orchestrator.submit(request, priority, &mut self.queue)
    }

    /// Handle for submitting from other threads. These requests go straight
    /// to the queue at the next update and do not wait for the startup ramp.
    pub fn sender(&self) -> SpawnRequestSender {
        self.queue.sender()
    }

    /// Once per tick, before any `next_admitted` call.
    ///
    /// Returns what the inbox drain moved. Inbox requests that no longer fit
    /// in the queue come back in `rejected` so the caller can retry or
    /// fail them.
    pub fn update(&mut self, diff_ms: u64) -> InboxDrain {
        if self.shut_down {
            return InboxDrain::default();
        }
        self.throttler.update(diff_ms);
        let drain = self.queue.drain_inbox();
        self.orchestrator.update(diff_ms, &mut self.queue);
        drain
    }

    /// Next request the spawn loop may resolve now, if any.
    /// The caller must report its outcome exactly once.
    pub fn next_admitted(&mut self) -> Option<SpawnRequest> {
        if self.shut_down || self.queue.is_empty() {
            return None;
        }
        if !self.throttler.can_spawn_now() {
            return None;
        }

        let request = self.queue.dequeue_next()?;
        self.in_flight += 1;
        self.admitted_total += 1;
        debug!(
            id = %request.id(),
            priority = %request.priority(),
            waited_ms = request.queued_for(self.clock.now_ms()).as_millis() as u64,
            "Spawn admitted"
        );
        Some(request)
    }

    pub fn record_success(&mut self) {
        self.settle();
        self.throttler.record_spawn_success();
    }

    pub fn record_failure(&mut self, reason: &str) {
        self.settle();
        self.throttler.record_spawn_failure(reason);
    }

    fn settle(&mut self) {
        if self.in_flight == 0 {
            debug!("Spawn outcome reported without a matching admission");
        }
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Apply a new configuration to every live component.
    /// Startup phases are fixed at initialization.
    pub fn reload_config(&mut self, mut config: AdmissionConfig) -> usize {
        let clamps = config.sanitize();
        self.throttler.reload_config(config.throttler.clone());
        if let Some(breaker) = self.throttler.circuit_breaker_mut() {
            breaker.set_config(config.circuit_breaker.clone());
        }
        if let Some(monitor) = self.throttler.resource_monitor_mut() {
            monitor.set_thresholds(config.resources.clone());
        }
        self.queue.set_capacity(config.queue.max_queue_size);
        self.config = config;
        self.throttler.recalculate_interval();
        clamps
    }

    /// Copy current state into the shared metrics registry
    pub fn publish(&self, metrics: &AdmissionMetrics) {
        metrics.record_throttler(&self.throttler.get_metrics());
        metrics.record_queue(&self.queue);
        metrics.record_startup(&self.orchestrator.status());
        metrics.record_pipeline(self.in_flight, self.admitted_total);
        if let Some(breaker) = self.throttler.circuit_breaker() {
            metrics.record_breaker(breaker);
        }
        if let Some(monitor) = self.throttler.resource_monitor() {
            metrics.record_monitor(monitor);
        }
        if let Some(reason) = self.throttler.last_failure_reason() {
            metrics.set_last_failure_reason(reason);
        }
    }

    /// Stop admitting and drop everything pending. Returns the dropped count.
    pub fn shutdown(&mut self) -> usize {
        if self.shut_down {
            return 0;
        }
        self.shut_down = true;
        let dropped = self.queue.clear() + self.orchestrator.clear_backlog();
        info!(
            dropped,
            in_flight = self.in_flight,
            admitted = self.admitted_total,
            "Spawn pipeline shut down"
        );
        dropped
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn throttler(&self) -> &AdaptiveSpawnThrottler {
        &self.throttler
    }

    pub fn throttler_mut(&mut self) -> &mut AdaptiveSpawnThrottler {
        &mut self.throttler
    }

    pub fn queue(&self) -> &SpawnPriorityQueue {
        &self.queue
    }

    pub fn orchestrator(&self) -> &StartupSpawnOrchestrator {
        &self.orchestrator
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    pub fn admitted_total(&self) -> u64 {
        self.admitted_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::circuit_breaker::CircuitState;
    use crate::admission::priority_queue::SpawnTarget;
    use crate::admission::resource::mocks::ManualProbe;
    use crate::util::clock::ManualClock;

    const TICK_MS: u64 = 50;

    fn pipeline(config: AdmissionConfig) -> (SpawnPipeline, ManualProbe, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let probe = ManualProbe::idle();
        let pipeline = SpawnPipeline::initialize(config, Box::new(probe.clone()), clock.clone());
        (pipeline, probe, clock)
    }

    fn no_ramp() -> AdmissionConfig {
        let mut config = AdmissionConfig::default();
        config.startup.enabled = false;
        config
    }

    fn request() -> SpawnRequest {
        SpawnRequest::new(SpawnTarget::anywhere(1, 60))
    }

    fn tick(pipeline: &mut SpawnPipeline, clock: &ManualClock) -> Vec<SpawnRequest> {
        clock.advance(TICK_MS);
        pipeline.update(TICK_MS);
        let mut admitted = Vec::new();
        while let Some(req) = pipeline.next_admitted() {
            pipeline.record_success();
            admitted.push(req);
        }
        admitted
    }

    #[test]
    fn test_priority_order_through_pipeline() {
        let (mut pipeline, _, clock) = pipeline(no_ramp());
        pipeline.submit(request(), SpawnPriority::Low).unwrap();
        pipeline.submit(request(), SpawnPriority::Critical).unwrap();

        let mut order = Vec::new();
        for _ in 0..10 {
            order.extend(tick(&mut pipeline, &clock).into_iter().map(|r| r.priority()));
        }
        assert_eq!(order, vec![SpawnPriority::Critical, SpawnPriority::Low]);
    }

    #[test]
    fn test_interval_limits_admission_per_tick() {
        let (mut pipeline, _, clock) = pipeline(no_ramp());
        for _ in 0..20 {
            pipeline.submit(request(), SpawnPriority::Normal).unwrap();
        }

        // 100ms interval with 50ms ticks: one spawn every other tick
        let mut per_tick = Vec::new();
        for _ in 0..10 {
            per_tick.push(tick(&mut pipeline, &clock).len());
        }
        assert!(per_tick.iter().all(|&n| n <= 1));
        assert_eq!(per_tick.iter().sum::<usize>(), 5);
    }

    #[test]
    fn test_failures_open_breaker_and_stop_admission() {
        let (mut pipeline, _, clock) = pipeline(no_ramp());
        for _ in 0..50 {
            pipeline.submit(request(), SpawnPriority::Normal).unwrap();
        }

        let mut failures = 0;
        while pipeline.throttler().circuit_state() != CircuitState::Open {
            clock.advance(TICK_MS * 2);
            pipeline.update(TICK_MS * 2);
            if pipeline.next_admitted().is_some() {
                pipeline.record_failure("character creation failed");
                failures += 1;
            }
            assert!(failures <= 10);
        }

        clock.advance(TICK_MS * 2);
        pipeline.update(TICK_MS * 2);
        assert!(pipeline.next_admitted().is_none());
        assert_eq!(pipeline.in_flight(), 0);
    }

    #[test]
    fn test_startup_ramp_gates_queue() {
        let (mut pipeline, _, clock) = pipeline(AdmissionConfig::default());
        for _ in 0..10 {
            pipeline.submit(request(), SpawnPriority::Low).unwrap();
        }
        assert!(pipeline.queue().is_empty());

        let mut admitted = Vec::new();
        for _ in 0..200 {
            admitted.extend(tick(&mut pipeline, &clock));
        }
        assert!(!admitted.is_empty());
        assert!(admitted.iter().all(|r| r.priority() == SpawnPriority::Critical));
    }

    #[test]
    fn test_inbox_requests_reach_queue() {
        let (mut pipeline, _, clock) = pipeline(AdmissionConfig::default());
        let sender = pipeline.sender();
        sender.try_send(request(), SpawnPriority::Critical).unwrap();

        let admitted = tick(&mut pipeline, &clock);
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].priority(), SpawnPriority::Critical);
    }

    #[test]
    fn test_inbox_overflow_returned_from_update() {
        let mut config = no_ramp();
        config.queue.max_queue_size = 2;
        let (mut pipeline, _, clock) = pipeline(config);
        let sender = pipeline.sender();

        let ids: Vec<_> = (0..5)
            .map(|_| {
                let req = request();
                let id = req.id();
                sender.try_send(req, SpawnPriority::Normal).unwrap();
                id
            })
            .collect();

        clock.advance(TICK_MS);
        let drain = pipeline.update(TICK_MS);
        assert_eq!(drain.accepted, 2);
        let returned: Vec<_> = drain.rejected.iter().map(|e| e.request.id()).collect();
        assert_eq!(returned, ids[2..].to_vec());
        assert_eq!(sender.dropped(), 3);
        assert_eq!(pipeline.queue().size(), 2);

        // Nothing left over for the next tick
        assert!(pipeline.update(TICK_MS).is_clean());
    }

    #[test]
    fn test_wait_measured_on_pipeline_clock() {
        let (mut pipeline, _, clock) = pipeline(no_ramp());
        pipeline.submit(request(), SpawnPriority::Normal).unwrap();

        clock.advance(700);
        pipeline.update(700);
        let req = pipeline.next_admitted().unwrap();
        pipeline.record_success();
        assert_eq!(req.queued_for(clock.now_ms()).as_millis(), 700);
        assert_eq!(pipeline.queue().average_wait().as_millis(), 700);
    }

    #[test]
    fn test_shutdown_drops_pending() {
        let (mut pipeline, _, clock) = pipeline(AdmissionConfig::default());
        for _ in 0..5 {
            pipeline.submit(request(), SpawnPriority::Normal).unwrap();
        }
        assert_eq!(pipeline.shutdown(), 5);
        assert!(pipeline.is_shut_down());
        assert!(tick(&mut pipeline, &clock).is_empty());
        assert_eq!(pipeline.shutdown(), 0);
    }

    #[test]
    fn test_reload_config() {
        let (mut pipeline, _, _) = pipeline(no_ramp());
        let mut config = no_ramp();
        config.throttler.base_spawn_interval_ms = 400;
        config.queue.max_queue_size = 3;
        assert_eq!(pipeline.reload_config(config), 0);
        assert_eq!(pipeline.throttler().get_current_spawn_interval(), 400);
        assert_eq!(pipeline.queue().capacity(), 3);
    }

    #[test]
    fn test_publish_metrics() {
        let (mut pipeline, _, clock) = pipeline(no_ramp());
        pipeline.submit(request(), SpawnPriority::High).unwrap();
        pipeline.submit(request(), SpawnPriority::High).unwrap();
        tick(&mut pipeline, &clock);

        let metrics = AdmissionMetrics::new();
        pipeline.publish(&metrics);
        let text = metrics.to_prometheus();
        assert!(text.contains("spawn_admission_spawns_total 1"));
        assert!(text.contains("spawn_admission_queue_depth 1"));
    }
}
