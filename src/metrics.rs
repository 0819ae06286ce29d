//! Prometheus-compatible metrics endpoint
//!
//! Exposes spawn admission state in Prometheus format for Grafana dashboards.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::admission::circuit_breaker::{CircuitState, SpawnCircuitBreaker};
use crate::admission::priority_queue::SpawnPriorityQueue;
#[cfg(feature = "metrics_extended")]
use crate::admission::priority_queue::SpawnPriority;
use crate::admission::resource::{ResourceMonitor, ResourcePressure};
use crate::admission::startup::StartupStatus;
use crate::admission::throttler::ThrottlerMetrics;

const TICK_HISTORY: usize = 1000;

/// Metrics registry for the spawn pipeline
#[derive(Debug)]
pub struct AdmissionMetrics {
    // Throttler gauges
    pub spawn_interval_ms: AtomicU64,
    pub spawn_rate_milli: AtomicU64, // spawns/s * 1000
    pub effective_multiplier_milli: AtomicU64,
    pub time_until_next_spawn_ms: AtomicU64,
    pub in_burst_prevention: AtomicU64, // 0 or 1
    pub burst_window_count: AtomicU64,

    // Inputs (0=normal..3=critical, 0=closed 1=half_open 2=open)
    pub pressure: AtomicU64,
    pub circuit_state: AtomicU64,

    // Throttler counters
    pub spawns_total: AtomicU64,
    pub failures_total: AtomicU64,
    pub throttled_total: AtomicU64,
    pub blocked_total: AtomicU64,
    pub burst_engagements: AtomicU64,

    // Breaker and monitor
    pub breaker_times_opened: AtomicU64,
    pub breaker_failure_ratio_milli: AtomicU64,
    pub monitor_samples: AtomicU64,
    pub monitor_sample_failures: AtomicU64,
    pub cpu_percent: AtomicU64,
    pub memory_percent: AtomicU64,

    // Queue
    pub queue_depth: AtomicU64,
    pub queue_rejected_total: AtomicU64,
    pub queue_enqueued_total: AtomicU64,
    pub queue_dequeued_total: AtomicU64,
    pub queue_avg_wait_ms: AtomicU64,
    #[cfg(feature = "metrics_extended")]
    pub queue_depth_by_priority: [AtomicU64; 4],
    #[cfg(feature = "metrics_extended")]
    pub queue_rejected_by_priority: [AtomicU64; 4],

    // Startup ramp (phase is 1-based, 0 once the ramp is over)
    pub startup_phase: AtomicU64,
    pub startup_target: AtomicU64,
    pub startup_released: AtomicU64,
    pub startup_backlog: AtomicU64,
    pub startup_complete: AtomicU64,

    // Pipeline
    pub in_flight: AtomicU64,
    pub admitted_total: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    start_time: Instant,
    last_failure_reason: RwLock<Option<String>>,
    tick_history: RwLock<VecDeque<u64>>,
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        Self {
            spawn_interval_ms: AtomicU64::new(0),
            spawn_rate_milli: AtomicU64::new(0),
            effective_multiplier_milli: AtomicU64::new(1000),
            time_until_next_spawn_ms: AtomicU64::new(0),
            in_burst_prevention: AtomicU64::new(0),
            burst_window_count: AtomicU64::new(0),
            pressure: AtomicU64::new(0),
            circuit_state: AtomicU64::new(0),
            spawns_total: AtomicU64::new(0),
            failures_total: AtomicU64::new(0),
            throttled_total: AtomicU64::new(0),
            blocked_total: AtomicU64::new(0),
            burst_engagements: AtomicU64::new(0),
            breaker_times_opened: AtomicU64::new(0),
            breaker_failure_ratio_milli: AtomicU64::new(0),
            monitor_samples: AtomicU64::new(0),
            monitor_sample_failures: AtomicU64::new(0),
            cpu_percent: AtomicU64::new(0),
            memory_percent: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            queue_rejected_total: AtomicU64::new(0),
            queue_enqueued_total: AtomicU64::new(0),
            queue_dequeued_total: AtomicU64::new(0),
            queue_avg_wait_ms: AtomicU64::new(0),
            #[cfg(feature = "metrics_extended")]
            queue_depth_by_priority: Default::default(),
            #[cfg(feature = "metrics_extended")]
            queue_rejected_by_priority: Default::default(),
            startup_phase: AtomicU64::new(0),
            startup_target: AtomicU64::new(0),
            startup_released: AtomicU64::new(0),
            startup_backlog: AtomicU64::new(0),
            startup_complete: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            admitted_total: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            start_time: Instant::now(),
            last_failure_reason: RwLock::new(None),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    pub fn record_throttler(&self, m: &ThrottlerMetrics) {
        self.spawn_interval_ms.store(m.current_interval_ms, Ordering::Relaxed);
        self.spawn_rate_milli
            .store((m.current_spawn_rate * 1000.0).round() as u64, Ordering::Relaxed);
        self.effective_multiplier_milli
            .store((m.effective_multiplier * 1000.0).round() as u64, Ordering::Relaxed);
        self.time_until_next_spawn_ms
            .store(m.time_until_next_spawn_ms, Ordering::Relaxed);
        self.in_burst_prevention
            .store(m.in_burst_prevention as u64, Ordering::Relaxed);
        self.burst_window_count
            .store(m.burst_window_count as u64, Ordering::Relaxed);
        self.pressure.store(m.pressure.as_u64(), Ordering::Relaxed);
        self.circuit_state.store(m.circuit_state.as_u64(), Ordering::Relaxed);
        self.spawns_total.store(m.total_spawns, Ordering::Relaxed);
        self.failures_total.store(m.total_failures, Ordering::Relaxed);
        self.throttled_total.store(m.throttled_spawns, Ordering::Relaxed);
        self.blocked_total.store(m.blocked_spawns, Ordering::Relaxed);
        self.burst_engagements.store(m.burst_engagements, Ordering::Relaxed);
    }

    pub fn record_queue(&self, queue: &SpawnPriorityQueue) {
        self.queue_depth.store(queue.size() as u64, Ordering::Relaxed);
        self.queue_rejected_total
            .store(queue.total_rejected(), Ordering::Relaxed);
        self.queue_enqueued_total
            .store(queue.enqueued_total(), Ordering::Relaxed);
        self.queue_dequeued_total
            .store(queue.dequeued_total(), Ordering::Relaxed);
        self.queue_avg_wait_ms
            .store(queue.average_wait().as_millis() as u64, Ordering::Relaxed);

        #[cfg(feature = "metrics_extended")]
        for priority in SpawnPriority::ALL {
            self.queue_depth_by_priority[priority.index()]
                .store(queue.size_by_priority(priority) as u64, Ordering::Relaxed);
            self.queue_rejected_by_priority[priority.index()]
                .store(queue.rejected_by_priority(priority), Ordering::Relaxed);
        }
    }

    pub fn record_startup(&self, status: &StartupStatus) {
        self.startup_phase
            .store(status.phase.unwrap_or(0) as u64, Ordering::Relaxed);
        self.startup_target
            .store(status.cumulative_target as u64, Ordering::Relaxed);
        self.startup_released.store(status.released as u64, Ordering::Relaxed);
        self.startup_backlog.store(status.backlog as u64, Ordering::Relaxed);
        self.startup_complete
            .store(status.complete as u64, Ordering::Relaxed);
    }

    pub fn record_breaker(&self, breaker: &SpawnCircuitBreaker) {
        self.breaker_times_opened
            .store(breaker.times_opened(), Ordering::Relaxed);
        self.breaker_failure_ratio_milli
            .store((breaker.failure_ratio() * 1000.0).round() as u64, Ordering::Relaxed);
    }

    pub fn record_monitor(&self, monitor: &ResourceMonitor) {
        self.monitor_samples.store(monitor.sample_count(), Ordering::Relaxed);
        self.monitor_sample_failures
            .store(monitor.total_failures(), Ordering::Relaxed);
        if let Some(snapshot) = monitor.last_snapshot() {
            self.cpu_percent
                .store(snapshot.cpu_percent.round() as u64, Ordering::Relaxed);
            self.memory_percent
                .store(snapshot.memory_percent.round() as u64, Ordering::Relaxed);
        }
    }

    pub fn record_pipeline(&self, in_flight: u32, admitted_total: u64) {
        self.in_flight.store(in_flight as u64, Ordering::Relaxed);
        self.admitted_total.store(admitted_total, Ordering::Relaxed);
    }

    pub fn set_last_failure_reason(&self, reason: &str) {
        let mut slot = self.last_failure_reason.write();
        if slot.as_deref() != Some(reason) {
            *slot = Some(reason.to_string());
        }
    }

    pub fn last_failure_reason(&self) -> Option<String> {
        self.last_failure_reason.read().clone()
    }

    /// Record how long one admission tick took
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();
            let p95 = ((sorted.len() as f32 * 0.95) as usize).min(sorted.len() - 1);
            self.tick_time_p95_us.store(sorted[p95], Ordering::Relaxed);
            self.tick_time_max_us
                .store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn pressure_name(&self) -> &'static str {
        ResourcePressure::ALL
            .get(self.pressure.load(Ordering::Relaxed) as usize)
            .map(|p| p.name())
            .unwrap_or("unknown")
    }

    fn circuit_name(&self) -> &'static str {
        match self.circuit_state.load(Ordering::Relaxed) {
            0 => CircuitState::Closed.name(),
            1 => CircuitState::HalfOpen.name(),
            2 => CircuitState::Open.name(),
            _ => "unknown",
        }
    }

    /// Prometheus text exposition format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP spawn_admission_{0} {1}\n# TYPE spawn_admission_{0} {2}\nspawn_admission_{0} {3}\n",
                    $name, $help, $type, $value
                ));
            };
        }

        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);

        metric!("spawn_interval_ms", "Current minimum gap between spawns", "gauge",
            load(&self.spawn_interval_ms));
        metric!("spawn_rate_milli", "Current spawn rate in spawns/s (x1000)", "gauge",
            load(&self.spawn_rate_milli));
        metric!("effective_multiplier_milli", "Combined rate multiplier (x1000)", "gauge",
            load(&self.effective_multiplier_milli));
        metric!("time_until_next_spawn_ms", "Time until the interval gate opens", "gauge",
            load(&self.time_until_next_spawn_ms));
        metric!("in_burst_prevention", "Burst prevention engaged (0/1)", "gauge",
            load(&self.in_burst_prevention));
        metric!("burst_window_count", "Spawns inside the burst window", "gauge",
            load(&self.burst_window_count));
        metric!("resource_pressure", "Resource pressure (0=normal, 3=critical)", "gauge",
            load(&self.pressure));
        metric!("circuit_state", "Circuit state (0=closed, 1=half_open, 2=open)", "gauge",
            load(&self.circuit_state));

        output.push_str(&format!(
            "# HELP spawn_admission_state Human-readable admission inputs\n# TYPE spawn_admission_state gauge\nspawn_admission_state{{pressure=\"{}\",circuit=\"{}\"}} 1\n",
            self.pressure_name(),
            self.circuit_name()
        ));

        metric!("spawns_total", "Successful spawns", "counter", load(&self.spawns_total));
        metric!("failures_total", "Failed spawns", "counter", load(&self.failures_total));
        metric!("throttled_total", "Spawns denied by rate policy", "counter",
            load(&self.throttled_total));
        metric!("blocked_total", "Spawns denied by the circuit breaker", "counter",
            load(&self.blocked_total));
        metric!("burst_engagements_total", "Times burst prevention engaged", "counter",
            load(&self.burst_engagements));
        metric!("breaker_opened_total", "Times the circuit breaker opened", "counter",
            load(&self.breaker_times_opened));
        metric!("breaker_failure_ratio_milli", "Failure ratio in the breaker window (x1000)", "gauge",
            load(&self.breaker_failure_ratio_milli));
        metric!("monitor_samples_total", "Resource samples taken", "counter",
            load(&self.monitor_samples));
        metric!("monitor_sample_failures_total", "Resource samples that failed", "counter",
            load(&self.monitor_sample_failures));
        metric!("cpu_percent", "Last sampled CPU usage", "gauge", load(&self.cpu_percent));
        metric!("memory_percent", "Last sampled memory usage", "gauge",
            load(&self.memory_percent));

        metric!("queue_depth", "Requests waiting in the priority queue", "gauge",
            load(&self.queue_depth));
        metric!("queue_rejected_total", "Requests rejected by a full queue", "counter",
            load(&self.queue_rejected_total));
        metric!("queue_enqueued_total", "Requests enqueued", "counter",
            load(&self.queue_enqueued_total));
        metric!("queue_dequeued_total", "Requests dequeued", "counter",
            load(&self.queue_dequeued_total));
        metric!("queue_avg_wait_ms", "Mean queue wait of dequeued requests", "gauge",
            load(&self.queue_avg_wait_ms));

        #[cfg(feature = "metrics_extended")]
        for priority in SpawnPriority::ALL {
            let i = priority.index();
            output.push_str(&format!(
                "spawn_admission_queue_depth_by_priority{{priority=\"{}\"}} {}\n",
                priority.name(),
                load(&self.queue_depth_by_priority[i])
            ));
            output.push_str(&format!(
                "spawn_admission_queue_rejected_by_priority{{priority=\"{}\"}} {}\n",
                priority.name(),
                load(&self.queue_rejected_by_priority[i])
            ));
        }

        metric!("startup_phase", "Active startup phase (1-based, 0 when done)", "gauge",
            load(&self.startup_phase));
        metric!("startup_target", "Cumulative target of the active phase", "gauge",
            load(&self.startup_target));
        metric!("startup_released", "Requests released by the startup ramp", "gauge",
            load(&self.startup_released));
        metric!("startup_backlog", "Requests held by the startup ramp", "gauge",
            load(&self.startup_backlog));
        metric!("startup_complete", "Startup ramp finished (0/1)", "gauge",
            load(&self.startup_complete));

        metric!("in_flight", "Admitted spawns awaiting an outcome", "gauge",
            load(&self.in_flight));
        metric!("admitted_total", "Requests admitted by the pipeline", "counter",
            load(&self.admitted_total));

        metric!("tick_time_microseconds", "Last admission tick time", "gauge",
            load(&self.tick_time_us));
        metric!("tick_time_p95_microseconds", "95th percentile admission tick time", "gauge",
            load(&self.tick_time_p95_us));
        metric!("tick_time_max_microseconds", "Maximum admission tick time", "gauge",
            load(&self.tick_time_max_us));
        metric!("tick_count", "Admission ticks processed", "counter", load(&self.tick_count));
        metric!("uptime_seconds", "Uptime in seconds", "counter", self.uptime_seconds());

        output
    }

    /// JSON rendering for direct API access
    pub fn to_json(&self) -> String {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);

        #[allow(unused_mut)]
        let mut queue = serde_json::json!({
            "depth": load(&self.queue_depth),
            "rejected": load(&self.queue_rejected_total),
            "enqueued": load(&self.queue_enqueued_total),
            "dequeued": load(&self.queue_dequeued_total),
            "avg_wait_ms": load(&self.queue_avg_wait_ms),
        });

        #[cfg(feature = "metrics_extended")]
        {
            let by_priority: serde_json::Map<String, serde_json::Value> = SpawnPriority::ALL
                .iter()
                .map(|p| {
                    (
                        p.name().to_string(),
                        serde_json::json!({
                            "depth": load(&self.queue_depth_by_priority[p.index()]),
                            "rejected": load(&self.queue_rejected_by_priority[p.index()]),
                        }),
                    )
                })
                .collect();
            queue["by_priority"] = serde_json::Value::Object(by_priority);
        }

        let body = serde_json::json!({
            "throttler": {
                "interval_ms": load(&self.spawn_interval_ms),
                "spawn_rate": load(&self.spawn_rate_milli) as f64 / 1000.0,
                "effective_multiplier": load(&self.effective_multiplier_milli) as f64 / 1000.0,
                "time_until_next_spawn_ms": load(&self.time_until_next_spawn_ms),
                "in_burst_prevention": load(&self.in_burst_prevention) == 1,
                "burst_window_count": load(&self.burst_window_count),
                "burst_engagements": load(&self.burst_engagements),
                "spawns": load(&self.spawns_total),
                "failures": load(&self.failures_total),
                "throttled": load(&self.throttled_total),
                "blocked": load(&self.blocked_total),
                "last_failure_reason": self.last_failure_reason(),
            },
            "resources": {
                "pressure": self.pressure_name(),
                "cpu_percent": load(&self.cpu_percent),
                "memory_percent": load(&self.memory_percent),
                "samples": load(&self.monitor_samples),
                "sample_failures": load(&self.monitor_sample_failures),
            },
            "circuit": {
                "state": self.circuit_name(),
                "times_opened": load(&self.breaker_times_opened),
                "failure_ratio": load(&self.breaker_failure_ratio_milli) as f64 / 1000.0,
            },
            "queue": queue,
            "startup": {
                "phase": load(&self.startup_phase),
                "target": load(&self.startup_target),
                "released": load(&self.startup_released),
                "backlog": load(&self.startup_backlog),
                "complete": load(&self.startup_complete) == 1,
            },
            "pipeline": {
                "in_flight": load(&self.in_flight),
                "admitted": load(&self.admitted_total),
                "tick_time_us": load(&self.tick_time_us),
                "tick_time_p95_us": load(&self.tick_time_p95_us),
                "tick_count": load(&self.tick_count),
                "uptime_seconds": self.uptime_seconds(),
            },
        });

        serde_json::to_string_pretty(&body).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for AdmissionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

/// Route one raw HTTP request
fn respond(metrics: &AdmissionMetrics, request: &str) -> String {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("GET "))
        .and_then(|rest| rest.split_whitespace().next());

    match path {
        Some("/metrics/json") | Some("/json") => {
            http_response("200 OK", "application/json", &metrics.to_json())
        }
        Some("/metrics") => http_response(
            "200 OK",
            "text/plain; version=0.0.4",
            &metrics.to_prometheus(),
        ),
        Some("/health") | Some("/") => http_response("200 OK", "text/plain", "OK"),
        _ => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<AdmissionMetrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Metrics server listening on http://{}/metrics", addr);
    serve(listener, metrics).await
}

async fn serve(listener: TcpListener, metrics: Arc<AdmissionMetrics>) -> anyhow::Result<()> {
    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];
            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = respond(&metrics, &request);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}
