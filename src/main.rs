use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use spawn_admission::admission::{
    HostCounters, HostResourceProbe, InboxError, SpawnPriority, SpawnRequest, SpawnRequestSender,
    SpawnTarget,
};
use spawn_admission::config::AdmissionConfig;
use spawn_admission::metrics::{self, AdmissionMetrics};
use spawn_admission::util::clock::SystemClock;
use spawn_admission::SpawnPipeline;

/// Synthetic load settings
#[derive(Debug, Clone)]
struct SimConfig {
    tick_ms: u64,
    initial_requests: u32,
    requests_per_second: u32,
    failure_rate: f64,
    db_pool_size: u32,
    metrics_port: u16,
    status_interval: Duration,
}

impl SimConfig {
    fn from_env() -> Self {
        fn var<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        Self {
            tick_ms: var("SIM_TICK_MS", 50u64).max(1),
            initial_requests: var("SIM_INITIAL_REQUESTS", 5000),
            requests_per_second: var("SIM_REQUESTS_PER_SECOND", 20),
            failure_rate: var("SIM_FAILURE_RATE", 0.02f64).clamp(0.0, 1.0),
            db_pool_size: var("SIM_DB_POOL_SIZE", 100),
            metrics_port: var("METRICS_PORT", 9090),
            status_interval: Duration::from_secs(var("SIM_STATUS_SECS", 5u64).max(1)),
        }
    }
}

fn random_request(rng: &mut impl Rng) -> SpawnRequest {
    let min_level = rng.gen_range(1..=60u8);
    let target = if rng.gen_bool(0.5) {
        SpawnTarget::new(rng.gen_range(1..=40), rng.gen_range(0..=2), min_level, min_level + 5)
    } else {
        SpawnTarget::anywhere(min_level, min_level + 5)
    };
    SpawnRequest::new(target)
}

/// Steady stream of requests from outside the tick loop
async fn produce(sender: SpawnRequestSender, per_second: u32) {
    if per_second == 0 {
        return;
    }
    let mut rng = StdRng::from_entropy();
    let mut interval = tokio::time::interval(Duration::from_millis(1000 / per_second.max(1) as u64));
    loop {
        interval.tick().await;
        let priority = match rng.gen_range(0..100) {
            0..=1 => SpawnPriority::Critical,
            2..=14 => SpawnPriority::High,
            15..=79 => SpawnPriority::Normal,
            _ => SpawnPriority::Low,
        };
        match sender.try_send(random_request(&mut rng), priority) {
            Ok(()) => {}
            Err(InboxError::Full(_)) => debug!("Spawn inbox full, dropping synthetic request"),
            Err(e @ InboxError::Closed(_)) => {
                warn!("Producer stopped: {}", e);
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Spawn admission simulator v{}", env!("CARGO_PKG_VERSION"));

    let config = AdmissionConfig::load_or_default();
    let sim = SimConfig::from_env();
    info!(
        "Configuration loaded: base={}ms min={}ms max={}ms, startup ramp={}",
        config.throttler.base_spawn_interval_ms,
        config.throttler.min_spawn_interval_ms,
        config.throttler.max_spawn_interval_ms,
        config.startup.enabled
    );
    info!(?sim, "Simulation settings");

    let metrics = Arc::new(AdmissionMetrics::new());
    let metrics_clone = metrics.clone();
    let metrics_port = sim.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let counters = Arc::new(HostCounters::new(sim.db_pool_size));
    let probe = HostResourceProbe::new(counters.clone());
    let mut pipeline = SpawnPipeline::initialize(config, Box::new(probe), Arc::new(SystemClock::new()));

    let mut rng = StdRng::from_entropy();
    let mut rejected = 0u32;
    for _ in 0..sim.initial_requests {
        if let Err(e) = pipeline.submit(random_request(&mut rng), SpawnPriority::Normal) {
            rejected += 1;
            if rejected == 1 {
                warn!("Initial request rejected: {}", e);
            }
        }
    }
    info!(
        submitted = sim.initial_requests,
        rejected, "Initial spawn requests submitted"
    );

    let producer = tokio::spawn(produce(pipeline.sender(), sim.requests_per_second));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };
    tokio::pin!(shutdown);

    let mut ticker = tokio::time::interval(Duration::from_millis(sim.tick_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_tick = Instant::now();
    let mut last_status = Instant::now();
    let mut spawned_regions = 0u32;
    let mut inbox_dropped = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let started = Instant::now();
                let diff_ms = started.duration_since(last_tick).as_millis() as u64;
                last_tick = started;

                let drain = pipeline.update(diff_ms);
                if !drain.is_clean() {
                    inbox_dropped += drain.rejected_count() as u64;
                    debug!(rejected = drain.rejected_count(), "Synthetic inbox requests dropped");
                }
                while let Some(request) = pipeline.next_admitted() {
                    if rng.gen_bool(sim.failure_rate) {
                        pipeline.record_failure("simulated character creation error");
                    } else {
                        pipeline.record_success();
                        if request.target().zone_id.is_some() {
                            spawned_regions = spawned_regions.saturating_add(1);
                        }
                    }
                }

                counters.set_active_regions(spawned_regions / 10);
                counters.set_db_connections(rng.gen_range(0..=sim.db_pool_size / 2));

                pipeline.publish(&metrics);
                metrics.record_tick_time(started.elapsed());

                if last_status.elapsed() >= sim.status_interval {
                    last_status = Instant::now();
                    let m = pipeline.throttler().get_metrics();
                    info!(
                        interval_ms = m.current_interval_ms,
                        pressure = %m.pressure,
                        circuit = %m.circuit_state,
                        queued = pipeline.queue().size(),
                        backlog = pipeline.orchestrator().backlog_len(),
                        spawned = m.total_spawns,
                        failed = m.total_failures,
                        inbox_dropped,
                        "Admission status"
                    );
                }
            }
            _ = &mut shutdown => {
                info!("Shutting down...");
                break;
            }
        }
    }

    producer.abort();
    let dropped = pipeline.shutdown();
    pipeline.publish(&metrics);
    info!(dropped, "Simulator stopped");

    Ok(())
}
