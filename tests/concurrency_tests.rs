// Cross-thread submission through the spawn inbox

use std::sync::Arc;
use std::thread;

use spawn_admission::admission::resource::mocks::ManualProbe;
use spawn_admission::admission::{
    InboxError, SpawnPriority, SpawnPriorityQueue, SpawnRequest, SpawnTarget,
};
use spawn_admission::config::{AdmissionConfig, QueueConfig};
use spawn_admission::util::clock::ManualClock;
use spawn_admission::SpawnPipeline;
use tokio::task::JoinSet;

const PRODUCERS: u32 = 4;
const PER_PRODUCER: u32 = 500;

/// Encodes the producer and its sequence number in the target
fn tagged(producer: u32, seq: u32) -> SpawnRequest {
    SpawnRequest::new(SpawnTarget::new(producer, seq, 1, 10))
}

fn priority_for(seq: u32) -> SpawnPriority {
    if seq % 5 == 0 {
        SpawnPriority::Critical
    } else {
        SpawnPriority::Low
    }
}

#[test]
fn test_threads_feed_single_consumer() {
    let mut queue = SpawnPriorityQueue::default();

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let sender = queue.sender();
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    sender.try_send(tagged(producer, seq), priority_for(seq)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let drain = queue.drain_inbox();
    assert_eq!(drain.accepted, (PRODUCERS * PER_PRODUCER) as usize);
    assert!(drain.is_clean());
    assert_eq!(
        queue.size_by_priority(SpawnPriority::Critical),
        (PRODUCERS * PER_PRODUCER / 5) as usize
    );

    // Tier precedence, and each producer's own order within a tier
    let mut last_seq: Vec<Option<u32>> = vec![None; PRODUCERS as usize];
    let mut seen_low = false;
    while let Some(req) = queue.dequeue_next() {
        match req.priority() {
            SpawnPriority::Critical => assert!(!seen_low, "critical after low"),
            SpawnPriority::Low => {
                if !seen_low {
                    seen_low = true;
                    last_seq.iter_mut().for_each(|s| *s = None);
                }
            }
            other => panic!("unexpected tier {}", other),
        }

        let producer = req.target().zone_id.unwrap() as usize;
        let seq = req.target().map_id.unwrap();
        if let Some(prev) = last_seq[producer] {
            assert!(seq > prev);
        }
        last_seq[producer] = Some(seq);
    }
}

#[test]
fn test_inbox_overflow_and_close() {
    let mut queue = SpawnPriorityQueue::new(&QueueConfig {
        max_queue_size: 2,
        inbox_capacity: 4,
    });
    let sender = queue.sender();

    for seq in 0..4 {
        sender.try_send(tagged(0, seq), SpawnPriority::Normal).unwrap();
    }
    assert_eq!(sender.pending(), 4);
    assert!(matches!(
        sender.try_send(tagged(0, 4), SpawnPriority::Normal),
        Err(InboxError::Full(_))
    ));

    // Queue capacity still applies to inbox requests
    let drain = queue.drain_inbox();
    assert_eq!((drain.accepted, drain.rejected_count()), (2, 2));
    assert_eq!(queue.total_rejected(), 2);
    assert_eq!(sender.pending(), 0);
    assert_eq!(sender.dropped(), 2);
    let returned: Vec<_> = drain.rejected.iter().map(|e| e.request.target().map_id).collect();
    assert_eq!(returned, vec![Some(2), Some(3)]);

    drop(queue);
    assert!(matches!(
        sender.try_send(tagged(0, 5), SpawnPriority::Normal),
        Err(InboxError::Closed(_))
    ));
}

#[tokio::test]
async fn test_async_producers_with_tick_loop() {
    let mut config = AdmissionConfig::default();
    config.startup.enabled = false;
    config.throttler.base_spawn_interval_ms = 50;
    config.throttler.min_spawn_interval_ms = 50;

    let clock = Arc::new(ManualClock::new(0));
    let mut pipeline = SpawnPipeline::initialize(config, Box::new(ManualProbe::idle()), clock.clone());

    let mut producers = JoinSet::new();
    for producer in 0..PRODUCERS {
        let sender = pipeline.sender();
        producers.spawn(async move {
            for seq in 0..10 {
                sender.try_send(tagged(producer, seq), SpawnPriority::High)?;
                tokio::task::yield_now().await;
            }
            Ok::<_, InboxError>(())
        });
    }
    while let Some(result) = producers.join_next().await {
        result.unwrap().unwrap();
    }

    let mut admitted = 0;
    for _ in 0..100 {
        clock.advance(50);
        pipeline.update(50);
        while pipeline.next_admitted().is_some() {
            pipeline.record_success();
            admitted += 1;
        }
    }

    assert_eq!(admitted, PRODUCERS * 10);
    assert!(pipeline.queue().is_empty());
    assert_eq!(pipeline.queue().dequeued_total(), (PRODUCERS * 10) as u64);
}
