//! Four-tier spawn admission queue
//!
//! Strict tier precedence (every `Critical` before any `High`, and so on), FIFO
//! within a tier, bounded total depth. The queue itself is single-owner; other
//! threads submit through a [`SpawnRequestSender`] whose requests are moved
//! into the tiers by [`SpawnPriorityQueue::drain_inbox`] on the owning thread.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::util::clock::{Clock, SystemClock};

/// Request importance, highest first
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SpawnPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl SpawnPriority {
    /// All tiers in dequeue order
    pub const ALL: [SpawnPriority; 4] = [
        SpawnPriority::Critical,
        SpawnPriority::High,
        SpawnPriority::Normal,
        SpawnPriority::Low,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            SpawnPriority::Critical => "critical",
            SpawnPriority::High => "high",
            SpawnPriority::Normal => "normal",
            SpawnPriority::Low => "low",
        }
    }
}

impl fmt::Display for SpawnPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where and what to spawn. Resolved by the downstream pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnTarget {
    pub zone_id: Option<u32>,
    pub map_id: Option<u32>,
    pub min_level: u8,
    pub max_level: u8,
}

impl SpawnTarget {
    pub fn new(zone_id: u32, map_id: u32, min_level: u8, max_level: u8) -> Self {
        Self {
            zone_id: Some(zone_id),
            map_id: Some(map_id),
            min_level: min_level.min(max_level),
            max_level: max_level.max(min_level),
        }
    }

    /// No zone or map preference
    pub fn anywhere(min_level: u8, max_level: u8) -> Self {
        Self {
            zone_id: None,
            map_id: None,
            min_level: min_level.min(max_level),
            max_level: max_level.max(min_level),
        }
    }
}

/// A pending admission ask
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    id: Uuid,
    target: SpawnTarget,
    priority: SpawnPriority,
    enqueued_at_ms: Option<u64>,
}

impl SpawnRequest {
    pub fn new(target: SpawnTarget) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            priority: SpawnPriority::default(),
            enqueued_at_ms: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target(&self) -> &SpawnTarget {
        &self.target
    }

    /// Tier assigned when the request was enqueued
    pub fn priority(&self) -> SpawnPriority {
        self.priority
    }

    /// Queue clock reading at enqueue
    pub fn enqueued_at_ms(&self) -> Option<u64> {
        self.enqueued_at_ms
    }

    /// Time spent waiting in the queue as of `now_ms` (queue clock)
    pub fn queued_for(&self, now_ms: u64) -> Duration {
        self.enqueued_at_ms
            .map(|t| Duration::from_millis(now_ms.saturating_sub(t)))
            .unwrap_or(Duration::ZERO)
    }
}

/// Enqueue refused because the queue is at capacity. Carries the request back.
#[derive(Debug, thiserror::Error)]
#[error("Spawn queue full ({capacity} pending), {priority} request rejected")]
pub struct QueueFull {
    pub request: SpawnRequest,
    pub priority: SpawnPriority,
    pub capacity: usize,
}

/// Errors from cross-thread submission
#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("Spawn inbox full")]
    Full(SpawnRequest),
    #[error("Spawn queue no longer exists")]
    Closed(SpawnRequest),
}

/// Cloneable handle for submitting requests from other threads
#[derive(Debug, Clone)]
pub struct SpawnRequestSender {
    tx: Sender<(SpawnRequest, SpawnPriority)>,
    dropped: Arc<AtomicU64>,
}

impl SpawnRequestSender {
    /// Non-blocking submit. The request lands in the queue at the next drain.
    pub fn try_send(&self, request: SpawnRequest, priority: SpawnPriority) -> Result<(), InboxError> {
        self.tx.try_send((request, priority)).map_err(|e| match e {
            TrySendError::Full((request, _)) => InboxError::Full(request),
            TrySendError::Disconnected((request, _)) => InboxError::Closed(request),
        })
    }

    /// Requests waiting to be drained
    pub fn pending(&self) -> usize {
        self.tx.len()
    }

    /// Requests accepted by `try_send` but later dropped because the queue
    /// was full when the inbox was drained. Shared by every clone.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Outcome of one inbox drain. Rejected requests are handed back to the
/// consumer, which decides whether to drop, retry or escalate them.
#[derive(Debug, Default)]
pub struct InboxDrain {
    pub accepted: usize,
    pub rejected: Vec<QueueFull>,
}

impl InboxDrain {
    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }

    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

pub struct SpawnPriorityQueue {
    tiers: [VecDeque<SpawnRequest>; 4],
    capacity: usize,
    len: usize,
    inbox_tx: Sender<(SpawnRequest, SpawnPriority)>,
    inbox_rx: Receiver<(SpawnRequest, SpawnPriority)>,
    inbox_dropped: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
    rejected: [u64; 4],
    enqueued_total: u64,
    dequeued_total: u64,
    total_wait_ms: u64,
}

impl SpawnPriorityQueue {
    pub fn new(config: &QueueConfig) -> Self {
        let (inbox_tx, inbox_rx) = crossbeam_channel::bounded(config.inbox_capacity.max(1));
        Self {
            tiers: Default::default(),
            capacity: config.max_queue_size.max(1),
            len: 0,
            inbox_tx,
            inbox_rx,
            inbox_dropped: Arc::new(AtomicU64::new(0)),
            clock: Arc::new(SystemClock::new()),
            rejected: [0; 4],
            enqueued_total: 0,
            dequeued_total: 0,
            total_wait_ms: 0,
        }
    }

    /// Stamp enqueue times from `clock` instead of the system clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(&QueueConfig {
            max_queue_size: capacity,
            ..Default::default()
        })
    }

    /// Add a request at the given tier. Fails explicitly when full.
    pub fn enqueue(&mut self, mut request: SpawnRequest, priority: SpawnPriority) -> Result<(), QueueFull> {
        if self.len >= self.capacity {
            self.rejected[priority.index()] += 1;
            return Err(QueueFull {
                request,
                priority,
                capacity: self.capacity,
            });
        }

        request.priority = priority;
        request.enqueued_at_ms = Some(self.clock.now_ms());
        self.tiers[priority.index()].push_back(request);
        self.len += 1;
        self.enqueued_total += 1;
        Ok(())
    }

    /// Oldest request of the highest non-empty tier
    pub fn dequeue_next(&mut self) -> Option<SpawnRequest> {
        let request = self.tiers.iter_mut().find_map(|tier| tier.pop_front())?;
        self.len -= 1;
        self.dequeued_total += 1;
        let waited = request.queued_for(self.clock.now_ms());
        self.total_wait_ms = self.total_wait_ms.saturating_add(waited.as_millis() as u64);
        Some(request)
    }

    /// Tier of the request `dequeue_next` would return
    pub fn peek_priority(&self) -> Option<SpawnPriority> {
        SpawnPriority::ALL
            .into_iter()
            .find(|p| !self.tiers[p.index()].is_empty())
    }

    pub fn size(&self) -> usize {
        self.len
    }

    pub fn size_by_priority(&self, priority: SpawnPriority) -> usize {
        self.tiers[priority.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the depth limit. Already queued requests are kept even above it.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    /// Drop everything queued. Returns the number of dropped requests.
    pub fn clear(&mut self) -> usize {
        let dropped = self.len;
        for tier in &mut self.tiers {
            tier.clear();
        }
        self.len = 0;
        dropped
    }

    /// Handle for other threads
    pub fn sender(&self) -> SpawnRequestSender {
        SpawnRequestSender {
            tx: self.inbox_tx.clone(),
            dropped: self.inbox_dropped.clone(),
        }
    }

    /// Move requests submitted through [`SpawnRequestSender`] into the tiers
    pub fn drain_inbox(&mut self) -> InboxDrain {
        let mut drain = InboxDrain::default();
        while let Ok((request, priority)) = self.inbox_rx.try_recv() {
            match self.enqueue(request, priority) {
                Ok(()) => drain.accepted += 1,
                Err(e) => {
                    debug!(id = %e.request.id(), "Inbox request rejected: {}", e);
                    drain.rejected.push(e);
                }
            }
        }
        if !drain.is_clean() {
            self.inbox_dropped
                .fetch_add(drain.rejected_count() as u64, Ordering::Relaxed);
            warn!(
                accepted = drain.accepted,
                rejected = drain.rejected_count(),
                capacity = self.capacity,
                "Spawn queue full while draining inbox"
            );
        }
        drain
    }

    pub fn rejected_by_priority(&self, priority: SpawnPriority) -> u64 {
        self.rejected[priority.index()]
    }

    pub fn total_rejected(&self) -> u64 {
        self.rejected.iter().sum()
    }

    pub fn enqueued_total(&self) -> u64 {
        self.enqueued_total
    }

    pub fn dequeued_total(&self) -> u64 {
        self.dequeued_total
    }

    /// Mean time dequeued requests spent waiting
    pub fn average_wait(&self) -> Duration {
        if self.dequeued_total == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.total_wait_ms / self.dequeued_total)
    }
}

impl Default for SpawnPriorityQueue {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}
