//! Channel-aware bounded queues between pipeline stages.
//!
//! Six FIFOs keyed `(stage, channel)`. Each queue owns its mutex and condvar
//! pair (Update rank); cross-queue walks always visit stages in pipeline
//! order and left before right. The manager shares the system shutdown flag:
//! once it is raised, `get` drains what is queued and then reports
//! `Shutdown`, and `put` refuses new work immediately.
//!
//! A full queue applies the configured overflow policy. Drop-oldest hands the
//! evicted buffer back to the caller — the queue never talks to the pool
//! itself, so buffer ownership stays a straight line from allocator to
//! releaser.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::error::DuplexError;
use crate::locks::{LockRank, RankedCondvar, RankedMutex};
use crate::pool::PooledBuffer;

/// Pipeline stages, in pipeline (and lock) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Capture,
    Processing,
    Storage,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Capture, Stage::Processing, Stage::Storage];

    pub fn index(self) -> usize {
        match self {
            Stage::Capture => 0,
            Stage::Processing => 1,
            Stage::Storage => 2,
        }
    }
}

/// Capture channels. Left is loopback/system audio, right the microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Left,
    Right,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Left, Channel::Right];

    pub fn index(self) -> usize {
        match self {
            Channel::Left => 0,
            Channel::Right => 1,
        }
    }

    /// Directory name used in the persisted layout.
    pub fn dir_name(self) -> &'static str {
        match self {
            Channel::Left => "left",
            Channel::Right => "right",
        }
    }
}

/// What `put` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the head, count an overrun, enqueue the new buffer.
    DropOldest,
    /// Wait for room until the timeout, then fail.
    Reject,
}

/// Successful `put` outcomes. The evicted buffer, if any, must be released
/// back to the pool by the caller.
#[derive(Debug)]
pub enum PutOutcome {
    Stored,
    DroppedOldest(PooledBuffer),
}

#[derive(Debug, Error)]
pub enum PutError {
    /// The queue stayed full for the whole timeout (reject policy). The
    /// rejected buffer rides along so the caller can release it.
    #[error("queue full")]
    Full(PooledBuffer),
    /// Shutdown was requested; the buffer rides along.
    #[error("shutdown in progress")]
    Shutdown(PooledBuffer),
}

impl PutError {
    pub fn into_buffer(self) -> PooledBuffer {
        match self {
            PutError::Full(b) | PutError::Shutdown(b) => b,
        }
    }

    pub fn as_duplex(&self, stage: Stage, channel: Channel) -> DuplexError {
        match self {
            PutError::Full(_) => DuplexError::QueueFull { stage, channel },
            PutError::Shutdown(_) => DuplexError::Shutdown,
        }
    }
}

#[derive(Debug, Error)]
pub enum GetError {
    #[error("queue empty")]
    Empty,
    #[error("shutdown in progress")]
    Shutdown,
}

impl GetError {
    pub fn as_duplex(&self, stage: Stage, channel: Channel) -> DuplexError {
        match self {
            GetError::Empty => DuplexError::QueueEmpty { stage, channel },
            GetError::Shutdown => DuplexError::Shutdown,
        }
    }
}

const LATENCY_WINDOW: usize = 512;

struct Entry {
    buffer: PooledBuffer,
    enqueued_at: Instant,
}

struct QueueInner {
    items: VecDeque<Entry>,
    latencies_us: VecDeque<u64>,
}

/// One bounded FIFO for a `(stage, channel)` pair.
pub struct ChannelQueue {
    stage: Stage,
    channel: Channel,
    capacity: usize,
    policy: OverflowPolicy,
    inner: RankedMutex<QueueInner>,
    not_empty: RankedCondvar,
    not_full: RankedCondvar,
    overruns: AtomicU64,
    underruns: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl ChannelQueue {
    fn new(
        stage: Stage,
        channel: Channel,
        capacity: usize,
        policy: OverflowPolicy,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            stage,
            channel,
            capacity: capacity.max(1),
            policy,
            inner: RankedMutex::new(
                LockRank::Update,
                QueueInner {
                    items: VecDeque::with_capacity(capacity.min(1024)),
                    latencies_us: VecDeque::with_capacity(LATENCY_WINDOW),
                },
            ),
            not_empty: RankedCondvar::new(),
            not_full: RankedCondvar::new(),
            overruns: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            shutdown,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bounded-blocking enqueue.
    ///
    /// Drop-oldest never blocks on a full queue: the head is evicted and
    /// returned for release. Reject waits for room until `timeout`.
    pub fn put(&self, buffer: PooledBuffer, timeout: Duration) -> Result<PutOutcome, PutError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PutError::Shutdown(buffer));
        }

        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                drop(inner);
                return Err(PutError::Shutdown(buffer));
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(Entry {
                    buffer,
                    enqueued_at: Instant::now(),
                });
                drop(inner);
                self.not_empty.notify_one();
                return Ok(PutOutcome::Stored);
            }
            match self.policy {
                OverflowPolicy::DropOldest => {
                    let evicted = inner.items.pop_front().map(|e| e.buffer);
                    inner.items.push_back(Entry {
                        buffer,
                        enqueued_at: Instant::now(),
                    });
                    drop(inner);
                    self.overruns.fetch_add(1, Ordering::Relaxed);
                    self.not_empty.notify_one();
                    // capacity >= 1, so the pop always yielded a buffer here.
                    return Ok(PutOutcome::DroppedOldest(
                        evicted.expect("full queue had no head"),
                    ));
                }
                OverflowPolicy::Reject => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        drop(inner);
                        return Err(PutError::Full(buffer));
                    }
                    self.not_full.wait_for(&mut inner, remaining);
                }
            }
        }
    }

    /// Bounded-blocking dequeue. Once shutdown is requested the queue drains
    /// what it holds, then reports `Shutdown`.
    pub fn get(&self, timeout: Duration) -> Result<PooledBuffer, GetError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(entry) = inner.items.pop_front() {
                let waited = entry.enqueued_at.elapsed();
                if inner.latencies_us.len() == LATENCY_WINDOW {
                    inner.latencies_us.pop_front();
                }
                inner.latencies_us.push_back(waited.as_micros() as u64);
                drop(inner);
                self.not_full.notify_one();
                return Ok(entry.buffer);
            }
            if self.shutdown.load(Ordering::Acquire) {
                return Err(GetError::Shutdown);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.underruns.fetch_add(1, Ordering::Relaxed);
                return Err(GetError::Empty);
            }
            self.not_empty.wait_for(&mut inner, remaining);
        }
    }

    /// Remove every queued buffer, handing them back for release.
    pub fn drain(&self) -> Vec<PooledBuffer> {
        let mut inner = self.inner.lock();
        let drained = inner.items.drain(..).map(|e| e.buffer).collect();
        drop(inner);
        self.not_full.notify_all();
        drained
    }

    pub fn metrics(&self) -> QueueMetrics {
        let inner = self.inner.lock();
        let mut sorted: Vec<u64> = inner.latencies_us.iter().copied().collect();
        drop(inner);
        sorted.sort_unstable();
        let pct = |p: f64| -> u64 {
            if sorted.is_empty() {
                0
            } else {
                let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
                sorted[idx]
            }
        };
        QueueMetrics {
            stage: self.stage,
            channel: self.channel,
            depth: self.len(),
            capacity: self.capacity,
            overruns: self.overruns.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            latency_p50_us: pct(0.50),
            latency_p95_us: pct(0.95),
        }
    }

    fn wake_all(&self) {
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueMetrics {
    pub stage: Stage,
    pub channel: Channel,
    pub depth: usize,
    pub capacity: usize,
    pub overruns: u64,
    pub underruns: u64,
    pub latency_p50_us: u64,
    pub latency_p95_us: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueCapacities {
    pub capture: usize,
    pub processing: usize,
    pub storage: usize,
}

impl QueueCapacities {
    fn for_stage(&self, stage: Stage) -> usize {
        match stage {
            Stage::Capture => self.capture,
            Stage::Processing => self.processing,
            Stage::Storage => self.storage,
        }
    }
}

/// The six queues plus the shared shutdown flag.
pub struct StageQueues {
    queues: Vec<ChannelQueue>,
    shutdown: Arc<AtomicBool>,
}

impl StageQueues {
    pub fn new(caps: QueueCapacities, policy: OverflowPolicy, shutdown: Arc<AtomicBool>) -> Self {
        let mut queues = Vec::with_capacity(6);
        for stage in Stage::ALL {
            for channel in Channel::ALL {
                queues.push(ChannelQueue::new(
                    stage,
                    channel,
                    caps.for_stage(stage),
                    policy,
                    Arc::clone(&shutdown),
                ));
            }
        }
        Self { queues, shutdown }
    }

    pub fn queue(&self, stage: Stage, channel: Channel) -> &ChannelQueue {
        &self.queues[stage.index() * 2 + channel.index()]
    }

    pub fn put(
        &self,
        stage: Stage,
        channel: Channel,
        buffer: PooledBuffer,
        timeout: Duration,
    ) -> Result<PutOutcome, PutError> {
        self.queue(stage, channel).put(buffer, timeout)
    }

    pub fn get(
        &self,
        stage: Stage,
        channel: Channel,
        timeout: Duration,
    ) -> Result<PooledBuffer, GetError> {
        self.queue(stage, channel).get(timeout)
    }

    pub fn size(&self, stage: Stage, channel: Channel) -> usize {
        self.queue(stage, channel).len()
    }

    /// Per-queue snapshots in fixed (stage, channel) order.
    pub fn metrics(&self) -> Vec<QueueMetrics> {
        self.queues.iter().map(ChannelQueue::metrics).collect()
    }

    /// |depth(left) − depth(right)| for a stage.
    pub fn skew(&self, stage: Stage) -> usize {
        let l = self.size(stage, Channel::Left);
        let r = self.size(stage, Channel::Right);
        l.abs_diff(r)
    }

    pub fn total_depth(&self) -> usize {
        self.queues.iter().map(ChannelQueue::len).sum()
    }

    /// Raise the shutdown flag and wake every waiter.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for q in &self.queues {
            q.wake_all();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Drain every queue in pipeline order, returning buffers for release.
    pub fn drain_all(&self) -> Vec<PooledBuffer> {
        let mut out = Vec::new();
        for q in &self.queues {
            out.extend(q.drain());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TieredPool;
    use std::thread;

    fn fixture(cap: usize, policy: OverflowPolicy) -> (TieredPool, StageQueues) {
        let pool = TieredPool::new([64, 8, 4], Duration::from_millis(50));
        let queues = StageQueues::new(
            QueueCapacities {
                capture: cap,
                processing: cap,
                storage: cap,
            },
            policy,
            Arc::new(AtomicBool::new(false)),
        );
        (pool, queues)
    }

    fn tagged(pool: &TieredPool, tag: u8) -> PooledBuffer {
        let mut buf = pool.allocate(16).unwrap();
        buf.write(&[tag; 4]);
        buf
    }

    #[test]
    fn fifo_order_is_preserved() {
        let (pool, queues) = fixture(8, OverflowPolicy::DropOldest);
        for tag in 1..=3u8 {
            let b = tagged(&pool, tag);
            queues
                .put(Stage::Capture, Channel::Left, b, Duration::from_millis(10))
                .unwrap();
        }
        for expected in 1..=3u8 {
            let mut got = queues
                .get(Stage::Capture, Channel::Left, Duration::from_millis(10))
                .unwrap();
            assert_eq!(got.as_slice()[0], expected);
            pool.release(&mut got).unwrap();
        }
    }

    #[test]
    fn depth_never_exceeds_capacity_with_drop_oldest() {
        let (pool, queues) = fixture(2, OverflowPolicy::DropOldest);
        let q = queues.queue(Stage::Capture, Channel::Left);

        // A, B, C, D into a capacity-2 queue: A and B are evicted.
        let mut evicted = Vec::new();
        for tag in b'a'..=b'd' {
            match q.put(tagged(&pool, tag), Duration::from_millis(10)).unwrap() {
                PutOutcome::Stored => {}
                PutOutcome::DroppedOldest(old) => evicted.push(old),
            }
            assert!(q.len() <= q.capacity());
        }
        assert_eq!(q.len(), 2);
        assert_eq!(q.metrics().overruns, 2);
        assert_eq!(evicted.len(), 2);
        assert_eq!(evicted[0].as_slice()[0], b'a');
        assert_eq!(evicted[1].as_slice()[0], b'b');

        // Consumer observes C then D.
        let mut c = q.get(Duration::from_millis(10)).unwrap();
        let mut d = q.get(Duration::from_millis(10)).unwrap();
        assert_eq!(c.as_slice()[0], b'c');
        assert_eq!(d.as_slice()[0], b'd');

        for buf in [&mut c, &mut d].into_iter().chain(evicted.iter_mut()) {
            pool.release(buf).unwrap();
        }
    }

    #[test]
    fn reject_policy_times_out_on_full_queue() {
        let (pool, queues) = fixture(1, OverflowPolicy::Reject);
        let q = queues.queue(Stage::Processing, Channel::Right);
        q.put(tagged(&pool, 1), Duration::from_millis(10)).unwrap();

        let started = Instant::now();
        let err = q.put(tagged(&pool, 2), Duration::from_millis(40)).unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(35));
        let mut rejected = err.into_buffer();
        pool.release(&mut rejected).unwrap();

        let mut remaining = q.drain();
        for buf in remaining.iter_mut() {
            pool.release(buf).unwrap();
        }
    }

    #[test]
    fn get_times_out_and_counts_underrun() {
        let (_pool, queues) = fixture(2, OverflowPolicy::DropOldest);
        let q = queues.queue(Stage::Storage, Channel::Left);
        let err = q.get(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, GetError::Empty));
        assert_eq!(q.metrics().underruns, 1);
    }

    #[test]
    fn blocked_get_is_released_by_put() {
        let (pool, queues) = fixture(4, OverflowPolicy::DropOldest);
        let queues = Arc::new(queues);

        let q2 = Arc::clone(&queues);
        let consumer = thread::spawn(move || {
            q2.get(Stage::Capture, Channel::Right, Duration::from_millis(500))
                .map(|b| b.as_slice()[0])
        });

        thread::sleep(Duration::from_millis(20));
        queues
            .put(
                Stage::Capture,
                Channel::Right,
                tagged(&pool, 9),
                Duration::from_millis(10),
            )
            .unwrap();
        assert_eq!(consumer.join().unwrap().unwrap(), 9);
    }

    #[test]
    fn shutdown_drains_then_reports() {
        let (pool, queues) = fixture(4, OverflowPolicy::DropOldest);
        queues
            .put(
                Stage::Capture,
                Channel::Left,
                tagged(&pool, 7),
                Duration::from_millis(10),
            )
            .unwrap();
        queues.begin_shutdown();

        // Drain still yields the queued buffer...
        let mut got = queues
            .get(Stage::Capture, Channel::Left, Duration::from_millis(10))
            .unwrap();
        pool.release(&mut got).unwrap();

        // ...then shutdown is reported, and put refuses new work.
        assert!(matches!(
            queues.get(Stage::Capture, Channel::Left, Duration::from_millis(10)),
            Err(GetError::Shutdown)
        ));
        let err = queues
            .put(
                Stage::Capture,
                Channel::Left,
                tagged(&pool, 8),
                Duration::from_millis(10),
            )
            .unwrap_err();
        let mut b = err.into_buffer();
        pool.release(&mut b).unwrap();
    }

    #[test]
    fn skew_is_absolute_depth_difference() {
        let (pool, queues) = fixture(8, OverflowPolicy::DropOldest);
        for _ in 0..3 {
            queues
                .put(
                    Stage::Processing,
                    Channel::Left,
                    tagged(&pool, 1),
                    Duration::from_millis(10),
                )
                .unwrap();
        }
        assert_eq!(queues.skew(Stage::Processing), 3);
        assert_eq!(queues.skew(Stage::Capture), 0);
        for mut b in queues.drain_all() {
            pool.release(&mut b).unwrap();
        }
    }

    #[test]
    fn latency_percentiles_are_reported() {
        let (pool, queues) = fixture(8, OverflowPolicy::DropOldest);
        let q = queues.queue(Stage::Capture, Channel::Left);
        q.put(tagged(&pool, 1), Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(5));
        let mut b = q.get(Duration::from_millis(10)).unwrap();
        pool.release(&mut b).unwrap();

        let m = q.metrics();
        assert!(m.latency_p50_us >= 4_000, "p50 was {}", m.latency_p50_us);
        assert!(m.latency_p95_us >= m.latency_p50_us);
    }
}
