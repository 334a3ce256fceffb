//! `DuplexEngine` — top-level lifecycle controller and the worker threads.
//!
//! ## Data path
//!
//! ```text
//! capture callback → SPSC ring → capture worker ─┬─ left  → [capture q] → processing → [processing q] → mover → [storage q] → writer → StorageManager
//!                                                └─ right → (same, per channel)
//! ```
//!
//! The callback side is wait-free; every worker wait is bounded and observes
//! the shared shutdown flag. Buffers are leased from the pool (accounted to
//! the capture component), travel the queues by ownership transfer, and are
//! released by the writer after the payload is handed to storage.
//!
//! ## Lifecycle
//!
//! ```text
//! DuplexEngine::new()   → coordinators built, components registered
//!     └─► start()       → components UNINITIALIZED→…→IDLE, workers spawned,
//!                         worker components RUNNING
//!         └─► shutdown() → RUNNING→STOPPING→STOPPED, queues drain
//!                          capture→storage, cleanup walk runs to
//!                          CLEANUP_COMPLETED (or CLEANUP_FAILED)
//! ```
//!
//! `start()`/`shutdown()` are idempotent: calling them in the wrong state
//! returns an error rather than panicking.

pub mod capture;

use std::fs;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cleanup::{CleanupCoordinator, CleanupPhase, CleanupReport};
use crate::config::{ChannelMode, CoreConfig};
use crate::error::{DuplexError, Result};
use crate::monitor::{ErrorReport, MonitorConfig, MonitorCoordinator, Reporter, Severity};
use crate::pool::TieredPool;
use crate::queues::{Channel, GetError, PutOutcome, QueueCapacities, Stage, StageQueues};
use crate::registry::{ComponentCoordinator, ComponentHandle, ComponentKind};
use crate::state::ComponentState;
use crate::storage::session::{self, RecoveryEvent, RecoveryJournal};
use crate::storage::{StorageConfig, StorageManager};

use capture::{CaptureSource, Consumer, FrameConsumer, SyntheticSource};

pub const COMPONENT_CAPTURE: &str = "capture";
pub const COMPONENT_PROCESSING: &str = "processing";
pub const COMPONENT_STORAGE: &str = "storage";
pub const COMPONENT_MONITORING: &str = "monitoring";
pub const COMPONENT_SYSTEM: &str = "system";

/// Peak metric is posted every this many processed buffers per channel.
const PEAK_METRIC_EVERY: u64 = 50;
/// Capture worker nap when the ring is empty.
const EMPTY_RING_SLEEP: Duration = Duration::from_millis(2);
/// Bound on the shutdown drain wait before leftovers are handed to the
/// releasing-resources cleanup step.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct PipelineStats {
    pub samples_in: AtomicU64,
    pub buffers_enqueued: AtomicU64,
    pub capture_overruns: AtomicU64,
    pub alloc_failures: AtomicU64,
    pub processed: AtomicU64,
    pub moved: AtomicU64,
    pub batches_submitted: AtomicU64,
    pub bytes_submitted: AtomicU64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            buffers_enqueued: self.buffers_enqueued.load(Ordering::Relaxed),
            capture_overruns: self.capture_overruns.load(Ordering::Relaxed),
            alloc_failures: self.alloc_failures.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            moved: self.moved.load(Ordering::Relaxed),
            batches_submitted: self.batches_submitted.load(Ordering::Relaxed),
            bytes_submitted: self.bytes_submitted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub samples_in: u64,
    pub buffers_enqueued: u64,
    pub capture_overruns: u64,
    pub alloc_failures: u64,
    pub processed: u64,
    pub moved: u64,
    pub batches_submitted: u64,
    pub bytes_submitted: u64,
}

/// Why `run_until` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    DurationElapsed,
    ShutdownRequested,
    CriticalError,
}

struct EngineHandles {
    capture: ComponentHandle,
    processing: ComponentHandle,
    storage: ComponentHandle,
    monitoring: ComponentHandle,
    system: ComponentHandle,
}

impl EngineHandles {
    fn workers(&self) -> [&ComponentHandle; 3] {
        [&self.capture, &self.processing, &self.storage]
    }

    fn init_order(&self) -> [&ComponentHandle; 5] {
        [
            &self.monitoring,
            &self.storage,
            &self.processing,
            &self.capture,
            &self.system,
        ]
    }
}

/// Shared context cloned into every worker thread.
#[derive(Clone)]
struct WorkerCtx {
    queues: Arc<StageQueues>,
    registry: Arc<ComponentCoordinator>,
    storage: Arc<StorageManager>,
    reporter: Reporter,
    stats: Arc<PipelineStats>,
    shutdown: Arc<AtomicBool>,
    /// Raised first during shutdown so the capture worker stops feeding the
    /// queues while downstream workers keep draining toward storage.
    capture_stop: Arc<AtomicBool>,
    /// All pipeline buffers are accounted to the capture component, which
    /// allocates them; the writer releases against the same handle.
    owner: ComponentHandle,
    stage_wait: Duration,
    idle_flush: Duration,
}

pub struct DuplexEngine {
    config: CoreConfig,
    session: u64,
    pool: TieredPool,
    queues: Arc<StageQueues>,
    registry: Arc<ComponentCoordinator>,
    monitor: Arc<MonitorCoordinator>,
    storage: Arc<StorageManager>,
    journal: Arc<RecoveryJournal>,
    cleanup: Arc<CleanupCoordinator>,
    stats: Arc<PipelineStats>,
    running: AtomicBool,
    stop_requested: Arc<AtomicBool>,
    capture_stop: Arc<AtomicBool>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    source: Arc<Mutex<Option<Box<dyn CaptureSource>>>>,
    handles: EngineHandles,
}

impl DuplexEngine {
    /// Build every coordinator and register the component graph. Does not
    /// start capturing — call `start()`.
    pub fn new(mut config: CoreConfig) -> Result<Self> {
        config.normalize();
        fs::create_dir_all(&config.working_dir)?;

        let session = session::acquire_session_id(&config.working_dir);
        let journal = Arc::new(RecoveryJournal::new(&config.working_dir, session)?);

        let shutdown = Arc::new(AtomicBool::new(false));
        let pool = TieredPool::new(
            [config.pool_small, config.pool_medium, config.pool_large],
            config.allocation_timeout,
        );
        let queues = Arc::new(StageQueues::new(
            QueueCapacities {
                capture: config.capture_queue,
                processing: config.processing_queue,
                storage: config.storage_queue,
            },
            config.overflow_policy,
            Arc::clone(&shutdown),
        ));

        let (reporter, rx) = Reporter::channel(1024);
        let registry = ComponentCoordinator::new(
            pool.clone(),
            reporter.clone(),
            config.history_cap,
            config.component_quota,
        );
        let monitor = MonitorCoordinator::new(
            pool.clone(),
            Arc::clone(&queues),
            Arc::clone(&registry),
            Arc::clone(&shutdown),
            reporter.clone(),
            rx,
            MonitorConfig {
                interval: config.monitor_interval,
                thread_timeout: config.thread_timeout,
                channel_skew_threshold: config.channel_skew_threshold,
                ..MonitorConfig::default()
            },
        );

        let session_dir = session.to_string();
        let storage = Arc::new(StorageManager::new(
            StorageConfig {
                recordings_dir: config.working_dir.join("recordings").join(&session_dir),
                emergency_dir: config
                    .working_dir
                    .join("emergency_backup")
                    .join(&session_dir),
                sample_rate: config.sample_rate,
                flush_bytes: config.effective_flush_bytes(),
                write_buffer_bytes: config.write_buffer_bytes,
                flush_age: config.flush_age,
                idle_flush: config.idle_flush,
                max_retries: config.flush_max_retries,
                retry_backoff: Duration::from_millis(50),
            },
            reporter.clone(),
        )?);

        let monitoring = registry.register(COMPONENT_MONITORING, ComponentKind::Monitoring, &[])?;
        let storage_h = registry.register(COMPONENT_STORAGE, ComponentKind::Storage, &[])?;
        let processing = registry.register(
            COMPONENT_PROCESSING,
            ComponentKind::Processing,
            &[COMPONENT_STORAGE],
        )?;
        let capture_h = registry.register(
            COMPONENT_CAPTURE,
            ComponentKind::Capture,
            &[COMPONENT_PROCESSING],
        )?;
        let system = registry.register(
            COMPONENT_SYSTEM,
            ComponentKind::System,
            &[
                COMPONENT_MONITORING,
                COMPONENT_STORAGE,
                COMPONENT_PROCESSING,
                COMPONENT_CAPTURE,
            ],
        )?;

        let cleanup = Arc::new(CleanupCoordinator::new(
            Arc::clone(system.cell()),
            reporter.clone(),
        ));

        info!(session, working_dir = ?config.working_dir, "engine built");
        Ok(Self {
            config,
            session,
            pool,
            queues,
            registry,
            monitor,
            storage,
            journal,
            cleanup,
            stats: Arc::new(PipelineStats::default()),
            running: AtomicBool::new(false),
            stop_requested: Arc::new(AtomicBool::new(false)),
            capture_stop: Arc::new(AtomicBool::new(false)),
            workers: Arc::new(Mutex::new(Vec::new())),
            source: Arc::new(Mutex::new(None)),
            handles: EngineHandles {
                capture: capture_h,
                processing,
                storage: storage_h,
                monitoring,
                system,
            },
        })
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn monitor(&self) -> &Arc<MonitorCoordinator> {
        &self.monitor
    }

    pub fn registry(&self) -> &Arc<ComponentCoordinator> {
        &self.registry
    }

    /// Flag a signal handler can raise to ask for an ordered stop. Unlike
    /// the system shutdown flag, this one lets the queues drain in pipeline
    /// order before `put` starts refusing work.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_requested)
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn pool(&self) -> &TieredPool {
        &self.pool
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn system_history(&self) -> Vec<crate::state::TransitionEvent> {
        self.handles.system.cell().history()
    }

    /// Start with the built-in synthetic capture source.
    pub fn start(&self) -> Result<()> {
        let (producer, consumer) = capture::create_capture_ring();
        let source = SyntheticSource::new(
            producer,
            self.config.sample_rate,
            self.config.frame_samples(),
            Duration::from_millis(self.config.frame_ms as u64),
            self.config.channels,
        );
        self.start_with_source(Box::new(source), consumer)
    }

    /// Start with a caller-provided capture source feeding the given
    /// consumer half of the capture ring.
    pub fn start_with_source(
        &self,
        source: Box<dyn CaptureSource>,
        consumer: FrameConsumer,
    ) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DuplexError::AlreadyRunning);
        }

        if let Err(e) = self.init_components() {
            self.abort_partial_init();
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.monitor.start_monitoring();

        {
            let mut slot = self.source.lock();
            *slot = Some(source);
            if let Err(e) = slot.as_mut().expect("just stored").start() {
                drop(slot);
                self.monitor.stop_monitoring();
                self.abort_partial_init();
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        if let Err(e) = self.spawn_workers(consumer) {
            // Same unwind as the sibling failure branches, plus reaping any
            // workers that did spawn before the failure.
            if let Some(source) = self.source.lock().as_mut() {
                source.stop();
            }
            self.capture_stop.store(true, Ordering::Release);
            self.monitor.request_shutdown();
            let spawned: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
            for worker in spawned {
                let _ = worker.join();
            }
            self.monitor.stop_monitoring();
            self.abort_partial_init();
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        for handle in self.handles.workers() {
            handle.cell().transition(ComponentState::Running, "started")?;
        }
        info!(session = self.session, "engine started");
        Ok(())
    }

    /// Walk every component UNINITIALIZED → INITIALIZING → IDLE, honoring
    /// the dependency-readiness rule.
    fn init_components(&self) -> Result<()> {
        for handle in self.handles.init_order() {
            handle
                .cell()
                .transition(ComponentState::Initializing, "init")?;
            self.registry.dependencies_ready(handle.name())?;
            handle.cell().transition(ComponentState::Idle, "initialized")?;
        }
        Ok(())
    }

    /// Partial-initialization rollback: components that already moved are
    /// driven to ERROR (the back-edges out of INITIALIZING/IDLE are not in
    /// the graph, so ERROR is the defined landing spot).
    fn abort_partial_init(&self) {
        for handle in self.handles.init_order().into_iter().rev() {
            let state = handle.cell().current();
            if state != ComponentState::Uninitialized && state != ComponentState::Error {
                let _ = handle
                    .cell()
                    .mark_error("initialization aborted", None);
            }
        }
    }

    fn worker_ctx(&self) -> WorkerCtx {
        WorkerCtx {
            queues: Arc::clone(&self.queues),
            registry: Arc::clone(&self.registry),
            storage: Arc::clone(&self.storage),
            reporter: self.monitor.reporter(),
            stats: Arc::clone(&self.stats),
            shutdown: self.monitor.shutdown_flag(),
            capture_stop: Arc::clone(&self.capture_stop),
            owner: self.handles.capture.clone(),
            stage_wait: self.config.stage_wait,
            idle_flush: self.config.idle_flush,
        }
    }

    fn active_channels(&self) -> Vec<Channel> {
        let mut out = Vec::new();
        if self.config.channels.left_enabled() {
            out.push(Channel::Left);
        }
        if self.config.channels.right_enabled() {
            out.push(Channel::Right);
        }
        out
    }

    fn spawn_workers(&self, consumer: FrameConsumer) -> Result<()> {
        let mut workers = self.workers.lock();

        let ctx = self.worker_ctx();
        let tid = self.registry.register_thread(&self.handles.capture)?;
        let frame = Duration::from_millis(self.config.frame_ms as u64);
        let mode = self.config.channels;
        workers.push(
            std::thread::Builder::new()
                .name("duplex-capture".into())
                .spawn(move || capture_loop(ctx, tid, consumer, frame, mode))
                .expect("failed to spawn capture worker"),
        );

        for channel in self.active_channels() {
            let ctx = self.worker_ctx();
            let tid = self.registry.register_thread(&self.handles.processing)?;
            workers.push(
                std::thread::Builder::new()
                    .name(format!("duplex-process-{}", channel.dir_name()))
                    .spawn(move || processing_loop(ctx, tid, channel))
                    .expect("failed to spawn processing worker"),
            );

            let ctx = self.worker_ctx();
            let tid = self.registry.register_thread(&self.handles.storage)?;
            workers.push(
                std::thread::Builder::new()
                    .name(format!("duplex-move-{}", channel.dir_name()))
                    .spawn(move || mover_loop(ctx, tid, channel))
                    .expect("failed to spawn storage mover"),
            );

            let ctx = self.worker_ctx();
            let tid = self.registry.register_thread(&self.handles.storage)?;
            workers.push(
                std::thread::Builder::new()
                    .name(format!("duplex-write-{}", channel.dir_name()))
                    .spawn(move || writer_loop(ctx, tid, channel))
                    .expect("failed to spawn writer"),
            );
        }
        Ok(())
    }

    /// Block until the duration elapses, shutdown is requested externally,
    /// or a critical error asks for cleanup.
    pub fn run_until(&self, duration: Option<Duration>) -> StopReason {
        let started = Instant::now();
        loop {
            if self.monitor.cleanup_requested() {
                return StopReason::CriticalError;
            }
            if self.stop_requested.load(Ordering::Acquire) || self.monitor.is_shutting_down() {
                return StopReason::ShutdownRequested;
            }
            if let Some(d) = duration {
                if started.elapsed() >= d {
                    return StopReason::DurationElapsed;
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Stop the pipeline and run the ordered cleanup walk.
    ///
    /// Queues drain capture→storage before the walk starts: the shutdown
    /// flag stops the capture worker first, downstream workers keep pulling
    /// until their queue reports `Shutdown` (drained), then the phase walk
    /// stops the source, flushes storage, releases leftovers and closes the
    /// logs.
    pub fn shutdown(&self) -> Result<CleanupReport> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(DuplexError::NotRunning);
        }

        for handle in self.handles.workers() {
            if handle.cell().current() == ComponentState::Running {
                if let Err(e) = handle.cell().transition(ComponentState::Stopping, "shutdown") {
                    debug!(component = handle.name(), error = %e, "stop transition skipped");
                }
            }
        }

        // Stop the flow at the source: the capture side goes quiet while the
        // downstream workers keep pulling, so the queues drain in pipeline
        // order before the global flag makes `put` refuse new work.
        if let Some(source) = self.source.lock().as_mut() {
            source.stop();
        }
        self.capture_stop.store(true, Ordering::Release);

        let drain_deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.queues.total_depth() > 0 && Instant::now() < drain_deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if self.queues.total_depth() > 0 {
            warn!(
                remaining = self.queues.total_depth(),
                "queues did not drain before the deadline; leftovers go to the release step"
            );
        }

        self.monitor.request_shutdown();

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }

        for handle in self.handles.workers() {
            if handle.cell().current() == ComponentState::Stopping {
                let _ = handle.cell().transition(ComponentState::Stopped, "drained");
            }
        }

        self.register_cleanup_steps();
        let result = self.cleanup.execute();

        let snap = self.stats.snapshot();
        info!(
            samples_in = snap.samples_in,
            buffers_enqueued = snap.buffers_enqueued,
            capture_overruns = snap.capture_overruns,
            alloc_failures = snap.alloc_failures,
            processed = snap.processed,
            batches_submitted = snap.batches_submitted,
            bytes_submitted = snap.bytes_submitted,
            "pipeline stopped — diagnostics"
        );

        match result {
            Ok(report) => Ok(report),
            Err(e) => {
                // Unrecoverable: leave a final journal entry before closing.
                let _ = self.journal.append(&RecoveryEvent {
                    ts: chrono::Utc::now().to_rfc3339(),
                    session: self.session,
                    component: COMPONENT_SYSTEM.into(),
                    from_state: self.handles.system.cell().current(),
                    to_state: ComponentState::CleanupFailed,
                    cause: e.to_string(),
                    severity: "critical".into(),
                });
                let _ = self.journal.close();
                self.monitor.stop_monitoring();
                Err(e)
            }
        }
    }

    fn register_cleanup_steps(&self) {
        let source = Arc::clone(&self.source);
        let source_v = Arc::clone(&self.source);
        self.cleanup.register_step(
            "stop-capture-source",
            CleanupPhase::StoppingCapture,
            &[],
            move || {
                if let Some(mut s) = source.lock().take() {
                    s.stop();
                }
                Ok(())
            },
            move || source_v.lock().is_none(),
        );

        for channel in self.active_channels() {
            let storage = Arc::clone(&self.storage);
            let storage_v = Arc::clone(&self.storage);
            let name = match channel {
                Channel::Left => "flush-left",
                Channel::Right => "flush-right",
            };
            self.cleanup.register_step(
                name,
                CleanupPhase::FlushingStorage,
                &[],
                move || {
                    storage.flush(channel)?;
                    Ok(())
                },
                move || storage_v.pending_batches(channel) == 0,
            );
        }

        let queues = Arc::clone(&self.queues);
        let registry = Arc::clone(&self.registry);
        let owner = self.handles.capture.clone();
        let queues_v = Arc::clone(&self.queues);
        self.cleanup.register_step(
            "drain-queues",
            CleanupPhase::ReleasingResources,
            &[],
            move || {
                for mut buf in queues.drain_all() {
                    if let Err(e) = registry.release_resource(&owner, &mut buf) {
                        debug!(error = %e, "drained buffer release failed");
                    }
                }
                Ok(())
            },
            move || queues_v.total_depth() == 0,
        );

        let pool = self.pool.clone();
        let pool_v = self.pool.clone();
        self.cleanup.register_step(
            "pool-quiesce",
            CleanupPhase::ReleasingResources,
            &["drain-queues"],
            move || {
                pool.cleanup_stage(crate::pool::CleanupStage::Gc);
                Ok(())
            },
            move || pool_v.stats().total_in_use() == 0,
        );

        let monitor = Arc::clone(&self.monitor);
        let monitor_v = Arc::clone(&self.monitor);
        self.cleanup.register_step(
            "stop-monitoring",
            CleanupPhase::ClosingLogs,
            &[],
            move || {
                monitor.stop_monitoring();
                Ok(())
            },
            move || !monitor_v.is_monitoring(),
        );

        let working_dir = self.config.working_dir.clone();
        let working_dir_v = working_dir.clone();
        let session = self.session;
        self.cleanup.register_step(
            "persist-session",
            CleanupPhase::ClosingLogs,
            &[],
            move || {
                session::persist_session_id(&working_dir, session)?;
                Ok(())
            },
            move || {
                fs::read_to_string(working_dir_v.join(".session"))
                    .map(|s| s.trim().parse::<u64>() == Ok(session))
                    .unwrap_or(false)
            },
        );

        let journal = Arc::clone(&self.journal);
        let journal_v = Arc::clone(&self.journal);
        let system_cell = Arc::clone(self.handles.system.cell());
        let session = self.session;
        self.cleanup.register_step(
            "close-journal",
            CleanupPhase::ClosingLogs,
            &["persist-session"],
            move || {
                if !journal.is_closed() {
                    journal.append(&RecoveryEvent {
                        ts: chrono::Utc::now().to_rfc3339(),
                        session,
                        component: COMPONENT_SYSTEM.into(),
                        from_state: system_cell.current(),
                        to_state: ComponentState::CleanupCompleted,
                        cause: "clean shutdown".into(),
                        severity: "info".into(),
                    })?;
                    journal.close()?;
                }
                Ok(())
            },
            move || journal_v.is_closed(),
        );
    }
}

// ── Worker loops ─────────────────────────────────────────────────────────

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Drain the capture ring, split channels, lease buffers and enqueue them.
/// Never blocks longer than one frame: drop-oldest handles a full queue.
fn capture_loop(
    ctx: WorkerCtx,
    tid: u64,
    mut consumer: FrameConsumer,
    frame: Duration,
    mode: ChannelMode,
) {
    let mut scratch = vec![0f32; 8192];
    let mut left: Vec<u8> = Vec::with_capacity(scratch.len());
    let mut right: Vec<u8> = Vec::with_capacity(scratch.len());
    // An odd trailing sample is carried to the next drain so the
    // left/right interleave never slips.
    let mut carry = 0usize;

    loop {
        if ctx.capture_stop.load(Ordering::Acquire) || ctx.shutdown.load(Ordering::Acquire) {
            break;
        }
        ctx.registry.thread_tick(tid);

        let n = consumer.pop_slice(&mut scratch[carry..]);
        let total = carry + n;
        if total < 2 {
            carry = total;
            std::thread::sleep(EMPTY_RING_SLEEP);
            continue;
        }
        ctx.stats.samples_in.fetch_add(n as u64, Ordering::Relaxed);

        let pairs = total / 2;
        left.clear();
        right.clear();
        for pair in scratch[..pairs * 2].chunks_exact(2) {
            left.extend_from_slice(&f32_to_i16(pair[0]).to_le_bytes());
            right.extend_from_slice(&f32_to_i16(pair[1]).to_le_bytes());
        }
        if total % 2 == 1 {
            scratch[0] = scratch[pairs * 2];
            carry = 1;
        } else {
            carry = 0;
        }

        if mode.left_enabled() {
            enqueue_capture(&ctx, Channel::Left, &left, frame);
        }
        if mode.right_enabled() {
            enqueue_capture(&ctx, Channel::Right, &right, frame);
        }
    }

    ctx.registry.unregister_thread(tid);
    debug!("capture worker exited");
}

fn enqueue_capture(ctx: &WorkerCtx, channel: Channel, bytes: &[u8], frame: Duration) {
    let mut buf = match ctx.registry.request_resource(&ctx.owner, bytes.len()) {
        Ok(buf) => buf,
        Err(e) => {
            ctx.stats.alloc_failures.fetch_add(1, Ordering::Relaxed);
            ctx.reporter.error(ErrorReport {
                component: COMPONENT_CAPTURE.into(),
                severity: Severity::Warning,
                kind: e.kind().into(),
                message: format!("{channel:?} frame dropped: {e}"),
            });
            return;
        }
    };
    buf.write(bytes);

    match ctx.queues.put(Stage::Capture, channel, buf, frame) {
        Ok(PutOutcome::Stored) => {
            ctx.stats.buffers_enqueued.fetch_add(1, Ordering::Relaxed);
        }
        Ok(PutOutcome::DroppedOldest(mut old)) => {
            ctx.stats.buffers_enqueued.fetch_add(1, Ordering::Relaxed);
            ctx.stats.capture_overruns.fetch_add(1, Ordering::Relaxed);
            let _ = ctx.registry.release_resource(&ctx.owner, &mut old);
        }
        Err(e) => {
            let mut rejected = e.into_buffer();
            let _ = ctx.registry.release_resource(&ctx.owner, &mut rejected);
        }
    }
}

/// Move capture → processing for one channel, inspecting the payload on the
/// way (peak metric).
fn processing_loop(ctx: WorkerCtx, tid: u64, channel: Channel) {
    let mut seen = 0u64;
    loop {
        ctx.registry.thread_tick(tid);
        match ctx.queues.get(Stage::Capture, channel, ctx.stage_wait) {
            Ok(buf) => {
                seen += 1;
                if seen % PEAK_METRIC_EVERY == 0 {
                    let peak = buf
                        .as_slice()
                        .chunks_exact(2)
                        .map(|p| i16::from_le_bytes([p[0], p[1]]).unsigned_abs())
                        .max()
                        .unwrap_or(0);
                    ctx.reporter.metric(
                        COMPONENT_PROCESSING,
                        &format!("peak_{}", channel.dir_name()),
                        peak as f64 / i16::MAX as f64,
                    );
                }
                ctx.stats.processed.fetch_add(1, Ordering::Relaxed);
                forward(&ctx, Stage::Processing, channel, buf);
            }
            Err(GetError::Empty) => continue,
            Err(GetError::Shutdown) => break,
        }
    }
    ctx.registry.unregister_thread(tid);
    debug!(?channel, "processing worker exited");
}

/// Move processing → storage for one channel.
fn mover_loop(ctx: WorkerCtx, tid: u64, channel: Channel) {
    loop {
        ctx.registry.thread_tick(tid);
        match ctx.queues.get(Stage::Processing, channel, ctx.stage_wait) {
            Ok(buf) => {
                ctx.stats.moved.fetch_add(1, Ordering::Relaxed);
                forward(&ctx, Stage::Storage, channel, buf);
            }
            Err(GetError::Empty) => continue,
            Err(GetError::Shutdown) => break,
        }
    }
    ctx.registry.unregister_thread(tid);
    debug!(?channel, "storage mover exited");
}

fn forward(ctx: &WorkerCtx, stage: Stage, channel: Channel, buf: crate::pool::PooledBuffer) {
    match ctx.queues.put(stage, channel, buf, ctx.stage_wait) {
        Ok(PutOutcome::Stored) => {}
        Ok(PutOutcome::DroppedOldest(mut old)) => {
            let _ = ctx.registry.release_resource(&ctx.owner, &mut old);
        }
        Err(e) => {
            ctx.reporter.error(ErrorReport {
                component: COMPONENT_PROCESSING.into(),
                severity: Severity::Warning,
                kind: e.as_duplex(stage, channel).kind().into(),
                message: format!("forward to {stage:?}/{channel:?} failed"),
            });
            let mut rejected = e.into_buffer();
            let _ = ctx.registry.release_resource(&ctx.owner, &mut rejected);
        }
    }
}

/// Drain storage queue → StorageManager, releasing buffers after the copy
/// and driving the flush triggers (including idle).
fn writer_loop(ctx: WorkerCtx, tid: u64, channel: Channel) {
    let wait = ctx.idle_flush.min(ctx.stage_wait).max(Duration::from_millis(10));
    loop {
        ctx.registry.thread_tick(tid);
        match ctx.queues.get(Stage::Storage, channel, wait) {
            Ok(mut buf) => {
                match ctx.storage.submit(channel, buf.as_slice()) {
                    Ok(_seq) => {
                        ctx.stats.batches_submitted.fetch_add(1, Ordering::Relaxed);
                        ctx.stats
                            .bytes_submitted
                            .fetch_add(buf.used() as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        ctx.reporter.error(ErrorReport {
                            component: COMPONENT_STORAGE.into(),
                            severity: Severity::Error,
                            kind: e.kind().into(),
                            message: format!("submit failed for {channel:?}: {e}"),
                        });
                    }
                }
                let _ = ctx.registry.release_resource(&ctx.owner, &mut buf);
                if let Err(e) = ctx.storage.maybe_flush(channel) {
                    warn!(?channel, error = %e, "flush failed");
                }
            }
            Err(GetError::Empty) => {
                if let Err(e) = ctx.storage.maybe_flush(channel) {
                    warn!(?channel, error = %e, "idle flush failed");
                }
            }
            Err(GetError::Shutdown) => break,
        }
    }
    ctx.registry.unregister_thread(tid);
    debug!(?channel, "writer exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> CoreConfig {
        CoreConfig {
            working_dir: dir.to_path_buf(),
            flush_age: Duration::from_millis(50),
            idle_flush: Duration::from_millis(20),
            stage_wait: Duration::from_millis(20),
            monitor_interval: Duration::from_millis(20),
            ..CoreConfig::default()
        }
    }

    #[test]
    fn start_and_shutdown_are_idempotency_checked() {
        let dir = tempdir().unwrap();
        let engine = DuplexEngine::new(test_config(dir.path())).unwrap();

        assert!(matches!(engine.shutdown(), Err(DuplexError::NotRunning)));
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(DuplexError::AlreadyRunning)));

        std::thread::sleep(Duration::from_millis(80));
        let report = engine.shutdown().unwrap();
        assert!(report.succeeded());
        assert!(matches!(engine.shutdown(), Err(DuplexError::NotRunning)));
    }

    #[test]
    fn clean_run_reaches_cleanup_completed_with_quiesced_pool() {
        let dir = tempdir().unwrap();
        let engine = DuplexEngine::new(test_config(dir.path())).unwrap();
        engine.start().unwrap();
        std::thread::sleep(Duration::from_millis(150));
        let report = engine.shutdown().unwrap();

        assert!(report.succeeded());
        assert_eq!(engine.pool().stats().total_in_use(), 0);
        let history = engine.system_history();
        assert_eq!(
            history.last().unwrap().to,
            ComponentState::CleanupCompleted
        );
        // Both channels produced sequenced output.
        let stats = engine.stats();
        assert!(stats.batches_submitted > 0, "no batches reached storage");
    }

    #[test]
    fn init_registers_all_components() {
        let dir = tempdir().unwrap();
        let engine = DuplexEngine::new(test_config(dir.path())).unwrap();
        let health = engine.monitor().health();
        for name in [
            COMPONENT_CAPTURE,
            COMPONENT_PROCESSING,
            COMPONENT_STORAGE,
            COMPONENT_MONITORING,
            COMPONENT_SYSTEM,
        ] {
            assert!(health.components.contains_key(name), "missing {name}");
        }
    }
}
