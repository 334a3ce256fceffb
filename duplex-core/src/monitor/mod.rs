//! Monitoring coordinator.
//!
//! The single surface workers address: metric updates, error reports, health
//! snapshots, and the system shutdown flag all live here. The coordinator
//! owns the handles to the pool, the stage queues and the component registry;
//! components themselves only ever hold a [`Reporter`] — a narrow,
//! non-blocking capability that posts onto a bounded channel.
//!
//! Metric emission never blocks: the internal ring drops its oldest entry on
//! overflow and counts the drop. Errors are counted per kind and per
//! severity; a `Critical` report raises the cleanup request the engine acts
//! on.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::locks::{LockRank, RankedMutex};
use crate::pool::{CleanupStage, PoolStats, TieredPool};
use crate::queues::{QueueMetrics, Stage, StageQueues};
use crate::registry::{ComponentCoordinator, ComponentHandle, HealthReport};

/// Error severities, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    fn index(self) -> usize {
        match self {
            Severity::Info => 0,
            Severity::Warning => 1,
            Severity::Error => 2,
            Severity::Critical => 3,
        }
    }
}

/// One metric sample posted by a worker or coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct MetricUpdate {
    pub component: String,
    pub name: String,
    pub value: f64,
}

/// A routed error: component, severity, stable kind label, human context.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub component: String,
    pub severity: Severity,
    pub kind: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ReportEvent {
    Metric(MetricUpdate),
    Error(ErrorReport),
}

/// Non-blocking posting capability handed to components and state callbacks.
///
/// Posts ride a bounded channel; when it is full the event is dropped and
/// counted. A reporter never takes a lock and never waits.
#[derive(Clone)]
pub struct Reporter {
    tx: Sender<ReportEvent>,
    dropped: Arc<AtomicU64>,
}

impl Reporter {
    /// Build a reporter and the receiving end the coordinator drains.
    pub fn channel(capacity: usize) -> (Reporter, Receiver<ReportEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Reporter {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// A reporter whose events go nowhere. For tests and detached tools.
    pub fn disconnected() -> Reporter {
        let (reporter, _rx) = Reporter::channel(1);
        reporter
    }

    pub fn metric(&self, component: &str, name: &str, value: f64) {
        self.post(ReportEvent::Metric(MetricUpdate {
            component: component.to_string(),
            name: name.to_string(),
            value,
        }));
    }

    pub fn error(&self, report: ErrorReport) {
        self.post(ReportEvent::Error(report));
    }

    fn post(&self, event: ReportEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Resident-byte budgets driving the pool's staged cleanup.
#[derive(Debug, Clone, Copy)]
pub struct PressureThresholds {
    pub soft_bytes: usize,
    pub hard_bytes: usize,
    pub emergency_bytes: usize,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            soft_bytes: 50 * 1024 * 1024,
            hard_bytes: 75 * 1024 * 1024,
            emergency_bytes: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub thread_timeout: Duration,
    pub channel_skew_threshold: usize,
    pub metrics_ring_cap: usize,
    pub pressure: PressureThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            thread_timeout: Duration::from_secs(10),
            channel_skew_threshold: 64,
            metrics_ring_cap: 4096,
            pressure: PressureThresholds::default(),
        }
    }
}

struct MetricsInner {
    ring: std::collections::VecDeque<MetricUpdate>,
    cap: usize,
    kinded: HashMap<String, u64>,
    by_severity: [u64; 4],
}

#[derive(Default)]
struct PerfInner {
    skew_events: u64,
    last_skew: [usize; 3],
}

/// Aggregate health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub components: HashMap<String, HealthReport>,
    pub pool: PoolStats,
    pub queues: Vec<QueueMetrics>,
    pub errors_by_severity: [u64; 4],
    pub errors_by_kind: HashMap<String, u64>,
    pub metrics_drops: u64,
    pub cleanup_requested: bool,
    pub shutdown: bool,
}

pub struct MonitorCoordinator {
    pool: TieredPool,
    queues: Arc<StageQueues>,
    registry: Arc<ComponentCoordinator>,
    shutdown: Arc<AtomicBool>,
    cleanup_requested: AtomicBool,
    resource_exhausted: AtomicBool,
    metrics: RankedMutex<MetricsInner>,
    perf: RankedMutex<PerfInner>,
    reporter: Reporter,
    rx: Receiver<ReportEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
    monitoring: Arc<AtomicBool>,
    config: MonitorConfig,
}

impl MonitorCoordinator {
    pub fn new(
        pool: TieredPool,
        queues: Arc<StageQueues>,
        registry: Arc<ComponentCoordinator>,
        shutdown: Arc<AtomicBool>,
        reporter: Reporter,
        rx: Receiver<ReportEvent>,
        config: MonitorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            queues,
            registry,
            shutdown,
            cleanup_requested: AtomicBool::new(false),
            resource_exhausted: AtomicBool::new(false),
            metrics: RankedMutex::new(
                LockRank::Metrics,
                MetricsInner {
                    ring: std::collections::VecDeque::with_capacity(256),
                    cap: config.metrics_ring_cap.max(16),
                    kinded: HashMap::new(),
                    by_severity: [0; 4],
                },
            ),
            perf: RankedMutex::new(LockRank::Performance, PerfInner::default()),
            reporter,
            rx,
            worker: Mutex::new(None),
            monitoring: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    /// The posting capability to hand to components.
    pub fn reporter(&self) -> Reporter {
        self.reporter.clone()
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Raise the system shutdown flag and wake all queue waiters.
    pub fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            info!("shutdown requested");
        }
        self.queues.begin_shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn cleanup_requested(&self) -> bool {
        self.cleanup_requested.load(Ordering::Acquire)
    }

    /// True once any allocation failed while the pool was in EMERGENCY —
    /// the unrecoverable-exhaustion exit path.
    pub fn resource_exhausted(&self) -> bool {
        self.resource_exhausted.load(Ordering::Acquire)
    }

    /// Record a metric sample. Never blocks: on a full ring the oldest
    /// sample is dropped and counted.
    pub fn update_metrics(&self, update: MetricUpdate) {
        let mut inner = self.metrics.lock();
        if inner.ring.len() == inner.cap {
            inner.ring.pop_front();
            self.reporter.dropped.fetch_add(1, Ordering::Relaxed);
        }
        inner.ring.push_back(update);
    }

    /// Route an error: count it per kind and severity, log it, escalate
    /// `Critical` to a cleanup request, and record it against the component.
    pub fn report_error(&self, report: ErrorReport) {
        {
            let mut inner = self.metrics.lock();
            *inner.kinded.entry(report.kind.clone()).or_insert(0) += 1;
            inner.by_severity[report.severity.index()] += 1;
        }

        match report.severity {
            Severity::Info => {
                debug!(component = %report.component, kind = %report.kind, "{}", report.message)
            }
            Severity::Warning => {
                warn!(component = %report.component, kind = %report.kind, "{}", report.message)
            }
            Severity::Error | Severity::Critical => {
                error!(component = %report.component, severity = ?report.severity, kind = %report.kind, "{}", report.message)
            }
        }

        if report.kind == "pool_exhausted" && self.pool.stage() >= CleanupStage::Emergency {
            self.resource_exhausted.store(true, Ordering::Release);
        }

        self.registry.note_error(&report.component, &report.message);

        if report.severity == Severity::Critical
            && !self.cleanup_requested.swap(true, Ordering::AcqRel)
        {
            warn!(component = %report.component, kind = %report.kind, "critical error — cleanup requested");
        }
    }

    /// Snapshot of the metric ring, oldest first.
    pub fn metrics_snapshot(&self) -> Vec<MetricUpdate> {
        self.metrics.lock().ring.iter().cloned().collect()
    }

    /// Latest per-stage skew readings and the total threshold breaches.
    pub fn skew_snapshot(&self) -> ([usize; 3], u64) {
        let perf = self.perf.lock();
        (perf.last_skew, perf.skew_events)
    }

    /// Thread registration passthrough — workers talk to the monitor, the
    /// monitor owns the registry handle.
    pub fn register_thread(&self, handle: &ComponentHandle) -> Result<u64> {
        self.registry.register_thread(handle)
    }

    pub fn thread_tick(&self, tid: u64) {
        self.registry.thread_tick(tid);
    }

    pub fn error_count(&self, kind: &str) -> u64 {
        self.metrics.lock().kinded.get(kind).copied().unwrap_or(0)
    }

    pub fn health(&self) -> SystemHealth {
        let (by_severity, by_kind) = {
            let inner = self.metrics.lock();
            (inner.by_severity, inner.kinded.clone())
        };
        SystemHealth {
            components: self.registry.health(),
            pool: self.pool.stats(),
            queues: self.queues.metrics(),
            errors_by_severity: by_severity,
            errors_by_kind: by_kind,
            metrics_drops: self.reporter.dropped(),
            cleanup_requested: self.cleanup_requested(),
            shutdown: self.is_shutting_down(),
        }
    }

    /// Spawn the monitor thread: drains the reporter channel and on every
    /// tick checks thread liveness, channel skew and memory pressure.
    pub fn start_monitoring(self: &Arc<Self>) {
        if self.monitoring.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("duplex-monitor".into())
            .spawn(move || this.monitor_loop())
            .expect("failed to spawn monitor thread");
        *self.worker.lock() = Some(handle);
        info!("monitoring started");
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::Acquire)
    }

    pub fn stop_monitoring(&self) {
        if !self.monitoring.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        // Drain anything still in flight so no error goes uncounted.
        self.drain_reports();
        info!("monitoring stopped");
    }

    fn monitor_loop(self: Arc<Self>) {
        let mut last_tick = std::time::Instant::now();
        while self.monitoring.load(Ordering::Acquire) {
            match self.rx.recv_timeout(self.config.interval.min(Duration::from_millis(100))) {
                Ok(event) => self.dispatch(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if last_tick.elapsed() >= self.config.interval {
                last_tick = std::time::Instant::now();
                self.tick();
            }
        }
    }

    /// Drain pending reporter events without the monitor thread.
    pub fn drain_reports(&self) {
        while let Ok(event) = self.rx.try_recv() {
            self.dispatch(event);
        }
    }

    fn dispatch(&self, event: ReportEvent) {
        match event {
            ReportEvent::Metric(m) => self.update_metrics(m),
            ReportEvent::Error(e) => self.report_error(e),
        }
    }

    fn tick(&self) {
        // Thread liveness.
        let stale = self.registry.liveness_sweep(self.config.thread_timeout);
        for dead in stale {
            self.report_error(ErrorReport {
                component: dead.component.clone(),
                severity: Severity::Critical,
                kind: "thread_heartbeat_timeout".into(),
                message: format!(
                    "thread {} of {} missed heartbeats for {:?}",
                    dead.tid, dead.component, self.config.thread_timeout
                ),
            });
            if let Err(e) = dead
                .cell
                .mark_error("thread heartbeat timeout", Some(format!("tid={}", dead.tid)))
            {
                debug!(component = %dead.component, error = %e, "could not mark component errored");
            }
        }

        // Channel skew. The perf lock is inner to metrics, so the warning
        // metrics are posted after it is released.
        let skews = [
            self.queues.skew(Stage::Capture),
            self.queues.skew(Stage::Processing),
            self.queues.skew(Stage::Storage),
        ];
        let mut skewed = Vec::new();
        {
            let mut perf = self.perf.lock();
            perf.last_skew = skews;
            for (stage, skew) in Stage::ALL.into_iter().zip(skews) {
                if skew > self.config.channel_skew_threshold {
                    perf.skew_events += 1;
                    skewed.push((stage, skew));
                }
            }
        }
        for (stage, skew) in skewed {
            self.update_metrics(MetricUpdate {
                component: "queues".into(),
                name: format!("channel_skew_{:?}", stage).to_lowercase(),
                value: skew as f64,
            });
            warn!(?stage, skew, "channel skew above threshold");
        }

        // Memory pressure → staged pool cleanup (monotonic).
        let resident = self.pool.stats().resident_bytes;
        let p = &self.config.pressure;
        let target = if resident >= p.emergency_bytes {
            Some(CleanupStage::Emergency)
        } else if resident >= p.hard_bytes {
            Some(CleanupStage::Hard)
        } else if resident >= p.soft_bytes {
            Some(CleanupStage::Soft)
        } else {
            None
        };
        if let Some(stage) = target {
            if self.pool.stage() < stage && self.pool.cleanup_stage(stage) {
                warn!(resident, ?stage, "memory pressure advanced pool cleanup stage");
                if stage == CleanupStage::Emergency {
                    self.report_error(ErrorReport {
                        component: "pool".into(),
                        severity: Severity::Critical,
                        kind: "pool_exhausted".into(),
                        message: format!("pool entered EMERGENCY at {resident} resident bytes"),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queues::{OverflowPolicy, QueueCapacities};

    fn fixture() -> (Arc<MonitorCoordinator>, Reporter) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let pool = TieredPool::new([8, 4, 2], Duration::from_millis(50));
        let queues = Arc::new(StageQueues::new(
            QueueCapacities {
                capture: 8,
                processing: 8,
                storage: 8,
            },
            OverflowPolicy::DropOldest,
            Arc::clone(&shutdown),
        ));
        let (reporter, rx) = Reporter::channel(64);
        let registry = ComponentCoordinator::new(pool.clone(), reporter.clone(), 256, None);
        let monitor = MonitorCoordinator::new(
            pool,
            queues,
            registry,
            shutdown,
            reporter.clone(),
            rx,
            MonitorConfig {
                interval: Duration::from_millis(20),
                thread_timeout: Duration::from_millis(50),
                ..MonitorConfig::default()
            },
        );
        (monitor, reporter)
    }

    #[test]
    fn metric_ring_drops_oldest_when_full() {
        let (monitor, _reporter) = fixture();
        let cap = monitor.metrics.lock().cap;
        for i in 0..(cap + 5) {
            monitor.update_metrics(MetricUpdate {
                component: "test".into(),
                name: format!("m{i}"),
                value: i as f64,
            });
        }
        let snapshot = monitor.metrics_snapshot();
        assert_eq!(snapshot.len(), cap);
        assert_eq!(snapshot[0].name, "m5");
        assert_eq!(monitor.reporter.dropped(), 5);
    }

    #[test]
    fn errors_are_counted_per_kind_and_severity() {
        let (monitor, _reporter) = fixture();
        monitor.report_error(ErrorReport {
            component: "worker".into(),
            severity: Severity::Warning,
            kind: "queue_full".into(),
            message: "capture overflow".into(),
        });
        monitor.report_error(ErrorReport {
            component: "worker".into(),
            severity: Severity::Warning,
            kind: "queue_full".into(),
            message: "capture overflow".into(),
        });
        assert_eq!(monitor.error_count("queue_full"), 2);
        assert_eq!(monitor.health().errors_by_severity[Severity::Warning.index()], 2);
        assert!(!monitor.cleanup_requested());
    }

    #[test]
    fn critical_error_raises_cleanup_request() {
        let (monitor, _reporter) = fixture();
        monitor.report_error(ErrorReport {
            component: "storage".into(),
            severity: Severity::Critical,
            kind: "emergency_backup_failed".into(),
            message: "disk gone".into(),
        });
        assert!(monitor.cleanup_requested());
    }

    #[test]
    fn reporter_events_arrive_via_drain() {
        let (monitor, reporter) = fixture();
        reporter.metric("worker", "frames", 42.0);
        reporter.error(ErrorReport {
            component: "worker".into(),
            severity: Severity::Info,
            kind: "io".into(),
            message: "transient".into(),
        });
        monitor.drain_reports();
        assert_eq!(monitor.error_count("io"), 1);
        assert!(monitor
            .metrics_snapshot()
            .iter()
            .any(|m| m.name == "frames"));
    }

    #[test]
    fn dead_thread_is_detected_within_two_timeouts() {
        let (monitor, _reporter) = fixture();
        let handle = monitor
            .registry
            .register("processing", crate::registry::ComponentKind::Processing, &[])
            .unwrap();
        let tid = monitor.registry.register_thread(&handle).unwrap();
        // Never tick the thread; sweep after the timeout expires.
        std::thread::sleep(Duration::from_millis(80));
        monitor.tick();
        assert_eq!(monitor.error_count("thread_heartbeat_timeout"), 1);
        assert!(monitor.cleanup_requested());
        let _ = tid;
    }

    #[test]
    fn shutdown_request_is_idempotent_and_visible() {
        let (monitor, _reporter) = fixture();
        assert!(!monitor.is_shutting_down());
        monitor.request_shutdown();
        monitor.request_shutdown();
        assert!(monitor.is_shutting_down());
    }
}
