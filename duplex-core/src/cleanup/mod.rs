//! Ordered cleanup coordinator.
//!
//! Teardown is a fixed walk of five phases, mirrored one-to-one onto the
//! cleanup states of the component state machine:
//!
//! ```text
//! INITIATING → STOPPING_CAPTURE → FLUSHING_STORAGE
//!            → RELEASING_RESOURCES → CLOSING_LOGS → COMPLETED
//! ```
//!
//! Steps register with a phase, dependencies, a handler and a verifier.
//! Within a phase steps run in topological order; a failed verification
//! retries the handler with exponential backoff, and a persistently failing
//! step fails its phase and skips its transitive dependents. Handlers must be
//! idempotent (safe to run twice); verifiers must be side-effect-free.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{DuplexError, Result};
use crate::locks::{LockRank, RankedMutex};
use crate::monitor::{ErrorReport, Reporter, Severity};
use crate::state::{ComponentState, StateCell};

/// Cleanup phases in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPhase {
    Initiating,
    StoppingCapture,
    FlushingStorage,
    ReleasingResources,
    ClosingLogs,
}

impl CleanupPhase {
    pub const ALL: [CleanupPhase; 5] = [
        CleanupPhase::Initiating,
        CleanupPhase::StoppingCapture,
        CleanupPhase::FlushingStorage,
        CleanupPhase::ReleasingResources,
        CleanupPhase::ClosingLogs,
    ];

    /// The state-machine state this phase executes under.
    pub fn state(self) -> ComponentState {
        match self {
            CleanupPhase::Initiating => ComponentState::InitiatingCleanup,
            CleanupPhase::StoppingCapture => ComponentState::StoppingCapture,
            CleanupPhase::FlushingStorage => ComponentState::FlushingStorage,
            CleanupPhase::ReleasingResources => ComponentState::ReleasingResources,
            CleanupPhase::ClosingLogs => ComponentState::ClosingLogs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
    Skipped,
}

type StepHandler = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;
type StepVerifier = Arc<dyn Fn() -> bool + Send + Sync>;

/// Registration defaults.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_STATE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct StepSpec {
    pub name: String,
    pub phase: CleanupPhase,
    pub depends_on: Vec<String>,
    pub handler: StepHandler,
    pub verifier: StepVerifier,
    pub max_retries: u32,
    pub state_timeout: Duration,
}

struct RegisteredStep {
    spec: StepSpec,
    status: StepStatus,
    attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub name: String,
    pub phase: CleanupPhase,
    pub status: StepStatus,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub steps: Vec<StepReport>,
    pub failed_phase: Option<CleanupPhase>,
}

impl CleanupReport {
    pub fn succeeded(&self) -> bool {
        self.failed_phase.is_none()
    }
}

enum DepVerdict {
    Ready,
    Blocked(String),
}

pub struct CleanupCoordinator {
    state: Arc<StateCell>,
    reporter: Reporter,
    steps: RankedMutex<Vec<RegisteredStep>>,
    backoff_base: Duration,
}

impl CleanupCoordinator {
    /// `state` is the system component's cell; the walk drives it through
    /// the cleanup states.
    pub fn new(state: Arc<StateCell>, reporter: Reporter) -> Self {
        Self {
            state,
            reporter,
            steps: RankedMutex::new(LockRank::Update, Vec::new()),
            backoff_base: Duration::from_millis(100),
        }
    }

    /// Shrink the retry backoff base (tests).
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Register a step with default retry budget and timeout. Re-registering
    /// a name replaces the previous registration and resets its status —
    /// handlers are idempotent by contract, so a re-run converges to the same
    /// state.
    pub fn register_step(
        &self,
        name: &str,
        phase: CleanupPhase,
        depends_on: &[&str],
        handler: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
        verifier: impl Fn() -> bool + Send + Sync + 'static,
    ) {
        self.register_step_spec(StepSpec {
            name: name.to_string(),
            phase,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            handler: Arc::new(handler),
            verifier: Arc::new(verifier),
            max_retries: DEFAULT_MAX_RETRIES,
            state_timeout: DEFAULT_STATE_TIMEOUT,
        });
    }

    pub fn register_step_spec(&self, spec: StepSpec) {
        let mut steps = self.steps.lock();
        if let Some(existing) = steps.iter_mut().find(|s| s.spec.name == spec.name) {
            existing.spec = spec;
            existing.status = StepStatus::Pending;
            existing.attempts = 0;
        } else {
            steps.push(RegisteredStep {
                spec,
                status: StepStatus::Pending,
                attempts: 0,
            });
        }
    }

    /// Run the phase walk. Already-completed steps are left alone, so a
    /// second execution after success is a no-op returning the same report.
    pub fn execute(&self) -> Result<CleanupReport> {
        if self.state.current() == ComponentState::CleanupCompleted {
            debug!("cleanup already completed — nothing to do");
            return Ok(self.report());
        }

        self.state
            .transition(ComponentState::InitiatingCleanup, "cleanup requested")?;
        info!("cleanup started");

        for phase in CleanupPhase::ALL {
            if phase != CleanupPhase::Initiating {
                self.state.transition(phase.state(), "cleanup phase")?;
            }

            self.run_phase(phase);

            let phase_failed = {
                let steps = self.steps.lock();
                steps
                    .iter()
                    .any(|s| s.spec.phase == phase && s.status == StepStatus::Failed)
            };
            if phase_failed {
                warn!(?phase, "cleanup phase failed");
                self.state
                    .transition(ComponentState::CleanupFailed, "phase failed")?;
                self.reporter.error(ErrorReport {
                    component: self.state.name().to_string(),
                    severity: Severity::Critical,
                    kind: "phase_failed".into(),
                    message: format!("cleanup phase {phase:?} failed"),
                });
                return Err(DuplexError::PhaseFailed { phase });
            }
        }

        self.state
            .transition(ComponentState::CleanupCompleted, "all phases completed")?;
        info!("cleanup completed");
        Ok(self.report())
    }

    fn run_phase(&self, phase: CleanupPhase) {
        for name in self.phase_order(phase) {
            let ready = self.dependencies_completed(&name);
            match ready {
                DepVerdict::Ready => self.run_step(&name),
                DepVerdict::Blocked(dep) => {
                    debug!(step = %name, blocked_on = %dep, "cleanup step skipped");
                    self.set_status(&name, StepStatus::Skipped);
                }
            }
        }
    }

    /// Topological order of this phase's pending steps (registration order
    /// among independents). A dependency cycle marks its members failed.
    fn phase_order(&self, phase: CleanupPhase) -> Vec<String> {
        let (order, cyclic) = {
            let steps = self.steps.lock();
            let members: Vec<&RegisteredStep> = steps
                .iter()
                .filter(|s| s.spec.phase == phase && s.status == StepStatus::Pending)
                .collect();
            let names: HashSet<&str> = members.iter().map(|s| s.spec.name.as_str()).collect();

            let mut indegree: HashMap<&str, usize> = HashMap::new();
            let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
            for step in &members {
                let same_phase_deps = step
                    .spec
                    .depends_on
                    .iter()
                    .filter(|d| names.contains(d.as_str()))
                    .count();
                indegree.insert(step.spec.name.as_str(), same_phase_deps);
                for dep in &step.spec.depends_on {
                    if names.contains(dep.as_str()) {
                        dependents
                            .entry(dep.as_str())
                            .or_default()
                            .push(step.spec.name.as_str());
                    }
                }
            }

            let mut queue: VecDeque<&str> = members
                .iter()
                .filter(|s| indegree[s.spec.name.as_str()] == 0)
                .map(|s| s.spec.name.as_str())
                .collect();
            let mut order: Vec<String> = Vec::with_capacity(members.len());
            while let Some(name) = queue.pop_front() {
                order.push(name.to_string());
                for dependent in dependents.get(name).cloned().unwrap_or_default() {
                    let d = indegree.get_mut(dependent).expect("indegree entry");
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(dependent);
                    }
                }
            }

            let cyclic: Vec<String> = members
                .iter()
                .map(|s| s.spec.name.clone())
                .filter(|n| !order.contains(n))
                .collect();
            (order, cyclic)
        };

        for name in cyclic {
            warn!(step = %name, "cleanup step is part of a dependency cycle");
            self.set_status(&name, StepStatus::Failed);
        }
        order
    }

    fn dependencies_completed(&self, name: &str) -> DepVerdict {
        let steps = self.steps.lock();
        let Some(step) = steps.iter().find(|s| s.spec.name == name) else {
            return DepVerdict::Ready;
        };
        for dep in &step.spec.depends_on {
            match steps.iter().find(|s| s.spec.name == *dep) {
                Some(d) if d.status == StepStatus::Completed => {}
                Some(d) => return DepVerdict::Blocked(format!("{dep} ({:?})", d.status)),
                None => return DepVerdict::Blocked(format!("{dep} (unregistered)")),
            }
        }
        DepVerdict::Ready
    }

    fn run_step(&self, name: &str) {
        // Pull what the attempt loop needs without holding the lock across
        // handler calls: handlers flush files, join threads, touch the pool.
        let (max_retries, state_timeout) = {
            let steps = self.steps.lock();
            let step = steps.iter().find(|s| s.spec.name == name).expect("step");
            (step.spec.max_retries, step.spec.state_timeout)
        };

        let started = Instant::now();
        let mut attempts = 0u32;
        let completed = loop {
            attempts += 1;
            let outcome = self.attempt(name);
            match outcome {
                Ok(true) => break true,
                Ok(false) => {
                    debug!(step = %name, attempts, "cleanup verifier rejected step");
                }
                Err(cause) => {
                    debug!(step = %name, attempts, %cause, "cleanup handler failed");
                }
            }
            if attempts > max_retries || started.elapsed() >= state_timeout {
                break false;
            }
            let backoff = self.backoff_base * 2u32.saturating_pow(attempts - 1);
            std::thread::sleep(backoff);
        };

        {
            let mut steps = self.steps.lock();
            if let Some(step) = steps.iter_mut().find(|s| s.spec.name == name) {
                step.attempts += attempts;
                step.status = if completed {
                    StepStatus::Completed
                } else {
                    StepStatus::Failed
                };
            }
        }

        if completed {
            debug!(step = %name, attempts, "cleanup step completed");
        } else {
            warn!(step = %name, attempts, "cleanup step failed");
            self.reporter.error(ErrorReport {
                component: self.state.name().to_string(),
                severity: Severity::Error,
                kind: "step_failed".into(),
                message: format!("cleanup step {name} failed after {attempts} attempts"),
            });
            self.skip_transitive_dependents(name);
        }
    }

    /// One handler+verifier attempt. `Ok(true)` = verified, `Ok(false)` =
    /// verifier rejected, `Err` = handler error. The handler runs with the
    /// step table unlocked — handlers flush files, join threads and touch
    /// the pool.
    fn attempt(&self, name: &str) -> std::result::Result<bool, String> {
        let (handler, verifier) = {
            let steps = self.steps.lock();
            let step = steps.iter().find(|s| s.spec.name == name).expect("step");
            (Arc::clone(&step.spec.handler), Arc::clone(&step.spec.verifier))
        };
        match (*handler)() {
            Ok(()) => Ok((*verifier)()),
            Err(e) => Err(e.to_string()),
        }
    }

    fn skip_transitive_dependents(&self, failed: &str) {
        let mut steps = self.steps.lock();
        let mut tainted: HashSet<String> = HashSet::new();
        tainted.insert(failed.to_string());
        loop {
            let mut changed = false;
            for step in steps.iter_mut() {
                if step.status != StepStatus::Pending {
                    continue;
                }
                if step.spec.depends_on.iter().any(|d| tainted.contains(d)) {
                    step.status = StepStatus::Skipped;
                    tainted.insert(step.spec.name.clone());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn set_status(&self, name: &str, status: StepStatus) {
        let mut steps = self.steps.lock();
        if let Some(step) = steps.iter_mut().find(|s| s.spec.name == name) {
            step.status = status;
        }
    }

    fn report(&self) -> CleanupReport {
        let steps = self.steps.lock();
        let failed_phase = steps
            .iter()
            .find(|s| s.status == StepStatus::Failed)
            .map(|s| s.spec.phase);
        CleanupReport {
            steps: steps
                .iter()
                .map(|s| StepReport {
                    name: s.spec.name.clone(),
                    phase: s.spec.phase,
                    status: s.status,
                    attempts: s.attempts,
                })
                .collect(),
            failed_phase,
        }
    }

    pub fn step_status(&self, name: &str) -> Option<StepStatus> {
        self.steps
            .lock()
            .iter()
            .find(|s| s.spec.name == name)
            .map(|s| s.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Reporter;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn system_cell() -> Arc<StateCell> {
        let cell = Arc::new(StateCell::new("system", 64, Reporter::disconnected()));
        cell.transition(ComponentState::Initializing, "init").unwrap();
        cell.transition(ComponentState::Idle, "ready").unwrap();
        cell
    }

    fn coordinator(cell: &Arc<StateCell>) -> CleanupCoordinator {
        CleanupCoordinator::new(Arc::clone(cell), Reporter::disconnected())
            .with_backoff_base(Duration::from_millis(1))
    }

    #[test]
    fn walks_all_phases_and_completes() {
        let cell = system_cell();
        let c = coordinator(&cell);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, phase) in [
            ("close-journal", CleanupPhase::ClosingLogs),
            ("stop-capture", CleanupPhase::StoppingCapture),
            ("flush-left", CleanupPhase::FlushingStorage),
            ("drain-queues", CleanupPhase::ReleasingResources),
        ] {
            let order2 = Arc::clone(&order);
            c.register_step(
                name,
                phase,
                &[],
                move || {
                    order2.lock().push(name.to_string());
                    Ok(())
                },
                || true,
            );
        }

        let report = c.execute().unwrap();
        assert!(report.succeeded());
        assert_eq!(cell.current(), ComponentState::CleanupCompleted);
        // Registration order is scrambled; phase order is not.
        assert_eq!(
            &*order.lock(),
            &["stop-capture", "flush-left", "drain-queues", "close-journal"]
        );
    }

    #[test]
    fn dependencies_order_steps_within_a_phase() {
        let cell = system_cell();
        let c = coordinator(&cell);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, deps) in [("c", vec!["b"]), ("a", vec![]), ("b", vec!["a"])] {
            let order2 = Arc::clone(&order);
            let deps: Vec<&str> = deps.iter().copied().collect();
            let tag = name.to_string();
            c.register_step(
                name,
                CleanupPhase::ReleasingResources,
                &deps,
                move || {
                    order2.lock().push(tag.clone());
                    Ok(())
                },
                || true,
            );
        }

        c.execute().unwrap();
        assert_eq!(&*order.lock(), &["a", "b", "c"]);
    }

    #[test]
    fn failing_verifier_retries_then_fails_phase_and_skips_dependents() {
        let cell = system_cell();
        let c = coordinator(&cell);
        let calls = Arc::new(AtomicUsize::new(0));

        let calls2 = Arc::clone(&calls);
        c.register_step(
            "flush-left",
            CleanupPhase::FlushingStorage,
            &[],
            move || {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            || false,
        );
        c.register_step(
            "verify-left",
            CleanupPhase::FlushingStorage,
            &["flush-left"],
            || Ok(()),
            || true,
        );
        c.register_step(
            "close-journal",
            CleanupPhase::ClosingLogs,
            &["flush-left"],
            || Ok(()),
            || true,
        );

        let err = c.execute().unwrap_err();
        assert!(matches!(
            err,
            DuplexError::PhaseFailed {
                phase: CleanupPhase::FlushingStorage
            }
        ));
        // Initial attempt + DEFAULT_MAX_RETRIES retries.
        assert_eq!(calls.load(Ordering::SeqCst), (DEFAULT_MAX_RETRIES + 1) as usize);
        assert_eq!(c.step_status("flush-left"), Some(StepStatus::Failed));
        assert_eq!(c.step_status("verify-left"), Some(StepStatus::Skipped));
        assert_eq!(c.step_status("close-journal"), Some(StepStatus::Skipped));
        assert_eq!(cell.current(), ComponentState::CleanupFailed);
    }

    #[test]
    fn handler_error_then_success_completes_with_retry() {
        let cell = system_cell();
        let c = coordinator(&cell);
        let calls = Arc::new(AtomicUsize::new(0));

        let calls2 = Arc::clone(&calls);
        c.register_step(
            "flaky",
            CleanupPhase::StoppingCapture,
            &[],
            move || {
                if calls2.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("first attempt loses");
                }
                Ok(())
            },
            || true,
        );

        let report = c.execute().unwrap();
        assert!(report.succeeded());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(c.step_status("flaky"), Some(StepStatus::Completed));
    }

    #[test]
    fn reexecution_after_success_is_a_noop() {
        let cell = system_cell();
        let c = coordinator(&cell);
        let calls = Arc::new(AtomicUsize::new(0));

        let calls2 = Arc::clone(&calls);
        c.register_step(
            "idempotent",
            CleanupPhase::ReleasingResources,
            &[],
            move || {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            || true,
        );

        c.execute().unwrap();
        let second = c.execute().unwrap();
        assert!(second.succeeded());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cell.current(), ComponentState::CleanupCompleted);
    }

    #[test]
    fn cleanup_can_start_from_error_state() {
        let cell = system_cell();
        cell.mark_error("fault", None).unwrap();
        let c = coordinator(&cell);
        c.register_step("noop", CleanupPhase::ClosingLogs, &[], || Ok(()), || true);
        let report = c.execute().unwrap();
        assert!(report.succeeded());
        assert_eq!(cell.current(), ComponentState::CleanupCompleted);
    }

    #[test]
    fn step_dependency_cycles_fail_the_phase() {
        let cell = system_cell();
        let c = coordinator(&cell);
        c.register_step("x", CleanupPhase::ClosingLogs, &["y"], || Ok(()), || true);
        c.register_step("y", CleanupPhase::ClosingLogs, &["x"], || Ok(()), || true);

        let err = c.execute().unwrap_err();
        assert!(matches!(
            err,
            DuplexError::PhaseFailed {
                phase: CleanupPhase::ClosingLogs
            }
        ));
    }
}
