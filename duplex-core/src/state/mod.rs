//! Component state machine.
//!
//! ## Transition graph
//!
//! ```text
//! UNINITIALIZED → INITIALIZING → IDLE → RUNNING ⇄ PAUSED
//! RUNNING → STOPPING → STOPPED
//! any non-terminal → ERROR
//! IDLE/ERROR → INITIATING_CLEANUP → STOPPING_CAPTURE → FLUSHING_STORAGE
//!   → RELEASING_RESOURCES → CLOSING_LOGS → CLEANUP_COMPLETED
//! any cleanup phase → CLEANUP_FAILED
//! ```
//!
//! Edges outside the graph are rejected and record no event. Invariant
//! predicates registered for a target state are evaluated under the state
//! lock (they may take inner-ranked locks, nothing else); callbacks run
//! strictly after the lock is released and receive the event by value plus a
//! non-blocking [`Reporter`] — they must not call back into the cell.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{DuplexError, Result};
use crate::locks::{LockRank, RankedMutex};
use crate::monitor::Reporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentState {
    Uninitialized,
    Initializing,
    Idle,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
    InitiatingCleanup,
    StoppingCapture,
    FlushingStorage,
    ReleasingResources,
    ClosingLogs,
    CleanupCompleted,
    CleanupFailed,
}

impl ComponentState {
    /// Terminal states admit no further transitions, including to ERROR.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::CleanupCompleted | Self::CleanupFailed)
    }

    /// The five in-flight cleanup phases.
    pub fn is_cleanup_phase(self) -> bool {
        matches!(
            self,
            Self::InitiatingCleanup
                | Self::StoppingCapture
                | Self::FlushingStorage
                | Self::ReleasingResources
                | Self::ClosingLogs
        )
    }

    /// Dependency readiness: a component counts as ready once initialized.
    pub fn is_at_least_idle(self) -> bool {
        matches!(self, Self::Idle | Self::Running | Self::Paused)
    }
}

/// Whether `from → to` is an edge of the fixed transition graph.
pub fn legal_edge(from: ComponentState, to: ComponentState) -> bool {
    use ComponentState::*;
    if from == to {
        return false;
    }
    if to == Error {
        return !from.is_terminal();
    }
    if to == CleanupFailed {
        return from.is_cleanup_phase();
    }
    matches!(
        (from, to),
        (Uninitialized, Initializing)
            | (Initializing, Idle)
            | (Idle, Running)
            | (Running, Paused)
            | (Paused, Running)
            | (Running, Stopping)
            | (Stopping, Stopped)
            | (Idle, InitiatingCleanup)
            | (Error, InitiatingCleanup)
            | (InitiatingCleanup, StoppingCapture)
            | (StoppingCapture, FlushingStorage)
            | (FlushingStorage, ReleasingResources)
            | (ReleasingResources, ClosingLogs)
            | (ClosingLogs, CleanupCompleted)
    )
}

/// One recorded transition. Retained per component in a bounded ring.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionEvent {
    pub component: String,
    pub from: ComponentState,
    pub to: ComponentState,
    pub timestamp: DateTime<Utc>,
    pub cause: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_context: Option<String>,
}

type InvariantFn = Arc<dyn Fn() -> bool + Send + Sync>;
type CallbackFn = Arc<dyn Fn(&TransitionEvent, &Reporter) + Send + Sync>;

struct Invariant {
    name: String,
    target: ComponentState,
    check: InvariantFn,
}

#[derive(Default)]
struct Hooks {
    invariants: Vec<Invariant>,
    callbacks: Vec<CallbackFn>,
}

struct CellInner {
    current: ComponentState,
    history: VecDeque<TransitionEvent>,
    cap: usize,
}

/// Per-component state cell. Owned by the component registry, shared via
/// `Arc` so transitions never require the registry lock.
pub struct StateCell {
    name: String,
    inner: RankedMutex<CellInner>,
    hooks: RankedMutex<Hooks>,
    reporter: Reporter,
}

impl StateCell {
    pub fn new(name: impl Into<String>, history_cap: usize, reporter: Reporter) -> Self {
        Self {
            name: name.into(),
            inner: RankedMutex::new(
                LockRank::State,
                CellInner {
                    current: ComponentState::Uninitialized,
                    history: VecDeque::with_capacity(history_cap.min(64)),
                    cap: history_cap.max(1),
                },
            ),
            hooks: RankedMutex::new(LockRank::Update, Hooks::default()),
            reporter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current(&self) -> ComponentState {
        self.inner.lock().current
    }

    /// Register a predicate evaluated whenever a transition targets `target`.
    /// Predicates run under the state lock: they must be non-blocking and may
    /// only take inner-ranked locks (metrics, queues, pool shelves).
    pub fn register_invariant(
        &self,
        name: impl Into<String>,
        target: ComponentState,
        check: impl Fn() -> bool + Send + Sync + 'static,
    ) {
        self.hooks.lock().invariants.push(Invariant {
            name: name.into(),
            target,
            check: Arc::new(check),
        });
    }

    /// Register a callback invoked after every successful transition, outside
    /// any lock. Callbacks receive the event by value and may only use the
    /// reporter; calling back into the cell from a callback is a bug.
    pub fn on_transition(&self, cb: impl Fn(&TransitionEvent, &Reporter) + Send + Sync + 'static) {
        self.hooks.lock().callbacks.push(Arc::new(cb));
    }

    pub fn transition(&self, to: ComponentState, cause: &str) -> Result<TransitionEvent> {
        self.transition_with_context(to, cause, None)
    }

    pub fn transition_with_context(
        &self,
        to: ComponentState,
        cause: &str,
        error_context: Option<String>,
    ) -> Result<TransitionEvent> {
        let event = {
            let mut inner = self.inner.lock();
            let from = inner.current;
            if !legal_edge(from, to) {
                return Err(DuplexError::InvalidTransition { from, to });
            }

            // Clone the matching predicates out of the hooks table first:
            // they must run with only the state lock held, so a predicate
            // that observes the metrics ring, a queue or a pool shelf stays
            // inside the rank hierarchy.
            let checks: Vec<(String, InvariantFn)> = {
                let hooks = self.hooks.lock();
                hooks
                    .invariants
                    .iter()
                    .filter(|i| i.target == to)
                    .map(|i| (i.name.clone(), Arc::clone(&i.check)))
                    .collect()
            };
            for (name, check) in checks {
                if !(*check)() {
                    return Err(DuplexError::InvariantViolated { name, target: to });
                }
            }

            let event = TransitionEvent {
                component: self.name.clone(),
                from,
                to,
                timestamp: Utc::now(),
                cause: cause.to_string(),
                error_context,
            };
            inner.current = to;
            if inner.history.len() == inner.cap {
                inner.history.pop_front();
            }
            inner.history.push_back(event.clone());
            event
        };

        debug!(component = %self.name, from = ?event.from, to = ?event.to, cause = %event.cause, "state transition");
        self.run_callbacks(&event);
        Ok(event)
    }

    /// Restore the previous event's `from` state when that back-edge is
    /// legal; otherwise force the component to ERROR.
    pub fn rollback(&self) -> Result<ComponentState> {
        enum Verdict {
            RolledBack(TransitionEvent),
            Errored(TransitionEvent, String),
            Stuck,
        }

        let verdict = {
            let mut inner = self.inner.lock();
            let current = inner.current;
            let Some(last) = inner.history.back() else {
                return Err(DuplexError::RollbackFailed {
                    component: self.name.clone(),
                    reason: "no transition history".into(),
                });
            };
            let target = last.from;

            if legal_edge(current, target) {
                let event = TransitionEvent {
                    component: self.name.clone(),
                    from: current,
                    to: target,
                    timestamp: Utc::now(),
                    cause: "rollback".into(),
                    error_context: None,
                };
                inner.current = target;
                if inner.history.len() == inner.cap {
                    inner.history.pop_front();
                }
                inner.history.push_back(event.clone());
                Verdict::RolledBack(event)
            } else if legal_edge(current, ComponentState::Error) {
                let reason = format!("back-edge {current:?} -> {target:?} is not legal");
                let event = TransitionEvent {
                    component: self.name.clone(),
                    from: current,
                    to: ComponentState::Error,
                    timestamp: Utc::now(),
                    cause: "rollback rejected".into(),
                    error_context: Some(reason.clone()),
                };
                inner.current = ComponentState::Error;
                if inner.history.len() == inner.cap {
                    inner.history.pop_front();
                }
                inner.history.push_back(event.clone());
                Verdict::Errored(event, reason)
            } else {
                Verdict::Stuck
            }
        };

        match verdict {
            Verdict::RolledBack(event) => {
                let state = event.to;
                self.run_callbacks(&event);
                Ok(state)
            }
            Verdict::Errored(event, reason) => {
                warn!(component = %self.name, %reason, "rollback forced ERROR");
                self.run_callbacks(&event);
                Err(DuplexError::RollbackFailed {
                    component: self.name.clone(),
                    reason,
                })
            }
            Verdict::Stuck => Err(DuplexError::RollbackFailed {
                component: self.name.clone(),
                reason: "no legal rollback from a terminal state".into(),
            }),
        }
    }

    /// Drive the component to ERROR if that edge is legal from the current
    /// state. Terminal states are left untouched.
    pub fn mark_error(&self, cause: &str, context: Option<String>) -> Result<()> {
        match self.transition_with_context(ComponentState::Error, cause, context) {
            Ok(_) => Ok(()),
            Err(DuplexError::InvalidTransition { from, .. }) if from == ComponentState::Error => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Events in insertion order, oldest first.
    pub fn history(&self) -> Vec<TransitionEvent> {
        self.inner.lock().history.iter().cloned().collect()
    }

    fn run_callbacks(&self, event: &TransitionEvent) {
        let callbacks: Vec<CallbackFn> = self.hooks.lock().callbacks.clone();
        for cb in callbacks {
            (*cb)(event, &self.reporter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Reporter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cell(name: &str) -> StateCell {
        StateCell::new(name, 256, Reporter::disconnected())
    }

    fn walk(cell: &StateCell, states: &[ComponentState]) {
        for s in states {
            cell.transition(*s, "test").unwrap();
        }
    }

    #[test]
    fn worker_lifecycle_walk() {
        use ComponentState::*;
        let c = cell("worker");
        walk(&c, &[Initializing, Idle, Running, Paused, Running, Stopping, Stopped]);
        assert_eq!(c.current(), Stopped);
        assert_eq!(c.history().len(), 7);
    }

    #[test]
    fn cleanup_chain_from_idle() {
        use ComponentState::*;
        let c = cell("system");
        walk(
            &c,
            &[
                Initializing,
                Idle,
                InitiatingCleanup,
                StoppingCapture,
                FlushingStorage,
                ReleasingResources,
                ClosingLogs,
                CleanupCompleted,
            ],
        );
        assert_eq!(c.current(), CleanupCompleted);
    }

    #[test]
    fn illegal_edge_is_rejected_without_recording() {
        use ComponentState::*;
        let c = cell("worker");
        walk(&c, &[Initializing, Idle, Running]);
        let before = c.history().len();

        let err = c.transition(Initializing, "test").unwrap_err();
        assert!(matches!(
            err,
            DuplexError::InvalidTransition {
                from: Running,
                to: Initializing
            }
        ));
        assert_eq!(c.current(), Running);
        assert_eq!(c.history().len(), before);
    }

    #[test]
    fn error_reachable_from_non_terminal_only() {
        use ComponentState::*;
        let c = cell("worker");
        walk(&c, &[Initializing, Idle, Running]);
        c.transition(Error, "fault").unwrap();
        assert_eq!(c.current(), Error);
        c.transition(InitiatingCleanup, "cleanup").unwrap();

        let done = cell("done");
        walk(
            &done,
            &[
                Initializing,
                Idle,
                InitiatingCleanup,
                StoppingCapture,
                FlushingStorage,
                ReleasingResources,
                ClosingLogs,
                CleanupCompleted,
            ],
        );
        assert!(done.transition(Error, "fault").is_err());
    }

    #[test]
    fn cleanup_phases_can_fail() {
        use ComponentState::*;
        let c = cell("system");
        walk(&c, &[Initializing, Idle, InitiatingCleanup, StoppingCapture]);
        c.transition(CleanupFailed, "step failed").unwrap();
        assert_eq!(c.current(), CleanupFailed);
    }

    #[test]
    fn history_ring_evicts_oldest() {
        use ComponentState::*;
        let c = StateCell::new("worker", 4, Reporter::disconnected());
        walk(&c, &[Initializing, Idle, Running]);
        for _ in 0..5 {
            c.transition(Paused, "bounce").unwrap();
            c.transition(Running, "bounce").unwrap();
        }
        let history = c.history();
        assert_eq!(history.len(), 4);
        // Newest entry is the final Paused→Running bounce.
        assert_eq!(history.last().unwrap().to, Running);
    }

    #[test]
    fn invariant_vetoes_transition() {
        use ComponentState::*;
        let c = cell("worker");
        walk(&c, &[Initializing, Idle]);
        c.register_invariant("never-runs", Running, || false);

        let err = c.transition(Running, "test").unwrap_err();
        assert!(matches!(err, DuplexError::InvariantViolated { .. }));
        assert_eq!(c.current(), Idle);
        assert_eq!(c.history().len(), 2);
    }

    #[test]
    fn invariants_may_observe_inner_ranked_locks() {
        use crate::locks::{LockRank, RankedMutex};
        use ComponentState::*;

        // Stands in for a queue interior or pool shelf a predicate inspects.
        let depth = Arc::new(RankedMutex::new(LockRank::Update, 0usize));
        let c = cell("worker");
        walk(&c, &[Initializing, Idle]);

        let depth2 = Arc::clone(&depth);
        c.register_invariant("queues-empty", Running, move || *depth2.lock() == 0);
        c.transition(Running, "test").unwrap();

        *depth.lock() = 5;
        c.transition(Paused, "pause").unwrap();
        let err = c.transition(Running, "resume").unwrap_err();
        assert!(matches!(err, DuplexError::InvariantViolated { .. }));
        assert_eq!(c.current(), Paused);
    }

    #[test]
    fn callbacks_run_outside_the_state_lock() {
        use ComponentState::*;
        let c = Arc::new(cell("worker"));
        let seen = Arc::new(AtomicUsize::new(0));

        let c2 = Arc::clone(&c);
        let seen2 = Arc::clone(&seen);
        c.on_transition(move |event, _reporter| {
            // Would deadlock if the state lock were still held.
            let _ = c2.current();
            assert_eq!(event.component, "worker");
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        walk(&c, &[Initializing, Idle]);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rollback_restores_prior_state_on_legal_back_edge() {
        use ComponentState::*;
        let c = cell("worker");
        walk(&c, &[Initializing, Idle, Running, Paused]);
        assert_eq!(c.rollback().unwrap(), Running);
        assert_eq!(c.current(), Running);
    }

    #[test]
    fn rollback_without_legal_back_edge_forces_error() {
        use ComponentState::*;
        let c = cell("worker");
        walk(&c, &[Initializing, Idle]);
        // Back-edge Idle → Initializing is not in the graph.
        let err = c.rollback().unwrap_err();
        assert!(matches!(err, DuplexError::RollbackFailed { .. }));
        assert_eq!(c.current(), Error);
    }
}
