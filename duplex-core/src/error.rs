use std::path::PathBuf;

use thiserror::Error;

use crate::cleanup::CleanupPhase;
use crate::pool::Tier;
use crate::queues::{Channel, Stage};
use crate::state::ComponentState;

/// All errors produced by duplex-core.
///
/// Every variant maps to a stable kind label via [`DuplexError::kind`]; the
/// monitoring coordinator counts errors per kind, so no error is ever
/// discarded without a trace.
#[derive(Debug, Error)]
pub enum DuplexError {
    // ── Resource ─────────────────────────────────────────────────────────
    #[error("{tier:?} buffer pool exhausted")]
    PoolExhausted { tier: Tier },

    #[error("allocation timed out waiting for the pool")]
    AllocationTimeout,

    #[error("buffer {id} was already released")]
    AlreadyReleased { id: u64 },

    #[error("buffer {id} is unknown to this pool")]
    UnknownBuffer { id: u64 },

    // ── Queue ────────────────────────────────────────────────────────────
    #[error("queue {stage:?}/{channel:?} is full")]
    QueueFull { stage: Stage, channel: Channel },

    #[error("queue {stage:?}/{channel:?} is empty")]
    QueueEmpty { stage: Stage, channel: Channel },

    #[error("shutdown in progress")]
    Shutdown,

    // ── State ────────────────────────────────────────────────────────────
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ComponentState,
        to: ComponentState,
    },

    #[error("invariant {name} violated entering {target:?}")]
    InvariantViolated {
        name: String,
        target: ComponentState,
    },

    #[error("rollback failed for {component}: {reason}")]
    RollbackFailed { component: String, reason: String },

    // ── Component ────────────────────────────────────────────────────────
    #[error("dependency {name} is not ready")]
    DependencyNotReady { name: String },

    #[error("thread {tid} missed its heartbeat deadline")]
    ThreadHeartbeatTimeout { tid: u64 },

    #[error("unknown component {name}")]
    UnknownComponent { name: String },

    #[error("component {name} is already registered")]
    DuplicateComponent { name: String },

    #[error("dependency cycle involving {name}")]
    DependencyCycle { name: String },

    #[error("component {component} exceeded its {tier:?} quota")]
    QuotaExceeded { component: String, tier: Tier },

    // ── Cleanup ──────────────────────────────────────────────────────────
    #[error("cleanup step {name} failed: {cause}")]
    StepFailed { name: String, cause: String },

    #[error("cleanup step {name} failed verification")]
    VerifierFailed { name: String },

    #[error("cleanup phase {phase:?} failed")]
    PhaseFailed { phase: CleanupPhase },

    // ── Storage ──────────────────────────────────────────────────────────
    #[error("flush failed after {attempts} attempts: {cause}")]
    FlushFailed { attempts: u32, cause: String },

    #[error("emergency backup failed: {cause}")]
    EmergencyBackupFailed { cause: String },

    #[error("checksum mismatch for {path}")]
    ChecksumMismatch { path: PathBuf },

    // ── Lifecycle ────────────────────────────────────────────────────────
    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DuplexError {
    /// Stable label used as the key of the per-kind error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::AllocationTimeout => "allocation_timeout",
            Self::AlreadyReleased { .. } => "already_released",
            Self::UnknownBuffer { .. } => "unknown_buffer",
            Self::QueueFull { .. } => "queue_full",
            Self::QueueEmpty { .. } => "queue_empty",
            Self::Shutdown => "shutdown",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvariantViolated { .. } => "invariant_violated",
            Self::RollbackFailed { .. } => "rollback_failed",
            Self::DependencyNotReady { .. } => "dependency_not_ready",
            Self::ThreadHeartbeatTimeout { .. } => "thread_heartbeat_timeout",
            Self::UnknownComponent { .. } => "unknown_component",
            Self::DuplicateComponent { .. } => "duplicate_component",
            Self::DependencyCycle { .. } => "dependency_cycle",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::StepFailed { .. } => "step_failed",
            Self::VerifierFailed { .. } => "verifier_failed",
            Self::PhaseFailed { .. } => "phase_failed",
            Self::FlushFailed { .. } => "flush_failed",
            Self::EmergencyBackupFailed { .. } => "emergency_backup_failed",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::AlreadyRunning => "already_running",
            Self::NotRunning => "not_running",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, DuplexError>;
