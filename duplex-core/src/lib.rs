//! # duplex-core
//!
//! Two-channel audio capture pipeline core: the concurrency, resource and
//! state fabric that keeps a loopback+microphone recorder safe under
//! long-running load.
//!
//! ## Architecture
//!
//! ```text
//! capture callback → SPSC ring → capture worker
//!                                     │ (pooled buffers, per channel)
//!                        [capture q] → processing → [processing q]
//!                                     │
//!                        [storage q] → writer → StorageManager → WAV + CRC-32C
//!
//! MonitorCoordinator: metrics / errors / shutdown flag / lock-rank root
//! ComponentCoordinator: registry, dependencies, thread heartbeats
//! CleanupCoordinator: INITIATING → … → CLOSING_LOGS phase walk
//! ```
//!
//! The capture callback is wait-free. Every worker wait is bounded and
//! observes the shared shutdown flag; every lock carries a rank checked in
//! debug builds (state → metrics → performance → component → update).

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod config;
pub mod error;
pub mod locks;
pub mod monitor;
pub mod pipeline;
pub mod pool;
pub mod queues;
pub mod registry;
pub mod state;
pub mod storage;

// Convenience re-exports for downstream crates
pub use cleanup::{CleanupCoordinator, CleanupPhase, CleanupReport};
pub use config::{ChannelMode, CoreConfig};
pub use error::{DuplexError, Result};
pub use monitor::{MonitorCoordinator, Reporter, Severity};
pub use pipeline::{DuplexEngine, StopReason};
pub use pool::{CleanupStage, PoolStats, PooledBuffer, Tier, TieredPool};
pub use queues::{Channel, OverflowPolicy, Stage, StageQueues};
pub use registry::{ComponentCoordinator, ComponentHandle, ComponentKind};
pub use state::{ComponentState, StateCell, TransitionEvent};
pub use storage::{StorageManager, StorageStats};
