//! Core configuration.
//!
//! Every tunable the pipeline honors lives here with its documented default.
//! `duplex-cli` maps command-line flags and `AT_*` environment variables onto
//! this struct; the library itself never reads the environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queues::OverflowPolicy;

/// Which capture channels are live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    /// System/loopback audio only (left channel).
    Loopback,
    /// Microphone only (right channel).
    Mic,
    /// Both channels (default).
    Both,
}

impl ChannelMode {
    pub fn left_enabled(self) -> bool {
        matches!(self, Self::Loopback | Self::Both)
    }

    pub fn right_enabled(self) -> bool {
        matches!(self, Self::Mic | Self::Both)
    }
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Root of recordings, logs and emergency backups.
    pub working_dir: PathBuf,
    /// Active channels. Default: both.
    pub channels: ChannelMode,
    /// Sample rate in Hz. Default: 16000.
    pub sample_rate: u32,
    /// Frame length the capture callback delivers, in milliseconds.
    /// The callback must never block longer than one frame.
    pub frame_ms: u32,

    /// Capture queue capacity per channel. Default: 1000.
    pub capture_queue: usize,
    /// Processing queue capacity per channel. Default: 500.
    pub processing_queue: usize,
    /// Storage queue capacity per channel. Default: 250.
    pub storage_queue: usize,
    /// What `put` does on a full queue. Default: drop oldest.
    pub overflow_policy: OverflowPolicy,
    /// Per-stage |depth(left) - depth(right)| above which a skew warning
    /// metric is emitted. Default: 64.
    pub channel_skew_threshold: usize,

    /// Max SMALL (4 KiB) buffers. Default: 256.
    pub pool_small: usize,
    /// Max MEDIUM (64 KiB) buffers. Default: 64.
    pub pool_medium: usize,
    /// Max LARGE (1 MiB) buffers. Default: 16.
    pub pool_large: usize,
    /// Bound on any single pool wait. Default: 50 ms.
    pub allocation_timeout: Duration,
    /// Per-component buffer quota per tier. Default: half of each tier cap.
    pub component_quota: Option<[usize; 3]>,

    /// Flush when a channel's buffered bytes reach this. A value of 0 means
    /// 80 % of `write_buffer_bytes`. Default: 0.
    pub flush_bytes: usize,
    /// Per-channel write-buffer capacity in bytes. Default: 1 MiB.
    pub write_buffer_bytes: usize,
    /// Flush when the oldest buffered entry reaches this age. Default: 1 s.
    pub flush_age: Duration,
    /// Flush when the storage queue has been idle this long. Default: 200 ms.
    pub idle_flush: Duration,
    /// Retries after a failed flush attempt before a batch is routed to
    /// emergency backup. Default: 3.
    pub flush_max_retries: u32,

    /// A registered thread silent for this long is reported dead.
    /// Default: 10 s.
    pub thread_timeout: Duration,
    /// Monitor loop tick. Default: 500 ms; clamped to at most half of
    /// `thread_timeout` so a dead thread is seen within 2x the timeout.
    pub monitor_interval: Duration,

    /// Transition-history ring size per component. Default: 256.
    pub history_cap: usize,
    /// Bounded wait used by worker `get`/`put` calls. Default: 100 ms.
    pub stage_wait: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            channels: ChannelMode::Both,
            sample_rate: 16_000,
            frame_ms: 10,
            capture_queue: 1000,
            processing_queue: 500,
            storage_queue: 250,
            overflow_policy: OverflowPolicy::DropOldest,
            channel_skew_threshold: 64,
            pool_small: 256,
            pool_medium: 64,
            pool_large: 16,
            allocation_timeout: Duration::from_millis(50),
            component_quota: None,
            flush_bytes: 0,
            write_buffer_bytes: 1 << 20,
            flush_age: Duration::from_millis(1000),
            idle_flush: Duration::from_millis(200),
            flush_max_retries: 3,
            thread_timeout: Duration::from_secs(10),
            monitor_interval: Duration::from_millis(500),
            history_cap: 256,
            stage_wait: Duration::from_millis(100),
        }
    }
}

impl CoreConfig {
    /// Samples per frame per channel at the configured rate.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    /// Effective flush-bytes threshold (resolves the 0 = 80 % rule).
    pub fn effective_flush_bytes(&self) -> usize {
        if self.flush_bytes == 0 {
            (self.write_buffer_bytes / 5) * 4
        } else {
            self.flush_bytes
        }
    }

    /// Clamp obviously unusable values into a workable range. Mirrors the
    /// normalization the CLI applies before handing the config to the engine.
    pub fn normalize(&mut self) {
        self.sample_rate = self.sample_rate.clamp(8_000, 192_000);
        self.frame_ms = self.frame_ms.clamp(1, 100);
        self.capture_queue = self.capture_queue.max(2);
        self.processing_queue = self.processing_queue.max(2);
        self.storage_queue = self.storage_queue.max(2);
        self.pool_small = self.pool_small.max(2);
        self.pool_medium = self.pool_medium.max(2);
        self.pool_large = self.pool_large.max(1);
        self.history_cap = self.history_cap.max(8);
        if self.monitor_interval > self.thread_timeout / 2 {
            self.monitor_interval = (self.thread_timeout / 2).max(Duration::from_millis(10));
        }
    }
}
