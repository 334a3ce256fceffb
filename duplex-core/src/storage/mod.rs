//! Storage manager.
//!
//! Per-channel bounded write buffers of sequenced batches. A flush fires when
//! any of three triggers holds: buffered bytes over the threshold, the oldest
//! entry over the age limit, or the storage stage idle past the idle window.
//! Flushing is single-writer per channel (IDLE → FLUSHING_BUFFERS → IDLE); a
//! flush requested while one is running is a counted no-op.
//!
//! Every flushed batch becomes `<seq>.wav` plus a `<seq>.wav.sum` sidecar
//! holding the CRC-32C of the PCM payload as eight hex chars. A batch that
//! keeps failing after the retry budget is routed to the emergency backup
//! tree with the same layout; sequence numbers are assigned at submit time,
//! so they stay gap-free per channel no matter where batches land.

pub mod session;

use std::collections::VecDeque;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crc::{Crc, CRC_32_ISCSI};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{DuplexError, Result};
use crate::locks::{LockRank, RankedMutex};
use crate::monitor::{ErrorReport, Reporter, Severity};
use crate::queues::Channel;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// CRC-32C (Castagnoli) of a payload, as written to `.sum` sidecars.
pub fn checksum(payload: &[u8]) -> u32 {
    CRC32C.checksum(payload)
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// `<working_dir>/recordings/<session>` — primary output tree.
    pub recordings_dir: PathBuf,
    /// `<working_dir>/emergency_backup/<session>` — fallback tree.
    pub emergency_dir: PathBuf,
    pub sample_rate: u32,
    /// Flush when buffered bytes reach this.
    pub flush_bytes: usize,
    /// Hard bound on buffered bytes per channel; a submit that would pass it
    /// forces an inline flush first.
    pub write_buffer_bytes: usize,
    /// Flush when the oldest buffered batch reaches this age.
    pub flush_age: Duration,
    /// Flush when no submit arrived for this long.
    pub idle_flush: Duration,
    /// Retries after the first failed write attempt before the batch is
    /// routed to emergency backup.
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

/// Why (or that) a flush ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Batches written (count).
    Flushed(usize),
    /// Nothing pending.
    Empty,
    /// Another flush was already running.
    NoOp,
}

/// Channel flush state, observable for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelFlushState {
    Idle,
    FlushingBuffers,
}

struct WriteBatch {
    seq: u64,
    payload: Vec<u8>,
}

struct ChannelBufInner {
    pending: VecDeque<WriteBatch>,
    bytes: usize,
    oldest_at: Option<Instant>,
    last_submit: Instant,
}

struct ChannelStore {
    channel: Channel,
    inner: RankedMutex<ChannelBufInner>,
    flushing: AtomicBool,
    next_seq: AtomicU64,
}

impl ChannelStore {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            inner: RankedMutex::new(
                LockRank::Update,
                ChannelBufInner {
                    pending: VecDeque::new(),
                    bytes: 0,
                    oldest_at: None,
                    last_submit: Instant::now(),
                },
            ),
            flushing: AtomicBool::new(false),
            next_seq: AtomicU64::new(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StorageStats {
    pub flushes: u64,
    pub flush_noop: u64,
    pub batches_written: u64,
    pub emergency_batches: u64,
    pub flush_failures: u64,
    pub bytes_written: u64,
}

#[derive(Default)]
struct Counters {
    flushes: AtomicU64,
    flush_noop: AtomicU64,
    batches_written: AtomicU64,
    emergency_batches: AtomicU64,
    flush_failures: AtomicU64,
    bytes_written: AtomicU64,
}

pub struct StorageManager {
    config: StorageConfig,
    channels: [ChannelStore; 2],
    reporter: Reporter,
    counters: Counters,
}

impl StorageManager {
    /// Create the manager and the primary per-channel directories.
    pub fn new(config: StorageConfig, reporter: Reporter) -> Result<Self> {
        for channel in Channel::ALL {
            fs::create_dir_all(config.recordings_dir.join(channel.dir_name()))?;
        }
        Ok(Self {
            config,
            channels: [
                ChannelStore::new(Channel::Left),
                ChannelStore::new(Channel::Right),
            ],
            reporter,
            counters: Counters::default(),
        })
    }

    fn store(&self, channel: Channel) -> &ChannelStore {
        &self.channels[channel.index()]
    }

    /// Queue a payload for the channel; returns its sequence number.
    ///
    /// Sequence numbers are assigned here, before any I/O, which is what
    /// keeps them gap-free even when individual batches are later routed to
    /// the emergency tree. A submit that would overrun the buffer bound
    /// flushes inline first.
    pub fn submit(&self, channel: Channel, payload: &[u8]) -> Result<u64> {
        let store = self.store(channel);
        let force_flush = {
            let inner = store.inner.lock();
            inner.bytes + payload.len() > self.config.write_buffer_bytes
        };
        if force_flush {
            self.flush(channel)?;
        }

        let seq = store.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut inner = store.inner.lock();
        inner.bytes += payload.len();
        if inner.oldest_at.is_none() {
            inner.oldest_at = Some(Instant::now());
        }
        inner.last_submit = Instant::now();
        inner.pending.push_back(WriteBatch {
            seq,
            payload: payload.to_vec(),
        });
        Ok(seq)
    }

    /// Flush if any trigger condition holds.
    pub fn maybe_flush(&self, channel: Channel) -> Result<FlushOutcome> {
        let store = self.store(channel);
        let (bytes, oldest_age, idle_for, has_pending) = {
            let inner = store.inner.lock();
            (
                inner.bytes,
                inner.oldest_at.map(|t| t.elapsed()),
                inner.last_submit.elapsed(),
                !inner.pending.is_empty(),
            )
        };
        if !has_pending {
            return Ok(FlushOutcome::Empty);
        }
        let by_bytes = bytes >= self.config.flush_bytes;
        let by_age = oldest_age.map(|a| a >= self.config.flush_age).unwrap_or(false);
        let by_idle = idle_for >= self.config.idle_flush;
        if by_bytes || by_age || by_idle {
            debug!(?channel, bytes, by_bytes, by_age, by_idle, "flush triggered");
            self.flush(channel)
        } else {
            Ok(FlushOutcome::Empty)
        }
    }

    pub fn flush_state(&self, channel: Channel) -> ChannelFlushState {
        if self.store(channel).flushing.load(Ordering::Acquire) {
            ChannelFlushState::FlushingBuffers
        } else {
            ChannelFlushState::Idle
        }
    }

    /// Flush everything pending on the channel. A flush while one is already
    /// running is a counted no-op, not an error.
    pub fn flush(&self, channel: Channel) -> Result<FlushOutcome> {
        let store = self.store(channel);
        if store.flushing.swap(true, Ordering::AcqRel) {
            self.counters.flush_noop.fetch_add(1, Ordering::Relaxed);
            return Ok(FlushOutcome::NoOp);
        }

        // IDLE → FLUSHING_BUFFERS. The guard below restores IDLE on every
        // exit path, including write errors.
        let result = self.flush_inner(store);
        store.flushing.store(false, Ordering::Release);
        result
    }

    fn flush_inner(&self, store: &ChannelStore) -> Result<FlushOutcome> {
        let batches: Vec<WriteBatch> = {
            let mut inner = store.inner.lock();
            inner.bytes = 0;
            inner.oldest_at = None;
            inner.pending.drain(..).collect()
        };
        if batches.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        let n = batches.len();
        for batch in batches {
            self.write_batch(store.channel, batch)?;
        }
        Ok(FlushOutcome::Flushed(n))
    }

    /// Write one batch to the primary tree, retrying with backoff; route to
    /// the emergency tree after the retry budget. `max_retries` counts the
    /// retries after the first attempt, matching the cleanup coordinator's
    /// step budget. Only a failed emergency write surfaces as an error.
    fn write_batch(&self, channel: Channel, batch: WriteBatch) -> Result<()> {
        let primary = self.config.recordings_dir.join(channel.dir_name());
        let mut attempts = 0u32;
        let mut last_error = String::new();

        while attempts <= self.config.max_retries {
            attempts += 1;
            match self.write_files(&primary, &batch) {
                Ok(bytes) => {
                    self.counters.batches_written.fetch_add(1, Ordering::Relaxed);
                    self.counters.bytes_written.fetch_add(bytes, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    debug!(?channel, seq = batch.seq, attempts, error = %last_error, "flush attempt failed");
                    if attempts <= self.config.max_retries {
                        std::thread::sleep(self.config.retry_backoff * attempts);
                    }
                }
            }
        }

        self.counters.flush_failures.fetch_add(1, Ordering::Relaxed);
        warn!(?channel, seq = batch.seq, attempts, error = %last_error, "flush failed — routing to emergency backup");
        self.reporter.error(ErrorReport {
            component: "storage".into(),
            severity: Severity::Critical,
            kind: "flush_failed".into(),
            message: format!(
                "{:?}/{} failed after {attempts} attempts: {last_error}",
                channel, batch.seq
            ),
        });

        let emergency = self.config.emergency_dir.join(channel.dir_name());
        match fs::create_dir_all(&emergency)
            .map_err(DuplexError::from)
            .and_then(|()| self.write_files(&emergency, &batch))
        {
            Ok(bytes) => {
                self.counters.emergency_batches.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes_written.fetch_add(bytes, Ordering::Relaxed);
                info!(?channel, seq = batch.seq, "batch routed to emergency backup");
                Ok(())
            }
            Err(e) => {
                self.reporter.error(ErrorReport {
                    component: "storage".into(),
                    severity: Severity::Critical,
                    kind: "emergency_backup_failed".into(),
                    message: format!("{:?}/{}: {e}", channel, batch.seq),
                });
                Err(DuplexError::EmergencyBackupFailed { cause: e.to_string() })
            }
        }
    }

    /// Write `<seq>.wav` and its `.sum` sidecar into `dir`. Returns payload
    /// bytes written.
    fn write_files(&self, dir: &Path, batch: &WriteBatch) -> Result<u64> {
        let wav_path = dir.join(format!("{}.wav", batch.seq));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.config.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&wav_path, spec)
            .map_err(|e| DuplexError::FlushFailed {
                attempts: 1,
                cause: e.to_string(),
            })?;
        for pair in batch.payload.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| DuplexError::FlushFailed {
                    attempts: 1,
                    cause: e.to_string(),
                })?;
        }
        writer.finalize().map_err(|e| DuplexError::FlushFailed {
            attempts: 1,
            cause: e.to_string(),
        })?;

        let sum_path = dir.join(format!("{}.wav.sum", batch.seq));
        fs::write(&sum_path, format!("{:08x}\n", checksum(&batch.payload)))?;
        Ok(batch.payload.len() as u64)
    }

    /// Flush both channels; used by the cleanup walk.
    pub fn flush_all(&self) -> Result<()> {
        for channel in Channel::ALL {
            self.flush(channel)?;
        }
        Ok(())
    }

    pub fn pending_bytes(&self, channel: Channel) -> usize {
        self.store(channel).inner.lock().bytes
    }

    pub fn pending_batches(&self, channel: Channel) -> usize {
        self.store(channel).inner.lock().pending.len()
    }

    /// Time since the channel last saw a submit.
    pub fn idle_for(&self, channel: Channel) -> Duration {
        self.store(channel).inner.lock().last_submit.elapsed()
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            flush_noop: self.counters.flush_noop.load(Ordering::Relaxed),
            batches_written: self.counters.batches_written.load(Ordering::Relaxed),
            emergency_batches: self.counters.emergency_batches.load(Ordering::Relaxed),
            flush_failures: self.counters.flush_failures.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
        }
    }

    /// Re-read a flushed `.wav`, recompute the payload CRC-32C and compare
    /// against the sidecar.
    pub fn verify_file(path: &Path) -> Result<()> {
        let mut reader = hound::WavReader::open(path).map_err(|e| DuplexError::FlushFailed {
            attempts: 1,
            cause: e.to_string(),
        })?;
        let mut payload = Vec::new();
        for sample in reader.samples::<i16>() {
            let s = sample.map_err(|e| DuplexError::FlushFailed {
                attempts: 1,
                cause: e.to_string(),
            })?;
            payload.extend_from_slice(&s.to_le_bytes());
        }

        let sum_path = path.with_extension("wav.sum");
        let mut recorded = String::new();
        fs::File::open(&sum_path)?.read_to_string(&mut recorded)?;
        let recorded = u32::from_str_radix(recorded.trim(), 16).map_err(|_| {
            DuplexError::ChecksumMismatch {
                path: sum_path.clone(),
            }
        })?;

        if checksum(&payload) != recorded {
            return Err(DuplexError::ChecksumMismatch { path: path.into() });
        }
        Ok(())
    }
}
