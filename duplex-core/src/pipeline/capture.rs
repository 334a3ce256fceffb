//! Capture sources and the callback-side ring.
//!
//! The capture callback — a real audio-driver callback or the synthetic
//! clock — runs on a thread the pipeline does not own. It must not allocate,
//! block, or perform I/O, so it writes interleaved `[left, right]` f32 frames
//! into an SPSC ring whose `push_slice` is wait-free. The capture worker
//! drains the consumer half on its own schedule.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ringbuf::{traits::Split, HeapRb};
use tracing::{debug, info};

use crate::config::ChannelMode;
use crate::error::Result;

pub use ringbuf::traits::{Consumer, Producer};

/// Producer half — held by the capture callback.
pub type FrameProducer = ringbuf::HeapProd<f32>;
/// Consumer half — held by the capture worker.
pub type FrameConsumer = ringbuf::HeapCons<f32>;

/// Interleaved stereo samples: 2^20 f32 ≈ 32 s of 16 kHz stereo. Enough to
/// ride out a stalled capture worker without dropping frames at the callback.
pub const RING_CAPACITY: usize = 1 << 20;

/// Create the matched producer/consumer pair for the capture boundary.
pub fn create_capture_ring() -> (FrameProducer, FrameConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}

/// A source of interleaved stereo frames. Implementations own the producer
/// half of the capture ring and stop feeding it when stopped.
pub trait CaptureSource: Send {
    fn start(&mut self) -> Result<()>;
    /// Idempotent; called again during cleanup.
    fn stop(&mut self);
    /// Interleaved samples the callback dropped because the ring was full.
    fn dropped_samples(&self) -> u64;
}

/// Clock-driven synthetic source: a sine per channel (defaults 440 Hz left,
/// 880 Hz right), one frame per tick. Stands in for the audio driver in
/// tests, benchmarks and the CLI's synthetic mode.
pub struct SyntheticSource {
    producer: Option<FrameProducer>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
    sample_rate: u32,
    frame_samples: usize,
    frame: Duration,
    mode: ChannelMode,
    left_hz: f32,
    right_hz: f32,
}

impl SyntheticSource {
    pub fn new(
        producer: FrameProducer,
        sample_rate: u32,
        frame_samples: usize,
        frame: Duration,
        mode: ChannelMode,
    ) -> Self {
        Self {
            producer: Some(producer),
            running: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            worker: None,
            sample_rate,
            frame_samples: frame_samples.max(1),
            frame,
            mode,
            left_hz: 440.0,
            right_hz: 880.0,
        }
    }

    pub fn with_tones(mut self, left_hz: f32, right_hz: f32) -> Self {
        self.left_hz = left_hz;
        self.right_hz = right_hz;
        self
    }
}

impl CaptureSource for SyntheticSource {
    fn start(&mut self) -> Result<()> {
        let Some(mut producer) = self.producer.take() else {
            return Ok(()); // already started once
        };
        self.running.store(true, Ordering::Release);

        let running = Arc::clone(&self.running);
        let dropped = Arc::clone(&self.dropped);
        let (sample_rate, frame_samples, frame, mode) =
            (self.sample_rate, self.frame_samples, self.frame, self.mode);
        let (left_hz, right_hz) = (self.left_hz, self.right_hz);

        let handle = std::thread::Builder::new()
            .name("duplex-synth-capture".into())
            .spawn(move || {
                let mut scratch = vec![0f32; frame_samples * 2];
                let mut phase_l = 0f32;
                let mut phase_r = 0f32;
                let step_l = std::f32::consts::TAU * left_hz / sample_rate as f32;
                let step_r = std::f32::consts::TAU * right_hz / sample_rate as f32;
                let mut next_tick = Instant::now();
                let mut frames = 0u64;

                while running.load(Ordering::Acquire) {
                    for i in 0..frame_samples {
                        scratch[i * 2] = if mode.left_enabled() {
                            0.5 * phase_l.sin()
                        } else {
                            0.0
                        };
                        scratch[i * 2 + 1] = if mode.right_enabled() {
                            0.5 * phase_r.sin()
                        } else {
                            0.0
                        };
                        phase_l = (phase_l + step_l) % std::f32::consts::TAU;
                        phase_r = (phase_r + step_r) % std::f32::consts::TAU;
                    }

                    let written = producer.push_slice(&scratch);
                    if written < scratch.len() {
                        dropped.fetch_add((scratch.len() - written) as u64, Ordering::Relaxed);
                    }
                    frames += 1;

                    next_tick += frame;
                    let now = Instant::now();
                    if next_tick > now {
                        std::thread::sleep(next_tick - now);
                    } else {
                        // Fell behind; realign rather than bursting.
                        next_tick = now;
                    }
                }
                debug!(frames, "synthetic capture stopped");
            })
            .expect("failed to spawn synthetic capture thread");

        self.worker = Some(handle);
        info!(
            sample_rate,
            frame_samples, ?mode, "synthetic capture started"
        );
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Live capture via cpal.
///
/// The input callback mixes the device's channels down to mono and writes it
/// to both stereo slots (loopback split is a platform concern layered above
/// this crate). `cpal::Stream` is `!Send`, so a `LiveCapture` must be created
/// and dropped on the same thread — the CLI does this on a dedicated capture
/// thread, mirroring how the rest of the pipeline treats the callback side.
#[cfg(feature = "audio-cpal")]
pub mod live {
    use super::*;
    use crate::error::DuplexError;
    use tracing::warn;
    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        SampleFormat, SampleRate, StreamConfig,
    };

    pub struct LiveCapture {
        _stream: cpal::Stream,
        running: Arc<AtomicBool>,
        pub sample_rate: u32,
    }

    impl LiveCapture {
        pub fn open_default(
            mut producer: FrameProducer,
            running: Arc<AtomicBool>,
        ) -> Result<LiveCapture> {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| anyhow::anyhow!("no default input device"))
                .map_err(DuplexError::from)?;
            let supported = device
                .default_input_config()
                .map_err(|e| DuplexError::Other(anyhow::anyhow!("input config: {e}")))?;

            let sample_rate = supported.sample_rate().0;
            let channels = supported.channels() as usize;
            let config = StreamConfig {
                channels: channels as u16,
                sample_rate: SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            if supported.sample_format() != SampleFormat::F32 {
                return Err(DuplexError::Other(anyhow::anyhow!(
                    "unsupported sample format: {:?}",
                    supported.sample_format()
                )));
            }

            let cb_running = Arc::clone(&running);
            let mut stereo: Vec<f32> = Vec::new();
            let stream = device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        if !cb_running.load(Ordering::Relaxed) {
                            return;
                        }
                        let frames = data.len() / channels;
                        stereo.resize(frames * 2, 0.0);
                        for f in 0..frames {
                            let base = f * channels;
                            let mut sum = 0f32;
                            for c in 0..channels {
                                sum += data[base + c];
                            }
                            let mono = sum / channels as f32;
                            stereo[f * 2] = mono;
                            stereo[f * 2 + 1] = mono;
                        }
                        let written = producer.push_slice(&stereo);
                        if written < stereo.len() {
                            warn!("capture ring full: dropped {} samples", stereo.len() - written);
                        }
                    },
                    |err| tracing::error!("audio stream error: {err}"),
                    None,
                )
                .map_err(|e| DuplexError::Other(anyhow::anyhow!("build stream: {e}")))?;

            stream
                .play()
                .map_err(|e| DuplexError::Other(anyhow::anyhow!("play stream: {e}")))?;

            Ok(LiveCapture {
                _stream: stream,
                running,
                sample_rate,
            })
        }

        pub fn stop(&self) {
            self.running.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_source_fills_the_ring_with_stereo_frames() {
        let (producer, mut consumer) = create_capture_ring();
        let mut source = SyntheticSource::new(
            producer,
            16_000,
            160,
            Duration::from_millis(10),
            ChannelMode::Both,
        );
        source.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        source.stop();

        let mut data = vec![0f32; 16_000];
        let n = consumer.pop_slice(&mut data);
        // At least a few 10 ms stereo frames in 50 ms.
        assert!(n >= 160 * 2 * 2, "only {n} samples captured");
        assert_eq!(n % 2, 0);
        // Both channels carry signal.
        let left_energy: f32 = data[..n].iter().step_by(2).map(|s| s * s).sum();
        let right_energy: f32 = data[1..n].iter().step_by(2).map(|s| s * s).sum();
        assert!(left_energy > 0.0);
        assert!(right_energy > 0.0);
    }

    #[test]
    fn loopback_only_mode_keeps_the_mic_channel_silent() {
        let (producer, mut consumer) = create_capture_ring();
        let mut source = SyntheticSource::new(
            producer,
            16_000,
            160,
            Duration::from_millis(10),
            ChannelMode::Loopback,
        );
        source.start().unwrap();
        std::thread::sleep(Duration::from_millis(40));
        source.stop();

        let mut data = vec![0f32; 8_000];
        let n = consumer.pop_slice(&mut data);
        assert!(n > 0);
        let right_energy: f32 = data[1..n].iter().step_by(2).map(|s| s * s).sum();
        assert_eq!(right_energy, 0.0);
    }

    #[test]
    fn stop_is_idempotent_and_restart_is_a_noop() {
        let (producer, _consumer) = create_capture_ring();
        let mut source = SyntheticSource::new(
            producer,
            16_000,
            160,
            Duration::from_millis(10),
            ChannelMode::Both,
        );
        source.start().unwrap();
        source.stop();
        source.stop();
        // The producer half was consumed by the first start.
        source.start().unwrap();
        assert_eq!(source.dropped_samples(), 0);
    }
}
