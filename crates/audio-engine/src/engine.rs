//! Streaming engine: owns the ring buffer, the feeder thread, and the device
//! binding for one playback session.
//!
//! Lifecycle: `initialize` (source opened, ring pre-filled, device bound to
//! the render callback) → `start` (feeder spawned, stream playing) → `stop`
//! (running cleared, feeder joined, stream released). `stop` is idempotent
//! and runs from `Drop`.
//!
//! The render callback executes on the device's real-time thread and touches
//! only the ring buffer and a handful of atomics; it completes in bounded
//! time independent of decode I/O.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result, ensure};

use crate::config::{self, EngineConfig};
use crate::decode::{AudioSource, SymphoniaSource};
use crate::device::{CpalOutput, OutputDevice, RenderFn};
use crate::feeder::{self, FeederContext};
use crate::ring::{self, Consumer, Monitor, Producer};
use crate::status::{self, EngineStats};

/// State shared between the engine, the feeder thread, and the render
/// callback.
pub(crate) struct SessionShared {
    /// Cooperative run flag: the only cancellation mechanism. Observed by
    /// the feeder at the top of each pass and by the callback on entry.
    pub(crate) running: AtomicBool,
    /// Advisory drain hint (samples) from the callback to the feeder.
    /// Staleness is tolerated; it only nudges the feeder's batch size.
    pub(crate) fill_level: AtomicU32,
    /// Samples delivered to the device. Written only by the callback.
    pub(crate) position_samples: AtomicU64,
    pub(crate) underrun_samples: AtomicU64,
    pub(crate) underrun_events: AtomicU64,
}

impl SessionShared {
    pub(crate) fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            fill_level: AtomicU32::new(0),
            position_samples: AtomicU64::new(0),
            underrun_samples: AtomicU64::new(0),
            underrun_events: AtomicU64::new(0),
        }
    }
}

struct Session {
    /// Handed to the feeder thread at `start`.
    source: Option<Box<dyn AudioSource>>,
    producer: Option<Producer<f32>>,
    feeder: Option<JoinHandle<()>>,
    monitor: Monitor<f32>,
    sample_rate: u32,
    channels: usize,
    total_samples: u64,
    idle_sleep: Duration,
}

/// One playback session: file source in, device stream out.
pub struct Engine {
    config: EngineConfig,
    device: Box<dyn OutputDevice>,
    shared: Arc<SessionShared>,
    session: Option<Session>,
}

impl Engine {
    /// Build an engine around an injected device binding.
    pub fn new(device: Box<dyn OutputDevice>, config: EngineConfig) -> Self {
        Self {
            config,
            device,
            shared: Arc::new(SessionShared::new()),
            session: None,
        }
    }

    /// Build an engine that plays through the host default output device.
    pub fn with_default_output(config: EngineConfig) -> Self {
        Self::new(Box::new(CpalOutput::new()), config)
    }

    /// Open `path` and prepare the session: pre-fill the ring buffer and
    /// bind the device stream to the render callback.
    pub fn initialize(&mut self, path: &Path) -> Result<()> {
        let source =
            SymphoniaSource::open(path).with_context(|| format!("open audio file {:?}", path))?;
        self.initialize_with_source(Box::new(source))
    }

    /// As [`Engine::initialize`], with the decode collaborator injected.
    pub fn initialize_with_source(&mut self, mut source: Box<dyn AudioSource>) -> Result<()> {
        ensure!(self.session.is_none(), "engine already initialized");
        ensure!(
            self.config.ring_capacity >= 2,
            "ring capacity must be at least 2 slots"
        );
        ensure!(
            self.config.fill_threshold < self.config.ring_capacity,
            "fill threshold must stay below the ring capacity"
        );

        let sample_rate = source.sample_rate();
        ensure!(sample_rate > 0, "source reports a zero sample rate");
        let channels = source.channels();
        ensure!(channels > 0, "source reports zero channels");
        let total_samples = source.total_frames() * channels as u64;

        let (mut producer, consumer) = ring::with_capacity(self.config.ring_capacity);
        let monitor = producer.monitor();

        let prefilled =
            feeder::prefill(&mut producer, source.as_mut(), self.config.read_chunk_frames)
                .context("pre-fill ring buffer")?;

        let idle_sleep = self.config.idle_sleep.unwrap_or_else(|| {
            config::derive_idle_sleep(self.config.fill_threshold, sample_rate)
        });

        let render = make_render_fn(consumer, self.shared.clone(), channels, total_samples);
        self.device
            .open(sample_rate, channels as u16, render)
            .context("open output device")?;

        tracing::info!(
            sample_rate,
            channels,
            total_samples,
            prefilled,
            idle_sleep_ms = idle_sleep.as_millis() as u64,
            "session initialized"
        );

        self.session = Some(Session {
            source: Some(source),
            producer: Some(producer),
            feeder: None,
            monitor,
            sample_rate,
            channels,
            total_samples,
            idle_sleep,
        });
        Ok(())
    }

    /// Set running, launch the feeder thread, and start the device stream.
    pub fn start(&mut self) -> Result<()> {
        let session = self.session.as_mut().context("engine not initialized")?;
        ensure!(session.feeder.is_none(), "engine already started");
        let (producer, source) = match (session.producer.take(), session.source.take()) {
            (Some(p), Some(s)) => (p, s),
            _ => anyhow::bail!("stopped session cannot be restarted"),
        };

        let ctx = FeederContext {
            producer,
            source,
            shared: self.shared.clone(),
            fill_threshold: self.config.fill_threshold,
            idle_sleep: session.idle_sleep,
            read_chunk_frames: self.config.read_chunk_frames,
        };
        self.shared.running.store(true, Ordering::Release);
        session.feeder = Some(std::thread::spawn(move || feeder::run(ctx)));

        self.device.start()?;
        tracing::info!("streaming started");
        Ok(())
    }

    /// Clear running, join the feeder, and stop the device stream.
    ///
    /// Blocks until the feeder thread has observably exited, so no shared
    /// resource is released while the producer side may still touch it.
    /// Safe to call repeatedly and from `Drop`.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(session) = self.session.as_mut() {
            if let Some(handle) = session.feeder.take() {
                if handle.join().is_err() {
                    tracing::error!("feeder thread panicked");
                }
            }
        }
        self.device.stop();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Best-effort snapshot of playback progress and buffer health.
    pub fn stats(&self) -> EngineStats {
        let Some(session) = self.session.as_ref() else {
            return EngineStats::default();
        };
        let position_samples = self.shared.position_samples.load(Ordering::Relaxed);
        let position_frames = position_samples / session.channels as u64;
        EngineStats {
            position_frames,
            total_frames: session.total_samples / session.channels as u64,
            elapsed_ms: status::elapsed_ms(position_frames, session.sample_rate),
            buffered_samples: session.monitor.len(),
            underrun_samples: self.shared.underrun_samples.load(Ordering::Relaxed),
            underrun_events: self.shared.underrun_events.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn make_render_fn(
    mut consumer: Consumer<f32>,
    shared: Arc<SessionShared>,
    channels: usize,
    total_samples: u64,
) -> RenderFn {
    Box::new(move |out: &mut [f32]| {
        render_block(&mut consumer, &shared, channels, total_samples, out);
    })
}

/// Fill one device buffer. Runs on the real-time thread: pops from the ring,
/// never blocks, allocates, or touches the decode collaborator.
fn render_block(
    consumer: &mut Consumer<f32>,
    shared: &SessionShared,
    channels: usize,
    total_samples: u64,
    out: &mut [f32],
) {
    if !shared.running.load(Ordering::Acquire) {
        out.fill(0.0);
        return;
    }

    let position = shared.position_samples.load(Ordering::Relaxed);
    let remaining_frames = total_samples.saturating_sub(position) / channels as u64;
    if remaining_frames == 0 {
        out.fill(0.0);
        return;
    }

    let requested_frames = out.len() / channels;
    let frames_to_copy = (requested_frames as u64).min(remaining_frames) as usize;
    let want = frames_to_copy * channels;

    shared.fill_level.store(want as u32, Ordering::Relaxed);

    let mut copied = 0usize;
    while copied < want {
        match consumer.pop() {
            Some(sample) => {
                out[copied] = sample;
                copied += 1;
            }
            // Underrun: truncate, no busy-retry on the audio thread.
            None => break,
        }
    }

    if copied < want {
        shared.underrun_events.fetch_add(1, Ordering::Relaxed);
        shared
            .underrun_samples
            .fetch_add((want - copied) as u64, Ordering::Relaxed);
    }

    // Covers stream end and underrun alike.
    out[copied..].fill(0.0);

    shared
        .position_samples
        .fetch_add(copied as u64, Ordering::Relaxed);
}
