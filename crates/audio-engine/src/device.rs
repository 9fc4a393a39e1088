//! Playback device collaborator.
//!
//! Thin wrapper around CPAL that opens an output stream bound to the
//! engine's render callback. The engine only sees the [`OutputDevice`]
//! trait, so tests drive the callback through a device double instead of
//! real hardware.
//!
//! ## Real-time constraints
//! The stream callback never blocks or allocates: non-f32 devices render
//! into a scratch buffer pre-allocated at stream build time and convert per
//! sample. Underruns are the render callback's concern, not the device's.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

/// Render callback handed to the device: fills an interleaved `f32` buffer
/// whose length is a whole number of frames.
pub type RenderFn = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// Playback stream binding consumed by the engine.
///
/// `open` configures a stream for the given rate/channel pair and registers
/// the render callback; `start` begins hardware playback; `stop` halts it
/// and releases the device handle.
pub trait OutputDevice {
    fn open(&mut self, sample_rate: u32, channels: u16, render: RenderFn) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self);
}

/// CPAL-backed [`OutputDevice`].
pub struct CpalOutput {
    device_hint: Option<String>,
    stream: Option<cpal::Stream>,
}

impl CpalOutput {
    /// Use the host default output device.
    pub fn new() -> Self {
        Self {
            device_hint: None,
            stream: None,
        }
    }

    /// Use the first output device whose name contains `needle`
    /// (case-insensitive).
    pub fn with_device(needle: impl Into<String>) -> Self {
        Self {
            device_hint: Some(needle.into()),
            stream: None,
        }
    }
}

impl Default for CpalOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputDevice for CpalOutput {
    fn open(&mut self, sample_rate: u32, channels: u16, render: RenderFn) -> Result<()> {
        let host = cpal::default_host();
        let device = pick_device(&host, self.device_hint.as_deref())?;
        let supported = pick_output_config(&device, sample_rate, channels)?;
        let config: cpal::StreamConfig = supported.clone().into();

        tracing::info!(
            rate_hz = sample_rate,
            channels,
            format = ?supported.sample_format(),
            "output stream configured"
        );

        let stream = build_output_stream(&device, &config, supported.sample_format(), render)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.stream
            .as_ref()
            .context("device not opened")?
            .play()
            .context("start output stream")?;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
            drop(stream);
        }
    }
}

/// Pick the first output device matching `needle` (case-insensitive), or the
/// default device.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices: Vec<cpal::Device> = host
            .output_devices()
            .context("No output devices")?
            .collect();
        if let Some(d) = devices.drain(..).find(|d| {
            d.description()
                .ok()
                .map(|n| matches_device_name(&n.name(), needle))
                .unwrap_or(false)
        }) {
            return Ok(d);
        }
        return Err(anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose a supported output config at exactly the source rate and channel
/// count, preferring richer sample formats.
///
/// There is no resampling stage, so a device that cannot run at the source
/// rate fails here rather than playing at the wrong pitch.
pub fn pick_output_config(
    device: &cpal::Device,
    sample_rate: u32,
    channels: u16,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> =
        device.supported_output_configs()?.collect();
    if ranges.is_empty() {
        return Err(anyhow!("No supported output configs"));
    }

    let mut best: Option<(u8, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        if range.channels() != channels {
            continue;
        }
        if sample_rate < range.min_sample_rate() || sample_rate > range.max_sample_rate() {
            continue;
        }
        let rank = sample_format_rank(range.sample_format());
        let replace = best.as_ref().map(|(b, _)| rank < *b).unwrap_or(true);
        if replace {
            best = Some((rank, range.with_sample_rate(sample_rate)));
        }
    }

    best.map(|(_, cfg)| cfg)
        .ok_or_else(|| anyhow!("No output config supports {sample_rate} Hz / {channels} ch"))
}

/// Build a CPAL output stream that delegates to `render`, converting `f32`
/// to the device sample format when needed.
fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    mut render: RenderFn,
) -> Result<cpal::Stream> {
    let err_fn = |err| tracing::warn!("stream error: {err}");

    match sample_format {
        cpal::SampleFormat::F32 => {
            let stream = device.build_output_stream(
                config,
                move |data: &mut [f32], _| render(data),
                err_fn,
                None,
            )?;
            Ok(stream)
        }
        cpal::SampleFormat::I16 => build_converted_stream::<i16>(device, config, render),
        cpal::SampleFormat::I32 => build_converted_stream::<i32>(device, config, render),
        cpal::SampleFormat::U16 => build_converted_stream::<u16>(device, config, render),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

/// Stream builder for non-f32 devices: render into a pre-allocated scratch
/// buffer, then convert sample by sample.
fn build_converted_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut render: RenderFn,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let mut scratch = vec![0.0f32; scratch_len(config.channels as usize)];
    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            // scratch.len() is a whole number of frames, so every chunk is
            // frame-aligned.
            for chunk in data.chunks_mut(scratch.len()) {
                let buf = &mut scratch[..chunk.len()];
                render(buf);
                for (out, s) in chunk.iter_mut().zip(buf.iter()) {
                    *out = <T as cpal::Sample>::from_sample::<f32>(*s);
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

const SCRATCH_FRAMES: usize = 4096;

fn scratch_len(channels: usize) -> usize {
    SCRATCH_FRAMES * channels.max(1)
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", "USB"));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", ""));
    }

    #[test]
    fn sample_format_rank_prefers_f32() {
        assert!(sample_format_rank(cpal::SampleFormat::F32) < sample_format_rank(cpal::SampleFormat::I32));
        assert!(sample_format_rank(cpal::SampleFormat::I32) < sample_format_rank(cpal::SampleFormat::I16));
        assert!(sample_format_rank(cpal::SampleFormat::I16) < sample_format_rank(cpal::SampleFormat::U16));
    }

    #[test]
    fn scratch_len_is_frame_aligned() {
        assert_eq!(scratch_len(2) % 2, 0);
        assert_eq!(scratch_len(6) % 6, 0);
        assert!(scratch_len(0) > 0);
    }
}
