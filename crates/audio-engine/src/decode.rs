//! File decode collaborator.
//!
//! Uses Symphonia to probe the container and stream interleaved `f32`
//! samples. The engine and feeder only see the [`AudioSource`] trait, so
//! tests can substitute scripted sources without touching a real file.

use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

/// Seekable source of decoded interleaved `f32` audio.
///
/// `read_frames` fills `out` with up to `frames` whole frames and returns the
/// number actually read; fewer than requested means end-of-stream.
pub trait AudioSource: Send {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> usize;
    fn total_frames(&self) -> u64;
    fn read_frames(&mut self, frames: usize, out: &mut Vec<f32>) -> Result<usize>;
    fn seek_to_frame(&mut self, frame: u64) -> Result<()>;
}

/// Symphonia-backed [`AudioSource`] for local files.
pub struct SymphoniaSource {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: usize,
    total_frames: u64,
    /// Decoded samples not yet handed out; packets rarely align with the
    /// requested read size.
    leftover: VecDeque<f32>,
}

impl SymphoniaSource {
    /// Probe and open `path`, failing if the container does not report the
    /// sample rate, channel layout, or total frame count.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {:?}", path))?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        Self::from_media_source(Box::new(file), hint)
    }

    /// Open from an arbitrary Symphonia [`MediaSource`].
    pub fn from_media_source(source: Box<dyn MediaSource>, hint: Hint) -> Result<Self> {
        let mss = MediaSourceStream::new(source, Default::default());

        let probed = symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;
        let format = probed.format;

        let track = format
            .default_track()
            .ok_or_else(|| anyhow!("no default audio track"))?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let channels = codec_params
            .channels
            .ok_or_else(|| anyhow!("unknown channel layout"))?
            .count();
        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| anyhow!("unknown sample rate"))?;
        let total_frames = codec_params
            .n_frames
            .ok_or_else(|| anyhow!("source does not report a total frame count"))?;

        let decoder =
            symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
            total_frames,
            leftover: VecDeque::new(),
        })
    }

    /// Decode packets until at least one sample is buffered.
    ///
    /// Returns `false` at end-of-stream. Corrupt packets are skipped.
    fn fill_leftover(&mut self) -> bool {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(_) => return false, // EOF
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(_) => continue,
            };
            if decoded.frames() == 0 {
                continue;
            }

            let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
            sample_buf.copy_interleaved_ref(decoded);
            self.leftover.extend(sample_buf.samples().iter().copied());
            return true;
        }
    }
}

impl AudioSource for SymphoniaSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn total_frames(&self) -> u64 {
        self.total_frames
    }

    fn read_frames(&mut self, frames: usize, out: &mut Vec<f32>) -> Result<usize> {
        let want = frames * self.channels;
        out.clear();

        while out.len() < want {
            if self.leftover.is_empty() && !self.fill_leftover() {
                break;
            }
            while out.len() < want {
                match self.leftover.pop_front() {
                    Some(sample) => out.push(sample),
                    None => break,
                }
            }
        }

        Ok(out.len() / self.channels)
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<()> {
        let rate = u64::from(self.sample_rate);
        let time = Time::new(frame / rate, (frame % rate) as f64 / rate as f64);
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .context("seek failed")?;

        self.decoder.reset();
        self.leftover.clear();

        // The format layer lands on a packet boundary at or before the
        // target; discard the difference.
        let mut skip = seeked.required_ts.saturating_sub(seeked.actual_ts) as usize * self.channels;
        while skip > 0 {
            if self.leftover.is_empty() && !self.fill_leftover() {
                break;
            }
            let drop_n = skip.min(self.leftover.len());
            self.leftover.drain(..drop_n);
            skip -= drop_n;
        }

        Ok(())
    }
}
