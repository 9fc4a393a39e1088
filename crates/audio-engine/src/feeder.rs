//! Feeder loop: keeps the ring buffer topped up from the decode source.
//!
//! Runs on a dedicated background thread owned by the engine, never on the
//! real-time callback thread. All blocking (file reads, idle sleeps) happens
//! here. The loop exits promptly once the session's running flag clears.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::Result;

use crate::decode::AudioSource;
use crate::engine::SessionShared;
use crate::ring::Producer;

pub(crate) struct FeederContext {
    pub(crate) producer: Producer<f32>,
    pub(crate) source: Box<dyn AudioSource>,
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) fill_threshold: usize,
    pub(crate) idle_sleep: Duration,
    pub(crate) read_chunk_frames: usize,
}

/// Run the top-up loop until the running flag clears.
///
/// Each pass: below the fill threshold, read a batch sized by the callback's
/// advisory drain hint and push sample by sample; otherwise idle for the
/// fixed sleep interval. Samples the ring cannot take yet are carried over,
/// never dropped. A decode read error is treated as end-of-stream.
pub(crate) fn run(ctx: FeederContext) {
    let FeederContext {
        mut producer,
        mut source,
        shared,
        fill_threshold,
        idle_sleep,
        read_chunk_frames,
    } = ctx;

    let channels = source.channels().max(1);
    let mut pending: VecDeque<f32> = VecDeque::new();
    let mut chunk: Vec<f32> = Vec::new();
    let mut source_done = false;

    while shared.running.load(Ordering::Acquire) {
        if producer.len() >= fill_threshold {
            thread::sleep(idle_sleep);
            continue;
        }

        if pending.is_empty() && !source_done {
            let hint = shared.fill_level.load(Ordering::Acquire) as usize;
            let frames = batch_frames(hint, channels, read_chunk_frames);
            match source.read_frames(frames, &mut chunk) {
                Ok(0) => {
                    source_done = true;
                    tracing::debug!("decode source drained");
                }
                Ok(_) => pending.extend(chunk.drain(..)),
                Err(e) => {
                    tracing::warn!("decode read failed, treating as end of stream: {e:#}");
                    source_done = true;
                }
            }
        }

        if pending.is_empty() {
            thread::sleep(idle_sleep);
            continue;
        }

        while let Some(&sample) = pending.front() {
            match producer.push(sample) {
                Ok(()) => {
                    pending.pop_front();
                }
                // Ring full; keep the remainder for the next pass.
                Err(_) => break,
            }
        }
    }

    tracing::debug!("feeder exited");
}

/// Batch size in frames from the advisory drain hint (samples), falling back
/// to the configured chunk when no hint has been published yet.
fn batch_frames(hint_samples: usize, channels: usize, read_chunk_frames: usize) -> usize {
    let chunk = read_chunk_frames.max(1);
    let hinted = hint_samples / channels;
    if hinted == 0 { chunk } else { hinted.clamp(1, chunk) }
}

/// Synchronous initial fill, run once before the session starts.
///
/// Reads only as many whole frames as the ring has space for, so no decoded
/// sample is lost. Returns the number of samples pushed.
pub(crate) fn prefill(
    producer: &mut Producer<f32>,
    source: &mut dyn AudioSource,
    read_chunk_frames: usize,
) -> Result<usize> {
    let channels = source.channels().max(1);
    let mut chunk = Vec::new();
    let mut pushed = 0usize;

    loop {
        let space = producer.capacity() - producer.len();
        let frames = (space / channels).min(read_chunk_frames.max(1));
        if frames == 0 {
            break;
        }
        let read = source.read_frames(frames, &mut chunk)?;
        if read == 0 {
            break;
        }
        for &sample in &chunk {
            if producer.push(sample).is_err() {
                break;
            }
            pushed += 1;
        }
    }

    Ok(pushed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::test_support::ScriptedSource;
    use crate::ring;
    use std::time::Instant;

    fn ramp(n: usize) -> Vec<f32> {
        (1..=n).map(|v| v as f32).collect()
    }

    #[test]
    fn prefill_fills_the_ring_in_order() {
        let (mut producer, mut consumer) = ring::with_capacity(8);
        let mut source = ScriptedSource::new(ramp(20), 8_000, 1);

        let pushed = prefill(&mut producer, &mut source, 4).unwrap();
        assert_eq!(pushed, 7);
        for expected in 1..=7 {
            assert_eq!(consumer.pop(), Some(expected as f32));
        }
    }

    #[test]
    fn prefill_stops_at_source_end() {
        let (mut producer, _consumer) = ring::with_capacity::<f32>(64);
        let mut source = ScriptedSource::new(ramp(5), 8_000, 1);
        let pushed = prefill(&mut producer, &mut source, 16).unwrap();
        assert_eq!(pushed, 5);
        assert_eq!(producer.len(), 5);
    }

    #[test]
    fn prefill_reads_whole_frames_only() {
        // Stereo into 8 slots: 3 whole frames fit the 7 usable slots.
        let (mut producer, mut consumer) = ring::with_capacity(8);
        let mut source = ScriptedSource::new(ramp(20), 8_000, 2);

        let pushed = prefill(&mut producer, &mut source, 8).unwrap();
        assert_eq!(pushed, 6);
        for expected in 1..=6 {
            assert_eq!(consumer.pop(), Some(expected as f32));
        }
    }

    #[test]
    fn feeder_tops_up_and_preserves_order() {
        let (producer, mut consumer) = ring::with_capacity(8);
        let shared = Arc::new(SessionShared::new());
        shared.running.store(true, Ordering::Release);

        let ctx = FeederContext {
            producer,
            source: Box::new(ScriptedSource::new(ramp(20), 8_000, 1)),
            shared: shared.clone(),
            fill_threshold: 4,
            idle_sleep: Duration::from_millis(1),
            // Larger than the ring: exercises the carry-over path.
            read_chunk_frames: 16,
        };
        let feeder = thread::spawn(move || run(ctx));

        let mut got = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while got.len() < 20 && Instant::now() < deadline {
            match consumer.pop() {
                Some(v) => got.push(v),
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
        assert_eq!(got, ramp(20));

        shared.running.store(false, Ordering::Release);
        feeder.join().unwrap();
    }

    #[test]
    fn feeder_idles_after_source_drains() {
        let (producer, mut consumer) = ring::with_capacity(64);
        let shared = Arc::new(SessionShared::new());
        shared.running.store(true, Ordering::Release);

        let ctx = FeederContext {
            producer,
            source: Box::new(ScriptedSource::new(ramp(5), 8_000, 1)),
            shared: shared.clone(),
            fill_threshold: 32,
            idle_sleep: Duration::from_millis(1),
            read_chunk_frames: 8,
        };
        let feeder = thread::spawn(move || run(ctx));

        // All five samples arrive, and nothing else ever does.
        let mut got = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while got.len() < 5 && Instant::now() < deadline {
            match consumer.pop() {
                Some(v) => got.push(v),
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
        assert_eq!(got, ramp(5));
        thread::sleep(Duration::from_millis(10));
        assert_eq!(consumer.pop(), None);

        shared.running.store(false, Ordering::Release);
        feeder.join().unwrap();
    }

    #[test]
    fn feeder_exits_promptly_when_running_clears() {
        let (producer, _consumer) = ring::with_capacity(8);
        let shared = Arc::new(SessionShared::new());
        shared.running.store(true, Ordering::Release);

        let ctx = FeederContext {
            producer,
            source: Box::new(ScriptedSource::new(ramp(1000), 8_000, 1)),
            shared: shared.clone(),
            fill_threshold: 4,
            idle_sleep: Duration::from_millis(20),
            read_chunk_frames: 4,
        };
        let feeder = thread::spawn(move || run(ctx));

        // Let it reach the idle sleep, then stop mid-sleep.
        thread::sleep(Duration::from_millis(5));
        shared.running.store(false, Ordering::Release);
        feeder.join().unwrap();
    }

    #[test]
    fn batch_frames_prefers_the_drain_hint() {
        assert_eq!(batch_frames(0, 2, 1024), 1024);
        assert_eq!(batch_frames(512, 2, 1024), 256);
        assert_eq!(batch_frames(8192, 2, 1024), 1024);
        assert_eq!(batch_frames(1, 2, 1024), 1024);
        assert_eq!(batch_frames(4, 1, 0), 1);
    }
}
