use std::time::Duration;

/// Streaming tuning parameters shared by the pre-fill, feeder, and callback.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Ring buffer slot count in samples (usable capacity is one less).
    pub ring_capacity: usize,

    /// Occupancy (samples) below which the feeder resumes active refilling.
    ///
    /// Must stay below `ring_capacity`; larger values keep more headroom
    /// against underruns at the cost of feeder wakeups.
    pub fill_threshold: usize,

    /// Feeder sleep while the ring is at/above the fill threshold.
    ///
    /// `None` derives the interval at initialization from half the fill
    /// threshold and the source sample rate, so the feeder always wakes
    /// before the callback can drain one threshold's worth of samples.
    pub idle_sleep: Option<Duration>,

    /// Decode batch size in frames when the callback has not yet published
    /// a drain hint.
    pub read_chunk_frames: usize,
}

impl Default for EngineConfig {
    /// Defaults sized for common device callback cadences.
    fn default() -> Self {
        Self {
            ring_capacity: 2048,
            fill_threshold: 512,
            idle_sleep: None,
            read_chunk_frames: 1024,
        }
    }
}

/// Idle interval from half the fill threshold at the source sample rate,
/// rounded to whole milliseconds. Fixed at initialization time.
pub(crate) fn derive_idle_sleep(fill_threshold: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::from_millis(10);
    }
    let ms = (fill_threshold as f64 / 2.0) * 1000.0 / f64::from(sample_rate);
    Duration::from_millis(ms.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_threshold_stays_below_capacity() {
        let cfg = EngineConfig::default();
        assert!(cfg.fill_threshold < cfg.ring_capacity);
        assert!(cfg.idle_sleep.is_none());
    }

    #[test]
    fn derive_idle_sleep_matches_half_threshold() {
        // 256 samples at 44.1 kHz is ~5.8 ms.
        assert_eq!(derive_idle_sleep(512, 44_100), Duration::from_millis(6));
        assert_eq!(derive_idle_sleep(512, 48_000), Duration::from_millis(5));
        assert_eq!(derive_idle_sleep(96, 48_000), Duration::from_millis(1));
    }

    #[test]
    fn derive_idle_sleep_guards_zero_rate() {
        assert_eq!(derive_idle_sleep(512, 0), Duration::from_millis(10));
    }
}
