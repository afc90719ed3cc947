//! Constant-rate presentation timestamps
//!
//! Timestamps are derived from a frame counter, never from arrival time, so
//! the output plays back at the configured rate no matter how irregularly
//! frames were delivered.

use crate::assert_invariant;

/// Frame-counter based timestamp source for the video track
#[derive(Debug, Clone)]
pub struct FramePacer {
    frame_duration_us: u64,
    next_frame: u64,
    last_timestamp_us: Option<u64>,
}

impl FramePacer {
    /// Create a pacer for the given frame rate
    pub fn new(fps: u32) -> Self {
        Self::with_frame_duration(1_000_000 / u64::from(fps.max(1)))
    }

    /// Create a pacer from an explicit frame duration
    pub fn with_frame_duration(frame_duration_us: u64) -> Self {
        Self {
            frame_duration_us,
            next_frame: 0,
            last_timestamp_us: None,
        }
    }

    /// Timestamp for the frame being submitted now; advances the counter.
    ///
    /// Call exactly once per frame the encoder accepted.
    pub fn next_timestamp(&mut self) -> u64 {
        let ts = self.next_frame * self.frame_duration_us;
        assert_invariant!(
            self.last_timestamp_us.map_or(true, |last| ts > last),
            "Frame timestamps strictly increase",
            "FramePacer::next_timestamp"
        );
        self.last_timestamp_us = Some(ts);
        self.next_frame += 1;
        ts
    }

    /// Timestamp the next frame would get, without advancing
    pub fn peek_timestamp(&self) -> u64 {
        self.next_frame * self.frame_duration_us
    }

    /// Frames timestamped so far
    pub fn frames(&self) -> u64 {
        self.next_frame
    }

    pub fn frame_duration_us(&self) -> u64 {
        self.frame_duration_us
    }
}

/// Sample-count based timestamp source for the audio track
#[derive(Debug, Clone)]
pub struct SamplePacer {
    sample_rate: u32,
    samples: u64,
}

impl SamplePacer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            samples: 0,
        }
    }

    /// Timestamp of a chunk holding `frames` samples per channel; advances.
    pub fn next_timestamp(&mut self, frames: u64) -> u64 {
        let ts = self.peek_timestamp();
        self.samples += frames;
        ts
    }

    pub fn peek_timestamp(&self) -> u64 {
        self.samples * 1_000_000 / u64::from(self.sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_follow_counter() {
        let mut pacer = FramePacer::new(25);
        let ts: Vec<u64> = (0..4).map(|_| pacer.next_timestamp()).collect();
        assert_eq!(ts, vec![0, 40_000, 80_000, 120_000]);
        assert_eq!(pacer.frames(), 4);
    }

    #[test]
    fn test_peek_does_not_advance() {
        let mut pacer = FramePacer::new(50);
        pacer.next_timestamp();
        assert_eq!(pacer.peek_timestamp(), 20_000);
        assert_eq!(pacer.peek_timestamp(), 20_000);
        assert_eq!(pacer.next_timestamp(), 20_000);
    }

    #[test]
    fn test_sample_pacer() {
        let mut pacer = SamplePacer::new(48_000);
        assert_eq!(pacer.next_timestamp(960), 0);
        assert_eq!(pacer.next_timestamp(960), 20_000);
        assert_eq!(pacer.peek_timestamp(), 40_000);
    }

    #[test]
    fn contract_pacer_monotonic() {
        crate::invariant_ppt::clear_invariant_log();
        let mut pacer = FramePacer::new(30);
        pacer.next_timestamp();
        pacer.next_timestamp();
        crate::invariant_ppt::contract_test(
            "frame pacer",
            &["Frame timestamps strictly increase"],
        );
    }
}
