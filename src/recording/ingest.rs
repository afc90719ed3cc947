//! Frame and audio ingestion
//!
//! Two ways to get frames into a session:
//!
//! - **Push**: a producer calls [`FrameSender::on_frame`] at its own cadence.
//!   Frames travel over a bounded channel to a single consumer thread, so the
//!   producer never touches the encoder.
//! - **Poll**: a timer samples a [`FrameSampler`] once per frame interval.
//!   When the sampler has nothing, the last good frame is submitted again so
//!   the output cadence never changes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use super::convert::PixelFormat;

/// How the bytes of a [`RawFrame`] are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLayout {
    /// Packed 8-bit RGB plus alpha, needs conversion
    Interleaved(PixelFormat),
    /// Planar YUV 4:2:0, ready for the encoder
    Planar,
}

/// One captured frame
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub layout: FrameLayout,
}

impl RawFrame {
    pub fn interleaved(data: impl Into<Bytes>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            layout: FrameLayout::Interleaved(format),
        }
    }

    pub fn planar(data: impl Into<Bytes>, width: u32, height: u32) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            layout: FrameLayout::Planar,
        }
    }

    pub fn is_planar(&self) -> bool {
        self.layout == FrameLayout::Planar
    }
}

/// Recording/paused state as seen by ingestion threads.
///
/// Read and written with sequentially-consistent ordering so a pause issued
/// from the control thread is observed by the next admission check.
#[derive(Debug, Default)]
pub struct SessionFlags {
    recording: AtomicBool,
    paused: AtomicBool,
    rejected: AtomicU64,
}

impl SessionFlags {
    pub fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::SeqCst);
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Recording and not paused
    pub fn accepting(&self) -> bool {
        self.is_recording() && !self.is_paused()
    }

    /// Push frames turned away because the queue was full
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn note_rejected(&self) -> u64 {
        self.rejected.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset(&self) {
        self.set_paused(false);
        self.rejected.store(0, Ordering::Relaxed);
    }
}

/// Producer half of a push-mode source
#[derive(Clone)]
pub struct FrameSender {
    tx: Sender<RawFrame>,
    flags: Arc<SessionFlags>,
    _alive: Arc<()>,
}

impl FrameSender {
    /// Offer a planar frame. Returns whether it was admitted.
    ///
    /// Frames are dropped silently while not recording or paused, and
    /// dropped and counted when the consumer is behind. The timestamp hint
    /// is advisory; output timing comes from the frame counter.
    pub fn on_frame(
        &self,
        planar: impl Into<Bytes>,
        width: u32,
        height: u32,
        timestamp_hint_us: Option<u64>,
    ) -> bool {
        if !self.flags.accepting() {
            return false;
        }
        if let Some(hint) = timestamp_hint_us {
            log::trace!("Push frame {}x{} (hint {}us)", width, height, hint);
        }
        self.admit(RawFrame::planar(planar, width, height))
    }

    /// Offer an already-built frame of any layout
    pub fn send(&self, frame: RawFrame) -> bool {
        if !self.flags.accepting() {
            return false;
        }
        self.admit(frame)
    }

    fn admit(&self, frame: RawFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let rejected = self.flags.note_rejected();
                if rejected.is_power_of_two() {
                    log::warn!("Push queue full, {} frame(s) rejected so far", rejected);
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("Push consumer gone, frame dropped");
                false
            }
        }
    }
}

/// Consumer half of a push-mode source
pub struct PushSource {
    rx: Receiver<RawFrame>,
    flags: Arc<SessionFlags>,
    producers: Weak<()>,
}

impl PushSource {
    /// Create a bounded push channel
    pub fn channel(capacity: usize) -> (FrameSender, PushSource) {
        let (tx, rx) = bounded(capacity.max(1));
        let flags = Arc::new(SessionFlags::default());
        let alive = Arc::new(());
        let source = PushSource {
            rx,
            flags: Arc::clone(&flags),
            producers: Arc::downgrade(&alive),
        };
        let sender = FrameSender {
            tx,
            flags,
            _alive: alive,
        };
        (sender, source)
    }

    /// Whether any [`FrameSender`] is still alive
    pub fn is_connected(&self) -> bool {
        self.producers.strong_count() > 0
    }

    /// Flags the senders consult before admitting a frame
    pub fn flags(&self) -> Arc<SessionFlags> {
        Arc::clone(&self.flags)
    }

    pub(crate) fn receiver(&self) -> &Receiver<RawFrame> {
        &self.rx
    }
}

/// Synchronous sampler of whatever surface the frames are rendered to
pub trait FrameSampler: Send {
    /// Return the current frame scaled to the target size, or `None` quickly
    /// when no frame is available.
    fn capture_current_frame(&mut self, target_width: u32, target_height: u32) -> Option<RawFrame>;
}

/// Where a session gets its frames from
pub enum FrameSource {
    Push(PushSource),
    Poll(Box<dyn FrameSampler>),
    /// Prefer push while a producer is connected, else poll the fallback
    PushOrPoll {
        push: PushSource,
        fallback: Box<dyn FrameSampler>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    Push,
    Poll,
}

/// Decide which ingestion strategy a source will run with
pub fn select_mode(source: &FrameSource) -> IngestMode {
    match source {
        FrameSource::Push(_) => IngestMode::Push,
        FrameSource::Poll(_) => IngestMode::Poll,
        FrameSource::PushOrPoll { push, .. } => {
            if push.is_connected() {
                IngestMode::Push
            } else {
                IngestMode::Poll
            }
        }
    }
}

pub(crate) enum ResolvedSource {
    Push(PushSource),
    Poll(Box<dyn FrameSampler>),
}

impl FrameSource {
    pub fn mode(&self) -> IngestMode {
        select_mode(self)
    }

    pub(crate) fn resolve(self) -> ResolvedSource {
        let mode = select_mode(&self);
        match (self, mode) {
            (FrameSource::Push(push), _) => ResolvedSource::Push(push),
            (FrameSource::Poll(sampler), _) => ResolvedSource::Poll(sampler),
            (FrameSource::PushOrPoll { push, .. }, IngestMode::Push) => {
                log::info!("Frame producer connected, using push ingestion");
                ResolvedSource::Push(push)
            }
            (FrameSource::PushOrPoll { fallback, .. }, IngestMode::Poll) => {
                log::info!("No frame producer connected, falling back to polling");
                ResolvedSource::Poll(fallback)
            }
        }
    }
}

/// What one poll tick produced
#[derive(Debug, Clone)]
pub enum TickOutcome {
    Fresh(RawFrame),
    /// Sampler had nothing; the last good frame is submitted again
    Reused(RawFrame),
    /// Sampler had nothing and there is no previous frame yet
    Skipped,
}

impl TickOutcome {
    pub fn frame(&self) -> Option<&RawFrame> {
        match self {
            TickOutcome::Fresh(f) | TickOutcome::Reused(f) => Some(f),
            TickOutcome::Skipped => None,
        }
    }
}

/// Sample-or-reuse policy for poll mode, one call per timer tick
pub struct PollIngest {
    sampler: Box<dyn FrameSampler>,
    width: u32,
    height: u32,
    last_good: Option<RawFrame>,
    ticks: u64,
    reused: u64,
    skipped: u64,
}

impl PollIngest {
    pub fn new(sampler: Box<dyn FrameSampler>, width: u32, height: u32) -> Self {
        Self {
            sampler,
            width,
            height,
            last_good: None,
            ticks: 0,
            reused: 0,
            skipped: 0,
        }
    }

    pub fn tick(&mut self) -> TickOutcome {
        self.ticks += 1;
        match self.sampler.capture_current_frame(self.width, self.height) {
            Some(frame) => {
                self.last_good = Some(frame.clone());
                TickOutcome::Fresh(frame)
            }
            None => match &self.last_good {
                Some(frame) => {
                    self.reused += 1;
                    log::debug!("Surface not ready on tick {}, reusing last frame", self.ticks);
                    TickOutcome::Reused(frame.clone())
                }
                None => {
                    self.skipped += 1;
                    log::debug!("Surface not ready on tick {}, nothing to reuse", self.ticks);
                    TickOutcome::Skipped
                }
            },
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn reused(&self) -> u64 {
        self.reused
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

/// A block of interleaved f32 PCM
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioChunk {
    /// Samples per channel
    pub fn frames(&self) -> u64 {
        (self.samples.len() / usize::from(self.channels.max(1))) as u64
    }

    /// Little-endian byte encoding handed to the audio codec
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// Producer half of an audio source
#[derive(Clone)]
pub struct AudioSender {
    tx: Sender<AudioChunk>,
}

impl AudioSender {
    /// Offer a chunk without blocking; returns whether it was queued
    pub fn send(&self, chunk: AudioChunk) -> bool {
        self.tx.try_send(chunk).is_ok()
    }
}

/// Consumer half of an audio source
pub struct AudioSource {
    rx: Receiver<AudioChunk>,
}

impl AudioSource {
    pub fn channel(capacity: usize) -> (AudioSender, AudioSource) {
        let (tx, rx) = bounded(capacity.max(1));
        (AudioSender { tx }, AudioSource { rx })
    }

    pub(crate) fn receiver(&self) -> &Receiver<AudioChunk> {
        &self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSampler;

    #[test]
    fn test_sender_drops_when_not_recording() {
        let (sender, source) = PushSource::channel(4);
        assert!(!sender.on_frame(vec![0u8; 6], 2, 2, None));
        assert!(source.receiver().is_empty());

        source.flags().set_recording(true);
        assert!(sender.on_frame(vec![0u8; 6], 2, 2, Some(0)));

        source.flags().set_paused(true);
        assert!(!sender.on_frame(vec![0u8; 6], 2, 2, Some(33_000)));
        assert_eq!(source.receiver().len(), 1);
        assert_eq!(source.flags().rejected(), 0);
    }

    #[test]
    fn test_sender_counts_full_queue() {
        let (sender, source) = PushSource::channel(2);
        source.flags().set_recording(true);
        assert!(sender.on_frame(vec![0u8; 6], 2, 2, None));
        assert!(sender.on_frame(vec![0u8; 6], 2, 2, None));
        assert!(!sender.on_frame(vec![0u8; 6], 2, 2, None));
        assert_eq!(source.flags().rejected(), 1);
    }

    #[test]
    fn test_select_mode() {
        let (sender, push) = PushSource::channel(1);
        let source = FrameSource::PushOrPoll {
            push,
            fallback: Box::new(ScriptedSampler::always(4, 4)),
        };
        assert_eq!(select_mode(&source), IngestMode::Push);

        drop(sender);
        assert_eq!(select_mode(&source), IngestMode::Poll);
        assert!(matches!(source.resolve(), ResolvedSource::Poll(_)));

        let poll = FrameSource::Poll(Box::new(ScriptedSampler::always(4, 4)));
        assert_eq!(poll.mode(), IngestMode::Poll);
    }

    #[test]
    fn test_poll_reuses_last_good_frame() {
        // Ticks are 1-based; 2, 5 and 9 fail
        let sampler = ScriptedSampler::failing_on(4, 4, &[2, 5, 9]);
        let mut ingest = PollIngest::new(Box::new(sampler), 4, 4);
        let produced = (0..10).filter(|_| ingest.tick().frame().is_some()).count();
        assert_eq!(produced, 10);
        assert_eq!(ingest.reused(), 3);
        assert_eq!(ingest.skipped(), 0);
    }

    #[test]
    fn test_poll_skips_leading_failures() {
        let sampler = ScriptedSampler::failing_on(4, 4, &[1, 2, 5]);
        let mut ingest = PollIngest::new(Box::new(sampler), 4, 4);
        let outcomes: Vec<_> = (0..6).map(|_| ingest.tick()).collect();
        assert!(matches!(outcomes[0], TickOutcome::Skipped));
        assert!(matches!(outcomes[1], TickOutcome::Skipped));
        assert!(matches!(outcomes[2], TickOutcome::Fresh(_)));
        assert!(matches!(outcomes[4], TickOutcome::Reused(_)));
        assert_eq!(ingest.skipped(), 2);
    }

    #[test]
    fn test_audio_chunk_frames() {
        let chunk = AudioChunk {
            samples: vec![0.0; 1920],
            sample_rate: 48_000,
            channels: 2,
        };
        assert_eq!(chunk.frames(), 960);
        assert_eq!(chunk.to_le_bytes().len(), 1920 * 4);
    }
}
