//! Per-track submission paths and the threads that feed them
//!
//! Every path converges on the same steps: convert if needed, reserve an
//! encoder slot, take the next paced timestamp, queue, then drain.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, tick, Receiver};

use super::adapter::{DrainReport, EncoderAdapter, SubmitOutcome};
use super::config::RecordingConfig;
use super::convert::{convert, i420_size, ResizeFilter};
use super::ingest::{
    AudioChunk, AudioSource, FrameLayout, PollIngest, PushSource, RawFrame, SessionFlags,
    TickOutcome,
};
use super::pacer::{FramePacer, SamplePacer};
use super::writer::ContainerGate;
use crate::errors::RecorderError;

/// Ticks between capture-rate log lines in poll mode
const RATE_CHECK_TICKS: u32 = 50;

/// Video submission path: converter, frame pacer, encoder, drain
pub struct VideoPipeline {
    adapter: Arc<EncoderAdapter>,
    gate: Arc<Mutex<ContainerGate>>,
    pacer: Mutex<FramePacer>,
    width: u32,
    height: u32,
    filter: ResizeFilter,
    submitted: AtomicU64,
    dropped: AtomicU64,
    reused: AtomicU64,
    skipped: AtomicU64,
}

impl VideoPipeline {
    pub fn new(
        adapter: Arc<EncoderAdapter>,
        gate: Arc<Mutex<ContainerGate>>,
        config: &RecordingConfig,
    ) -> Self {
        Self {
            adapter,
            gate,
            pacer: Mutex::new(FramePacer::with_frame_duration(config.frame_duration_us())),
            width: config.width,
            height: config.height,
            filter: ResizeFilter::default(),
            submitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn with_filter(mut self, filter: ResizeFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Encode one frame and drain whatever the encoder has ready
    pub fn submit_frame(&self, frame: &RawFrame) -> Result<SubmitOutcome, RecorderError> {
        let payload: Cow<'_, [u8]> = match frame.layout {
            FrameLayout::Planar => {
                if frame.width != self.width || frame.height != self.height {
                    return Err(RecorderError::Capture(format!(
                        "Planar frame is {}x{}, session records {}x{}",
                        frame.width, frame.height, self.width, self.height
                    )));
                }
                let expected = i420_size(self.width, self.height);
                if frame.data.len() != expected {
                    return Err(RecorderError::Capture(format!(
                        "Planar frame holds {} bytes, expected {}",
                        frame.data.len(),
                        expected
                    )));
                }
                Cow::Borrowed(&frame.data[..])
            }
            FrameLayout::Interleaved(format) => Cow::Owned(convert(
                &frame.data,
                format,
                frame.width,
                frame.height,
                self.width,
                self.height,
                self.filter,
            )?),
        };

        // Holding the pacer across the submit keeps timestamps in queue order
        let outcome = {
            let mut pacer = self.pacer.lock().expect("lock poisoned");
            self.adapter.submit(&payload, || pacer.next_timestamp())?
        };

        match outcome {
            SubmitOutcome::Queued { .. } => {
                self.submitted.fetch_add(1, Ordering::Relaxed);
            }
            SubmitOutcome::WouldBlock => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    log::warn!("Encoder input busy, {} frame(s) dropped so far", dropped);
                }
            }
        }

        self.drain();
        Ok(outcome)
    }

    /// Drain the video encoder, logging failures
    pub fn drain(&self) -> DrainReport {
        self.adapter.drain(&self.gate).unwrap_or_else(|e| {
            log::error!("Video drain failed: {}", e);
            DrainReport::default()
        })
    }

    /// Deliver end-of-stream at the next frame position and drain to it
    pub fn finish(&self, timeout: Duration) -> bool {
        let timestamp_us = self.pacer.lock().expect("lock poisoned").peek_timestamp();
        finish_track(&self.adapter, &self.gate, timestamp_us, timeout)
    }

    pub fn adapter(&self) -> &Arc<EncoderAdapter> {
        &self.adapter
    }

    pub(crate) fn note_tick(&self, outcome: &TickOutcome) {
        match outcome {
            TickOutcome::Fresh(_) => {}
            TickOutcome::Reused(_) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
            }
            TickOutcome::Skipped => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn frames_submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn frames_reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }

    pub fn ticks_skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Audio submission path: sample pacer, encoder, drain
pub struct AudioPipeline {
    adapter: Arc<EncoderAdapter>,
    gate: Arc<Mutex<ContainerGate>>,
    pacer: Mutex<SamplePacer>,
    sample_rate: u32,
    channels: u16,
    submitted: AtomicU64,
    dropped: AtomicU64,
}

impl AudioPipeline {
    pub fn new(
        adapter: Arc<EncoderAdapter>,
        gate: Arc<Mutex<ContainerGate>>,
        config: &RecordingConfig,
    ) -> Self {
        Self {
            adapter,
            gate,
            pacer: Mutex::new(SamplePacer::new(config.audio.sample_rate)),
            sample_rate: config.audio.sample_rate,
            channels: config.audio.channels,
            submitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn submit_chunk(&self, chunk: &AudioChunk) -> Result<SubmitOutcome, RecorderError> {
        if chunk.sample_rate != self.sample_rate || chunk.channels != self.channels {
            return Err(RecorderError::Capture(format!(
                "Audio chunk is {} Hz x{}, session records {} Hz x{}",
                chunk.sample_rate, chunk.channels, self.sample_rate, self.channels
            )));
        }

        let payload = chunk.to_le_bytes();
        let outcome = {
            let mut pacer = self.pacer.lock().expect("lock poisoned");
            self.adapter
                .submit(&payload, || pacer.next_timestamp(chunk.frames()))?
        };

        match outcome {
            SubmitOutcome::Queued { .. } => {
                self.submitted.fetch_add(1, Ordering::Relaxed);
            }
            SubmitOutcome::WouldBlock => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.drain();
        Ok(outcome)
    }

    pub fn drain(&self) -> DrainReport {
        self.adapter.drain(&self.gate).unwrap_or_else(|e| {
            log::error!("Audio drain failed: {}", e);
            DrainReport::default()
        })
    }

    pub fn finish(&self, timeout: Duration) -> bool {
        let timestamp_us = self.pacer.lock().expect("lock poisoned").peek_timestamp();
        finish_track(&self.adapter, &self.gate, timestamp_us, timeout)
    }

    pub fn adapter(&self) -> &Arc<EncoderAdapter> {
        &self.adapter
    }

    pub fn chunks_submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn chunks_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn finish_track(
    adapter: &EncoderAdapter,
    gate: &Mutex<ContainerGate>,
    timestamp_us: u64,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    match adapter.signal_end_of_stream(timestamp_us, gate, timeout) {
        Ok(true) => {}
        Ok(false) => return false,
        Err(e) => {
            log::error!("{:?} end-of-stream failed: {}", adapter.kind(), e);
            return false;
        }
    }
    let remaining = deadline.saturating_duration_since(Instant::now());
    match adapter.drain_to_end(gate, remaining) {
        Ok(report) => report.end_of_stream || adapter.reached_end_of_stream(),
        Err(e) => {
            log::error!("{:?} final drain failed: {}", adapter.kind(), e);
            false
        }
    }
}

/// A named ingestion thread
pub(crate) struct Worker {
    name: String,
    handle: JoinHandle<()>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: &str, body: F) -> Result<Self, RecorderError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("crabreel-{}", name))
            .spawn(body)
            .map_err(|e| RecorderError::InvalidState(format!("{} spawn failed: {}", name, e)))?;
        Ok(Self {
            name: name.to_string(),
            handle,
        })
    }

    /// Wait up to `timeout` for the thread to exit; detach it otherwise
    pub(crate) fn join_timeout(self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.handle.is_finished() {
                if self.handle.join().is_err() {
                    log::error!("{} worker panicked", self.name);
                }
                return true;
            }
            if start.elapsed() >= timeout {
                log::warn!("{} worker did not exit within {:?}, detaching", self.name, timeout);
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

fn submit_logged(video: &VideoPipeline, frame: &RawFrame) {
    if let Err(e) = video.submit_frame(frame) {
        log::warn!("Frame submission failed: {}", e);
    }
}

/// Single consumer for push-mode frames. Frames already admitted when stop
/// is signalled are still submitted, unless the session is paused.
pub(crate) fn run_push_consumer(
    source: PushSource,
    video: Arc<VideoPipeline>,
    flags: Arc<SessionFlags>,
    stop: Receiver<()>,
) {
    let frames = source.receiver().clone();
    loop {
        select! {
            recv(frames) -> msg => match msg {
                Ok(frame) => {
                    if !flags.is_paused() {
                        submit_logged(&video, &frame);
                    }
                }
                Err(_) => {
                    log::debug!("All frame producers disconnected");
                    break;
                }
            },
            recv(stop) -> _ => break,
        }
    }

    let mut late = 0u32;
    while let Ok(frame) = frames.try_recv() {
        if !flags.is_paused() {
            submit_logged(&video, &frame);
            late += 1;
        }
    }
    if late > 0 {
        log::debug!("Submitted {} queued frame(s) after stop", late);
    }
}

/// Timer-driven sampling at the configured frame interval
pub(crate) fn run_poll_loop(
    mut ingest: PollIngest,
    video: Arc<VideoPipeline>,
    flags: Arc<SessionFlags>,
    interval: Duration,
    stop: Receiver<()>,
) {
    let ticker = tick(interval);
    let mut window_start = Instant::now();
    let mut window_ticks = 0u32;

    loop {
        select! {
            recv(stop) -> _ => break,
            recv(ticker) -> _ => {
                if !flags.accepting() {
                    continue;
                }
                let outcome = ingest.tick();
                video.note_tick(&outcome);
                if let Some(frame) = outcome.frame() {
                    submit_logged(&video, frame);
                }

                window_ticks += 1;
                if window_ticks == RATE_CHECK_TICKS {
                    let elapsed = window_start.elapsed().as_secs_f64();
                    if elapsed > 0.0 {
                        log::debug!(
                            "Capture rate {:.1} fps (target {:.1})",
                            f64::from(window_ticks) / elapsed,
                            1.0 / interval.as_secs_f64().max(f64::EPSILON)
                        );
                    }
                    window_start = Instant::now();
                    window_ticks = 0;
                }
            }
        }
    }
}

/// Consumer for audio chunks; chunks arriving while paused are dropped
pub(crate) fn run_audio_loop(
    source: AudioSource,
    audio: Arc<AudioPipeline>,
    flags: Arc<SessionFlags>,
    stop: Receiver<()>,
) {
    let chunks = source.receiver().clone();
    loop {
        select! {
            recv(chunks) -> msg => match msg {
                Ok(chunk) => {
                    if flags.accepting() {
                        if let Err(e) = audio.submit_chunk(&chunk) {
                            log::warn!("Audio submission failed: {}", e);
                        }
                    }
                }
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }
}

/// Periodic drain of every active encoder
pub(crate) fn run_drain_ticker(
    video: Arc<VideoPipeline>,
    audio: Option<Arc<AudioPipeline>>,
    interval: Duration,
    stop: Receiver<()>,
) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(ticker) -> _ => {
                video.drain();
                if let Some(audio) = &audio {
                    audio.drain();
                }
            }
        }
    }
}
