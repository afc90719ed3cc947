//! Encoder adapter and drain loop
//!
//! Wraps a `Codec` with lifecycle state, bounded input-slot acquisition, load
//! reporting, and the loop that moves encoded output into the container.
//! The codec mutex doubles as the drain guard: at most one drain runs per
//! encoder, and queueing never interleaves with a drain in progress.

use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use super::codec::{Codec, CodecOutput, InputSlot, TrackKind};
use super::writer::{ContainerGate, Registration, WriteOutcome};
use crate::config::EncoderSettings;
use crate::errors::RecorderError;

const ACQUIRE_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Unconfigured,
    Configured,
    Running,
    /// End-of-stream queued, outputs still flowing
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadLevel {
    Nominal,
    /// Three quarters of the input pool outstanding
    Warning,
    /// Seven eighths of the input pool outstanding
    Critical,
}

impl LoadLevel {
    pub fn classify(outstanding: usize, capacity: usize) -> Self {
        if capacity == 0 {
            return LoadLevel::Nominal;
        }
        if outstanding * 8 >= capacity * 7 {
            LoadLevel::Critical
        } else if outstanding * 4 >= capacity * 3 {
            LoadLevel::Warning
        } else {
            LoadLevel::Nominal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued { timestamp_us: u64 },
    /// No input slot freed up within the input timeout
    WouldBlock,
}

/// Snapshot of how full an encoder's input pool is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderLoad {
    pub outstanding: usize,
    pub capacity: usize,
    pub level: LoadLevel,
}

/// What one drain pass moved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub written: u64,
    pub discarded: u64,
    pub end_of_stream: bool,
}

impl DrainReport {
    fn absorb(&mut self, other: DrainReport) {
        self.written += other.written;
        self.discarded += other.discarded;
        self.end_of_stream |= other.end_of_stream;
    }
}

struct EncoderCore {
    codec: Box<dyn Codec>,
    state: EncoderState,
    end_of_stream_seen: bool,
    load_level: LoadLevel,
}

/// Lifecycle and flow control around one codec session
pub struct EncoderAdapter {
    kind: TrackKind,
    core: Mutex<EncoderCore>,
    input_timeout: Duration,
    output_timeout: Duration,
}

impl EncoderAdapter {
    pub fn new(codec: Box<dyn Codec>, settings: &EncoderSettings) -> Self {
        Self {
            kind: codec.kind(),
            core: Mutex::new(EncoderCore {
                codec,
                state: EncoderState::Unconfigured,
                end_of_stream_seen: false,
                load_level: LoadLevel::Nominal,
            }),
            input_timeout: Duration::from_millis(settings.input_timeout_ms),
            output_timeout: Duration::from_millis(settings.output_timeout_ms),
        }
    }

    fn lock_core(&self) -> MutexGuard<'_, EncoderCore> {
        self.core.lock().expect("lock poisoned")
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn state(&self) -> EncoderState {
        self.lock_core().state
    }

    /// Whether an end-of-stream output has come back from the codec
    pub fn reached_end_of_stream(&self) -> bool {
        self.lock_core().end_of_stream_seen
    }

    pub fn configure(&self, config: &super::config::RecordingConfig) -> Result<(), RecorderError> {
        let mut core = self.lock_core();
        if matches!(core.state, EncoderState::Running | EncoderState::Draining) {
            return Err(RecorderError::InvalidState(format!(
                "{:?} encoder is running",
                self.kind
            )));
        }
        core.codec.configure(config)?;
        core.state = EncoderState::Configured;
        core.end_of_stream_seen = false;
        Ok(())
    }

    pub fn start(&self) -> Result<(), RecorderError> {
        let mut core = self.lock_core();
        if core.state != EncoderState::Configured {
            return Err(RecorderError::InvalidState(format!(
                "{:?} encoder started in state {:?}",
                self.kind, core.state
            )));
        }
        core.codec.start()?;
        core.state = EncoderState::Running;
        log::debug!("{:?} encoder running", self.kind);
        Ok(())
    }

    /// Try to reserve an input slot, retrying until `timeout` elapses.
    ///
    /// Returns `Ok(None)` when no slot freed up in time.
    pub fn acquire_input(&self, timeout: Duration) -> Result<Option<InputSlot>, RecorderError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut core = self.lock_core();
                if core.state != EncoderState::Running {
                    return Err(RecorderError::InvalidState(format!(
                        "{:?} encoder not accepting input ({:?})",
                        self.kind, core.state
                    )));
                }
                if let Some(slot) = core.codec.dequeue_input() {
                    return Ok(Some(slot));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(ACQUIRE_BACKOFF);
        }
    }

    /// Reserve an input slot using the configured input timeout
    pub fn try_acquire_input(&self) -> Result<Option<InputSlot>, RecorderError> {
        self.acquire_input(self.input_timeout)
    }

    /// Fill a reserved slot. Queueing end-of-stream moves the adapter to draining.
    pub fn queue(
        &self,
        slot: InputSlot,
        payload: &[u8],
        timestamp_us: u64,
        end_of_stream: bool,
    ) -> Result<(), RecorderError> {
        let mut core = self.lock_core();
        core.codec
            .queue_input(slot, payload, timestamp_us, end_of_stream)?;
        if end_of_stream {
            core.state = EncoderState::Draining;
            log::debug!("{:?} end-of-stream queued at {}us", self.kind, timestamp_us);
        }
        self.update_load(&mut core);
        Ok(())
    }

    /// Submit one payload. The payload is checked first and the timestamp
    /// is only drawn once a slot was reserved, so neither a rejected payload
    /// nor a would-block result consumes a timestamp.
    pub fn submit<F>(&self, payload: &[u8], next_timestamp: F) -> Result<SubmitOutcome, RecorderError>
    where
        F: FnOnce() -> u64,
    {
        self.lock_core().codec.check_input(payload)?;
        match self.try_acquire_input()? {
            Some(slot) => {
                let timestamp_us = next_timestamp();
                self.queue(slot, payload, timestamp_us, false)?;
                Ok(SubmitOutcome::Queued { timestamp_us })
            }
            None => Ok(SubmitOutcome::WouldBlock),
        }
    }

    fn update_load(&self, core: &mut EncoderCore) {
        let level = LoadLevel::classify(core.codec.pending_inputs(), core.codec.input_capacity());
        if level != core.load_level {
            match level {
                LoadLevel::Critical => log::warn!(
                    "{:?} encoder input pool critical: {}/{} outstanding",
                    self.kind,
                    core.codec.pending_inputs(),
                    core.codec.input_capacity()
                ),
                LoadLevel::Warning => log::warn!(
                    "{:?} encoder input pool high: {}/{} outstanding",
                    self.kind,
                    core.codec.pending_inputs(),
                    core.codec.input_capacity()
                ),
                LoadLevel::Nominal => {
                    log::debug!("{:?} encoder load back to nominal", self.kind)
                }
            }
            core.load_level = level;
        }
    }

    pub fn load(&self) -> EncoderLoad {
        let core = self.lock_core();
        let outstanding = core.codec.pending_inputs();
        let capacity = core.codec.input_capacity();
        EncoderLoad {
            outstanding,
            capacity,
            level: LoadLevel::classify(outstanding, capacity),
        }
    }

    pub fn request_keyframe(&self) {
        self.lock_core().codec.request_keyframe();
    }

    /// Move every ready output into the container.
    ///
    /// Stops at the first "try again later" or at end-of-stream. Write
    /// failures are logged and the sample skipped; codec failures abort the
    /// pass and are returned.
    pub fn drain(&self, gate: &Mutex<ContainerGate>) -> Result<DrainReport, RecorderError> {
        let mut core = self.lock_core();
        let mut report = DrainReport::default();

        if !matches!(core.state, EncoderState::Running | EncoderState::Draining) {
            return Ok(report);
        }

        loop {
            match core.codec.dequeue_output(self.output_timeout)? {
                CodecOutput::TryAgainLater => break,
                CodecOutput::FormatReady(descriptor) => {
                    let mut gate = gate.lock().expect("lock poisoned");
                    match gate.register_track(&descriptor) {
                        Ok(Registration::Registered { index, started }) => {
                            log::info!(
                                "{:?} format ready ({:?}), track {}{}",
                                self.kind,
                                descriptor.format,
                                index,
                                if started { ", writer started" } else { "" }
                            );
                        }
                        Ok(Registration::Duplicate) => {
                            log::error!(
                                "{:?} encoder announced its format twice; ignoring",
                                self.kind
                            );
                        }
                        Err(e) => {
                            log::error!("Failed to add {:?} track: {}", self.kind, e);
                        }
                    }
                }
                CodecOutput::Sample(mut sample) => {
                    if sample.flags.codec_config {
                        sample.size = 0;
                    }
                    let end_of_stream = sample.flags.end_of_stream;

                    if sample.size > 0 {
                        let outcome = gate
                            .lock()
                            .expect("lock poisoned")
                            .write(self.kind, &sample);
                        match outcome {
                            Ok(WriteOutcome::Written) => report.written += 1,
                            Ok(WriteOutcome::Discarded) => report.discarded += 1,
                            Err(e) => log::error!(
                                "Failed to write {:?} sample at {}us: {}",
                                self.kind,
                                sample.timestamp_us,
                                e
                            ),
                        }
                    }

                    core.codec.release_output(sample);

                    if end_of_stream {
                        core.end_of_stream_seen = true;
                        report.end_of_stream = true;
                        break;
                    }
                }
            }
        }

        self.update_load(&mut core);
        Ok(report)
    }

    /// Queue end-of-stream, retrying slot acquisition with drains in between
    /// until `timeout` elapses. Returns whether it was queued.
    pub fn signal_end_of_stream(
        &self,
        timestamp_us: u64,
        gate: &Mutex<ContainerGate>,
        timeout: Duration,
    ) -> Result<bool, RecorderError> {
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if let Some(slot) = self.acquire_input(self.input_timeout)? {
                self.queue(slot, &[], timestamp_us, true)?;
                if attempts > 1 {
                    log::debug!(
                        "{:?} end-of-stream queued after {} attempts",
                        self.kind,
                        attempts
                    );
                }
                return Ok(true);
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "{:?} encoder gave no input slot for end-of-stream within {:?}",
                    self.kind,
                    timeout
                );
                return Ok(false);
            }
            if let Err(e) = self.drain(gate) {
                log::error!("{:?} drain during end-of-stream retry failed: {}", self.kind, e);
            }
        }
    }

    /// Drain until end-of-stream comes back or `timeout` elapses
    pub fn drain_to_end(
        &self,
        gate: &Mutex<ContainerGate>,
        timeout: Duration,
    ) -> Result<DrainReport, RecorderError> {
        let deadline = Instant::now() + timeout;
        let mut total = DrainReport::default();
        while !self.reached_end_of_stream() {
            total.absorb(self.drain(gate)?);
            if total.end_of_stream {
                break;
            }
            if Instant::now() >= deadline {
                log::warn!("{:?} encoder did not reach end-of-stream in {:?}", self.kind, timeout);
                break;
            }
            thread::sleep(ACQUIRE_BACKOFF);
        }
        Ok(total)
    }

    /// Release the codec. Safe to call more than once.
    pub fn stop(&self) -> Result<(), RecorderError> {
        let mut core = self.lock_core();
        if matches!(core.state, EncoderState::Stopped | EncoderState::Unconfigured) {
            core.state = EncoderState::Stopped;
            return Ok(());
        }
        core.state = EncoderState::Stopped;
        core.codec.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::config::RecordingConfig;
    use crate::recording::encoder::H264Codec;
    use crate::testing::{MockCodec, MockWriter};

    fn settings() -> EncoderSettings {
        EncoderSettings {
            input_timeout_ms: 2,
            output_timeout_ms: 0,
            ..EncoderSettings::default()
        }
    }

    fn running(codec: MockCodec) -> EncoderAdapter {
        let adapter = EncoderAdapter::new(Box::new(codec), &settings());
        adapter.configure(&RecordingConfig::default()).unwrap();
        adapter.start().unwrap();
        adapter
    }

    #[test]
    fn test_load_levels() {
        assert_eq!(LoadLevel::classify(0, 16), LoadLevel::Nominal);
        assert_eq!(LoadLevel::classify(11, 16), LoadLevel::Nominal);
        assert_eq!(LoadLevel::classify(12, 16), LoadLevel::Warning);
        assert_eq!(LoadLevel::classify(13, 16), LoadLevel::Warning);
        assert_eq!(LoadLevel::classify(14, 16), LoadLevel::Critical);
        assert_eq!(LoadLevel::classify(16, 16), LoadLevel::Critical);
    }

    #[test]
    fn test_lifecycle() {
        let adapter = EncoderAdapter::new(Box::new(MockCodec::video()), &settings());
        assert_eq!(adapter.state(), EncoderState::Unconfigured);
        assert!(adapter.start().is_err());

        adapter.configure(&RecordingConfig::default()).unwrap();
        adapter.start().unwrap();
        assert_eq!(adapter.state(), EncoderState::Running);
        assert!(adapter.configure(&RecordingConfig::default()).is_err());

        adapter.stop().unwrap();
        adapter.stop().unwrap();
        assert_eq!(adapter.state(), EncoderState::Stopped);
    }

    #[test]
    fn test_acquire_times_out() {
        let codec = MockCodec::video().failing_acquisitions(usize::MAX);
        let adapter = running(codec);
        assert!(adapter.acquire_input(Duration::from_millis(3)).unwrap().is_none());
    }

    #[test]
    fn test_rejected_payload_consumes_no_timestamp() {
        let adapter = EncoderAdapter::new(Box::new(H264Codec::new(4, 2)), &settings());
        adapter.configure(&RecordingConfig::new(64, 48, 25)).unwrap();
        adapter.start().unwrap();

        let mut drawn = 0;
        assert!(adapter
            .submit(&[0u8; 100], || {
                drawn += 1;
                0
            })
            .is_err());
        assert_eq!(drawn, 0);
        assert_eq!(adapter.load().outstanding, 0);
    }

    #[test]
    fn test_would_block_consumes_no_timestamp() {
        let adapter = running(MockCodec::video().failing_acquisitions(usize::MAX));
        let mut drawn = 0;
        let outcome = adapter
            .submit(&[1], || {
                drawn += 1;
                0
            })
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::WouldBlock);
        assert_eq!(drawn, 0);
    }

    #[test]
    fn test_drain_registers_and_writes() {
        let codec = MockCodec::video();
        let codec_log = codec.log();
        let adapter = running(codec);
        let writer = MockWriter::new();
        let writer_log = writer.log();
        let gate = Mutex::new(ContainerGate::new(Box::new(writer), false));

        for ts in [0u64, 40_000, 80_000] {
            let slot = adapter.try_acquire_input().unwrap().unwrap();
            adapter.queue(slot, &[1, 2, 3], ts, false).unwrap();
        }
        let report = adapter.drain(&gate).unwrap();
        assert_eq!(report.written, 3);
        assert!(!report.end_of_stream);

        let written: Vec<u64> = writer_log
            .lock()
            .unwrap()
            .samples
            .iter()
            .map(|(_, s)| s.timestamp_us)
            .collect();
        assert_eq!(written, vec![0, 40_000, 80_000]);
        assert_eq!(codec_log.lock().unwrap().released, 3);
    }

    #[test]
    fn test_config_samples_never_written() {
        let codec = MockCodec::video().with_codec_config_sample();
        let codec_log = codec.log();
        let adapter = running(codec);
        let writer = MockWriter::new();
        let writer_log = writer.log();
        let gate = Mutex::new(ContainerGate::new(Box::new(writer), false));

        let slot = adapter.try_acquire_input().unwrap().unwrap();
        adapter.queue(slot, &[1], 0, false).unwrap();
        adapter.drain(&gate).unwrap();

        assert_eq!(writer_log.lock().unwrap().samples.len(), 1);
        // The config buffer is still handed back
        assert_eq!(codec_log.lock().unwrap().released, 2);
    }

    #[test]
    fn test_end_of_stream_retries_until_slot() {
        let codec = MockCodec::video();
        let codec_log = codec.log();
        let adapter = running(codec);
        let gate = Mutex::new(ContainerGate::new(Box::new(MockWriter::new()), false));

        codec_log.lock().unwrap().fail_next_acquisitions = 3;
        let queued = adapter
            .signal_end_of_stream(120_000, &gate, Duration::from_secs(1))
            .unwrap();
        assert!(queued);
        assert_eq!(adapter.state(), EncoderState::Draining);

        let report = adapter.drain_to_end(&gate, Duration::from_secs(1)).unwrap();
        assert!(report.end_of_stream);
        assert!(adapter.reached_end_of_stream());
        assert_eq!(codec_log.lock().unwrap().end_of_stream_at, Some(120_000));
    }

    #[test]
    fn test_duplicate_format_is_ignored() {
        let codec = MockCodec::video().announcing_format_twice();
        let adapter = running(codec);
        let writer = MockWriter::new();
        let writer_log = writer.log();
        let gate = Mutex::new(ContainerGate::new(Box::new(writer), false));

        let slot = adapter.try_acquire_input().unwrap().unwrap();
        adapter.queue(slot, &[1], 0, false).unwrap();
        adapter.drain(&gate).unwrap();

        let log = writer_log.lock().unwrap();
        assert_eq!(log.tracks.len(), 1);
        assert_eq!(log.starts, 1);
        assert_eq!(log.samples.len(), 1);
    }
}
