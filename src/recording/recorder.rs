//! Recording session controller
//!
//! `Recorder` owns at most one [`ActiveSession`] at a time. The session is
//! built by `start` and torn down by `stop`; nothing about a session
//! outlives it except the [`RecordingStats`] it leaves behind.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Local;
use crossbeam_channel::{bounded, Receiver, Sender};
use uuid::Uuid;

use super::adapter::EncoderAdapter;
use super::backend::{RecorderBackend, SoftwareBackend};
use super::config::{RecordingConfig, RecordingStats};
use super::ingest::{
    AudioSource, FrameSender, FrameSource, IngestMode, PollIngest, PushSource, ResolvedSource,
    SessionFlags,
};
use super::pipeline::{
    run_audio_loop, run_drain_ticker, run_poll_loop, run_push_consumer, AudioPipeline,
    VideoPipeline, Worker,
};
use super::store::{LibraryStore, MediaMetadata, MediaStore};
use super::writer::ContainerGate;
use crate::config::RecorderSettings;
use crate::errors::RecorderError;
use crate::timing::SessionClock;

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Recording,
    Paused,
    /// `stop` is draining and closing the session
    Finalizing,
}

struct ActiveSession {
    id: Uuid,
    output_path: PathBuf,
    display_name: String,
    config: RecordingConfig,
    mode: IngestMode,
    flags: Arc<SessionFlags>,
    clock: SessionClock,
    video: Arc<VideoPipeline>,
    audio: Option<Arc<AudioPipeline>>,
    gate: Arc<Mutex<ContainerGate>>,
    workers: Vec<Worker>,
    stop_tx: Option<Sender<()>>,
}

struct Inner {
    state: SessionState,
    session: Option<ActiveSession>,
}

/// Records frames into a container file, one session at a time
pub struct Recorder {
    settings: RecorderSettings,
    backend: Arc<dyn RecorderBackend>,
    store: Arc<dyn MediaStore>,
    config: Mutex<RecordingConfig>,
    pending_audio: Mutex<Option<AudioSource>>,
    inner: Mutex<Inner>,
    last_stats: Mutex<Option<RecordingStats>>,
}

impl Recorder {
    pub fn new(
        settings: RecorderSettings,
        backend: Arc<dyn RecorderBackend>,
        store: Arc<dyn MediaStore>,
    ) -> Self {
        Self {
            settings,
            backend,
            store,
            config: Mutex::new(RecordingConfig::default()),
            pending_audio: Mutex::new(None),
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                session: None,
            }),
            last_stats: Mutex::new(None),
        }
    }

    /// Software encoders and a filesystem library under `storage.library_dir`
    pub fn with_settings(settings: RecorderSettings) -> Self {
        let store = Arc::new(LibraryStore::from_settings(&settings.storage));
        Self::new(settings, Arc::new(SoftwareBackend), store)
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("lock poisoned")
    }

    pub fn settings(&self) -> &RecorderSettings {
        &self.settings
    }

    /// Set the configuration the next `start` will use
    pub fn configure(&self, config: RecordingConfig) {
        log::info!(
            "Recording configured: {}x{} @ {} fps, {} bps, device {}, audio {}",
            config.width,
            config.height,
            config.fps,
            config.bitrate,
            config.device_tag,
            config.include_audio
        );
        *self.config.lock().expect("lock poisoned") = config;
    }

    pub fn config(&self) -> RecordingConfig {
        self.config.lock().expect("lock poisoned").clone()
    }

    /// Use `source` for the audio track of the next session
    pub fn attach_audio(&self, source: AudioSource) {
        *self.pending_audio.lock().expect("lock poisoned") = Some(source);
    }

    /// Push channel sized from the ingest settings
    pub fn push_channel(&self) -> (FrameSender, PushSource) {
        PushSource::channel(self.settings.ingest.push_queue_capacity)
    }

    pub fn state(&self) -> SessionState {
        self.lock_inner().state
    }

    /// True while a session is recording or paused
    pub fn is_recording(&self) -> bool {
        matches!(
            self.lock_inner().state,
            SessionState::Recording | SessionState::Paused
        )
    }

    pub fn is_paused(&self) -> bool {
        self.lock_inner().state == SessionState::Paused
    }

    /// Recording time excluding pauses; 0 when idle
    pub fn active_duration_ms(&self) -> u64 {
        self.lock_inner()
            .session
            .as_ref()
            .map(|s| s.clock.active().as_millis() as u64)
            .unwrap_or(0)
    }

    /// Ingestion strategy of the running session
    pub fn ingest_mode(&self) -> Option<IngestMode> {
        self.lock_inner().session.as_ref().map(|s| s.mode)
    }

    pub fn output_path(&self) -> Option<PathBuf> {
        self.lock_inner()
            .session
            .as_ref()
            .map(|s| s.output_path.clone())
    }

    /// Stats of the most recently stopped session
    pub fn last_stats(&self) -> Option<RecordingStats> {
        self.last_stats.lock().expect("lock poisoned").clone()
    }

    /// Start a session fed by `source`. Returns false if a session is
    /// already running or anything fails to set up.
    pub fn start(&self, source: FrameSource) -> bool {
        let mut inner = self.lock_inner();
        if inner.state != SessionState::Idle {
            log::warn!("start ignored: recorder is {:?}", inner.state);
            return false;
        }

        let config = self.config();
        let audio_source = if config.include_audio {
            self.pending_audio.lock().expect("lock poisoned").take()
        } else {
            None
        };

        match self.open_session(config, source, audio_source) {
            Ok(session) => {
                log::info!(
                    "Recording {} started: {} ({:?} ingestion)",
                    session.id,
                    session.output_path.display(),
                    session.mode
                );
                inner.session = Some(session);
                inner.state = SessionState::Recording;
                true
            }
            Err(e) => {
                log::error!("Failed to start recording: {}", e);
                false
            }
        }
    }

    pub fn pause(&self) -> bool {
        let mut inner = self.lock_inner();
        if inner.state != SessionState::Recording {
            log::warn!("pause ignored: recorder is {:?}", inner.state);
            return false;
        }
        if let Some(session) = inner.session.as_mut() {
            session.clock.pause();
            session.flags.set_paused(true);
        }
        inner.state = SessionState::Paused;
        log::info!("Recording paused");
        true
    }

    pub fn resume(&self) -> bool {
        let mut inner = self.lock_inner();
        if inner.state != SessionState::Paused {
            log::warn!("resume ignored: recorder is {:?}", inner.state);
            return false;
        }
        if let Some(session) = inner.session.as_mut() {
            let paused = session.clock.resume();
            session.flags.set_paused(false);
            log::info!("Recording resumed after {:?}", paused);
        }
        inner.state = SessionState::Recording;
        true
    }

    /// Stop the session and hand the finished file to the media store.
    ///
    /// Every cleanup step runs even if an earlier one failed. Calling `stop`
    /// with no session is a no-op that returns true.
    pub fn stop(&self) -> bool {
        let session = {
            let mut inner = self.lock_inner();
            match inner.session.take() {
                Some(session) => {
                    inner.state = SessionState::Finalizing;
                    session
                }
                None => return true,
            }
        };

        let stats = self.finalize(session);
        log::info!(
            "Recording {} stopped: {} frames submitted, {} dropped, {} samples written",
            stats.session_id,
            stats.frames_submitted,
            stats.frames_dropped,
            stats.samples_written
        );
        *self.last_stats.lock().expect("lock poisoned") = Some(stats);

        self.lock_inner().state = SessionState::Idle;
        true
    }

    fn output_name(&self, config: &RecordingConfig) -> String {
        format!(
            "{}-{}_{}.mp4",
            self.settings.storage.file_prefix,
            config.device_tag,
            Local::now().format("%y%m%d_%H%M%S")
        )
    }

    fn open_session(
        &self,
        config: RecordingConfig,
        source: FrameSource,
        audio_source: Option<AudioSource>,
    ) -> Result<ActiveSession, RecorderError> {
        config.validate()?;
        self.settings
            .validate()
            .map_err(RecorderError::Configuration)?;

        let encoder_settings = &self.settings.encoder;
        let video_adapter = Arc::new(EncoderAdapter::new(
            self.backend.video_codec(&config, encoder_settings)?,
            encoder_settings,
        ));
        video_adapter.configure(&config)?;

        let audio_adapter = if config.include_audio {
            let adapter = Arc::new(EncoderAdapter::new(
                self.backend.audio_codec(&config, encoder_settings)?,
                encoder_settings,
            ));
            adapter.configure(&config)?;
            Some(adapter)
        } else {
            None
        };

        let work_dir = &self.settings.storage.work_dir;
        fs::create_dir_all(work_dir).map_err(|e| {
            RecorderError::Io(format!("Failed to create {}: {}", work_dir.display(), e))
        })?;
        let display_name = self.output_name(&config);
        let output_path = work_dir.join(&display_name);

        let writer = self.backend.container(&output_path, &self.settings.storage)?;
        let gate = Arc::new(Mutex::new(ContainerGate::new(writer, config.include_audio)));

        let started = video_adapter.start().and_then(|_| match &audio_adapter {
            Some(adapter) => adapter.start(),
            None => Ok(()),
        });
        if let Err(e) = started {
            abort_partial(&video_adapter, audio_adapter.as_deref(), &gate, &output_path);
            return Err(e);
        }

        let video = Arc::new(VideoPipeline::new(
            Arc::clone(&video_adapter),
            Arc::clone(&gate),
            &config,
        ));
        let audio = audio_adapter
            .as_ref()
            .map(|a| Arc::new(AudioPipeline::new(Arc::clone(a), Arc::clone(&gate), &config)));

        // An audio encoder announces its format right away; registering it
        // now keeps the writer from waiting on the first audio chunk.
        if let Some(audio) = &audio {
            audio.drain();
        }

        let resolved = source.resolve();
        let (mode, flags) = match &resolved {
            ResolvedSource::Push(push) => (IngestMode::Push, push.flags()),
            ResolvedSource::Poll(_) => (IngestMode::Poll, Arc::new(SessionFlags::default())),
        };
        flags.reset();
        flags.set_recording(true);

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let workers = match self.spawn_workers(
            resolved,
            audio_source,
            &config,
            &video,
            audio.as_ref(),
            &flags,
            &stop_rx,
        ) {
            Ok(workers) => workers,
            Err(e) => {
                flags.set_recording(false);
                drop(stop_tx);
                abort_partial(&video_adapter, audio_adapter.as_deref(), &gate, &output_path);
                return Err(e);
            }
        };

        Ok(ActiveSession {
            id: Uuid::new_v4(),
            output_path,
            display_name,
            config,
            mode,
            flags,
            clock: SessionClock::start(),
            video,
            audio,
            gate,
            workers,
            stop_tx: Some(stop_tx),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_workers(
        &self,
        source: ResolvedSource,
        audio_source: Option<AudioSource>,
        config: &RecordingConfig,
        video: &Arc<VideoPipeline>,
        audio: Option<&Arc<AudioPipeline>>,
        flags: &Arc<SessionFlags>,
        stop_rx: &Receiver<()>,
    ) -> Result<Vec<Worker>, RecorderError> {
        let mut workers = Vec::new();

        let video_worker = match source {
            ResolvedSource::Push(push) => {
                let (video, flags, stop) = (Arc::clone(video), Arc::clone(flags), stop_rx.clone());
                Worker::spawn("push", move || run_push_consumer(push, video, flags, stop))
            }
            ResolvedSource::Poll(sampler) => {
                let ingest = PollIngest::new(sampler, config.width, config.height);
                let interval = config.frame_interval();
                let (video, flags, stop) = (Arc::clone(video), Arc::clone(flags), stop_rx.clone());
                Worker::spawn("poll", move || {
                    run_poll_loop(ingest, video, flags, interval, stop)
                })
            }
        };
        workers.push(video_worker?);

        if let Some(audio) = audio {
            match audio_source {
                Some(source) => {
                    let (audio, flags, stop) =
                        (Arc::clone(audio), Arc::clone(flags), stop_rx.clone());
                    workers.push(Worker::spawn("audio", move || {
                        run_audio_loop(source, audio, flags, stop)
                    })?);
                }
                None => workers.extend(self.spawn_microphone(config, audio, flags, stop_rx)?),
            }
        }

        let drain_interval = self.settings.encoder.drain_interval_ms;
        if drain_interval > 0 {
            let (video, audio, stop) = (Arc::clone(video), audio.cloned(), stop_rx.clone());
            let interval = Duration::from_millis(drain_interval);
            workers.push(Worker::spawn("drain", move || {
                run_drain_ticker(video, audio, interval, stop)
            })?);
        }

        Ok(workers)
    }

    #[cfg(feature = "audio")]
    fn spawn_microphone(
        &self,
        config: &RecordingConfig,
        audio: &Arc<AudioPipeline>,
        flags: &Arc<SessionFlags>,
        stop_rx: &Receiver<()>,
    ) -> Result<Option<Worker>, RecorderError> {
        let audio_config = config.audio.clone();
        let (audio, flags, stop) = (Arc::clone(audio), Arc::clone(flags), stop_rx.clone());
        let worker = Worker::spawn("microphone", move || {
            crate::audio::run_microphone(audio_config, audio, flags, stop)
        })?;
        Ok(Some(worker))
    }

    #[cfg(not(feature = "audio"))]
    fn spawn_microphone(
        &self,
        _config: &RecordingConfig,
        _audio: &Arc<AudioPipeline>,
        _flags: &Arc<SessionFlags>,
        _stop_rx: &Receiver<()>,
    ) -> Result<Option<Worker>, RecorderError> {
        log::info!("No audio source attached; audio track will carry no samples");
        Ok(None)
    }

    fn finalize(&self, mut session: ActiveSession) -> RecordingStats {
        let active = session.clock.active();

        // No new frames: clear the flag, wake every worker, wait for them
        session.flags.set_recording(false);
        drop(session.stop_tx.take());
        let join_timeout = Duration::from_millis(self.settings.ingest.worker_join_timeout_ms);
        for worker in session.workers.drain(..) {
            worker.join_timeout(join_timeout);
        }

        let eos_timeout = Duration::from_millis(self.settings.encoder.end_of_stream_timeout_ms);
        let mut end_of_stream = session.video.finish(eos_timeout);
        if let Some(audio) = &session.audio {
            end_of_stream &= audio.finish(eos_timeout);
        }
        if !end_of_stream {
            log::warn!("Recording {} finalized without end-of-stream from every encoder", session.id);
        }

        if let Err(e) = session.video.adapter().stop() {
            log::error!("Video encoder failed to stop: {}", e);
        }
        if let Some(audio) = &session.audio {
            if let Err(e) = audio.adapter().stop() {
                log::error!("Audio encoder failed to stop: {}", e);
            }
        }

        let (finalized, written, discarded, container) = {
            let mut gate = session.gate.lock().expect("lock poisoned");
            let finalized = gate.finish().unwrap_or_else(|e| {
                log::error!("Container writer failed to stop: {}", e);
                false
            });
            gate.close();
            (finalized, gate.written(), gate.discarded(), gate.stats().cloned())
        };

        let mut persisted_path = None;
        if finalized {
            let metadata = MediaMetadata::for_recording(
                &session.display_name,
                &self.settings.storage,
                &session.config.device_tag,
            );
            match self.store.persist(&session.output_path, &metadata) {
                Ok(path) => persisted_path = Some(path),
                Err(e) => log::error!("Failed to persist {}: {}", session.output_path.display(), e),
            }
        } else if let Err(e) = fs::remove_file(&session.output_path) {
            log::debug!(
                "No container to keep; could not remove {}: {}",
                session.output_path.display(),
                e
            );
        }

        let container = container.unwrap_or_default();
        RecordingStats {
            session_id: session.id,
            output_path: session.output_path.clone(),
            persisted_path,
            frames_submitted: session.video.frames_submitted(),
            frames_dropped: session.video.frames_dropped(),
            frames_rejected: session.flags.rejected(),
            frames_reused: session.video.frames_reused(),
            ticks_skipped: session.video.ticks_skipped(),
            audio_chunks_submitted: session
                .audio
                .as_ref()
                .map(|a| a.chunks_submitted())
                .unwrap_or(0),
            samples_written: written,
            samples_discarded: discarded,
            end_of_stream_delivered: end_of_stream,
            active_duration_ms: active.as_millis() as u64,
            media_duration_secs: container.duration_secs,
            bytes_written: container.bytes_written,
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.lock_inner().session.is_some() {
            log::warn!("Recorder dropped while recording, stopping");
            self.stop();
        }
    }
}

/// Release whatever `start` had built before it failed
fn abort_partial(
    video: &EncoderAdapter,
    audio: Option<&EncoderAdapter>,
    gate: &Mutex<ContainerGate>,
    path: &std::path::Path,
) {
    if let Err(e) = video.stop() {
        log::error!("Video encoder failed to stop: {}", e);
    }
    if let Some(audio) = audio {
        if let Err(e) = audio.stop() {
            log::error!("Audio encoder failed to stop: {}", e);
        }
    }
    gate.lock().expect("lock poisoned").close();
    let _ = fs::remove_file(path);
}
