//! Wall-clock accounting for a recording session
//!
//! Active time is `elapsed - paused`, where `paused` includes the pause that
//! may still be in progress. All methods also come in an `_at` form taking
//! an explicit `Instant` so the arithmetic can be checked deterministically.

use std::time::{Duration, Instant};

/// Session start time plus accumulated pause time
#[derive(Debug, Clone)]
pub struct SessionClock {
    start: Instant,
    paused_total: Duration,
    pause_started: Option<Instant>,
}

impl SessionClock {
    /// Start a clock at the current instant
    pub fn start() -> Self {
        Self::start_at(Instant::now())
    }

    /// Start a clock at a given instant
    pub fn start_at(start: Instant) -> Self {
        Self {
            start,
            paused_total: Duration::ZERO,
            pause_started: None,
        }
    }

    /// Mark the beginning of a pause; no-op if already paused
    pub fn pause_at(&mut self, now: Instant) {
        if self.pause_started.is_none() {
            self.pause_started = Some(now);
        }
    }

    pub fn pause(&mut self) {
        self.pause_at(Instant::now());
    }

    /// End the current pause, returning how long it lasted
    pub fn resume_at(&mut self, now: Instant) -> Duration {
        match self.pause_started.take() {
            Some(since) => {
                let paused = now.saturating_duration_since(since);
                self.paused_total += paused;
                paused
            }
            None => Duration::ZERO,
        }
    }

    pub fn resume(&mut self) -> Duration {
        self.resume_at(Instant::now())
    }

    pub fn is_paused(&self) -> bool {
        self.pause_started.is_some()
    }

    /// Active (non-paused) time as of `now`
    pub fn active_at(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.start);
        let current_pause = self
            .pause_started
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or(Duration::ZERO);
        elapsed
            .saturating_sub(self.paused_total)
            .saturating_sub(current_pause)
    }

    pub fn active(&self) -> Duration {
        self.active_at(Instant::now())
    }

    /// Total time spent paused as of `now`
    pub fn paused_at(&self, now: Instant) -> Duration {
        self.paused_total
            + self
                .pause_started
                .map(|since| now.saturating_duration_since(since))
                .unwrap_or(Duration::ZERO)
    }

    /// Instant the session started
    pub fn start_instant(&self) -> Instant {
        self.start
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::start()
    }
}
