//! Playback clock sources.
//!
//! Every time-dependent component reads time through [`ClockSource`] so the
//! same scheduling and progress code runs against real playback or against
//! the fixed-step clock used while capturing frames.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Shared handle to whichever clock drives the current run.
pub type SharedClock = Arc<dyn ClockSource>;

/// Read-only view over a playback clock.
pub trait ClockSource: Send + Sync {
    /// Current playback position in milliseconds.
    fn now_ms(&self) -> f64;

    /// Whether playback is currently advancing.
    fn is_running(&self) -> bool;

    /// Current playback position in seconds.
    fn now_seconds(&self) -> f64 {
        self.now_ms() / 1000.0
    }
}

/// Snapshot of a clock at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClockState {
    pub current_time_ms: f64,
    pub is_running: bool,
}

/// Clock that follows real elapsed time while playing, the way an audio
/// element reports its position. Pausing keeps the position; playing past
/// the end of the track stops the clock at the track duration.
#[derive(Debug)]
pub struct LiveClock {
    inner: Mutex<LiveState>,
}

#[derive(Debug)]
struct LiveState {
    offset_ms: f64,
    started: Option<Instant>,
    duration_ms: Option<f64>,
}

impl LiveState {
    fn position(&self) -> f64 {
        let elapsed = self
            .started
            .map(|start| start.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        let position = self.offset_ms + elapsed;
        match self.duration_ms {
            Some(duration) => position.min(duration),
            None => position,
        }
    }

    fn has_ended(&self) -> bool {
        self.duration_ms
            .map(|duration| self.position() >= duration)
            .unwrap_or(false)
    }
}

impl LiveClock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LiveState {
                offset_ms: 0.0,
                started: None,
                duration_ms: None,
            }),
        }
    }

    /// Creates a clock for a track of known length.
    pub fn with_duration(duration_seconds: f64) -> Self {
        let clock = Self::new();
        clock.lock().duration_ms = Some(duration_seconds.max(0.0) * 1000.0);
        clock
    }

    /// Starts or resumes playback. An ended track restarts from zero.
    pub fn play(&self) {
        let mut state = self.lock();
        if state.has_ended() {
            state.offset_ms = 0.0;
            state.started = None;
        }
        if state.started.is_none() {
            state.started = Some(Instant::now());
        }
    }

    pub fn pause(&self) {
        let mut state = self.lock();
        if state.started.is_some() {
            state.offset_ms = state.position();
            state.started = None;
        }
    }

    /// Moves the play head, keeping the running state.
    pub fn seek(&self, seconds: f64) {
        let mut state = self.lock();
        state.offset_ms = seconds.max(0.0) * 1000.0;
        if state.started.is_some() {
            state.started = Some(Instant::now());
        }
    }

    /// True once a clock with a known duration has reached its end.
    pub fn has_ended(&self) -> bool {
        self.lock().has_ended()
    }

    pub fn state(&self) -> ClockState {
        ClockState {
            current_time_ms: self.now_ms(),
            is_running: self.is_running(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LiveState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LiveClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for LiveClock {
    fn now_ms(&self) -> f64 {
        self.lock().position()
    }

    fn is_running(&self) -> bool {
        let state = self.lock();
        state.started.is_some() && !state.has_ended()
    }
}

/// Clock advanced programmatically in fixed steps. Only the capture loop
/// moves it; everything else reads it through [`ClockSource`].
#[derive(Debug, Default)]
pub struct VirtualClock {
    state: Mutex<ClockState>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions the clock at `seconds`.
    pub fn set_seconds(&self, seconds: f64) {
        self.lock().current_time_ms = seconds.max(0.0) * 1000.0;
    }

    /// Moves the clock to the start of `frame` at `frame_rate` frames per
    /// second.
    pub fn set_frame(&self, frame: u64, frame_rate: u32) {
        self.set_seconds(frame_time_seconds(frame, frame_rate));
    }

    pub fn start(&self) {
        self.lock().is_running = true;
    }

    pub fn stop(&self) {
        self.lock().is_running = false;
    }

    pub fn state(&self) -> ClockState {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ClockSource for VirtualClock {
    fn now_ms(&self) -> f64 {
        self.lock().current_time_ms
    }

    fn is_running(&self) -> bool {
        self.lock().is_running
    }
}

/// A clock that playback can start, stop and move.
pub trait Transport: ClockSource {
    fn play(&self);

    fn pause(&self);

    fn seek(&self, seconds: f64);

    /// True once a clock with a known length has reached its end.
    fn has_ended(&self) -> bool;
}

impl Transport for LiveClock {
    fn play(&self) {
        LiveClock::play(self);
    }

    fn pause(&self) {
        LiveClock::pause(self);
    }

    fn seek(&self, seconds: f64) {
        LiveClock::seek(self, seconds);
    }

    fn has_ended(&self) -> bool {
        LiveClock::has_ended(self)
    }
}

/// Stepped transport: playback only advances when the owner moves the clock.
impl Transport for VirtualClock {
    fn play(&self) {
        self.start();
    }

    fn pause(&self) {
        self.stop();
    }

    fn seek(&self, seconds: f64) {
        self.set_seconds(seconds);
    }

    fn has_ended(&self) -> bool {
        false
    }
}

/// Time in seconds at which `frame` starts.
pub fn frame_time_seconds(frame: u64, frame_rate: u32) -> f64 {
    if frame_rate == 0 {
        return 0.0;
    }
    frame as f64 / frame_rate as f64
}
