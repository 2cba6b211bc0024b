//! Time-based progress channels for animated entities.

use std::fmt;

use crate::clock::SharedClock;

/// One normalised `[0, 1]` progress value driven by elapsed clock time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressChannel {
    birth_ms: Option<f64>,
    duration_ms: f64,
    value: f64,
}

impl ProgressChannel {
    /// Starts the channel at `now_ms`. Non-positive or non-finite durations
    /// complete immediately.
    pub fn start(&mut self, now_ms: f64, duration_seconds: f64) {
        self.birth_ms = Some(now_ms);
        self.duration_ms = duration_seconds * 1000.0;
        self.value = if self.is_instant() { 1.0 } else { 0.0 };
    }

    /// Recomputes the value for `now_ms`. The value never goes down.
    pub fn update(&mut self, now_ms: f64) -> f64 {
        let Some(birth) = self.birth_ms else {
            return self.value;
        };
        if self.is_instant() {
            self.value = 1.0;
            return self.value;
        }

        let raw = (now_ms - birth) / self.duration_ms;
        self.value = self.value.max(raw.clamp(0.0, 1.0));
        self.value
    }

    /// Forces the channel to its end state.
    pub fn complete(&mut self) {
        self.value = 1.0;
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_started(&self) -> bool {
        self.birth_ms.is_some()
    }

    pub fn birth_ms(&self) -> Option<f64> {
        self.birth_ms
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration_ms
    }

    fn is_instant(&self) -> bool {
        !(self.duration_ms.is_finite() && self.duration_ms > 0.0)
    }
}

/// Progress values read in one [`ProgressTracker::sample`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressSample {
    pub growth: f64,
    pub draw: f64,
}

/// Growth and draw progress for one visual entity, read against the clock it
/// was created with.
///
/// While the clock is stopped, sampling returns the last computed values.
#[derive(Clone)]
pub struct ProgressTracker {
    clock: SharedClock,
    growth: ProgressChannel,
    draw: ProgressChannel,
}

impl ProgressTracker {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            growth: ProgressChannel::default(),
            draw: ProgressChannel::default(),
        }
    }

    pub fn start_growth(&mut self, duration_seconds: f64) {
        self.growth.start(self.clock.now_ms(), duration_seconds);
    }

    pub fn start_draw(&mut self, duration_seconds: f64) {
        self.draw.start(self.clock.now_ms(), duration_seconds);
    }

    /// Marks the draw channel finished without timing it.
    pub fn complete_draw(&mut self) {
        self.draw.complete();
    }

    pub fn complete_growth(&mut self) {
        self.growth.complete();
    }

    pub fn sample(&mut self) -> ProgressSample {
        if self.clock.is_running() {
            let now = self.clock.now_ms();
            self.growth.update(now);
            self.draw.update(now);
        }
        self.current()
    }

    /// Last computed values, without touching the clock.
    pub fn current(&self) -> ProgressSample {
        ProgressSample {
            growth: self.growth.value(),
            draw: self.draw.value(),
        }
    }

    pub fn growth(&self) -> &ProgressChannel {
        &self.growth
    }

    pub fn draw(&self) -> &ProgressChannel {
        &self.draw
    }
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("growth", &self.growth)
            .field("draw", &self.draw)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::VirtualClock;

    fn running_clock(seconds: f64) -> Arc<VirtualClock> {
        let clock = Arc::new(VirtualClock::new());
        clock.set_seconds(seconds);
        clock.start();
        clock
    }

    #[test]
    fn growth_runs_from_zero_to_one() {
        let clock = running_clock(3.0);
        let mut tracker = ProgressTracker::new(clock.clone());
        tracker.start_growth(2.0);

        assert_eq!(tracker.sample().growth, 0.0);

        clock.set_seconds(4.0);
        assert!((tracker.sample().growth - 0.5).abs() < 1e-9);

        clock.set_seconds(5.0);
        assert_eq!(tracker.sample().growth, 1.0);

        clock.set_seconds(60.0);
        assert_eq!(tracker.sample().growth, 1.0);
    }

    #[test]
    fn zero_duration_is_complete() {
        let clock = running_clock(1.0);
        let mut tracker = ProgressTracker::new(clock);
        tracker.start_growth(0.0);
        tracker.start_draw(-1.0);

        let sample = tracker.sample();
        assert_eq!(sample.growth, 1.0);
        assert_eq!(sample.draw, 1.0);
    }

    #[test]
    fn channels_are_independent() {
        let clock = running_clock(0.0);
        let mut tracker = ProgressTracker::new(clock.clone());
        tracker.start_growth(1.0);
        clock.set_seconds(0.5);
        tracker.start_draw(1.0);

        clock.set_seconds(1.0);
        let sample = tracker.sample();
        assert_eq!(sample.growth, 1.0);
        assert!((sample.draw - 0.5).abs() < 1e-9);
    }

    #[test]
    fn stopped_clock_freezes_progress() {
        let clock = running_clock(0.0);
        let mut tracker = ProgressTracker::new(clock.clone());
        tracker.start_growth(4.0);

        clock.set_seconds(1.0);
        let before = tracker.sample().growth;
        clock.stop();
        clock.set_seconds(3.0);
        assert_eq!(tracker.sample().growth, before);

        clock.start();
        assert!((tracker.sample().growth - 0.75).abs() < 1e-9);
    }

    #[test]
    fn seeking_backwards_never_lowers_progress() {
        let clock = running_clock(0.0);
        let mut tracker = ProgressTracker::new(clock.clone());
        tracker.start_draw(1.0);

        clock.set_seconds(0.8);
        let high = tracker.sample().draw;
        clock.set_seconds(0.2);
        assert_eq!(tracker.sample().draw, high);
    }

    #[test]
    fn unstarted_channels_stay_at_zero() {
        let clock = running_clock(10.0);
        let mut tracker = ProgressTracker::new(clock);
        assert_eq!(tracker.sample(), ProgressSample::default());

        tracker.complete_draw();
        assert_eq!(tracker.sample().draw, 1.0);
        assert!(!tracker.draw().is_started());
    }
}
