//! Live playback driver.

use std::sync::Arc;

use image::RgbaImage;

use crate::{
    audio::{DecodedTrack, LiveSampler, DEFAULT_WAVEFORM_BINS},
    clock::{LiveClock, SharedClock, Transport, VirtualClock},
    render::{FrameContext, FrameRenderer},
    scene::Resettable,
    timeline::{CueScheduler, HandlerRegistry, Score},
    Result,
};

/// Samples kept for the live waveform.
const HISTORY: usize = DEFAULT_WAVEFORM_BINS * 4;

/// Plays a track against a [`Transport`] clock, a [`LiveClock`] unless told
/// otherwise: each [`Player::tick`] feeds the live sampler up to the play
/// head, fires due cues and renders one frame.
pub struct Player<S, R, C = LiveClock> {
    clock: Arc<C>,
    scheduler: CueScheduler,
    registry: HandlerRegistry<S>,
    scene: S,
    renderer: R,
    track: Arc<DecodedTrack>,
    sampler: Arc<LiveSampler>,
    ctx: FrameContext,
    fed_until: usize,
    started: bool,
}

impl<S, R> Player<S, R>
where
    S: Resettable,
    R: FrameRenderer<S>,
{
    pub fn new(
        track: Arc<DecodedTrack>,
        registry: HandlerRegistry<S>,
        scene: S,
        renderer: R,
    ) -> Self {
        let clock = Arc::new(LiveClock::with_duration(track.duration_seconds()));
        Self::with_clock(clock, track, registry, scene, renderer)
    }
}

impl<S, R, C> Player<S, R, C>
where
    S: Resettable,
    R: FrameRenderer<S>,
    C: Transport + 'static,
{
    pub fn with_clock(
        clock: Arc<C>,
        track: Arc<DecodedTrack>,
        registry: HandlerRegistry<S>,
        scene: S,
        renderer: R,
    ) -> Self {
        let shared: SharedClock = clock.clone();
        let sampler = Arc::new(LiveSampler::new(HISTORY));
        let ctx = FrameContext::new(shared.clone(), sampler.clone());

        Self {
            clock,
            scheduler: CueScheduler::new(shared),
            registry,
            scene,
            renderer,
            track,
            sampler,
            ctx,
            fed_until: 0,
            started: false,
        }
    }

    /// Schedules every track of `score` on the player's clock.
    pub fn schedule(&mut self, score: &Score) -> Result<Vec<usize>> {
        let counts = score.schedule(&mut self.scheduler)?;
        tracing::info!(cues = self.scheduler.cues().len(), "score scheduled");
        Ok(counts)
    }

    /// Starts the clock. The first start and any start after the track
    /// ended begin from a freshly reset scene with every cue pending, the
    /// same state a capture run starts from.
    pub fn play(&mut self) {
        if !self.started || self.clock.has_ended() {
            self.restart();
        }
        self.clock.play();
    }

    pub fn pause(&mut self) {
        self.clock.pause();
    }

    /// Pauses a running player, otherwise starts it.
    pub fn toggle(&mut self) {
        if self.clock.is_running() {
            self.pause();
        } else {
            self.play();
        }
    }

    fn restart(&mut self) {
        tracing::info!(replay = self.started, "starting playback from a fresh scene");
        self.scheduler.rewind();
        self.scene.reset();
        self.sampler.clear();
        self.fed_until = 0;
        self.started = true;
    }

    /// Advances one display frame.
    pub fn tick(&mut self) -> Result<RgbaImage> {
        self.feed_sampler();
        let fired = self.scheduler.dispatch(&mut self.registry, &mut self.scene);
        if fired > 0 {
            tracing::debug!(fired, time = self.clock.now_seconds(), "live cues fired");
        }
        self.renderer.render(&mut self.scene, &self.ctx)
    }

    /// Pushes the samples between the last fed position and the play head.
    fn feed_sampler(&mut self) {
        let head = self
            .track
            .sample_index_at(self.clock.now_seconds())
            .min(self.track.samples().len());
        if head < self.fed_until {
            self.sampler.clear();
            self.fed_until = 0;
        }
        let from = self.fed_until.max(head.saturating_sub(HISTORY));
        if from < head {
            self.sampler.push_samples(&self.track.samples()[from..head]);
        }
        self.fed_until = head;
    }

    pub fn clock(&self) -> &Arc<C> {
        &self.clock
    }

    pub fn scheduler(&self) -> &CueScheduler {
        &self.scheduler
    }

    pub fn scene(&self) -> &S {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut S {
        &mut self.scene
    }

    /// Context handed to the renderer during live playback.
    pub fn live_context(&self) -> &FrameContext {
        &self.ctx
    }
}

impl<S, R> Player<S, R, VirtualClock>
where
    S: Resettable,
    R: FrameRenderer<S>,
{
    /// Plays a fresh run up to `seconds`, one frame at a time at
    /// `frame_rate`, and returns the frame shown there. Times past the end
    /// of the track render the last frame position.
    pub fn render_at(&mut self, seconds: f64, frame_rate: u32) -> Result<RgbaImage> {
        self.started = false;
        self.play();
        let seconds = seconds.clamp(0.0, self.track.duration_seconds());
        let target = (seconds * frame_rate as f64).floor() as u64;
        for frame in 0..target {
            self.clock.set_frame(frame, frame_rate);
            self.tick()?;
        }
        self.clock.set_frame(target, frame_rate);
        tracing::debug!(frame = target, seconds, "rendering still");
        self.tick()
    }
}
