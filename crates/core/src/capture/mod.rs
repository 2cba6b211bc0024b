//! Offline frame capture.
//!
//! A [`CaptureLoop`] replays every scheduled cue against its own
//! [`VirtualClock`], renders one frame per tick of the configured frame rate
//! and streams the encoded PNGs into a [`FrameBuffer`]. The live clock and
//! the live sampler are never touched: each run builds a fresh
//! [`FrameContext`] around a [`VirtualSampler`].

use std::sync::Arc;

use chrono::Utc;

use crate::{
    archive::{ArchivePart, FrameBuffer, FrameRecord, PartSink},
    audio::{DecodedTrack, VirtualSampler},
    clock::{frame_time_seconds, ClockSource, SharedClock, VirtualClock},
    config::{BackgroundFill, CaptureConfig},
    render::{composite_background, encode_png, FrameContext, FrameRenderer},
    scene::Resettable,
    timeline::{CueCursor, CueScheduler, HandlerRegistry},
    CueSyncError, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    #[default]
    Idle,
    Capturing,
}

/// Summary of a finished capture run.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureReport {
    pub frames: u64,
    pub parts: Vec<ArchivePart>,
    /// Epoch milliseconds stamped into every part name of the run.
    pub timestamp: i64,
}

pub struct CaptureLoop<K> {
    config: CaptureConfig,
    state: CaptureState,
    buffer: FrameBuffer<K>,
}

impl<K: PartSink> CaptureLoop<K> {
    pub fn new(config: CaptureConfig, sink: K) -> Result<Self> {
        config.validate()?;
        let buffer = FrameBuffer::new(config.prefix.clone(), config.frame_rate, sink)
            .with_chunk_size(config.chunk_size);
        Ok(Self {
            config,
            state: CaptureState::Idle,
            buffer,
        })
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn is_capturing(&self) -> bool {
        self.state == CaptureState::Capturing
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    pub fn buffer(&self) -> &FrameBuffer<K> {
        &self.buffer
    }

    pub fn sink(&self) -> &K {
        self.buffer.sink()
    }

    pub fn into_sink(self) -> K {
        self.buffer.into_sink()
    }

    /// Exports the whole track as numbered frames.
    ///
    /// Returns `Ok(None)` without doing anything when capture is disabled or
    /// a run is already in progress. Any render or encode failure stops the
    /// run with [`CueSyncError::CaptureAbort`]; parts written before the
    /// failure stay valid.
    pub fn run<S, R>(
        &mut self,
        scheduler: &CueScheduler,
        registry: &mut HandlerRegistry<S>,
        scene: &mut S,
        renderer: &mut R,
        track: Arc<DecodedTrack>,
    ) -> Result<Option<CaptureReport>>
    where
        S: Resettable,
        R: FrameRenderer<S>,
    {
        if !self.config.enabled {
            tracing::debug!("capture disabled, ignoring start");
            return Ok(None);
        }
        if self.is_capturing() {
            tracing::warn!("capture already running, ignoring start");
            return Ok(None);
        }

        let Self {
            config,
            state,
            buffer,
        } = self;
        let _guard = StateGuard::enter(state);

        let timestamp = Utc::now().timestamp_millis();
        buffer.begin_run(timestamp);
        let mut cursor = CueCursor::new(scheduler.snapshot());
        scene.reset();

        let clock = Arc::new(VirtualClock::new());
        let shared: SharedClock = clock.clone();
        let sampler = Arc::new(VirtualSampler::new(track.clone(), shared.clone()));
        let mut ctx = FrameContext::new(shared.clone(), sampler);
        clock.start();

        let total_frames = track.total_frames(config.frame_rate);
        tracing::info!(
            prefix = %config.prefix,
            total_frames,
            cues = cursor.len(),
            timestamp,
            "capture started"
        );

        for frame in 0..total_frames {
            let t = frame_time_seconds(frame, config.frame_rate);
            clock.set_seconds(t);
            ctx.frame = Some(frame);
            registry.fire_all(cursor.take_due(shared.now_seconds()), scene, &shared);

            let record = match render_frame(config, scene, renderer, &ctx, frame) {
                Ok(record) => record,
                Err(err) => return Err(abort(config, buffer, frame, err, true)),
            };
            tracing::debug!(frame, total_frames, "captured frame");

            if let Err(err) = buffer.push(record) {
                return Err(abort(config, buffer, frame, err, false));
            }
        }

        if let Err(err) = buffer.flush() {
            let last = total_frames.saturating_sub(1);
            return Err(abort(config, buffer, last, err, false));
        }
        clock.stop();

        let parts = buffer.parts().to_vec();
        tracing::info!(frames = total_frames, parts = parts.len(), "capture finished");
        Ok(Some(CaptureReport {
            frames: total_frames,
            parts,
            timestamp,
        }))
    }
}

impl<K> std::fmt::Debug for CaptureLoop<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureLoop")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("buffer", &self.buffer)
            .finish()
    }
}

/// Holds the loop in [`CaptureState::Capturing`] until dropped.
struct StateGuard<'a> {
    state: &'a mut CaptureState,
}

impl<'a> StateGuard<'a> {
    fn enter(state: &'a mut CaptureState) -> Self {
        *state = CaptureState::Capturing;
        Self { state }
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        *self.state = CaptureState::Idle;
    }
}

fn render_frame<S, R>(
    config: &CaptureConfig,
    scene: &mut S,
    renderer: &mut R,
    ctx: &FrameContext,
    frame: u64,
) -> Result<FrameRecord>
where
    R: FrameRenderer<S>,
{
    let mut image = renderer.render(scene, ctx)?;
    if config.capture_css_background {
        let fill = config.background.unwrap_or_else(BackgroundFill::black);
        image = composite_background(&image, &fill);
    }
    let png = encode_png(&image)?;
    Ok(FrameRecord::new(&config.prefix, frame, png))
}

/// Wraps `err` for `frame` and settles the buffered frames. `salvage` is
/// false when the sink itself failed, in which case nothing more is written.
fn abort<K: PartSink>(
    config: &CaptureConfig,
    buffer: &mut FrameBuffer<K>,
    frame: u64,
    err: CueSyncError,
    salvage: bool,
) -> CueSyncError {
    let err = err.into_abort(frame);
    tracing::error!(%err, "capture aborted");

    if salvage && config.salvage_on_abort {
        match buffer.flush() {
            Ok(Some(part)) => tracing::info!(
                part = part.part_number,
                frames = part.frames.len(),
                "salvaged frames before abort"
            ),
            Ok(None) => {}
            Err(flush_err) => {
                let dropped = buffer.discard();
                tracing::warn!(%flush_err, dropped, "could not salvage frames");
            }
        }
    } else {
        let dropped = buffer.discard();
        if dropped > 0 {
            tracing::warn!(dropped, "discarded buffered frames");
        }
    }
    err
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};

    use image::{Rgba, RgbaImage};

    use super::*;
    use crate::{
        archive::{MemorySink, RECIPE_FILE},
        audio::{AudioMode, AudioSampler, LiveSampler},
        clock::LiveClock,
        config::{SceneConfig, ScoreConfig},
        render::PreviewRenderer,
        scene::Scene,
        timeline::{Cue, Event},
    };

    #[derive(Debug, Default)]
    struct Recording {
        fired: Vec<(String, u32, f64)>,
        resets: usize,
    }

    impl Resettable for Recording {
        fn reset(&mut self) {
            self.fired.clear();
            self.resets += 1;
        }
    }

    fn recording_registry() -> HandlerRegistry<Recording> {
        let mut registry = HandlerRegistry::new();
        for name in ["main", "sub"] {
            registry.bind(name, |scene: &mut Recording, cue: &Cue, clock: &SharedClock| {
                scene
                    .fired
                    .push((cue.handler.clone(), cue.sequence_index, clock.now_seconds()));
            });
        }
        registry
    }

    fn scheduler() -> CueScheduler {
        let clock: SharedClock = Arc::new(LiveClock::new());
        CueScheduler::new(clock)
    }

    fn solid(_: &mut Recording, _: &FrameContext) -> Result<RgbaImage> {
        Ok(RgbaImage::from_pixel(2, 2, Rgba([10, 20, 30, 255])))
    }

    fn entry_names(bytes: &[u8]) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    fn entry_bytes(bytes: &[u8], name: &str) -> Vec<u8> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut data = Vec::new();
        archive.by_name(name).unwrap().read_to_end(&mut data).unwrap();
        data
    }

    struct FailingSink;

    impl PartSink for FailingSink {
        fn store(&mut self, _: &str, _: Vec<u8>) -> Result<()> {
            Err(CueSyncError::Encoding("disk full".into()))
        }
    }

    #[test]
    fn captures_every_whole_frame_in_chunks() {
        let config = CaptureConfig {
            chunk_size: 64,
            ..CaptureConfig::with_prefix("test")
        };
        let mut capture = CaptureLoop::new(config, MemorySink::new()).unwrap();
        let track = Arc::new(DecodedTrack::silent(2.51, 1000).unwrap());

        let report = capture
            .run(
                &scheduler(),
                &mut recording_registry(),
                &mut Recording::default(),
                &mut solid,
                track,
            )
            .unwrap()
            .expect("capture ran");

        assert_eq!(report.frames, 150);
        let sizes: Vec<_> = report.parts.iter().map(|part| part.frames.len()).collect();
        assert_eq!(sizes, vec![64, 64, 22]);
        let numbers: Vec<u64> = report
            .parts
            .iter()
            .flat_map(|part| part.frames.iter().copied())
            .collect();
        assert_eq!(numbers, (0..150).collect::<Vec<_>>());
        assert_eq!(capture.state(), CaptureState::Idle);

        let sink = capture.into_sink();
        assert_eq!(sink.parts.len(), 3);
        for (index, (name, bytes)) in sink.parts.iter().enumerate() {
            assert_eq!(
                name,
                &format!("test_frames_part{}_{}.zip", index + 1, report.timestamp)
            );
            let has_recipe = entry_names(bytes).contains(&RECIPE_FILE.to_string());
            assert_eq!(has_recipe, index == 0);
        }
    }

    #[test]
    fn replays_cues_in_time_order_once() {
        let mut scheduler = scheduler();
        scheduler
            .schedule_cue_set(
                &[Event::new(0.0, 1), Event::new(0.5, 2), Event::new(0.51, 3)],
                "main",
                false,
            )
            .unwrap();
        scheduler
            .schedule_cue_set(&[Event::new(0.25, 1)], "sub", false)
            .unwrap();

        let mut capture =
            CaptureLoop::new(CaptureConfig::with_prefix("cues"), MemorySink::new()).unwrap();
        let mut scene = Recording::default();
        let track = Arc::new(DecodedTrack::silent(1.0, 1000).unwrap());
        capture
            .run(&scheduler, &mut recording_registry(), &mut scene, &mut solid, track)
            .unwrap();

        assert_eq!(scene.resets, 1);
        let order: Vec<_> = scene
            .fired
            .iter()
            .map(|(handler, sequence, _)| (handler.as_str(), *sequence))
            .collect();
        assert_eq!(order, vec![("main", 1), ("sub", 1), ("main", 2), ("main", 3)]);

        let fire_times = [0.0, 0.25, 0.5, 0.51];
        for ((_, _, at), due) in scene.fired.iter().zip(fire_times) {
            assert!(*at >= due && *at < due + 1.0 / 60.0, "{at} vs {due}");
        }
    }

    #[test]
    fn render_failure_salvages_completed_frames() {
        let live_sampler = Arc::new(LiveSampler::new(8));
        live_sampler.push_samples(&[1.0, 2.0, 3.0]);
        let live = FrameContext::new(Arc::new(LiveClock::new()), live_sampler);

        let mut capture =
            CaptureLoop::new(CaptureConfig::with_prefix("abort"), MemorySink::new()).unwrap();
        let mut renderer = |_: &mut Recording, ctx: &FrameContext| -> Result<RgbaImage> {
            assert_eq!(ctx.sampler.mode(), AudioMode::Virtual);
            if ctx.frame == Some(42) {
                return Err(CueSyncError::msg("renderer lost its surface"));
            }
            Ok(RgbaImage::new(1, 1))
        };
        let track = Arc::new(DecodedTrack::silent(10.0, 100).unwrap());
        assert_eq!(track.total_frames(60), 600);

        let err = capture
            .run(
                &scheduler(),
                &mut recording_registry(),
                &mut Recording::default(),
                &mut renderer,
                track,
            )
            .unwrap_err();

        assert!(matches!(err, CueSyncError::CaptureAbort { frame: 42, .. }));
        assert!(!err.is_encoding());
        assert!(!capture.is_capturing());
        assert!(capture.buffer().is_empty());

        let parts = capture.buffer().parts();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].frames, (0..42).collect::<Vec<_>>());
        assert!(parts[0].has_recipe);

        assert_eq!(live.sampler.mode(), AudioMode::Live);
        assert_eq!(live.sampler.waveform(3), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn abort_without_salvage_writes_nothing() {
        let config = CaptureConfig {
            salvage_on_abort: false,
            ..CaptureConfig::with_prefix("abort")
        };
        let mut capture = CaptureLoop::new(config, MemorySink::new()).unwrap();
        let mut renderer = |_: &mut Recording, ctx: &FrameContext| -> Result<RgbaImage> {
            match ctx.frame {
                Some(5) => Err("broken frame".into()),
                _ => Ok(RgbaImage::new(1, 1)),
            }
        };
        let track = Arc::new(DecodedTrack::silent(1.0, 100).unwrap());

        let err = capture
            .run(
                &scheduler(),
                &mut recording_registry(),
                &mut Recording::default(),
                &mut renderer,
                track,
            )
            .unwrap_err();
        assert!(matches!(err, CueSyncError::CaptureAbort { frame: 5, .. }));
        assert!(capture.sink().parts.is_empty());
        assert!(capture.buffer().is_empty());
    }

    #[test]
    fn sink_failure_aborts_as_encoding() {
        let config = CaptureConfig {
            chunk_size: 10,
            ..CaptureConfig::with_prefix("full")
        };
        let mut capture = CaptureLoop::new(config, FailingSink).unwrap();
        let track = Arc::new(DecodedTrack::silent(1.0, 1000).unwrap());

        let err = capture
            .run(
                &scheduler(),
                &mut recording_registry(),
                &mut Recording::default(),
                &mut solid,
                track,
            )
            .unwrap_err();
        assert!(matches!(err, CueSyncError::CaptureAbort { frame: 9, .. }));
        assert!(err.is_encoding());
        assert!(capture.buffer().is_empty());
        assert!(capture.buffer().parts().is_empty());
        assert_eq!(capture.state(), CaptureState::Idle);
    }

    #[test]
    fn start_is_ignored_when_disabled_or_running() {
        let track = Arc::new(DecodedTrack::silent(1.0, 1000).unwrap());
        let mut scene = Recording::default();

        let mut capture = CaptureLoop::new(CaptureConfig::default(), MemorySink::new()).unwrap();
        let outcome = capture
            .run(&scheduler(), &mut recording_registry(), &mut scene, &mut solid, track.clone())
            .unwrap();
        assert!(outcome.is_none());

        capture.set_enabled(true);
        capture.state = CaptureState::Capturing;
        let outcome = capture
            .run(&scheduler(), &mut recording_registry(), &mut scene, &mut solid, track)
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(scene.resets, 0);
        assert!(capture.sink().parts.is_empty());
    }

    fn scene_capture(scene: &mut Scene) -> MemorySink {
        let mut scheduler = scheduler();
        scheduler
            .schedule_cue_set(
                &[Event::new(0.0, 0).with_duration_ticks(3840)],
                crate::scene::MAIN_HANDLER,
                false,
            )
            .unwrap();
        let mut registry = HandlerRegistry::new();
        Scene::bind_handlers(&mut registry);

        let config = CaptureConfig {
            capture_css_background: true,
            background: Some(BackgroundFill::Solid {
                color: [9, 9, 9, 255],
            }),
            ..CaptureConfig::with_prefix("scene")
        };
        let mut capture = CaptureLoop::new(config, MemorySink::new()).unwrap();
        let mut renderer = PreviewRenderer::new(64, 48).transparent(true);
        let track = Arc::new(DecodedTrack::silent(0.5, 1000).unwrap());

        let report = capture
            .run(&scheduler, &mut registry, scene, &mut renderer, track)
            .unwrap()
            .unwrap();
        assert_eq!(report.frames, 30);
        capture.into_sink()
    }

    #[test]
    fn scene_replays_are_identical_and_composited() {
        let config = SceneConfig {
            width: 64,
            height: 48,
            seed: Some(11),
            ..SceneConfig::default()
        };
        let mut scene = Scene::new(&config, ScoreConfig::default());

        let first = scene_capture(&mut scene);
        let second = scene_capture(&mut scene);

        for frame in [0, 10, 29] {
            let name = format!("scene_{frame:05}.png");
            assert_eq!(
                entry_bytes(&first.parts[0].1, &name),
                entry_bytes(&second.parts[0].1, &name)
            );
        }

        let png = entry_bytes(&first.parts[0].1, "scene_00000.png");
        let image = image::load_from_memory(&png).unwrap().to_rgba8();
        assert_eq!(image.dimensions(), (64, 48));
        assert_eq!(image.get_pixel(0, 0), &Rgba([9, 9, 9, 255]));
    }
}
