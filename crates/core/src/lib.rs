//! Core library for the cuesync engine.
//!
//! Score events become [`Cue`]s that a [`CueScheduler`] fires against an
//! injected [`ClockSource`]. Cue handlers update scene state, entities track
//! their growth and draw progress through [`ProgressTracker`], and a
//! [`FrameRenderer`] turns the scene into pixels. The same pipeline runs live
//! through [`Player`] or offline through [`CaptureLoop`], which replays the
//! piece frame by frame on a [`VirtualClock`] and archives the PNG frames in
//! numbered zip parts.

pub mod analysis;
pub mod archive;
pub mod audio;
pub mod capture;
pub mod clock;
pub mod config;
pub mod error;
pub mod player;
pub mod progress;
pub mod render;
pub mod scene;
pub mod timeline;

pub use analysis::SpectrumAnalyzer;
pub use archive::{ArchivePart, DirectorySink, FrameBuffer, FrameRecord, MemorySink, PartSink};
pub use audio::{AudioMode, AudioSampler, DecodedTrack, LiveSampler, SharedSampler, VirtualSampler};
pub use capture::{CaptureLoop, CaptureReport, CaptureState};
pub use clock::{ClockSource, LiveClock, SharedClock, Transport, VirtualClock};
pub use config::{AppConfig, AudioConfig, BackgroundFill, CaptureConfig, SceneConfig, ScoreConfig};
pub use error::{CueSyncError, Result};
pub use player::Player;
pub use progress::{ProgressChannel, ProgressSample, ProgressTracker};
pub use render::{encode_png, still_filename, FrameContext, FrameRenderer, PreviewRenderer};
pub use scene::{Resettable, Scene};
pub use timeline::{Cue, CueCursor, CueScheduler, Event, HandlerRegistry, Score, ScoreTrack};
