use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{CueSyncError, Result};

/// Frame rate used for capture unless configured otherwise.
pub const DEFAULT_FRAME_RATE: u32 = 60;
/// Number of buffered frames that triggers an archive part.
pub const DEFAULT_CHUNK_SIZE: usize = 1500;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub capture: CaptureConfig,
    pub audio: AudioConfig,
    pub score: ScoreConfig,
    pub scene: SceneConfig,
}

impl AppConfig {
    /// Loads a JSON config file. Missing sections fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.capture.validate()?;
        self.score.validate()?;
        if self.scene.width == 0 || self.scene.height == 0 {
            return Err(CueSyncError::Config("canvas size must be non-zero".into()));
        }
        Ok(())
    }
}

/// Settings for offline frame capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Prefix for frame and archive file names.
    pub prefix: String,
    pub enabled: bool,
    /// Composite frames over [`CaptureConfig::background`] before encoding.
    pub capture_css_background: bool,
    pub background: Option<BackgroundFill>,
    pub frame_rate: u32,
    pub chunk_size: usize,
    /// Archive the frames completed before a failing frame when a capture
    /// aborts.
    pub salvage_on_abort: bool,
    pub output_dir: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            prefix: "capture".to_string(),
            enabled: false,
            capture_css_background: false,
            background: None,
            frame_rate: DEFAULT_FRAME_RATE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            salvage_on_abort: true,
            output_dir: PathBuf::from("captures"),
        }
    }
}

impl CaptureConfig {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            enabled: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefix.trim().is_empty() {
            return Err(CueSyncError::Config("capture prefix is empty".into()));
        }
        if self.frame_rate == 0 {
            return Err(CueSyncError::Config("frame rate must be positive".into()));
        }
        if self.chunk_size == 0 {
            return Err(CueSyncError::Config("chunk size must be positive".into()));
        }
        Ok(())
    }
}

/// Fill painted behind captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackgroundFill {
    Solid { color: [u8; 4] },
    VerticalGradient { top: [u8; 4], bottom: [u8; 4] },
}

impl BackgroundFill {
    pub fn black() -> Self {
        Self::Solid {
            color: [0, 0, 0, 255],
        }
    }

    /// Color of row `y` in a canvas `height` rows tall.
    pub fn color_at(&self, y: u32, height: u32) -> [u8; 4] {
        match *self {
            Self::Solid { color } => color,
            Self::VerticalGradient { top, bottom } => {
                let t = if height <= 1 {
                    0.0
                } else {
                    y as f32 / (height - 1) as f32
                };
                let mut out = [0u8; 4];
                for channel in 0..4 {
                    let a = top[channel] as f32;
                    let b = bottom[channel] as f32;
                    out[channel] = (a + (b - a) * t).round() as u8;
                }
                out
            }
        }
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate used when no track is decoded.
    pub sample_rate: u32,
    pub waveform_bins: usize,
    /// Spectrum bars drawn by the preview renderer. Zero turns them off.
    pub spectrum_bins: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            waveform_bins: crate::audio::DEFAULT_WAVEFORM_BINS,
            spectrum_bins: 64,
        }
    }
}

/// Musical timing used to turn note lengths into seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreConfig {
    /// Ticks per quarter note of the score export.
    pub ppq: u32,
    pub bpm: f64,
    /// Share of a note's length spent growing a shape.
    pub growth_share: f64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            ppq: 3840 * 4,
            bpm: 54.0,
            growth_share: 0.8,
        }
    }
}

impl ScoreConfig {
    pub fn ticks_to_seconds(&self, ticks: u64) -> f64 {
        (ticks as f64 / self.ppq as f64) * (60.0 / self.bpm)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ppq == 0 {
            return Err(CueSyncError::Config("ppq must be positive".into()));
        }
        if !(self.bpm.is_finite() && self.bpm > 0.0) {
            return Err(CueSyncError::Config("bpm must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub width: u32,
    pub height: u32,
    /// Seed for layout and shape choices. Captures are only reproducible
    /// with a fixed seed.
    pub seed: Option<u64>,
    /// Edition token hashed into the seed when `seed` is unset.
    pub seed_phrase: Option<String>,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            seed: None,
            seed_phrase: None,
        }
    }
}
