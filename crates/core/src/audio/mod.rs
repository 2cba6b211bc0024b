//! Decoded audio and waveform sampling strategies.
//!
//! Renderers read audio through [`AudioSampler`]. Live playback injects a
//! [`LiveSampler`] fed by the audio callback; capture injects a
//! [`VirtualSampler`] that reads the decoded track at the virtual clock
//! position, so exported frames see the same samples a live run would.

use std::{
    collections::VecDeque,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::{analysis::SpectrumAnalyzer, clock::SharedClock, CueSyncError, Result};

/// Default number of waveform bins requested by renderers.
pub const DEFAULT_WAVEFORM_BINS: usize = 1024;

/// Mode enum describes where a sampler gets its audio from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioMode {
    /// Most recent samples handed over by the playback callback.
    Live,
    /// Direct lookup into the decoded track at the virtual clock position.
    Virtual,
}

/// Strategy that supplies audio data to the render step.
pub trait AudioSampler: Send + Sync {
    /// Returns `bins` time-domain amplitude samples.
    fn waveform(&self, bins: usize) -> Vec<f32>;

    fn mode(&self) -> AudioMode;

    /// Magnitude spectrum of the most recent `2 * bins` samples.
    fn spectrum(&self, bins: usize) -> Result<Vec<f32>> {
        let window = self.waveform(bins * 2);
        SpectrumAnalyzer::new().magnitudes(&window, bins)
    }
}

/// Shared handle to a sampler strategy.
pub type SharedSampler = Arc<dyn AudioSampler>;

/// First channel of a decoded track.
#[derive(Debug, Clone)]
pub struct DecodedTrack {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl DecodedTrack {
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Result<Self> {
        if sample_rate == 0 {
            return Err(CueSyncError::Decode("sample rate must be positive".into()));
        }
        Ok(Self {
            samples,
            sample_rate,
        })
    }

    /// A silent track of `duration_seconds`.
    pub fn silent(duration_seconds: f64, sample_rate: u32) -> Result<Self> {
        let len = (duration_seconds.max(0.0) * sample_rate as f64).round() as usize;
        Self::from_samples(vec![0.0; len], sample_rate)
    }

    /// Decodes an audio file and keeps its first channel.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| CueSyncError::Decode(e.to_string()))?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| CueSyncError::Decode("no audio track found".into()))?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| CueSyncError::Decode("unknown sample rate".into()))?;

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| CueSyncError::Decode(e.to_string()))?;

        let mut samples = Vec::new();
        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(CueSyncError::Decode(e.to_string())),
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(reason)) => {
                    tracing::warn!(reason, "skipping undecodable packet");
                    continue;
                }
                Err(e) => return Err(CueSyncError::Decode(e.to_string())),
            };

            let spec = *decoded.spec();
            let channels = spec.channels.count().max(1);
            let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            buffer.copy_interleaved_ref(decoded);
            samples.extend(buffer.samples().iter().step_by(channels));
        }

        tracing::info!(
            path = %path.display(),
            sample_rate,
            samples = samples.len(),
            "decoded audio track"
        );
        Self::from_samples(samples, sample_rate)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Number of whole frames the track spans at `frame_rate`.
    pub fn total_frames(&self, frame_rate: u32) -> u64 {
        (self.duration_seconds() * frame_rate as f64).floor() as u64
    }

    /// Index of the sample playing at `seconds`.
    pub fn sample_index_at(&self, seconds: f64) -> usize {
        (seconds.max(0.0) * self.sample_rate as f64).floor() as usize
    }

    /// `bins` samples ending just before `end`. Positions before the start
    /// or past the end of the track are zero, matching what a
    /// [`LiveSampler`] fed up to `end` returns.
    pub fn window_ending_at(&self, end: usize, bins: usize) -> Vec<f32> {
        let padding = bins.saturating_sub(end);
        let mut window = vec![0.0; padding];
        window.extend(
            (end - (bins - padding)..end)
                .map(|index| self.samples.get(index).copied().unwrap_or(0.0)),
        );
        window
    }
}

/// Reads the decoded track at the position of the clock it was built with.
pub struct VirtualSampler {
    track: Arc<DecodedTrack>,
    clock: SharedClock,
}

impl VirtualSampler {
    pub fn new(track: Arc<DecodedTrack>, clock: SharedClock) -> Self {
        Self { track, clock }
    }
}

impl AudioSampler for VirtualSampler {
    fn waveform(&self, bins: usize) -> Vec<f32> {
        let end = self.track.sample_index_at(self.clock.now_seconds());
        self.track.window_ending_at(end, bins)
    }

    fn mode(&self) -> AudioMode {
        AudioMode::Virtual
    }
}

impl std::fmt::Debug for VirtualSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualSampler")
            .field("sample_rate", &self.track.sample_rate())
            .field("position_ms", &self.clock.now_ms())
            .finish()
    }
}

/// Keeps the most recent samples pushed by the playback callback.
#[derive(Debug)]
pub struct LiveSampler {
    history: Mutex<VecDeque<f32>>,
    capacity: usize,
}

impl LiveSampler {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn push_samples(&self, samples: &[f32]) {
        let mut history = self.lock();
        history.extend(samples.iter().copied());
        if history.len() > self.capacity {
            let overflow = history.len() - self.capacity;
            history.drain(..overflow);
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<f32>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LiveSampler {
    fn default() -> Self {
        Self::new(DEFAULT_WAVEFORM_BINS * 4)
    }
}

impl AudioSampler for LiveSampler {
    fn waveform(&self, bins: usize) -> Vec<f32> {
        let history = self.lock();
        let available = history.len().min(bins);
        let mut out = vec![0.0; bins - available];
        out.extend(history.iter().skip(history.len() - available).copied());
        out
    }

    fn mode(&self) -> AudioMode {
        AudioMode::Live
    }
}
