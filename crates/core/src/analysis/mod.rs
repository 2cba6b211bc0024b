use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::Result;

/// Magnitude spectrum helper shared by every [`AudioSampler`](crate::audio::AudioSampler).
///
/// Windows the input with a Hann window and returns bin magnitudes scaled to
/// roughly `[0, 1]` for full-scale input. Plans are cached per block size.
pub struct SpectrumAnalyzer {
    planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl SpectrumAnalyzer {
    pub fn new() -> Self {
        Self {
            planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    /// Returns `bins` magnitudes for `samples`. Blocks shorter than two
    /// samples yield silence.
    pub fn magnitudes(&mut self, samples: &[f32], bins: usize) -> Result<Vec<f32>> {
        let len = samples.len();
        if len < 2 || bins == 0 {
            return Ok(vec![0.0; bins]);
        }

        let fft = self.prepare_fft(len);
        for (index, value) in samples.iter().enumerate() {
            fft.input[index] = *value * hann_value(index, len);
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let scale = 2.0 / len as f32;
        let mut out: Vec<f32> = fft
            .spectrum
            .iter()
            .take(bins)
            .map(|bin| (bin.norm() * scale).clamp(0.0, 1.0))
            .collect();
        out.resize(bins, 0.0);
        Ok(out)
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        let rebuild = self
            .fft
            .as_ref()
            .map(|fft| fft.size != size)
            .unwrap_or(true);

        if rebuild {
            let plan = self.planner.plan_fft_forward(size);
            let scratch = plan.make_scratch_vec();
            let spectrum = plan.make_output_vec();
            let input = plan.make_input_vec();
            self.fft = Some(FftResources {
                size,
                plan,
                scratch,
                spectrum,
                input,
            });
        }

        self.fft.as_mut().expect("fft resources must exist")
    }
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for SpectrumAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumAnalyzer")
            .field("size", &self.fft.as_ref().map(|fft| fft.size))
            .finish()
    }
}

/// Root mean square of a block. Empty blocks are silent.
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_has_flat_spectrum() {
        let mut analyzer = SpectrumAnalyzer::new();
        let spectrum = analyzer.magnitudes(&[0.0; 256], 64).unwrap();
        assert_eq!(spectrum.len(), 64);
        assert!(spectrum.iter().all(|value| *value == 0.0));
    }

    #[test]
    fn sine_peaks_at_its_bin() {
        let len = 512;
        let bin = 32;
        let samples: Vec<f32> = (0..len)
            .map(|i| (2.0 * PI * bin as f32 * i as f32 / len as f32).sin())
            .collect();

        let mut analyzer = SpectrumAnalyzer::new();
        let spectrum = analyzer.magnitudes(&samples, 128).unwrap();
        let loudest = spectrum
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(index, _)| index)
            .unwrap();
        assert_eq!(loudest, bin);
    }

    #[test]
    fn rms_of_constant_block() {
        assert!((compute_rms(&[0.5; 32]) - 0.5).abs() < 1e-6);
        assert_eq!(compute_rms(&[]), 0.0);
    }
}
