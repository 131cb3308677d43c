//! Sample rate conversion for bridge ports.
//!
//! Two modes, chosen per port at insertion time: cheap linear
//! interpolation, or a windowed-sinc low-pass in small and large
//! variants. Frame-based: each call converts one fixed-size input
//! block, carrying filter history across calls.

use crate::error::{Error, Result};
use crate::types::Sample;

/// Resampler quality, from the bridge option bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleQuality {
    /// Linear interpolation, no filtering.
    Linear,
    /// 16-tap windowed sinc.
    SmallFilter,
    /// 64-tap windowed sinc.
    LargeFilter,
}

impl ResampleQuality {
    fn taps(&self) -> usize {
        match self {
            ResampleQuality::Linear => 2,
            ResampleQuality::SmallFilter => 16,
            ResampleQuality::LargeFilter => 64,
        }
    }
}

/// Converts between a port rate and the bridge rate.
pub struct Resampler {
    src_rate: u32,
    dst_rate: u32,
    quality: ResampleQuality,
    /// Last `taps` input samples, prepended to the next block.
    history: Vec<Sample>,
    /// Precomputed kernel half-width and cutoff for the sinc modes.
    cutoff: f64,
}

impl Resampler {
    pub fn new(src_rate: u32, dst_rate: u32, quality: ResampleQuality) -> Result<Resampler> {
        if src_rate == 0 || dst_rate == 0 {
            return Err(Error::UnsupportedConversion(src_rate, dst_rate));
        }
        // Anti-aliasing cutoff sits below the narrower Nyquist.
        let cutoff = 0.45 * (src_rate.min(dst_rate) as f64) / (src_rate as f64);
        Ok(Resampler {
            src_rate,
            dst_rate,
            quality,
            history: vec![0; quality.taps()],
            cutoff,
        })
    }

    /// Input samples needed to produce `output_count` samples.
    pub fn input_size(&self, output_count: usize) -> usize {
        output_count * self.src_rate as usize / self.dst_rate as usize
    }

    /// Convert one block. `output` length picks the output count; the
    /// input must hold exactly `input_size(output.len())` samples.
    pub fn run(&mut self, input: &[Sample], output: &mut [Sample]) -> Result<()> {
        let needed = self.input_size(output.len());
        if input.len() != needed {
            return Err(Error::InvalidOperation(format!(
                "resampler fed {} samples, needs {}",
                input.len(),
                needed
            )));
        }

        let taps = self.quality.taps();
        // Work buffer: history followed by this block.
        let mut work = Vec::with_capacity(taps + input.len());
        work.extend_from_slice(&self.history);
        work.extend_from_slice(input);

        let step = self.src_rate as f64 / self.dst_rate as f64;
        match self.quality {
            ResampleQuality::Linear => {
                for (i, out) in output.iter_mut().enumerate() {
                    // Interpolate between the two samples around t,
                    // offset so history covers t's left neighbour.
                    let t = i as f64 * step + (taps - 1) as f64;
                    let n = t.floor() as usize;
                    let frac = t - n as f64;
                    let a = work[n.min(work.len() - 1)] as f64;
                    let b = work[(n + 1).min(work.len() - 1)] as f64;
                    *out = clamp_sample(a + (b - a) * frac);
                }
            }
            ResampleQuality::SmallFilter | ResampleQuality::LargeFilter => {
                let half = (taps / 2) as isize;
                // Downsampling needs gain-compensated kernels; the
                // cutoff term handles both directions.
                let gain = 2.0 * self.cutoff;
                for (i, out) in output.iter_mut().enumerate() {
                    let t = i as f64 * step + half as f64;
                    let center = t.floor() as isize;
                    let mut acc = 0.0f64;
                    for k in (center - half + 1)..=(center + half) {
                        if k < 0 || k as usize >= work.len() {
                            continue;
                        }
                        let u = t - k as f64;
                        acc += work[k as usize] as f64 * gain * sinc(2.0 * self.cutoff * u)
                            * hamming(u, half as f64);
                    }
                    *out = clamp_sample(acc);
                }
            }
        }

        // Keep the tail as history for the next block.
        let keep = taps.min(work.len());
        self.history = work[work.len() - keep..].to_vec();
        Ok(())
    }
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-9 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

fn hamming(x: f64, half: f64) -> f64 {
    if x.abs() >= half {
        return 0.0;
    }
    0.54 + 0.46 * (std::f64::consts::PI * x / half).cos()
}

fn clamp_sample(value: f64) -> Sample {
    value.round().clamp(-32768.0, 32767.0) as Sample
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(rate: u32, freq: f64, count: usize, amplitude: f64) -> Vec<Sample> {
        (0..count)
            .map(|i| {
                (amplitude * (2.0 * std::f64::consts::PI * freq * i as f64 / rate as f64).sin())
                    as Sample
            })
            .collect()
    }

    fn zero_crossings(samples: &[Sample]) -> usize {
        samples.windows(2).filter(|w| (w[0] >= 0) != (w[1] >= 0)).count()
    }

    #[test]
    fn upsample_doubles_sample_count() {
        let mut rs = Resampler::new(8000, 16000, ResampleQuality::Linear).unwrap();
        assert_eq!(rs.input_size(320), 160);
        let input = sine(8000, 1000.0, 160, 10000.0);
        let mut output = vec![0i16; 320];
        rs.run(&input, &mut output).unwrap();
        // 1 kHz for 20 ms is 20 full cycles → about 40 crossings.
        let crossings = zero_crossings(&output);
        assert!((38..=42).contains(&crossings), "crossings = {}", crossings);
    }

    #[test]
    fn downsample_preserves_tone_frequency() {
        for quality in [ResampleQuality::SmallFilter, ResampleQuality::LargeFilter] {
            let mut rs = Resampler::new(16000, 8000, quality).unwrap();
            assert_eq!(rs.input_size(160), 320);
            let input = sine(16000, 1000.0, 320, 10000.0);
            let mut output = vec![0i16; 160];
            rs.run(&input, &mut output).unwrap();
            let crossings = zero_crossings(&output[8..]);
            assert!((34..=42).contains(&crossings), "crossings = {}", crossings);
        }
    }

    #[test]
    fn large_filter_passes_signal_energy() {
        let mut rs = Resampler::new(8000, 16000, ResampleQuality::LargeFilter).unwrap();
        let input = sine(8000, 1000.0, 160, 10000.0);
        let mut output = vec![0i16; 320];
        rs.run(&input, &mut output).unwrap();
        // Steady-state RMS within ~2 dB of the input RMS.
        let rms = |s: &[Sample]| {
            (s.iter().map(|v| (*v as f64) * (*v as f64)).sum::<f64>() / s.len() as f64).sqrt()
        };
        let in_rms = rms(&input);
        let out_rms = rms(&output[64..]);
        assert!(
            (out_rms / in_rms) > 0.8 && (out_rms / in_rms) < 1.25,
            "rms ratio = {}",
            out_rms / in_rms
        );
    }

    #[test]
    fn mismatched_input_size_is_rejected() {
        let mut rs = Resampler::new(8000, 16000, ResampleQuality::Linear).unwrap();
        let mut output = vec![0i16; 320];
        assert!(rs.run(&[0; 100], &mut output).is_err());
    }

    #[test]
    fn history_carries_across_blocks() {
        // Two consecutive blocks should join without a discontinuity.
        let mut rs = Resampler::new(8000, 16000, ResampleQuality::SmallFilter).unwrap();
        let full = sine(8000, 400.0, 320, 12000.0);
        let mut out_a = vec![0i16; 320];
        let mut out_b = vec![0i16; 320];
        rs.run(&full[..160], &mut out_a).unwrap();
        rs.run(&full[160..], &mut out_b).unwrap();
        let boundary_jump = (out_b[0] as i32 - out_a[319] as i32).abs();
        assert!(boundary_jump < 3000, "jump = {}", boundary_jump);
    }
}
