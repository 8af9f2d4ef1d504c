//! Sample-rate conversion between the hardware rate and the rate the DSP
//! engine was configured for.

use num_complex::Complex;

/// Streaming I/Q resampler.
///
/// Integer decimation averages whole groups of input samples. Any other
/// ratio interpolates linearly between neighbours. State carries over
/// between blocks, so block boundaries are invisible in the output.
#[derive(Debug, Clone)]
pub struct Resampler {
    input_rate: u32,
    output_rate: u32,
    mode: Mode,
}

#[derive(Debug, Clone)]
enum Mode {
    Average {
        factor: usize,
        acc: Complex<f64>,
        count: usize,
    },
    Linear {
        step: f64,
        /// Position of the next output sample relative to `prev`.
        phase: f64,
        prev: Option<Complex<f64>>,
    },
}

impl Resampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        let input_rate = input_rate.max(1);
        let output_rate = output_rate.max(1);
        let mode = if input_rate % output_rate == 0 {
            Mode::Average {
                factor: (input_rate / output_rate) as usize,
                acc: Complex::new(0.0, 0.0),
                count: 0,
            }
        } else {
            Mode::Linear {
                step: input_rate as f64 / output_rate as f64,
                phase: 0.0,
                prev: None,
            }
        };
        Self {
            input_rate,
            output_rate,
            mode,
        }
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Convert one block, appending the results to `out`.
    pub fn process(&mut self, input: &[Complex<f64>], out: &mut Vec<Complex<f64>>) {
        match &mut self.mode {
            Mode::Average { factor, acc, count } => {
                for &s in input {
                    *acc += s;
                    *count += 1;
                    if *count == *factor {
                        out.push(*acc / *factor as f64);
                        *acc = Complex::new(0.0, 0.0);
                        *count = 0;
                    }
                }
            }
            Mode::Linear { step, phase, prev } => {
                for &s in input {
                    let Some(p) = *prev else {
                        *prev = Some(s);
                        continue;
                    };
                    while *phase < 1.0 {
                        out.push(p + (s - p) * *phase);
                        *phase += *step;
                    }
                    *phase -= 1.0;
                    *prev = Some(s);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<Complex<f64>> {
        (0..n).map(|k| Complex::new(k as f64, -(k as f64))).collect()
    }

    #[test]
    fn integer_decimation_averages() {
        let mut r = Resampler::new(192_000, 48_000);
        let mut out = Vec::new();
        // Split mid-group to check carry-over.
        let input = ramp(10);
        r.process(&input[..3], &mut out);
        r.process(&input[3..], &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Complex::new(1.5, -1.5));
        assert_eq!(out[1], Complex::new(5.5, -5.5));
    }

    #[test]
    fn upsampling_interpolates() {
        let mut r = Resampler::new(48_000, 96_000);
        let mut out = Vec::new();
        r.process(&ramp(4), &mut out);
        let re: Vec<f64> = out.iter().map(|c| c.re).collect();
        assert_eq!(re, vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5]);
    }

    #[test]
    fn fractional_ratio_keeps_rate() {
        let mut r = Resampler::new(2_500_000, 384_000);
        let mut out = Vec::new();
        for block in ramp(25_000).chunks(1000) {
            r.process(block, &mut out);
        }
        let expected = 25_000.0 * 384_000.0 / 2_500_000.0;
        assert!((out.len() as f64 - expected).abs() <= 1.0, "{}", out.len());
        assert!(out.windows(2).all(|w| w[1].re > w[0].re));
    }
}
