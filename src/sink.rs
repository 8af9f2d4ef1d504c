//! Interfaces to the DSP engine that consumes decoded samples.

use num_complex::Complex;

/// Receives decoded samples, one call per sample, in wire order.
///
/// All calls happen on the thread that drains the receive ring, so an
/// implementation may run its DSP synchronously from here.
pub trait DspSink: Send {
    /// I/Q sample for logical receiver `rx`.
    fn add_iq_samples(&mut self, rx: usize, iq: Complex<f64>);

    /// Microphone sample at 48 kHz.
    fn add_mic_sample(&mut self, sample: f64);

    /// Correlated PureSignal pair: TX reference and PA feedback.
    fn add_ps_iq_samples(&mut self, reference: Complex<f64>, feedback: Complex<f64>);

    /// Main and auxiliary samples of the diversity pair.
    fn add_diversity_samples(&mut self, main: Complex<f64>, aux: Complex<f64>);
}

/// Microphone captured on the host instead of the radio.
pub trait LocalMicrophone: Send {
    fn is_active(&self) -> bool;

    /// Next 48 kHz sample, or `None` when capture underran.
    fn next_sample(&mut self) -> Option<f64>;
}

/// Phase-rotate and scale `aux`, then add it to `main`.
pub fn diversity_combine(main: Complex<f64>, aux: Complex<f64>, gain: f64, phase_deg: f64) -> Complex<f64> {
    main + aux * Complex::from_polar(gain, phase_deg.to_radians())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_in_phase_doubles() {
        let s = Complex::new(0.25, -0.5);
        let out = diversity_combine(s, s, 1.0, 0.0);
        assert!((out - s * 2.0).norm() < 1e-12);
    }

    #[test]
    fn combine_anti_phase_cancels() {
        let s = Complex::new(0.25, -0.5);
        let out = diversity_combine(s, s, 1.0, 180.0);
        assert!(out.norm() < 1e-12);
    }
}
