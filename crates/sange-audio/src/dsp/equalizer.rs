//! N-band peaking equalizer.
//!
//! Each band is an RBJ peaking biquad run independently per channel, in
//! series with the other bands.

use std::f32::consts::PI;
use std::sync::Arc;

use sange_core::EqualizerBand;
use tracing::debug;

/// Gain limit for a band, in dB.
pub const MAX_GAIN_DB: f32 = 24.0;

/// Highest usable center frequency as a fraction of the sample rate.
const MAX_FREQUENCY_RATIO: f32 = 0.45;

/// Normalized biquad coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Coefficients {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl Coefficients {
    fn peaking(sample_rate: u32, band: &EqualizerBand, q: f32) -> Self {
        let sample_rate = sample_rate as f32;
        let gain_db = band.gain.clamp(-MAX_GAIN_DB, MAX_GAIN_DB);
        let frequency = band.frequency.min(sample_rate * MAX_FREQUENCY_RATIO);

        let a = 10.0_f32.powf(gain_db / 40.0);
        let omega = 2.0 * PI * frequency / sample_rate;
        let (sin_omega, cos_omega) = omega.sin_cos();
        let alpha = sin_omega / (2.0 * q);

        let a0 = 1.0 + alpha / a;
        Self {
            b0: (1.0 + alpha * a) / a0,
            b1: (-2.0 * cos_omega) / a0,
            b2: (1.0 - alpha * a) / a0,
            a1: (-2.0 * cos_omega) / a0,
            a2: (1.0 - alpha / a) / a0,
        }
    }
}

/// Direct form I history of one band on one channel.
#[derive(Debug, Clone, Copy, Default)]
struct History {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl History {
    #[inline]
    fn process(&mut self, c: &Coefficients, x: f32) -> f32 {
        let mut y = c.b0 * x + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        // Flush denormals
        if y.abs() < 1e-15 {
            y = 0.0;
        }
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// Stateful equalizer for one stream.
#[derive(Debug)]
pub struct Equalizer {
    q: f32,
    sample_rate: u32,
    channels: usize,
    bands: Arc<[EqualizerBand]>,
    coefficients: Vec<Coefficients>,
    /// `history[band * channels + channel]`
    history: Vec<History>,
}

impl Equalizer {
    pub fn new(q: f32) -> Self {
        Self {
            q,
            sample_rate: 0,
            channels: 0,
            bands: Arc::from(Vec::new()),
            coefficients: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn band_count(&self) -> usize {
        self.coefficients.len()
    }

    /// Filter interleaved `samples` in place with `bands`.
    ///
    /// Coefficients are rebuilt when the band set or the stream format
    /// changes; filter history survives a band update of the same size.
    pub fn process(
        &mut self,
        samples: &mut [f32],
        channels: u16,
        sample_rate: u32,
        bands: &Arc<[EqualizerBand]>,
    ) {
        let channels = channels as usize;
        if channels == 0 {
            return;
        }
        self.configure(channels, sample_rate, bands);
        if self.coefficients.is_empty() {
            return;
        }

        for frame in samples.chunks_exact_mut(channels) {
            for (channel, sample) in frame.iter_mut().enumerate() {
                let mut x = *sample;
                for (band, c) in self.coefficients.iter().enumerate() {
                    x = self.history[band * channels + channel].process(c, x);
                }
                *sample = x;
            }
        }
    }

    /// Clear filter history.
    pub fn reset(&mut self) {
        self.history.fill(History::default());
    }

    fn configure(&mut self, channels: usize, sample_rate: u32, bands: &Arc<[EqualizerBand]>) {
        let format_changed = channels != self.channels || sample_rate != self.sample_rate;
        if !format_changed && Arc::ptr_eq(bands, &self.bands) {
            return;
        }

        self.coefficients = bands
            .iter()
            .map(|band| Coefficients::peaking(sample_rate, band, self.q))
            .collect();

        let len = bands.len() * channels;
        if format_changed || self.history.len() != len {
            self.history = vec![History::default(); len];
        }

        debug!(
            "Equalizer configured: {} bands, {channels} ch @ {sample_rate}Hz",
            bands.len()
        );
        self.channels = channels;
        self.sample_rate = sample_rate;
        self.bands = Arc::clone(bands);
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn bands(list: &[(f32, f32)]) -> Arc<[EqualizerBand]> {
        list.iter()
            .map(|&(f, g)| EqualizerBand::new(f, g))
            .collect::<Vec<_>>()
            .into()
    }

    fn sine(frequency: f32, sample_rate: u32, frames: usize) -> Vec<f32> {
        (0..frames)
            .map(|i| (2.0 * PI * frequency * i as f32 / sample_rate as f32).sin() * 0.5)
            .collect()
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn test_empty_band_set_is_transparent() {
        let mut eq = Equalizer::new(1.0);
        let input = sine(440.0, 48000, 1024);
        let mut output = input.clone();
        eq.process(&mut output, 1, 48000, &bands(&[]));
        assert_eq!(input, output);
    }

    #[test]
    fn test_boost_at_center_frequency() {
        let mut eq = Equalizer::new(1.0);
        let input = sine(1000.0, 48000, 48000);
        let mut output = input.clone();
        eq.process(&mut output, 1, 48000, &bands(&[(1000.0, 6.0)]));

        // Skip the transient, then compare levels: +6 dB is about 2x.
        let ratio = rms(&output[4800..]) / rms(&input[4800..]);
        assert!((ratio - 2.0).abs() < 0.1, "ratio {ratio}");
    }

    #[test]
    fn test_cut_away_from_center_is_small() {
        let mut eq = Equalizer::new(1.0);
        let input = sine(100.0, 48000, 48000);
        let mut output = input.clone();
        eq.process(&mut output, 1, 48000, &bands(&[(8000.0, -12.0)]));

        let ratio = rms(&output[4800..]) / rms(&input[4800..]);
        assert!(ratio > 0.95, "ratio {ratio}");
    }

    #[test]
    fn test_band_update_rebuilds_coefficients() {
        let mut eq = Equalizer::new(1.0);
        let mut buf = vec![0.0; 64];
        eq.process(&mut buf, 2, 44100, &bands(&[(100.0, 3.0)]));
        assert_eq!(eq.band_count(), 1);
        eq.process(&mut buf, 2, 44100, &bands(&[(100.0, 3.0), (5000.0, -3.0), (12000.0, 1.0)]));
        assert_eq!(eq.band_count(), 3);
        assert_eq!(eq.history.len(), 6);
    }

    proptest! {
        #[test]
        fn prop_stable_for_any_band(
            frequency in 1.0f32..200_000.0,
            gain in -100.0f32..100.0,
            sample_rate in prop::sample::select(vec![8000u32, 22050, 44100, 48000, 96000]),
        ) {
            let mut eq = Equalizer::new(1.0);
            let set = bands(&[(frequency, gain)]);

            let mut impulse = vec![0.0f32; 2 * 8192];
            impulse[0] = 1.0;
            impulse[1] = 1.0;
            eq.process(&mut impulse, 2, sample_rate, &set);
            prop_assert!(impulse.iter().all(|s| s.is_finite()));

            // Silence afterwards must decay towards zero.
            let mut tail = vec![0.0f32; 2 * 8192];
            eq.process(&mut tail, 2, sample_rate, &set);
            prop_assert!(tail[tail.len() - 2..].iter().all(|s| s.abs() < 1e-3));
        }
    }
}
