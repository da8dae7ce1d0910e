//! Tremolo: amplitude modulation by a low frequency oscillator.

use std::f64::consts::TAU;

use sange_core::{Tremolo, TremoloWaveform};

/// Tremolo stage with a free-running LFO.
///
/// The LFO is unipolar (`w` in `[0, 1]`) and the applied gain is
/// `1 - depth * (1 - w)`, so the signal peaks at unity and dips to
/// `1 - depth`.
#[derive(Debug, Clone)]
pub struct TremoloStage {
    waveform: TremoloWaveform,
    /// LFO phase in cycles, `[0, 1)`.
    phase: f64,
}

impl TremoloStage {
    pub const fn new(waveform: TremoloWaveform) -> Self {
        Self {
            waveform,
            phase: 0.0,
        }
    }

    /// Modulate interleaved `samples` in place.
    pub fn process(&mut self, samples: &mut [f32], channels: u16, sample_rate: u32, settings: &Tremolo) {
        if !settings.is_active() || channels == 0 || sample_rate == 0 {
            return;
        }

        let increment = f64::from(settings.rate_hz) / f64::from(sample_rate);
        let depth = settings.depth.clamp(0.0, 1.0);

        for frame in samples.chunks_exact_mut(channels as usize) {
            let gain = 1.0 - depth * (1.0 - self.lfo());
            for sample in frame {
                *sample *= gain;
            }
            self.phase = (self.phase + increment).fract();
        }
    }

    pub fn reset(&mut self) {
        self.phase = 0.0;
    }

    /// Unipolar LFO value at the current phase; 1.0 at phase zero.
    fn lfo(&self) -> f32 {
        let value = match self.waveform {
            TremoloWaveform::Sine => (TAU * self.phase).cos().mul_add(0.5, 0.5),
            TremoloWaveform::Triangle => (2.0 * self.phase - 1.0).abs(),
        };
        value as f32
    }
}
