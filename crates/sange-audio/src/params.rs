//! DSP parameters shared between the control surface and the producer.

use std::sync::Arc;

use parking_lot::RwLock;
use sange_core::{EqualizerBand, OutputFormat, Tremolo};

/// Slowest rate or tempo factor the chain runs at.
pub const MIN_SPEED_FACTOR: f64 = 0.0625;

/// Fastest rate or tempo factor the chain runs at.
pub const MAX_SPEED_FACTOR: f64 = 16.0;

/// One immutable set of DSP parameters.
///
/// The producer takes a snapshot per frame, so every field of a frame is
/// processed under the same settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DspParams {
    /// Linear gain.
    pub volume: f32,
    /// Varispeed factor: pitch and speed change together.
    pub rate: f64,
    /// Time-stretch factor: speed changes, pitch does not.
    pub tempo: f64,
    pub tremolo: Tremolo,
    /// Replaced wholesale on every update.
    pub equalizer: Arc<[EqualizerBand]>,
    pub output: OutputFormat,
}

impl DspParams {
    pub fn new(output: OutputFormat) -> Self {
        Self {
            volume: 1.0,
            rate: 1.0,
            tempo: 1.0,
            tremolo: Tremolo::default(),
            equalizer: Arc::from(Vec::new()),
            output,
        }
    }

    /// Media seconds consumed per second of output.
    pub fn speed(&self) -> f64 {
        self.rate * self.tempo
    }
}

impl Default for DspParams {
    fn default() -> Self {
        Self::new(OutputFormat::default())
    }
}

/// Copy-on-write holder of the current [`DspParams`].
#[derive(Debug)]
pub struct SharedParams {
    current: RwLock<Arc<DspParams>>,
}

impl SharedParams {
    pub fn new(params: DspParams) -> Self {
        Self {
            current: RwLock::new(Arc::new(params)),
        }
    }

    /// The parameters in force right now.
    pub fn snapshot(&self) -> Arc<DspParams> {
        Arc::clone(&self.current.read())
    }

    /// Publish a modified copy of the current parameters.
    pub fn update(&self, f: impl FnOnce(&mut DspParams)) {
        let mut current = self.current.write();
        let mut next = DspParams::clone(&current);
        f(&mut next);
        *current = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_stable() {
        let shared = SharedParams::new(DspParams::default());
        let before = shared.snapshot();
        shared.update(|p| p.volume = 0.5);
        assert!((before.volume - 1.0).abs() < f32::EPSILON);
        assert!((shared.snapshot().volume - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_equalizer_replacement_is_atomic() {
        let shared = Arc::new(SharedParams::new(DspParams::default()));
        let boost: Arc<[EqualizerBand]> = Arc::from(vec![EqualizerBand::new(100.0, 6.0); 5]);
        let cut: Arc<[EqualizerBand]> = Arc::from(vec![EqualizerBand::new(4000.0, -6.0); 9]);

        let writer = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                for i in 0..2000 {
                    let bands = if i % 2 == 0 { &boost } else { &cut };
                    shared.update(|p| p.equalizer = Arc::clone(bands));
                }
            })
        };

        while !writer.is_finished() {
            let snapshot = shared.snapshot();
            let bands = &snapshot.equalizer;
            if let Some(first) = bands.first() {
                let expected = if first.gain > 0.0 { 5 } else { 9 };
                assert_eq!(bands.len(), expected);
                assert!(bands.iter().all(|b| b == first));
            }
        }
        assert!(writer.join().is_ok());
    }

    #[test]
    fn test_speed() {
        let mut params = DspParams::default();
        params.rate = 1.25;
        params.tempo = 0.8;
        assert!((params.speed() - 1.0).abs() < 1e-12);
    }
}
