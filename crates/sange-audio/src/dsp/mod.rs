//! The DSP chain a frame passes through between decoding and delivery.
//!
//! Stage order is fixed: resample, volume, equalizer, tremolo, rate, tempo.

mod equalizer;
mod stretch;
mod tremolo;

pub use equalizer::{Equalizer, MAX_GAIN_DB};
pub use stretch::{Stretched, TempoStretch, Varispeed};
pub use tremolo::TremoloStage;

use sange_core::config::DspConfig;
use sange_core::{Frame, OutputFormat, Result};
use tracing::debug;

use crate::params::DspParams;
use crate::resample::Converter;

/// Stateful processing chain for one session.
///
/// Everything except continuity state (resampler buffers, filter history,
/// LFO phase, rate/tempo buffers) comes from the [`DspParams`] passed with
/// each frame. [`DspChain::reset`] clears the continuity state.
pub struct DspChain {
    converter: Option<Converter>,
    /// Output format the downstream stages were last run with.
    output: Option<OutputFormat>,
    equalizer: Equalizer,
    tremolo: TremoloStage,
    varispeed: Varispeed,
    tempo: TempoStretch,
    last_sequence: Option<u64>,
}

impl DspChain {
    pub fn new(config: &DspConfig) -> Self {
        Self {
            converter: None,
            output: None,
            equalizer: Equalizer::new(config.equalizer_q),
            tremolo: TremoloStage::new(config.tremolo_waveform),
            varispeed: Varispeed::new(),
            tempo: TempoStretch::new(config.tempo_window),
            last_sequence: None,
        }
    }

    /// Run `frame` through every stage. `None` means the frame was absorbed
    /// by a buffering stage and nothing is ready to deliver yet.
    pub fn process(&mut self, frame: Frame, params: &DspParams) -> Result<Option<Frame>> {
        let sequence = frame.sequence;
        self.last_sequence = Some(sequence);
        self.negotiate(&frame, &params.output)?;

        let Some(converter) = &mut self.converter else {
            return Ok(None);
        };
        let Some(mut frame) = converter.process(frame)? else {
            return Ok(None);
        };

        self.shape(&mut frame.samples, frame.channels, frame.sample_rate, params);
        Ok(self.stretch(frame, params))
    }

    /// Drain what the resampler and the rate/tempo stages still hold.
    ///
    /// The tail is delivered as a single frame numbered after the last
    /// processed one. Continuity state is cleared afterwards.
    pub fn flush(&mut self, params: &DspParams) -> Result<Option<Frame>> {
        let Some(sequence) = self.last_sequence.map(|s| s + 1) else {
            return Ok(None);
        };
        let Some(output) = self.output else {
            return Ok(None);
        };

        let mut pieces: Vec<Stretched> = Vec::new();

        if let Some(converter) = &mut self.converter {
            if let Some(mut frame) = converter.flush(sequence)? {
                self.shape(&mut frame.samples, frame.channels, frame.sample_rate, params);
                if let Some(frame) = self.stretch(frame, params) {
                    pieces.push(Stretched {
                        timestamp: frame.timestamp,
                        samples: frame.samples,
                    });
                }
            }
        }

        if let Some(tail) = self.varispeed.flush() {
            let stretched = self.tempo.process(
                tail.timestamp,
                tail.samples,
                output.channels,
                output.sample_rate,
                params.tempo,
            );
            pieces.push(stretched);
        }
        if let Some(tail) = self.tempo.flush(output.sample_rate, params.tempo) {
            pieces.push(tail);
        }

        self.reset();

        let mut pieces = pieces.into_iter().filter(|p| !p.samples.is_empty());
        let Some(first) = pieces.next() else {
            return Ok(None);
        };
        let mut samples = first.samples;
        for piece in pieces {
            samples.extend(piece.samples);
        }

        self.last_sequence = Some(sequence);
        Ok(Some(Frame::new(
            sequence,
            first.timestamp,
            output.sample_rate,
            output.channels,
            samples,
        )))
    }

    /// Drain the chain ahead of an output layout change.
    ///
    /// When `params.output` differs from the layout the stages last ran
    /// with in channels or rate, everything still buffered is flushed in the
    /// old layout and the converter is rebuilt on the next frame. Returns
    /// `None` when there is nothing to drain.
    pub fn drain_for(&mut self, params: &DspParams) -> Result<Option<Frame>> {
        let Some(current) = self.output else {
            return Ok(None);
        };
        if current.channels == params.output.channels
            && current.sample_rate == params.output.sample_rate
        {
            return Ok(None);
        }

        let tail = self.flush(params)?;
        if let Some(tail) = &tail {
            debug!(
                "Drained {} frames before switching from {} ch @ {}Hz",
                tail.frames(),
                current.channels,
                current.sample_rate
            );
        }
        self.converter = None;
        self.output = None;
        Ok(tail)
    }

    /// Clear all continuity state, e.g. after a seek.
    pub fn reset(&mut self) {
        if let Some(converter) = &mut self.converter {
            converter.reset();
        }
        self.reset_downstream();
    }

    fn reset_downstream(&mut self) {
        self.equalizer.reset();
        self.tremolo.reset();
        self.varispeed.reset();
        self.tempo.reset();
    }

    /// Make sure the converter matches the frame's format and the wanted
    /// output format.
    fn negotiate(&mut self, frame: &Frame, output: &OutputFormat) -> Result<()> {
        if self
            .converter
            .as_ref()
            .is_some_and(|c| c.converts(frame, output))
        {
            return Ok(());
        }

        if self.output.is_some_and(|current| current != *output) {
            debug!(
                "Output format changed to {} ch @ {}Hz, {} bps",
                output.channels, output.sample_rate, output.bitrate
            );
        }
        let layout_changed = self.output.is_none_or(|current| {
            current.channels != output.channels || current.sample_rate != output.sample_rate
        });
        if layout_changed {
            self.reset_downstream();
        }

        self.converter = Some(Converter::new(frame.sample_rate, frame.channels, output)?);
        self.output = Some(*output);
        Ok(())
    }

    /// Volume, equalizer, and tremolo, all in place.
    fn shape(&mut self, samples: &mut [f32], channels: u16, sample_rate: u32, params: &DspParams) {
        if (params.volume - 1.0).abs() > f32::EPSILON {
            for sample in samples.iter_mut() {
                *sample *= params.volume;
            }
        }
        self.equalizer
            .process(samples, channels, sample_rate, &params.equalizer);
        self.tremolo
            .process(samples, channels, sample_rate, &params.tremolo);
    }

    fn stretch(&mut self, frame: Frame, params: &DspParams) -> Option<Frame> {
        let Frame {
            sequence,
            timestamp,
            sample_rate,
            channels,
            samples,
        } = frame;

        let step = self
            .varispeed
            .process(timestamp, samples, channels, sample_rate, params.rate);
        let step = self
            .tempo
            .process(step.timestamp, step.samples, channels, sample_rate, params.tempo);

        (!step.samples.is_empty()).then(|| {
            Frame::new(sequence, step.timestamp, sample_rate, channels, step.samples)
        })
    }
}
