//! Sample-rate and channel-layout conversion into the negotiated output
//! format, using rubato.

use rubato::{FftFixedIn, Resampler as RubatoResampler};
use sange_core::{Error, Frame, OutputFormat, Result};
use tracing::debug;

/// Input frames fed to rubato per call.
const CHUNK_SIZE: usize = 1024;

/// Upper bound on silent chunks pushed through when flushing.
const FLUSH_ROUNDS: usize = 4;

/// Converts frames of one source format into the output format.
///
/// Channels are remixed first, then the rate is converted. Resampled output
/// is restamped from the first input timestamp after a reset plus the number
/// of frames produced since.
pub struct Converter {
    input_rate: u32,
    input_channels: u16,
    output_rate: u32,
    output_channels: u16,
    resampler: Option<FftFixedIn<f32>>,
    /// Remixed input waiting for a full chunk, one buffer per output channel.
    input_buffer: Vec<Vec<f32>>,
    /// Timestamp of the first input frame since the last reset.
    origin: Option<f64>,
    /// Output frames produced since `origin`.
    produced: u64,
    /// Input frames accepted since `origin`.
    consumed: u64,
}

impl Converter {
    pub fn new(input_rate: u32, input_channels: u16, output: &OutputFormat) -> Result<Self> {
        if input_rate == 0 || input_channels == 0 {
            return Err(Error::InvalidFormat(format!(
                "cannot convert from {input_channels} ch at {input_rate} Hz"
            )));
        }

        let output_channels = output.channels;
        let resampler = if input_rate == output.sample_rate {
            None
        } else {
            let resampler = FftFixedIn::new(
                input_rate as usize,
                output.sample_rate as usize,
                CHUNK_SIZE,
                2,
                output_channels as usize,
            )
            .map_err(|e| Error::InvalidFormat(format!("Failed to create resampler: {e}")))?;
            Some(resampler)
        };

        debug!(
            "Converter created: {input_channels} ch @ {input_rate}Hz -> {output_channels} ch @ {}Hz",
            output.sample_rate
        );

        Ok(Self {
            input_rate,
            input_channels,
            output_rate: output.sample_rate,
            output_channels,
            resampler,
            input_buffer: vec![Vec::new(); output_channels as usize],
            origin: None,
            produced: 0,
            consumed: 0,
        })
    }

    /// Whether this converter handles `frame`'s format into `output`.
    pub fn converts(&self, frame: &Frame, output: &OutputFormat) -> bool {
        self.input_rate == frame.sample_rate
            && self.input_channels == frame.channels
            && self.output_rate == output.sample_rate
            && self.output_channels == output.channels
    }

    /// Check if rate conversion is needed.
    pub const fn needs_resampling(&self) -> bool {
        self.resampler.is_some()
    }

    pub const fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub const fn output_channels(&self) -> u16 {
        self.output_channels
    }

    /// Convert one frame. Returns `None` while the resampler is still
    /// collecting a full chunk.
    pub fn process(&mut self, frame: Frame) -> Result<Option<Frame>> {
        let remixed = remix(&frame.samples, self.input_channels, self.output_channels);

        if self.resampler.is_none() {
            return Ok(Some(Frame::new(
                frame.sequence,
                frame.timestamp,
                self.output_rate,
                self.output_channels,
                remixed,
            )));
        }

        if self.origin.is_none() {
            self.origin = Some(frame.timestamp);
        }
        self.consumed += frame.frames() as u64;
        self.deinterleave(&remixed);

        let mut output = Vec::new();
        while self.input_buffer[0].len() >= CHUNK_SIZE {
            let chunk: Vec<Vec<f32>> = self
                .input_buffer
                .iter_mut()
                .map(|ch| ch.drain(..CHUNK_SIZE).collect())
                .collect();
            self.run_chunk(&chunk, usize::MAX, &mut output)?;
        }

        Ok(self.emit(frame.sequence, output))
    }

    /// Drain buffered input at end of stream.
    ///
    /// Pads with silence until the resampler has given back as many frames
    /// as the input accounts for, and no more.
    pub fn flush(&mut self, sequence: u64) -> Result<Option<Frame>> {
        if self.resampler.is_none() {
            return Ok(None);
        }

        let expected = (self.consumed as f64 * f64::from(self.output_rate)
            / f64::from(self.input_rate))
        .round() as usize;
        let channels = self.output_channels as usize;

        let mut output = Vec::new();
        for _ in 0..FLUSH_ROUNDS {
            let produced = self.produced as usize + output.len() / channels;
            if produced >= expected {
                break;
            }
            let chunk: Vec<Vec<f32>> = self
                .input_buffer
                .iter_mut()
                .map(|ch| {
                    let mut data: Vec<f32> = std::mem::take(ch);
                    data.resize(CHUNK_SIZE, 0.0);
                    data
                })
                .collect();
            self.run_chunk(&chunk, expected - produced, &mut output)?;
        }

        Ok(self.emit(sequence, output))
    }

    /// Drop buffered input and resampler history.
    pub fn reset(&mut self) {
        if let Some(resampler) = &mut self.resampler {
            resampler.reset();
        }
        self.input_buffer.iter_mut().for_each(Vec::clear);
        self.origin = None;
        self.produced = 0;
        self.consumed = 0;
    }

    fn run_chunk(&mut self, chunk: &[Vec<f32>], max_frames: usize, output: &mut Vec<f32>) -> Result<()> {
        let Some(resampler) = &mut self.resampler else {
            return Ok(());
        };
        let resampled = resampler
            .process(chunk, None)
            .map_err(|e| Error::Internal(format!("Resample failed: {e}")))?;

        let frames = resampled.first().map_or(0, Vec::len).min(max_frames);
        output.reserve(frames * resampled.len());
        for frame in 0..frames {
            for ch in &resampled {
                output.push(ch[frame]);
            }
        }
        Ok(())
    }

    fn emit(&mut self, sequence: u64, samples: Vec<f32>) -> Option<Frame> {
        if samples.is_empty() {
            return None;
        }
        let origin = self.origin.unwrap_or(0.0);
        let timestamp = origin + self.produced as f64 / f64::from(self.output_rate);
        let frame = Frame::new(
            sequence,
            timestamp,
            self.output_rate,
            self.output_channels,
            samples,
        );
        self.produced += frame.frames() as u64;
        Some(frame)
    }

    /// Deinterleave input samples into channel buffers.
    fn deinterleave(&mut self, input: &[f32]) {
        let channels = self.input_buffer.len();
        for frame in input.chunks_exact(channels) {
            for (buffer, &sample) in self.input_buffer.iter_mut().zip(frame) {
                buffer.push(sample);
            }
        }
    }
}

/// Map interleaved samples from `from` channels to `to` channels.
///
/// Mono is copied to every output channel; folding down averages the input
/// channels that share an output slot (`input % to`).
pub fn remix(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    let (from, to) = (from as usize, to as usize);
    if from == to {
        return samples.to_vec();
    }

    let frames = samples.len() / from;
    let mut out = Vec::with_capacity(frames * to);
    for frame in samples.chunks_exact(from) {
        if from == 1 {
            out.extend(std::iter::repeat_n(frame[0], to));
        } else if to > from {
            out.extend((0..to).map(|c| frame[c % from]));
        } else {
            for c in 0..to {
                let (sum, n) = frame
                    .iter()
                    .skip(c)
                    .step_by(to)
                    .fold((0.0, 0u32), |(sum, n), &s| (sum + s, n + 1));
                out.push(sum / n as f32);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;

    fn frame(sequence: u64, timestamp: f64, rate: u32, channels: u16, frames: usize) -> Frame {
        Frame::new(sequence, timestamp, rate, channels, vec![0.5; frames * channels as usize])
    }

    #[test]
    fn test_passthrough_keeps_timestamps() {
        let output = OutputFormat::new(2, 48000, 128_000).unwrap();
        let mut converter = Converter::new(48000, 2, &output).unwrap();
        assert!(!converter.needs_resampling());

        let out = converter.process(frame(7, 1.25, 48000, 2, 480)).unwrap().unwrap();
        assert_eq!(out.sequence, 7);
        assert!((out.timestamp - 1.25).abs() < f64::EPSILON);
        assert_eq!(out.samples.len(), 960);
    }

    #[test]
    fn test_remix() {
        assert_eq!(remix(&[0.1, 0.2], 1, 2), vec![0.1, 0.1, 0.2, 0.2]);
        assert_eq!(remix(&[0.2, 0.4, 0.0, 1.0], 2, 1), vec![0.3, 0.5]);
        assert_eq!(remix(&[0.1, 0.2], 2, 3), vec![0.1, 0.2, 0.1]);
    }

    #[test]
    fn test_upsample_to_output_format() {
        let output = OutputFormat::new(2, 48000, 128_000).unwrap();
        let mut converter = Converter::new(22050, 1, &output).unwrap();
        assert!(converter.needs_resampling());

        let mut produced = 0;
        let mut last_ts = -1.0;
        for i in 0..20u64 {
            let ts = i as f64 * 512.0 / 22050.0;
            if let Some(out) = converter.process(frame(i, ts, 22050, 1, 512)).unwrap() {
                assert_eq!(out.channels, 2);
                assert_eq!(out.sample_rate, 48000);
                assert!(out.timestamp > last_ts);
                last_ts = out.timestamp;
                produced += out.frames();
            }
        }
        if let Some(out) = converter.flush(20).unwrap() {
            produced += out.frames();
        }

        let expected = (20.0 * 512.0 * 48000.0 / 22050.0) as usize;
        assert!(produced.abs_diff(expected) <= 2, "{produced} vs {expected}");
    }

    #[test]
    fn test_reset_restarts_timeline() {
        let output = OutputFormat::new(1, 44100, 64_000).unwrap();
        let mut converter = Converter::new(48000, 1, &output).unwrap();
        for i in 0..4 {
            converter.process(frame(i, i as f64 * 0.02, 48000, 1, 960)).unwrap();
        }

        converter.reset();
        let mut first = None;
        for i in 0..4 {
            if let Some(out) = converter.process(frame(10 + i, 5.0 + i as f64 * 0.02, 48000, 1, 960)).unwrap() {
                first.get_or_insert(out.timestamp);
            }
        }
        assert!((first.unwrap() - 5.0).abs() < 1e-9);
    }
}
