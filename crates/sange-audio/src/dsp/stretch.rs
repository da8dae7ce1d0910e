//! Playback rate and tempo stages.
//!
//! [`Varispeed`] resamples by linear interpolation, so pitch follows speed.
//! [`TempoStretch`] is a windowed overlap-add stretcher that changes speed
//! without touching pitch.
//!
//! Both stages stay bypassed until their factor first leaves 1.0. From then
//! on they stay engaged until [`reset`](Varispeed::reset), so returning to
//! 1.0 does not cut off what they have buffered. While engaged, output
//! timestamps advance by the media time each output sample stands for.

use std::f32::consts::PI;

/// Output of a stage: interleaved samples and the media time of the first.
#[derive(Debug, Clone, PartialEq)]
pub struct Stretched {
    pub timestamp: f64,
    pub samples: Vec<f32>,
}

/// Media-time bookkeeping shared by both stages.
#[derive(Debug, Clone, Copy, Default)]
struct Timeline {
    /// Media time of the next output sample.
    next: Option<f64>,
}

impl Timeline {
    fn start(&mut self, timestamp: f64) -> f64 {
        *self.next.get_or_insert(timestamp)
    }

    fn advance(&mut self, frames: usize, factor: f64, sample_rate: u32) {
        if let Some(next) = &mut self.next {
            *next += frames as f64 * factor / f64::from(sample_rate);
        }
    }
}

/// Linear-interpolation varispeed.
#[derive(Debug, Default)]
pub struct Varispeed {
    engaged: bool,
    /// Read position in frames, relative to the first frame of `tail`.
    position: f64,
    /// Last input frame, kept for interpolating across frame boundaries.
    tail: Vec<f32>,
    timeline: Timeline,
}

impl Varispeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn is_engaged(&self) -> bool {
        self.engaged
    }

    pub fn process(
        &mut self,
        timestamp: f64,
        samples: Vec<f32>,
        channels: u16,
        sample_rate: u32,
        rate: f64,
    ) -> Stretched {
        if !self.engaged {
            if (rate - 1.0).abs() < f64::EPSILON {
                return Stretched { timestamp, samples };
            }
            self.engaged = true;
        }

        let channels = channels as usize;
        let out_timestamp = self.timeline.start(timestamp);

        let mut buffer = std::mem::take(&mut self.tail);
        buffer.extend_from_slice(&samples);
        let frames = buffer.len() / channels;

        let mut out = Vec::with_capacity((samples.len() as f64 / rate) as usize + channels);
        while frames > 0 && self.position + 1.0 < frames as f64 {
            let index = self.position as usize;
            let frac = (self.position - index as f64) as f32;
            let a = &buffer[index * channels..(index + 1) * channels];
            let b = &buffer[(index + 1) * channels..(index + 2) * channels];
            out.extend(a.iter().zip(b).map(|(&a, &b)| (b - a).mul_add(frac, a)));
            self.position += rate;
        }

        if frames > 0 {
            self.position -= (frames - 1) as f64;
            self.tail = buffer[(frames - 1) * channels..].to_vec();
        }

        self.timeline.advance(out.len() / channels.max(1), rate, sample_rate);
        Stretched {
            timestamp: out_timestamp,
            samples: out,
        }
    }

    /// Emit the held-back last frame.
    pub fn flush(&mut self) -> Option<Stretched> {
        if !self.engaged || self.tail.is_empty() {
            return None;
        }
        let timestamp = self.timeline.next.unwrap_or(0.0);
        Some(Stretched {
            timestamp,
            samples: std::mem::take(&mut self.tail),
        })
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Overlap-add time stretcher with a periodic Hann window at 50% overlap.
#[derive(Debug)]
pub struct TempoStretch {
    window: Vec<f32>,
    engaged: bool,
    channels: usize,
    /// Unconsumed interleaved input.
    input: Vec<f32>,
    /// Analysis position in frames into `input`, may be fractional.
    read_position: f64,
    /// Overlap-add accumulator, `window.len()` frames.
    accumulator: Vec<f32>,
    timeline: Timeline,
}

impl TempoStretch {
    /// `window_frames` is rounded up to an even number.
    pub fn new(window_frames: usize) -> Self {
        let len = (window_frames.max(2) + 1) & !1;
        let window = (0..len)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / len as f32).cos())
            .collect();
        Self {
            window,
            engaged: false,
            channels: 0,
            input: Vec::new(),
            read_position: 0.0,
            accumulator: Vec::new(),
            timeline: Timeline::default(),
        }
    }

    pub const fn is_engaged(&self) -> bool {
        self.engaged
    }

    fn window_len(&self) -> usize {
        self.window.len()
    }

    fn hop(&self) -> usize {
        self.window.len() / 2
    }

    pub fn process(
        &mut self,
        timestamp: f64,
        samples: Vec<f32>,
        channels: u16,
        sample_rate: u32,
        tempo: f64,
    ) -> Stretched {
        if !self.engaged {
            if (tempo - 1.0).abs() < f64::EPSILON {
                return Stretched { timestamp, samples };
            }
            self.engaged = true;
            self.channels = channels as usize;
            self.accumulator = vec![0.0; self.window_len() * self.channels];
        }

        let out_timestamp = self.timeline.start(timestamp);
        self.input.extend_from_slice(&samples);
        let out = self.run(tempo);
        self.timeline.advance(out.len() / self.channels.max(1), tempo, sample_rate);
        Stretched {
            timestamp: out_timestamp,
            samples: out,
        }
    }

    /// Push silence through to release what is still in the window.
    pub fn flush(&mut self, sample_rate: u32, tempo: f64) -> Option<Stretched> {
        if !self.engaged || self.channels == 0 {
            return None;
        }
        let timestamp = self.timeline.next?;

        let pending = self.input.len() / self.channels;
        let expected = ((pending as f64 - self.read_position).max(0.0) / tempo).ceil() as usize
            + self.window_len()
            - self.hop();
        self.input
            .resize(self.input.len() + self.window_len() * self.channels, 0.0);
        let mut out = self.run(tempo);

        let hop = self.hop() * self.channels;
        out.extend_from_slice(&self.accumulator[..hop]);
        out.truncate(expected * self.channels);
        self.input.clear();
        self.accumulator.fill(0.0);
        self.read_position = 0.0;

        self.timeline.advance(out.len() / self.channels, tempo, sample_rate);
        (!out.is_empty()).then_some(Stretched {
            timestamp,
            samples: out,
        })
    }

    pub fn reset(&mut self) {
        self.engaged = false;
        self.channels = 0;
        self.input.clear();
        self.read_position = 0.0;
        self.accumulator.clear();
        self.timeline = Timeline::default();
    }

    fn run(&mut self, tempo: f64) -> Vec<f32> {
        let channels = self.channels;
        let window_len = self.window_len();
        let hop = self.hop();
        let analysis_hop = hop as f64 * tempo;

        let mut out = Vec::new();
        loop {
            let start = self.read_position.round() as usize;
            if (start + window_len) * channels > self.input.len() {
                break;
            }

            let segment = &self.input[start * channels..(start + window_len) * channels];
            for (i, (acc, &x)) in self.accumulator.iter_mut().zip(segment).enumerate() {
                *acc += x * self.window[i / channels];
            }

            out.extend_from_slice(&self.accumulator[..hop * channels]);
            self.accumulator.copy_within(hop * channels.., 0);
            let len = self.accumulator.len();
            self.accumulator[len - hop * channels..].fill(0.0);

            self.read_position += analysis_hop;
        }

        let consumed = (self.read_position.floor() as usize).min(self.input.len() / channels.max(1));
        self.input.drain(..consumed * channels);
        self.read_position -= consumed as f64;
        out
    }
}
