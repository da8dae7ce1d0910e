//! Decoded audio frames.

/// One buffer of channel-interleaved `f32` PCM.
///
/// A frame is moved from the decode pipeline into the DSP chain and from
/// there into a `packet` event; it is never shared while being mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Monotonic sequence number assigned by the decode pipeline.
    pub sequence: u64,
    /// Presentation timestamp of the first sample, in seconds of media time.
    pub timestamp: f64,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
    /// Interleaved samples (`frames() * channels` values).
    pub samples: Vec<f32>,
}

impl Frame {
    pub const fn new(
        sequence: u64,
        timestamp: f64,
        sample_rate: u32,
        channels: u16,
        samples: Vec<f32>,
    ) -> Self {
        Self {
            sequence,
            timestamp,
            sample_rate,
            channels,
            samples,
        }
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / usize::from(self.channels)
    }

    /// Playback length of this frame in seconds.
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    /// Timestamp just past the last sample.
    pub fn end_timestamp(&self) -> f64 {
        self.timestamp + self.duration()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
