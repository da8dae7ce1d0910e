//! Output format and DSP parameter types.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Highest channel count the negotiator accepts.
pub const MAX_CHANNELS: u16 = 8;

/// Highest output sample rate the negotiator accepts.
pub const MAX_SAMPLE_RATE: u32 = 384_000;

/// Target format of the frames delivered in `packet` events.
///
/// `bitrate` is not used by the engine itself; it is negotiated here so a
/// downstream encoder can read it alongside the PCM it is handed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OutputFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub bitrate: u32,
}

impl OutputFormat {
    /// Build a validated output format.
    pub fn new(channels: u16, sample_rate: u32, bitrate: u32) -> Result<Self> {
        let format = Self {
            channels,
            sample_rate,
            bitrate,
        };
        format.validate()?;
        Ok(format)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(Error::InvalidFormat(format!(
                "channel count {} outside 1..={MAX_CHANNELS}",
                self.channels
            )));
        }
        if self.sample_rate == 0 || self.sample_rate > MAX_SAMPLE_RATE {
            return Err(Error::InvalidFormat(format!(
                "sample rate {} outside 1..={MAX_SAMPLE_RATE}",
                self.sample_rate
            )));
        }
        if self.bitrate == 0 {
            return Err(Error::InvalidFormat("bitrate must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for OutputFormat {
    /// 48 kHz stereo at 128 kbps.
    fn default() -> Self {
        Self {
            channels: 2,
            sample_rate: 48000,
            bitrate: 128_000,
        }
    }
}

/// One equalizer band: a center frequency and the gain applied around it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EqualizerBand {
    /// Center frequency in Hz.
    pub frequency: f32,
    /// Gain in dB; negative values attenuate.
    pub gain: f32,
}

impl EqualizerBand {
    pub const fn new(frequency: f32, gain: f32) -> Self {
        Self { frequency, gain }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.frequency.is_finite() || self.frequency <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "equalizer frequency {} must be a positive number",
                self.frequency
            )));
        }
        if !self.gain.is_finite() {
            return Err(Error::InvalidArgument(format!(
                "equalizer gain {} must be finite",
                self.gain
            )));
        }
        Ok(())
    }
}

/// Tremolo settings. A tremolo is active only when both values are non-zero.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Tremolo {
    /// Modulation depth in `[0, 1]`.
    pub depth: f32,
    /// Modulation rate in Hz.
    pub rate_hz: f32,
}

impl Tremolo {
    pub fn new(depth: f32, rate_hz: f32) -> Result<Self> {
        if !depth.is_finite() || !(0.0..=1.0).contains(&depth) {
            return Err(Error::InvalidArgument(format!(
                "tremolo depth {depth} outside [0, 1]"
            )));
        }
        if !rate_hz.is_finite() || rate_hz < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "tremolo rate {rate_hz} must be >= 0"
            )));
        }
        Ok(Self { depth, rate_hz })
    }

    pub fn is_active(&self) -> bool {
        self.depth > 0.0 && self.rate_hz > 0.0
    }
}

/// Shape of the tremolo gain envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TremoloWaveform {
    #[default]
    Sine,
    Triangle,
}
