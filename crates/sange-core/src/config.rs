//! Player configuration.
//!
//! Every field has a default, so a config file only needs to name what it
//! overrides:
//!
//! ```json
//! { "pacing": "unpaced", "http": { "retries": 4 } }
//! ```

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{OutputFormat, TremoloWaveform};
use crate::{Error, Result};

/// How the producer loop schedules frames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Pacing {
    /// Release each frame at its wall-clock due time; frames that fall
    /// further behind than `max_lateness_ms` are dropped.
    #[default]
    Realtime,
    /// Produce as fast as the subscriber consumes.
    Unpaced,
}

/// Top-level configuration for a player session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlayerConfig {
    /// Capacity of the queue between the producer and the subscriber.
    pub queue_depth: usize,
    pub pacing: Pacing,
    /// Lateness after which a realtime-paced frame is dropped.
    pub max_lateness_ms: u64,
    /// Upper bound for waiting on the producer to acknowledge a command.
    pub control_timeout_ms: u64,
    /// Initial output format.
    pub output: OutputFormat,
    pub decode: DecodeConfig,
    pub http: HttpConfig,
    pub dsp: DspConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            queue_depth: 16,
            pacing: Pacing::Realtime,
            max_lateness_ms: 200,
            control_timeout_ms: 2000,
            output: OutputFormat::default(),
            decode: DecodeConfig::default(),
            http: HttpConfig::default(),
            dsp: DspConfig::default(),
        }
    }
}

impl PlayerConfig {
    /// Parse and validate a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 {
            return Err(Error::InvalidArgument(
                "queue_depth must be at least 1".to_string(),
            ));
        }
        if self.control_timeout_ms == 0 {
            return Err(Error::InvalidArgument(
                "control_timeout_ms must be positive".to_string(),
            ));
        }
        if self.decode.max_consecutive_errors == 0 {
            return Err(Error::InvalidArgument(
                "decode.max_consecutive_errors must be at least 1".to_string(),
            ));
        }
        if !(self.dsp.equalizer_q.is_finite() && self.dsp.equalizer_q > 0.0) {
            return Err(Error::InvalidArgument(
                "dsp.equalizer_q must be positive".to_string(),
            ));
        }
        if self.dsp.tempo_window < 64 {
            return Err(Error::InvalidArgument(
                "dsp.tempo_window must be at least 64 frames".to_string(),
            ));
        }
        self.output.validate()
    }

    pub const fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub const fn max_lateness(&self) -> Duration {
        Duration::from_millis(self.max_lateness_ms)
    }
}

/// Decode pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DecodeConfig {
    /// Consecutive undecodable packets tolerated before the stream is
    /// considered desynchronized.
    pub max_consecutive_errors: u32,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 16,
        }
    }
}

/// Remote source settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Extra attempts after a retryable failure.
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            read_timeout_ms: 10_000,
            retries: 2,
            retry_backoff_ms: 250,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36".to_string(),
        }
    }
}

/// DSP chain settings that are fixed for the lifetime of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DspConfig {
    /// Q of every equalizer band.
    pub equalizer_q: f32,
    pub tremolo_waveform: TremoloWaveform,
    /// Window length (in frames) of the tempo stretcher.
    pub tempo_window: usize,
}

impl Default for DspConfig {
    fn default() -> Self {
        Self {
            equalizer_q: 1.0,
            tremolo_waveform: TremoloWaveform::Sine,
            tempo_window: 1024,
        }
    }
}
