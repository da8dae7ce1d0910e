//! Audio device output using cpal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, SampleFormat, Stream, StreamConfig,
};
use sange_audio::buffer::SharedSampleRing;
use tracing::{debug, error, info};

/// An open output stream fed from a [`SharedSampleRing`].
pub struct DeviceOutput {
    _stream: Stream,
    device_name: String,
    sample_rate: u32,
    channels: u16,
    underruns: Arc<AtomicU64>,
}

impl DeviceOutput {
    /// Open the default output device.
    pub fn open_default(ring: SharedSampleRing) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("No output device found"))?;
        Self::with_device(&device, ring)
    }

    /// Open `device` with its default configuration.
    pub fn with_device(device: &Device, ring: SharedSampleRing) -> Result<Self> {
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Using audio output device: {device_name}");

        let supported = device
            .default_output_config()
            .context("Failed to get output config")?;
        debug!("Supported output config: {supported:?}");

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();
        let underruns = Arc::new(AtomicU64::new(0));

        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(device, &config, ring, Arc::clone(&underruns))?,
            SampleFormat::I16 => build_stream::<i16>(device, &config, ring, Arc::clone(&underruns))?,
            SampleFormat::U16 => build_stream::<u16>(device, &config, ring, Arc::clone(&underruns))?,
            _ => return Err(anyhow!("Unsupported sample format: {sample_format:?}")),
        };
        stream.play().context("Failed to start stream")?;

        Ok(Self {
            _stream: stream,
            device_name,
            sample_rate: config.sample_rate.0,
            channels: config.channels,
            underruns,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub const fn channels(&self) -> u16 {
        self.channels
    }

    /// Callbacks that found the ring short of samples.
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
    device: &Device,
    config: &StreamConfig,
    ring: SharedSampleRing,
    underruns: Arc<AtomicU64>,
) -> Result<Stream> {
    let mut scratch: Vec<f32> = Vec::new();

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if scratch.len() < data.len() {
                    scratch.resize(data.len(), 0.0);
                }
                let scratch = &mut scratch[..data.len()];
                let read = ring.pop_or_silence(scratch);
                if read > 0 && read < data.len() {
                    underruns.fetch_add(1, Ordering::Relaxed);
                }
                for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(sample.clamp(-1.0, 1.0));
                }
            },
            |err| error!("Audio stream error: {err}"),
            None,
        )
        .context("Failed to build stream")?;

    Ok(stream)
}
