//! Helpers shared by the unit tests of this crate.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::f32::consts::TAU;

use sange_core::Error;

use crate::decode::{DecodedPacket, PacketDecoder, PacketError, StreamInfo};

/// Encode a 440 Hz sine tone as a 16-bit PCM WAV file.
pub fn wav_bytes(sample_rate: u32, channels: u16, secs: f64) -> Vec<u8> {
    let frames = (f64::from(sample_rate) * secs).round() as u32;
    let block_align = u32::from(channels) * 2;
    let data_len = frames * block_align;

    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * block_align).to_le_bytes());
    out.extend_from_slice(&(block_align as u16).to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());

    for i in 0..frames {
        let value = (TAU * 440.0 * i as f32 / sample_rate as f32).sin() * 0.5;
        let sample = (value * f32::from(i16::MAX)) as i16;
        for _ in 0..channels {
            out.extend_from_slice(&sample.to_le_bytes());
        }
    }
    out
}

/// One step of a [`ScriptedDecoder`].
#[derive(Debug, Clone)]
pub enum Step {
    Packet(DecodedPacket),
    Corrupt,
    Fatal,
}

/// Decoder that replays a fixed list of packets and failures.
pub struct ScriptedDecoder {
    info: StreamInfo,
    steps: Vec<Step>,
    cursor: usize,
    seekable: bool,
}

impl ScriptedDecoder {
    /// A constant-level tone cut into packets of `packet_frames` frames.
    pub fn tone(sample_rate: u32, channels: u16, secs: f64, packet_frames: usize) -> Self {
        let total = (f64::from(sample_rate) * secs).round() as usize;
        let mut steps = Vec::new();
        let mut start = 0;
        while start < total {
            let frames = packet_frames.min(total - start);
            steps.push(Step::Packet(DecodedPacket {
                timestamp: Some(start as f64 / f64::from(sample_rate)),
                sample_rate,
                channels,
                samples: vec![0.25; frames * channels as usize],
            }));
            start += frames;
        }
        Self {
            info: StreamInfo {
                sample_rate,
                channels,
                duration: Some(total as f64 / f64::from(sample_rate)),
            },
            steps,
            cursor: 0,
            seekable: true,
        }
    }

    /// Insert a failure before the packet at `index`.
    pub fn with_step_at(mut self, index: usize, step: Step) -> Self {
        let at = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Step::Packet(_)))
            .nth(index)
            .map_or(self.steps.len(), |(i, _)| i);
        self.steps.insert(at, step);
        self
    }

    pub fn unseekable(mut self) -> Self {
        self.seekable = false;
        self
    }

    pub fn without_duration(mut self) -> Self {
        self.info.duration = None;
        self
    }
}

impl PacketDecoder for ScriptedDecoder {
    fn info(&self) -> StreamInfo {
        self.info
    }

    fn next_packet(&mut self) -> Result<Option<DecodedPacket>, PacketError> {
        let Some(step) = self.steps.get(self.cursor).cloned() else {
            return Ok(None);
        };
        self.cursor += 1;
        match step {
            Step::Packet(packet) => Ok(Some(packet)),
            Step::Corrupt => Err(PacketError::Corrupt(format!(
                "scripted corruption at step {}",
                self.cursor - 1
            ))),
            Step::Fatal => Err(Error::DecodeError("scripted desync".to_string()).into()),
        }
    }

    fn can_seek(&self) -> bool {
        self.seekable
    }

    fn seek(&mut self, position_secs: f64) -> sange_core::Result<f64> {
        if !self.seekable {
            return Err(Error::Unsupported("scripted stream is live".to_string()));
        }
        let mut target = (0, 0.0);
        for (i, step) in self.steps.iter().enumerate() {
            if let Step::Packet(packet) = step {
                let ts = packet.timestamp.unwrap_or(0.0);
                if ts > position_secs {
                    break;
                }
                target = (i, ts);
            }
        }
        self.cursor = target.0;
        Ok(target.1)
    }
}
