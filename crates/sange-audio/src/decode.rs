//! Demuxing and decoding of compressed audio into PCM packets.
//!
//! [`PacketDecoder`] is the seam between the engine and whatever does the
//! actual codec work; [`SymphoniaDecoder`] is the implementation used for
//! real sources.

use sange_core::{Error, Result};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
    units::{Time, TimeBase},
};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::source::Source;

/// Format of the decoded stream as declared by the container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
    /// Declared duration in seconds, if the container knows it.
    pub duration: Option<f64>,
}

/// One packet worth of decoded, interleaved PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    /// Presentation time in seconds, if the container provides one.
    pub timestamp: Option<f64>,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

/// Failure to produce the next packet.
#[derive(Error, Debug)]
pub enum PacketError {
    /// This packet could not be decoded; the next one may be fine.
    #[error("corrupt packet: {0}")]
    Corrupt(String),
    /// The stream cannot be decoded any further.
    #[error(transparent)]
    Fatal(#[from] Error),
}

/// The decode capability consumed by the pipeline.
pub trait PacketDecoder: Send {
    fn info(&self) -> StreamInfo;

    /// Decode the next packet. `Ok(None)` marks the end of the stream.
    fn next_packet(&mut self) -> std::result::Result<Option<DecodedPacket>, PacketError>;

    fn can_seek(&self) -> bool;

    /// Reposition to the nearest packet at or before `position_secs`.
    /// Returns the position actually reached.
    fn seek(&mut self, position_secs: f64) -> Result<f64>;
}

/// Decoder backed by symphonia's probe, demuxers, and codecs.
pub struct SymphoniaDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    info: StreamInfo,
    seekable: bool,
}

impl SymphoniaDecoder {
    /// Probe `source` and open a decoder for its first audio track.
    pub fn open(source: Source) -> Result<Self> {
        let mut hint = Hint::new();
        if let Some(ext) = source.extension() {
            hint.with_extension(ext);
        } else if let Some(ext) = source.mime_type().and_then(extension_for_mime) {
            hint.with_extension(ext);
        }

        let seekable = source.seekable();
        let locator = source.locator().to_string();
        let mss = MediaSourceStream::new(Box::new(source), MediaSourceStreamOptions::default());

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| match e {
                SymphoniaError::Unsupported(what) => {
                    Error::Unsupported(format!("{locator}: unsupported format ({what})"))
                }
                other => Error::DecodeError(format!("{locator}: failed to probe format: {other}")),
            })?;

        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::DecodeError(format!("{locator}: no audio tracks found")))?;

        let track_id = track.id;
        let params = &track.codec_params;
        let sample_rate = params.sample_rate.unwrap_or(48000);
        let channels = params.channels.map_or(2, |c| c.count() as u16);
        let time_base = params.time_base;
        let duration = match (time_base, params.n_frames) {
            (Some(tb), Some(n_frames)) => Some(seconds(tb.calc_time(n_frames))),
            _ => None,
        };

        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| Error::Unsupported(format!("{locator}: no decoder for codec: {e}")))?;

        debug!(
            "Audio track: id={track_id}, sample_rate={sample_rate}, channels={channels}, duration={duration:?}"
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            time_base,
            info: StreamInfo {
                sample_rate,
                channels,
                duration,
            },
            seekable,
        })
    }

    fn rebuild_decoder(&mut self) -> Result<()> {
        let track = self
            .format
            .tracks()
            .iter()
            .find(|t| t.id == self.track_id)
            .ok_or_else(|| Error::DecodeError("audio track disappeared".to_string()))?;
        self.decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::DecodeError(format!("Failed to recreate decoder: {e}")))?;
        Ok(())
    }
}

impl PacketDecoder for SymphoniaDecoder {
    fn info(&self) -> StreamInfo {
        self.info
    }

    fn next_packet(&mut self) -> std::result::Result<Option<DecodedPacket>, PacketError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    debug!("Track parameters changed, recreating decoder");
                    self.rebuild_decoder()?;
                    continue;
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    return Err(PacketError::Corrupt(format!("malformed container data: {e}")));
                }
                Err(e) => {
                    return Err(Error::DecodeError(format!("Failed to read packet: {e}")).into());
                }
            };

            // Skip packets for other tracks
            if packet.track_id() != self.track_id {
                continue;
            }

            let timestamp = self.time_base.map(|tb| seconds(tb.calc_time(packet.ts())));

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let frames = decoded.frames();
                    if frames == 0 {
                        trace!("Empty packet at ts={}", packet.ts());
                        continue;
                    }

                    let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buf.copy_interleaved_ref(decoded);

                    return Ok(Some(DecodedPacket {
                        timestamp,
                        sample_rate: spec.rate,
                        channels: spec.channels.count() as u16,
                        samples: buf.samples().to_vec(),
                    }));
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    return Err(PacketError::Corrupt(format!(
                        "undecodable packet at ts={}: {e}",
                        packet.ts()
                    )));
                }
                Err(SymphoniaError::IoError(e)) => {
                    return Err(PacketError::Corrupt(format!(
                        "truncated packet at ts={}: {e}",
                        packet.ts()
                    )));
                }
                Err(e) => {
                    return Err(Error::DecodeError(format!("Decode failed: {e}")).into());
                }
            }
        }
    }

    fn can_seek(&self) -> bool {
        self.seekable
    }

    fn seek(&mut self, position_secs: f64) -> Result<f64> {
        if !self.seekable {
            return Err(Error::Unsupported("source is not seekable".to_string()));
        }

        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(position_secs),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::SeekError(format!("{e}")))?;

        // Reset decoder state
        self.decoder.reset();

        let reached = self
            .time_base
            .map_or(position_secs, |tb| seconds(tb.calc_time(seeked.required_ts)));
        if (reached - position_secs).abs() > 0.5 {
            warn!("Seek to {position_secs:.3}s landed at {reached:.3}s");
        }
        Ok(reached)
    }
}

fn seconds(time: Time) -> f64 {
    time.seconds as f64 + time.frac
}

/// Demuxer hint for a MIME type.
fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let mime = mime.to_ascii_lowercase();
    if mime.contains("webm") || mime.contains("opus") {
        Some("webm")
    } else if mime.contains("mp4") || mime.contains("m4a") || mime.contains("aac") {
        Some("m4a")
    } else if mime.contains("mp3") || mime.contains("mpeg") {
        Some("mp3")
    } else if mime.contains("ogg") || mime.contains("vorbis") {
        Some("ogg")
    } else if mime.contains("flac") {
        Some("flac")
    } else if mime.contains("wav") {
        Some("wav")
    } else {
        None
    }
}
