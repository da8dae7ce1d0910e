//! Decode pipeline: turns decoder packets into sequenced, monotonically
//! timestamped frames and keeps the frame accounting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sange_core::{Error, Frame, Result};
use tracing::{trace, warn};

use crate::decode::{PacketDecoder, PacketError};

/// Frame accounting shared between the producer and the control surface.
///
/// `total` is always bumped before `dropped`, and [`FrameCounters::snapshot`]
/// reads in the opposite order, so a snapshot never shows more dropped
/// frames than total ones.
#[derive(Debug, Default)]
pub struct FrameCounters {
    total: AtomicU64,
    dropped: AtomicU64,
    packets: AtomicU64,
}

/// Consistent view of [`FrameCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub total: u64,
    pub dropped: u64,
    pub packets: u64,
}

impl FrameCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// A frame was produced.
    pub fn record_frame(&self) {
        self.total.fetch_add(1, Ordering::AcqRel);
    }

    /// A frame was lost before it could be produced (e.g. corrupt packet).
    pub fn record_lost(&self) {
        self.total.fetch_add(1, Ordering::AcqRel);
        self.dropped.fetch_add(1, Ordering::AcqRel);
    }

    /// A frame already counted by [`Self::record_frame`] was discarded.
    pub fn record_discarded(&self) {
        self.dropped.fetch_add(1, Ordering::AcqRel);
    }

    /// A `packet` event was delivered.
    pub fn record_packet(&self) {
        self.packets.fetch_add(1, Ordering::AcqRel);
    }

    /// `count` delivered packets were purged from the queue unread.
    pub fn retract_packets(&self, count: usize) {
        if count == 0 {
            return;
        }
        let _ = self
            .packets
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |packets| {
                Some(packets.saturating_sub(count as u64))
            });
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let dropped = self.dropped();
        let packets = self.packets();
        let total = self.total();
        CounterSnapshot {
            total,
            dropped,
            packets,
        }
    }
}

/// Pulls packets from a [`PacketDecoder`] and yields [`Frame`]s.
pub struct DecodePipeline {
    decoder: Box<dyn PacketDecoder>,
    counters: Arc<FrameCounters>,
    max_consecutive_errors: u32,
    consecutive_errors: u32,
    next_sequence: u64,
    last_timestamp: Option<f64>,
    last_end: f64,
    notices: Vec<String>,
}

impl DecodePipeline {
    pub fn new(
        decoder: Box<dyn PacketDecoder>,
        counters: Arc<FrameCounters>,
        max_consecutive_errors: u32,
    ) -> Self {
        Self {
            decoder,
            counters,
            max_consecutive_errors,
            consecutive_errors: 0,
            next_sequence: 0,
            last_timestamp: None,
            last_end: 0.0,
            notices: Vec::new(),
        }
    }

    /// Start numbering frames at `sequence`, e.g. to keep numbering
    /// increasing across sources.
    pub const fn starting_at(mut self, sequence: u64) -> Self {
        self.next_sequence = sequence;
        self
    }

    /// Declared duration of the stream in seconds.
    pub fn duration(&self) -> Option<f64> {
        self.decoder.info().duration
    }

    pub fn can_seek(&self) -> bool {
        self.decoder.can_seek()
    }

    /// Sequence number the next frame will carry.
    pub const fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Produce the next frame. `Ok(None)` is the end of the stream.
    ///
    /// Corrupt packets are skipped and counted as dropped; a description of
    /// each lands in [`Self::take_notices`]. A run of more than
    /// `max_consecutive_errors` of them fails with `DecodeError`.
    pub fn feed(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.decoder.next_packet() {
                Ok(Some(packet)) => {
                    self.consecutive_errors = 0;
                    if packet.channels == 0 || packet.sample_rate == 0 {
                        return Err(Error::DecodeError(format!(
                            "decoder produced an invalid format ({} ch, {} Hz)",
                            packet.channels, packet.sample_rate
                        )));
                    }

                    let timestamp = match (packet.timestamp, self.last_timestamp) {
                        (Some(ts), Some(prev)) if ts > prev => ts,
                        (Some(ts), None) => ts,
                        _ => self.last_end,
                    };

                    let frame = Frame::new(
                        self.next_sequence,
                        timestamp,
                        packet.sample_rate,
                        packet.channels,
                        packet.samples,
                    );
                    self.next_sequence += 1;
                    self.last_timestamp = Some(timestamp);
                    self.last_end = frame.end_timestamp();
                    self.counters.record_frame();

                    trace!(
                        "Frame {} at {:.3}s ({} frames)",
                        frame.sequence,
                        frame.timestamp,
                        frame.frames()
                    );
                    return Ok(Some(frame));
                }
                Ok(None) => return Ok(None),
                Err(PacketError::Corrupt(reason)) => {
                    self.counters.record_lost();
                    self.consecutive_errors += 1;
                    warn!(
                        "Skipping corrupt packet ({}/{}): {reason}",
                        self.consecutive_errors, self.max_consecutive_errors
                    );
                    self.notices.push(format!("skipped corrupt packet: {reason}"));
                    if self.consecutive_errors > self.max_consecutive_errors {
                        return Err(Error::DecodeError(format!(
                            "{} consecutive undecodable packets, last: {reason}",
                            self.consecutive_errors
                        )));
                    }
                }
                Err(PacketError::Fatal(err)) => return Err(err),
            }
        }
    }

    /// Reposition the decoder. Returns the media time actually reached.
    pub fn seek(&mut self, position_secs: f64) -> Result<f64> {
        if !self.decoder.can_seek() {
            return Err(Error::SeekError("source is not seekable".to_string()));
        }
        let reached = self.decoder.seek(position_secs).map_err(|e| match e {
            Error::SeekError(_) => e,
            other => Error::SeekError(other.to_string()),
        })?;
        self.consecutive_errors = 0;
        self.last_timestamp = None;
        self.last_end = reached;
        Ok(reached)
    }

    /// Account for a frame numbered `sequence` that was produced downstream
    /// of the decoder (a flushed DSP tail): it counts towards the total and
    /// later frames are numbered after it.
    pub fn adopt_tail(&mut self, sequence: u64) {
        self.next_sequence = self.next_sequence.max(sequence + 1);
        self.counters.record_frame();
    }

    /// Drain the diagnostics collected since the last call.
    pub fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }
}
