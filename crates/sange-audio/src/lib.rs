//! # sange-audio
//!
//! Decode, DSP, and transport engine for sange.
//!
//! Features:
//! - Local, in-memory, and HTTP sources with range-request seeking
//! - Symphonia-based decoding with corrupt-packet recovery
//! - DSP chain: resample, volume, equalizer, tremolo, rate, tempo
//! - A `Player` state machine delivering PCM packets as events
//! - Lock-free ring buffer for handing packets to an audio device

pub mod buffer;
pub mod clock;
pub mod decode;
pub mod dsp;
pub mod events;
pub mod params;
pub mod pipeline;
pub mod player;
pub mod resample;
pub mod source;

#[cfg(test)]
mod test_util;

pub use decode::{PacketDecoder, SymphoniaDecoder};
pub use dsp::DspChain;
pub use events::{channel, ChannelSink, EventSink, Events};
pub use params::DspParams;
pub use pipeline::CounterSnapshot;
pub use player::Player;
pub use source::Source;
