//! Core domain types for sange.

pub mod event;
pub mod format;
pub mod frame;
pub mod state;

pub use event::Event;
pub use format::{EqualizerBand, OutputFormat, Tremolo, TremoloWaveform};
pub use frame::Frame;
pub use state::PlaybackState;
