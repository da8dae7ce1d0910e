//! # sange-core
//!
//! Core types, configuration, and error handling for the sange playback engine.

pub mod config;
pub mod error;
pub mod types;

pub use config::{DecodeConfig, DspConfig, HttpConfig, Pacing, PlayerConfig};
pub use error::{Error, ErrorKind, Result};
pub use types::*;
