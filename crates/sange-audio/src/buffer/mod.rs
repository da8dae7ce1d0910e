//! Lock-free sample buffering for device output.

pub mod ring;

pub use ring::{shared_sample_ring, SampleRing, SharedSampleRing};
