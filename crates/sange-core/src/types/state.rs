//! Playback state machine states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of a player session.
///
/// `Idle -> Ready -> Playing <-> Paused -> Stopped`; `Error` is reachable from
/// any live state and `Destroyed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    /// Constructed, no source set.
    #[default]
    Idle,
    /// Source opened and probed, not yet started.
    Ready,
    Playing,
    Paused,
    /// Stopped by the caller or by reaching the end of the stream.
    Stopped,
    /// An unrecoverable error occurred; only `destroy()` is accepted.
    Error,
    Destroyed,
}

impl PlaybackState {
    /// Whether frames are being pulled.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Playing)
    }

    /// Whether a source is loaded and usable.
    pub const fn has_source(self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Playing | Self::Paused | Self::Stopped
        )
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Destroyed)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Ready => "Ready",
            Self::Playing => "Playing",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
            Self::Destroyed => "Destroyed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playback_state_default() {
        assert_eq!(PlaybackState::default(), PlaybackState::Idle);
    }

    #[test]
    fn test_state_predicates() {
        assert!(PlaybackState::Paused.has_source());
        assert!(!PlaybackState::Idle.has_source());
        assert!(PlaybackState::Error.is_terminal());
        assert!(!PlaybackState::Stopped.is_terminal());
        assert_eq!(PlaybackState::Playing.to_string(), "Playing");
    }
}
