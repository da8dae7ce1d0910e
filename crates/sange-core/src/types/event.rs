//! Notifications raised by a player session.

use crate::error::ErrorKind;
use crate::types::Frame;

/// Events emitted by a player to its subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A source was opened and probed.
    Ready,
    /// One processed frame, in output format.
    Packet(Frame),
    /// The stream reached its end.
    Finish,
    /// Diagnostic message, e.g. a skipped corrupt packet.
    Debug(String),
    /// An error the player could not absorb.
    Error { kind: ErrorKind, message: String },
}

impl Event {
    /// Short event name, as used by subscribers keyed on strings.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Packet(_) => "packet",
            Self::Finish => "finish",
            Self::Debug(_) => "debug",
            Self::Error { .. } => "error",
        }
    }

    pub const fn is_packet(&self) -> bool {
        matches!(self, Self::Packet(_))
    }
}

impl From<&crate::Error> for Event {
    fn from(err: &crate::Error) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
