//! Event delivery from a player to its subscriber.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError};
use sange_core::Event;
use tracing::{trace, warn};

/// Receives the events of one player.
///
/// Nothing the player does depends on delivery succeeding.
pub trait EventSink: Send + Sync {
    /// Deliver `event`, waiting a bounded time at most.
    fn emit(&self, event: Event);

    /// Try to deliver `event` within `timeout`, handing it back if the
    /// subscriber is not keeping up. The producer uses this for packets so it
    /// can notice control commands while blocked.
    fn offer(&self, event: Event, timeout: Duration) -> Result<(), Event> {
        let _ = timeout;
        self.emit(event);
        Ok(())
    }

    /// Forget packets queued but not yet consumed (after a seek or stop).
    /// Returns how many were forgotten.
    fn discard_packets(&self) -> usize {
        0
    }
}

impl<F> EventSink for F
where
    F: Fn(Event) + Send + Sync,
{
    fn emit(&self, event: Event) {
        self(event);
    }
}

/// Bounded queue sink; the subscriber reads from the paired [`Events`].
///
/// A full queue makes [`EventSink::offer`] time out, which is how the
/// producer experiences backpressure.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<Event>,
    /// Kept to purge stale packets.
    rx: Receiver<Event>,
    emit_timeout: Duration,
}

/// Subscriber side of a [`ChannelSink`].
#[derive(Debug, Clone)]
pub struct Events {
    rx: Receiver<Event>,
}

/// Create a sink with room for `depth` queued events.
///
/// `emit_timeout` bounds how long non-packet events wait for room.
pub fn channel(depth: usize, emit_timeout: Duration) -> (ChannelSink, Events) {
    let (tx, rx) = bounded(depth.max(1));
    (
        ChannelSink {
            tx,
            rx: rx.clone(),
            emit_timeout,
        },
        Events { rx },
    )
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        match self.tx.send_timeout(event, self.emit_timeout) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(event)) => {
                warn!("Event queue full, dropping {} event", event.name());
            }
            Err(SendTimeoutError::Disconnected(event)) => {
                trace!("No subscriber for {} event", event.name());
            }
        }
    }

    fn offer(&self, event: Event, timeout: Duration) -> Result<(), Event> {
        match self.tx.send_timeout(event, timeout) {
            Ok(()) | Err(SendTimeoutError::Disconnected(_)) => Ok(()),
            Err(SendTimeoutError::Timeout(event)) => Err(event),
        }
    }

    fn discard_packets(&self) -> usize {
        let mut kept = Vec::new();
        let mut discarded = 0usize;
        while let Ok(event) = self.rx.try_recv() {
            if event.is_packet() {
                discarded += 1;
            } else {
                kept.push(event);
            }
        }
        for event in kept {
            if self.tx.try_send(event).is_err() {
                warn!("Event queue refilled while purging packets");
                break;
            }
        }
        if discarded > 0 {
            trace!("Discarded {discarded} queued packets");
        }
        discarded
    }
}

impl Events {
    /// Block until the next event. `None` once the player is gone and the
    /// queue is drained.
    pub fn recv(&self) -> Option<Event> {
        self.rx.recv().ok()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take the next event if one is queued.
    pub fn try_recv(&self) -> Option<Event> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
