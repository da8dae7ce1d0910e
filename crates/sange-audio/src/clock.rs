//! Media-time clock derived from delivered frames.

use std::time::Instant;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
struct Anchor {
    /// Media time at `since`.
    media: f64,
    /// Media time the anchor may advance by before it stops.
    span: f64,
    /// Media seconds per wall-clock second.
    speed: f64,
    /// Wall-clock start; `None` while frozen.
    since: Option<Instant>,
}

/// Playback position in media seconds.
///
/// Anchored at the timestamp of the last delivered frame and interpolated
/// with elapsed wall-clock time, capped at the end of that frame. Reading it
/// never waits on the producer.
#[derive(Debug)]
pub struct PlaybackClock {
    anchor: Mutex<Anchor>,
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            anchor: Mutex::new(Anchor {
                media: 0.0,
                span: 0.0,
                speed: 1.0,
                since: None,
            }),
        }
    }

    /// Current media time.
    pub fn time(&self) -> f64 {
        let anchor = *self.anchor.lock();
        match anchor.since {
            Some(since) => {
                let advanced = since.elapsed().as_secs_f64() * anchor.speed;
                anchor.media + advanced.min(anchor.span)
            }
            None => anchor.media,
        }
    }

    /// A frame starting at `timestamp` and covering `span` media seconds was
    /// handed to the subscriber.
    pub fn on_frame(&self, timestamp: f64, span: f64, speed: f64, running: bool) {
        let mut anchor = self.anchor.lock();
        *anchor = Anchor {
            media: timestamp,
            span: span.max(0.0),
            speed,
            since: running.then(Instant::now),
        };
    }

    /// Jump to `position` and hold there until the next frame.
    pub fn set(&self, position: f64) {
        let mut anchor = self.anchor.lock();
        *anchor = Anchor {
            media: position,
            span: 0.0,
            speed: anchor.speed,
            since: None,
        };
    }

    /// Stop advancing, keeping the current position.
    pub fn freeze(&self) {
        let mut anchor = self.anchor.lock();
        if let Some(since) = anchor.since.take() {
            let advanced = (since.elapsed().as_secs_f64() * anchor.speed).min(anchor.span);
            anchor.media += advanced;
            anchor.span -= advanced;
        }
    }

    /// Resume advancing from the frozen position.
    pub fn resume(&self) {
        let mut anchor = self.anchor.lock();
        if anchor.since.is_none() {
            anchor.since = Some(Instant::now());
        }
    }
}
