//! Transport controller: the [`Player`] control surface and its producer
//! thread.
//!
//! Control calls run on the caller's thread. Anything that touches the decode
//! pipeline or the DSP chain (start, seek, stop, shutdown) is sent to the
//! producer as a command and waited on for a bounded time. Parameter setters
//! publish a new [`DspParams`] snapshot and never wait on the producer.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use sange_core::config::{Pacing, PlayerConfig};
use sange_core::{
    EqualizerBand, Error, Event, Frame, OutputFormat, PlaybackState, Result, Tremolo,
};
use tracing::{debug, error, info, trace, warn};

use crate::clock::PlaybackClock;
use crate::decode::{PacketDecoder, SymphoniaDecoder};
use crate::dsp::DspChain;
use crate::events::{channel, EventSink, Events};
use crate::params::{DspParams, SharedParams, MAX_SPEED_FACTOR, MIN_SPEED_FACTOR};
use crate::pipeline::{CounterSnapshot, DecodePipeline, FrameCounters};
use crate::source::Source;

/// How long the producer waits for a command while not playing.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// How long one delivery attempt may block on a full event queue.
const OFFER_SLICE: Duration = Duration::from_millis(20);

/// State shared between the control surface and the producer.
struct Shared {
    state: RwLock<PlaybackState>,
    params: SharedParams,
    counters: Arc<FrameCounters>,
    clock: PlaybackClock,
    duration: RwLock<Option<f64>>,
    /// Message of the error that moved the session to `Error`.
    failure: Mutex<Option<String>>,
}

impl Shared {
    /// Move from `from` to `to`; false if the state was something else.
    fn transition(&self, from: PlaybackState, to: PlaybackState) -> bool {
        let mut state = self.state.write();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    fn failure_message(&self) -> String {
        self.failure
            .lock()
            .clone()
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

/// Commands handled by the producer thread.
enum Command {
    Start {
        rewind: bool,
        ack: Sender<Result<()>>,
    },
    Seek {
        position: f64,
        ack: Sender<Result<f64>>,
    },
    Stop {
        ack: Sender<Result<()>>,
    },
    /// Re-check the state now instead of after the next poll.
    Wake,
    Shutdown {
        ack: Sender<()>,
    },
}

struct Worker {
    commands: Sender<Command>,
    thread: JoinHandle<()>,
}

/// Control-side bookkeeping, serialized by the `control` lock.
#[derive(Default)]
struct Control {
    worker: Option<Worker>,
    seekable: bool,
    /// A seek was issued while stopped, so the next start does not rewind.
    seeked_while_stopped: bool,
}

/// One playback session.
///
/// Events are delivered to the [`EventSink`] the player was built with. All
/// methods take `&self`, so a player can be shared across threads behind an
/// `Arc`. Dropping the player destroys it.
pub struct Player {
    config: PlayerConfig,
    shared: Arc<Shared>,
    sink: Arc<dyn EventSink>,
    control: Mutex<Control>,
}

impl Player {
    /// Create a player that delivers its events through a bounded queue.
    pub fn new(config: PlayerConfig) -> Result<(Self, Events)> {
        config.validate()?;
        let (sink, events) = channel(config.queue_depth, config.control_timeout() / 4);
        Ok((Self::build(config, Arc::new(sink)), events))
    }

    /// Create a player that hands its events to `sink`.
    pub fn with_sink(config: PlayerConfig, sink: impl EventSink + 'static) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, Arc::new(sink)))
    }

    fn build(config: PlayerConfig, sink: Arc<dyn EventSink>) -> Self {
        let shared = Arc::new(Shared {
            state: RwLock::new(PlaybackState::Idle),
            params: SharedParams::new(DspParams::new(config.output)),
            counters: Arc::new(FrameCounters::new()),
            clock: PlaybackClock::new(),
            duration: RwLock::new(None),
            failure: Mutex::new(None),
        });
        debug!("Player created ({:?} pacing)", config.pacing);
        Self {
            config,
            shared,
            sink,
            control: Mutex::new(Control::default()),
        }
    }

    /// Current state. Never fails, not even after `destroy()`.
    pub fn state(&self) -> PlaybackState {
        *self.shared.state.read()
    }

    // Source loading

    /// Open a local file or an `http(s)` URL and probe it.
    pub fn set_url(&self, locator: &str, is_local_file: bool) -> Result<()> {
        self.load(|| {
            let source = Source::open(locator, is_local_file, &self.config.http)?;
            let decoder: Box<dyn PacketDecoder> = Box::new(SymphoniaDecoder::open(source)?);
            Ok(decoder)
        })
    }

    /// Play an in-memory encoded stream.
    pub fn set_buffer(&self, data: impl Into<Bytes>) -> Result<()> {
        let source = Source::from_bytes(data);
        self.load(|| {
            let decoder: Box<dyn PacketDecoder> = Box::new(SymphoniaDecoder::open(source)?);
            Ok(decoder)
        })
    }

    /// Play from an already opened decoder.
    pub fn load_decoder(&self, decoder: Box<dyn PacketDecoder>) -> Result<()> {
        self.load(|| Ok(decoder))
    }

    fn load(&self, open: impl FnOnce() -> Result<Box<dyn PacketDecoder>>) -> Result<()> {
        let mut control = self.control.lock();
        let state = self.alive()?;
        if !matches!(
            state,
            PlaybackState::Idle | PlaybackState::Ready | PlaybackState::Stopped
        ) {
            return Err(invalid_state("load a source", state));
        }

        let decoder = match open() {
            Ok(decoder) => decoder,
            Err(err) => {
                warn!("Failed to open source: {err}");
                // The sink may call back into the player.
                drop(control);
                self.sink.emit(Event::from(&err));
                return Err(err);
            }
        };

        if let Some(worker) = control.worker.take() {
            self.retire(worker);
        }
        self.shared
            .counters
            .retract_packets(self.sink.discard_packets());

        let info = decoder.info();
        let seekable = decoder.can_seek();
        let pipeline = DecodePipeline::new(
            decoder,
            Arc::clone(&self.shared.counters),
            self.config.decode.max_consecutive_errors,
        )
        .starting_at(self.shared.counters.total());

        let (commands_tx, commands_rx) = unbounded();
        let producer = Producer::new(
            pipeline,
            DspChain::new(&self.config.dsp),
            Arc::clone(&self.shared),
            Arc::clone(&self.sink),
            commands_rx,
            &self.config,
        );
        let thread = match thread::Builder::new()
            .name("sange-producer".to_string())
            .spawn(move || producer.run())
        {
            Ok(thread) => thread,
            Err(e) => {
                // The previous source is already gone.
                *control = Control::default();
                *self.shared.state.write() = PlaybackState::Idle;
                return Err(Error::Internal(format!(
                    "Failed to spawn producer thread: {e}"
                )));
            }
        };

        *control = Control {
            worker: Some(Worker {
                commands: commands_tx,
                thread,
            }),
            seekable,
            seeked_while_stopped: false,
        };
        *self.shared.duration.write() = info.duration;
        self.shared.clock.set(0.0);
        *self.shared.state.write() = PlaybackState::Ready;

        drop(control);

        info!(
            "Source ready: {} ch @ {}Hz, duration {:?}, seekable: {seekable}",
            info.channels, info.sample_rate, info.duration
        );
        self.sink.emit(Event::Ready);
        Ok(())
    }

    // Transport

    /// Begin playback. From `Stopped` playback restarts at the beginning
    /// unless a seek was issued while stopped. Resumes when paused.
    pub fn start(&self) -> Result<()> {
        let mut control = self.control.lock();
        let state = self.alive()?;
        match state {
            PlaybackState::Playing => Ok(()),
            PlaybackState::Paused => self.resume(&control),
            PlaybackState::Ready | PlaybackState::Stopped => {
                let rewind = state == PlaybackState::Stopped && !control.seeked_while_stopped;
                let worker = worker(&control)?;
                self.request(worker, |ack| Command::Start { rewind, ack })?;
                control.seeked_while_stopped = false;
                info!("Playback started (rewind: {rewind})");
                Ok(())
            }
            PlaybackState::Idle | PlaybackState::Error | PlaybackState::Destroyed => {
                Err(invalid_state("start", state))
            }
        }
    }

    /// Pause or resume. Asking for the state the player is already in does
    /// nothing.
    pub fn set_paused(&self, paused: bool) -> Result<()> {
        let control = self.control.lock();
        let state = self.alive()?;
        match (paused, state) {
            (true, PlaybackState::Paused) | (false, PlaybackState::Playing) => Ok(()),
            (true, PlaybackState::Playing) => {
                if !self
                    .shared
                    .transition(PlaybackState::Playing, PlaybackState::Paused)
                {
                    return Err(self.refused("pause"));
                }
                self.shared.clock.freeze();
                debug!("Paused at {:.3}s", self.shared.clock.time());
                Ok(())
            }
            (false, PlaybackState::Paused) => self.resume(&control),
            (false, _) => Ok(()),
            (true, _) => Err(invalid_state("pause", state)),
        }
    }

    fn resume(&self, control: &Control) -> Result<()> {
        if !self
            .shared
            .transition(PlaybackState::Paused, PlaybackState::Playing)
        {
            return Err(self.refused("resume"));
        }
        self.shared.clock.resume();
        if let Some(worker) = &control.worker {
            let _ = worker.commands.send(Command::Wake);
        }
        debug!("Resumed at {:.3}s", self.shared.clock.time());
        Ok(())
    }

    /// Jump to `position` seconds, clamped to the stream's duration.
    pub fn seek(&self, position: f64) -> Result<()> {
        let mut control = self.control.lock();
        let state = self.alive()?;
        if !position.is_finite() || position < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "seek position {position} must be a non-negative number"
            )));
        }
        if !matches!(
            state,
            PlaybackState::Playing | PlaybackState::Paused | PlaybackState::Stopped
        ) {
            return Err(invalid_state("seek", state));
        }
        if !control.seekable {
            return Err(Error::SeekError("source is not seekable".to_string()));
        }

        let target = match *self.shared.duration.read() {
            Some(duration) => position.min(duration),
            None => position,
        };
        let worker = worker(&control)?;
        let reached = self.request(worker, |ack| Command::Seek {
            position: target,
            ack,
        })?;
        if state == PlaybackState::Stopped {
            control.seeked_while_stopped = true;
        }
        debug!("Seeked to {target:.3}s (decoder at {reached:.3}s)");
        Ok(())
    }

    /// Stop playback, dropping queued packets. The source stays open.
    pub fn stop(&self) -> Result<()> {
        let mut control = self.control.lock();
        let state = self.alive()?;
        match state {
            PlaybackState::Idle | PlaybackState::Stopped => Ok(()),
            PlaybackState::Ready | PlaybackState::Playing | PlaybackState::Paused => {
                let worker = worker(&control)?;
                self.request(worker, |ack| Command::Stop { ack })?;
                control.seeked_while_stopped = false;
                info!("Playback stopped");
                Ok(())
            }
            PlaybackState::Error | PlaybackState::Destroyed => Err(self.refused("stop")),
        }
    }

    /// Release everything. Calling it again does nothing.
    pub fn destroy(&self) -> Result<()> {
        let mut control = self.control.lock();
        {
            let mut state = self.shared.state.write();
            if *state == PlaybackState::Destroyed {
                return Ok(());
            }
            *state = PlaybackState::Destroyed;
        }
        if let Some(worker) = control.worker.take() {
            self.retire(worker);
        }
        self.shared
            .counters
            .retract_packets(self.sink.discard_packets());
        self.shared.clock.freeze();
        info!("Player destroyed");
        Ok(())
    }

    // DSP parameters

    /// Linear gain, `>= 0`.
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        self.alive()?;
        if !volume.is_finite() || volume < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "volume {volume} must be a non-negative number"
            )));
        }
        self.shared.params.update(|p| p.volume = volume);
        debug!("Volume set to {volume}");
        Ok(())
    }

    /// Varispeed factor: pitch follows speed.
    pub fn set_rate(&self, rate: f64) -> Result<()> {
        self.alive()?;
        let rate = speed_factor("rate", rate)?;
        self.shared.params.update(|p| p.rate = rate);
        debug!("Rate set to {rate}");
        Ok(())
    }

    /// Time-stretch factor: pitch is kept.
    pub fn set_tempo(&self, tempo: f64) -> Result<()> {
        self.alive()?;
        let tempo = speed_factor("tempo", tempo)?;
        self.shared.params.update(|p| p.tempo = tempo);
        debug!("Tempo set to {tempo}");
        Ok(())
    }

    pub fn set_tremolo(&self, depth: f32, rate_hz: f32) -> Result<()> {
        self.alive()?;
        let tremolo = Tremolo::new(depth, rate_hz)?;
        self.shared.params.update(|p| p.tremolo = tremolo);
        debug!("Tremolo set to depth {depth} @ {rate_hz}Hz");
        Ok(())
    }

    /// Replace the whole band list. An empty list disables the equalizer.
    pub fn set_equalizer(&self, bands: &[EqualizerBand]) -> Result<()> {
        self.alive()?;
        for band in bands {
            band.validate()?;
        }
        let count = bands.len();
        let bands: Arc<[EqualizerBand]> = Arc::from(bands);
        self.shared.params.update(|p| p.equalizer = bands);
        debug!("Equalizer set with {count} bands");
        Ok(())
    }

    /// Change the format of delivered packets from the next frame on.
    pub fn set_output(&self, channels: u16, sample_rate: u32, bitrate: u32) -> Result<()> {
        self.alive()?;
        let output = OutputFormat::new(channels, sample_rate, bitrate)?;
        self.shared.params.update(|p| p.output = output);
        debug!("Output set to {channels} ch @ {sample_rate}Hz, {bitrate} bps");
        Ok(())
    }

    pub fn set_bitrate(&self, bitrate: u32) -> Result<()> {
        self.alive()?;
        if bitrate == 0 {
            return Err(Error::InvalidFormat("bitrate must be positive".to_string()));
        }
        self.shared.params.update(|p| p.output.bitrate = bitrate);
        debug!("Bitrate set to {bitrate} bps");
        Ok(())
    }

    // Queries

    /// Playback position in media seconds.
    pub fn time(&self) -> Result<f64> {
        self.alive()?;
        Ok(self.shared.clock.time())
    }

    /// Declared duration of the current source; `None` for live streams.
    pub fn duration(&self) -> Result<Option<f64>> {
        self.alive()?;
        Ok(*self.shared.duration.read())
    }

    pub fn frames_dropped(&self) -> Result<u64> {
        self.alive()?;
        Ok(self.shared.counters.dropped())
    }

    pub fn total_frames(&self) -> Result<u64> {
        self.alive()?;
        Ok(self.shared.counters.total())
    }

    /// Number of `packet` events delivered.
    pub fn total_packets(&self) -> Result<u64> {
        self.alive()?;
        Ok(self.shared.counters.packets())
    }

    /// All counters, read so that `dropped <= total` holds.
    pub fn counters(&self) -> Result<CounterSnapshot> {
        self.alive()?;
        Ok(self.shared.counters.snapshot())
    }

    pub fn output_format(&self) -> Result<OutputFormat> {
        self.alive()?;
        Ok(self.shared.params.snapshot().output)
    }

    /// The DSP parameters in force.
    pub fn params(&self) -> Result<Arc<DspParams>> {
        self.alive()?;
        Ok(self.shared.params.snapshot())
    }

    // Helpers

    /// The current state, or the error every call fails with once the
    /// session is over.
    fn alive(&self) -> Result<PlaybackState> {
        match self.state() {
            PlaybackState::Destroyed => Err(Error::Destroyed),
            PlaybackState::Error => Err(Error::Failed(self.shared.failure_message())),
            state => Ok(state),
        }
    }

    /// Error for an operation whose state changed underneath it.
    fn refused(&self, operation: &'static str) -> Error {
        match self.alive() {
            Ok(state) => invalid_state(operation, state),
            Err(err) => err,
        }
    }

    /// Send a command and wait for the producer to acknowledge it.
    fn request<T>(
        &self,
        worker: &Worker,
        command: impl FnOnce(Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (ack_tx, ack_rx) = bounded(1);
        worker
            .commands
            .send(command(ack_tx))
            .map_err(|_| self.producer_gone())?;
        match ack_rx.recv_timeout(self.config.control_timeout()) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(format!(
                "producer did not respond within {:?}",
                self.config.control_timeout()
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(self.producer_gone()),
        }
    }

    fn producer_gone(&self) -> Error {
        match self.alive() {
            Ok(_) => Error::Internal("producer thread exited".to_string()),
            Err(err) => err,
        }
    }

    /// Shut a producer down and join it, detaching it if it does not answer
    /// in time.
    fn retire(&self, worker: Worker) {
        let timeout = self.config.control_timeout();
        let (ack_tx, ack_rx) = bounded(1);
        let stopped = worker
            .commands
            .send(Command::Shutdown { ack: ack_tx })
            .is_err()
            || !matches!(ack_rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout));

        if stopped {
            if worker.thread.join().is_err() {
                warn!("Producer thread panicked");
            }
        } else {
            warn!("Producer did not stop within {timeout:?}, detaching it");
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        let _ = self.destroy();
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("state", &self.state())
            .field("counters", &self.shared.counters.snapshot())
            .finish_non_exhaustive()
    }
}

fn invalid_state(operation: &'static str, state: PlaybackState) -> Error {
    Error::InvalidState {
        operation,
        state: state.to_string(),
    }
}

fn worker(control: &Control) -> Result<&Worker> {
    control
        .worker
        .as_ref()
        .ok_or_else(|| Error::Internal("no producer for the loaded source".to_string()))
}

/// Validate a rate or tempo factor and clamp it to what the chain supports.
fn speed_factor(name: &str, value: f64) -> Result<f64> {
    if !value.is_finite() || value <= 0.0 {
        return Err(Error::InvalidArgument(format!(
            "{name} {value} must be a positive number"
        )));
    }
    let clamped = value.clamp(MIN_SPEED_FACTOR, MAX_SPEED_FACTOR);
    if (clamped - value).abs() > f64::EPSILON {
        warn!("Clamping {name} {value} to {clamped}");
    }
    Ok(clamped)
}

/// A processed frame waiting for delivery.
struct Pending {
    frame: Frame,
    /// Media seconds per output second the frame was processed at.
    speed: f64,
}

/// The producer loop: decode, process, deliver.
struct Producer {
    pipeline: DecodePipeline,
    chain: DspChain,
    shared: Arc<Shared>,
    sink: Arc<dyn EventSink>,
    commands: Receiver<Command>,
    pacing: Pacing,
    max_lateness: Duration,
    pending: Option<Pending>,
    /// Wall-clock due time of the pending frame under realtime pacing.
    next_due: Option<Instant>,
    was_playing: bool,
    end_of_stream: bool,
}

impl Producer {
    fn new(
        pipeline: DecodePipeline,
        chain: DspChain,
        shared: Arc<Shared>,
        sink: Arc<dyn EventSink>,
        commands: Receiver<Command>,
        config: &PlayerConfig,
    ) -> Self {
        Self {
            pipeline,
            chain,
            shared,
            sink,
            commands,
            pacing: config.pacing,
            max_lateness: config.max_lateness(),
            pending: None,
            next_due: None,
            was_playing: false,
            end_of_stream: false,
        }
    }

    fn run(mut self) {
        debug!("Producer started");

        loop {
            let state = *self.shared.state.read();
            if state.is_terminal() {
                break;
            }

            let playing = state.is_active();
            if playing && !self.was_playing {
                // Pauses do not count as lateness.
                self.next_due = None;
            }
            self.was_playing = playing;

            let wait = if playing {
                self.time_until_due()
            } else {
                Some(IDLE_POLL)
            };
            let command = match wait {
                None => match self.commands.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                },
                Some(wait) => match self.commands.recv_timeout(wait) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
            };

            if let Some(command) = command {
                if !self.handle(command) {
                    break;
                }
                continue;
            }

            if playing && !self.step() {
                break;
            }
        }

        debug!("Producer stopped");
    }

    /// Returns false when the producer should exit.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Start { rewind, ack } => {
                let result = if !rewind {
                    Ok(())
                } else if self.pipeline.can_seek() {
                    self.reposition(0.0).map(|_| ())
                } else if self.end_of_stream {
                    Err(Error::Unsupported(
                        "cannot restart a finished stream that is not seekable".to_string(),
                    ))
                } else {
                    Ok(())
                };
                if result.is_ok() {
                    let mut state = self.shared.state.write();
                    if matches!(*state, PlaybackState::Ready | PlaybackState::Stopped) {
                        *state = PlaybackState::Playing;
                    }
                }
                let _ = ack.send(result);
            }
            Command::Seek { position, ack } => {
                let _ = ack.send(self.reposition(position));
            }
            Command::Stop { ack } => {
                self.reset();
                {
                    let mut state = self.shared.state.write();
                    if !state.is_terminal() {
                        *state = PlaybackState::Stopped;
                    }
                }
                self.shared.clock.set(0.0);
                let _ = ack.send(Ok(()));
            }
            Command::Wake => {}
            Command::Shutdown { ack } => {
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    /// Seek the pipeline and clear everything buffered for the old position.
    fn reposition(&mut self, position: f64) -> Result<f64> {
        let reached = self.pipeline.seek(position)?;
        self.reset();
        self.shared.clock.set(position);
        Ok(reached)
    }

    fn reset(&mut self) {
        self.chain.reset();
        self.pending = None;
        self.next_due = None;
        self.end_of_stream = false;
        self.shared
            .counters
            .retract_packets(self.sink.discard_packets());
    }

    /// How long to wait before the pending frame is due, if at all.
    fn time_until_due(&self) -> Option<Duration> {
        if self.pacing != Pacing::Realtime || self.pending.is_none() {
            return None;
        }
        let due = self.next_due?;
        due.checked_duration_since(Instant::now())
            .map(|wait| wait.min(IDLE_POLL))
    }

    /// Produce or deliver one frame. Returns false when the producer should
    /// exit.
    fn step(&mut self) -> bool {
        if self.pending.is_none() {
            if self.end_of_stream {
                self.finish();
                return true;
            }
            if let Err(err) = self.produce() {
                self.fail(&err);
                return false;
            }
        }
        self.deliver();
        true
    }

    fn produce(&mut self) -> Result<()> {
        let params = self.shared.params.snapshot();

        // Audio buffered in the old layout goes out before the new one.
        if let Some(tail) = self.chain.drain_for(&params)? {
            self.pipeline.adopt_tail(tail.sequence);
            self.pending = Some(Pending {
                frame: tail,
                speed: params.speed(),
            });
            return Ok(());
        }

        let fed = self.pipeline.feed();
        for notice in self.pipeline.take_notices() {
            self.sink.emit(Event::Debug(notice));
        }

        let processed = match fed? {
            Some(frame) => self.chain.process(frame, &params)?,
            None => {
                debug!("Decoder reached end of stream");
                self.end_of_stream = true;
                let tail = self.chain.flush(&params)?;
                if let Some(tail) = &tail {
                    self.pipeline.adopt_tail(tail.sequence);
                }
                tail
            }
        };

        if let Some(frame) = processed {
            self.pending = Some(Pending {
                frame,
                speed: params.speed(),
            });
        }
        Ok(())
    }

    fn deliver(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        if self.pacing == Pacing::Realtime {
            if let Some(due) = self.next_due {
                let now = Instant::now();
                if now < due {
                    self.pending = Some(pending);
                    return;
                }
                if now > due + self.max_lateness {
                    warn!(
                        "Dropping frame {}, {:?} late",
                        pending.frame.sequence,
                        now - due
                    );
                    self.shared.counters.record_discarded();
                    self.next_due = Some(due + Duration::from_secs_f64(pending.frame.duration()));
                    return;
                }
            }
        }

        let Pending { frame, speed } = pending;
        let sequence = frame.sequence;
        let timestamp = frame.timestamp;
        let duration = frame.duration();

        match self.sink.offer(Event::Packet(frame), OFFER_SLICE) {
            Ok(()) => {
                self.shared.counters.record_packet();
                let running = self.shared.state.read().is_active();
                self.shared
                    .clock
                    .on_frame(timestamp, duration * speed, speed, running);
                if self.pacing == Pacing::Realtime {
                    let anchor = self.next_due.unwrap_or_else(Instant::now);
                    self.next_due = Some(anchor + Duration::from_secs_f64(duration));
                }
                trace!("Delivered frame {sequence} at {timestamp:.3}s");
            }
            Err(Event::Packet(frame)) => {
                self.pending = Some(Pending { frame, speed });
            }
            Err(_) => {}
        }
    }

    fn finish(&mut self) {
        if !self
            .shared
            .transition(PlaybackState::Playing, PlaybackState::Stopped)
        {
            return;
        }
        self.shared.clock.freeze();
        info!("Playback finished");
        self.sink.emit(Event::Finish);
    }

    fn fail(&mut self, err: &Error) {
        error!("Playback failed: {err}");
        *self.shared.failure.lock() = Some(err.to_string());
        {
            let mut state = self.shared.state.write();
            if *state != PlaybackState::Destroyed {
                *state = PlaybackState::Error;
            }
        }
        self.shared.clock.freeze();
        self.sink.emit(Event::from(err));
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use std::io::Write;
    use std::sync::{OnceLock, Weak};

    use sange_core::ErrorKind;

    use super::*;
    use crate::test_util::{wav_bytes, ScriptedDecoder, Step};

    const WAIT: Duration = Duration::from_secs(5);

    fn config(pacing: Pacing, output: (u16, u32)) -> PlayerConfig {
        PlayerConfig {
            pacing,
            output: OutputFormat::new(output.0, output.1, 128_000).unwrap(),
            ..PlayerConfig::default()
        }
    }

    fn loaded(decoder: ScriptedDecoder, config: PlayerConfig) -> (Player, Events) {
        let (player, events) = Player::new(config).unwrap();
        player.load_decoder(Box::new(decoder)).unwrap();
        assert_eq!(events.recv_timeout(WAIT), Some(Event::Ready));
        (player, events)
    }

    fn next_packet(events: &Events) -> Frame {
        loop {
            if let Event::Packet(frame) = events.recv_timeout(WAIT).unwrap() {
                return frame;
            }
        }
    }

    /// Every event up to and including `finish`.
    fn until_finish(events: &Events) -> Vec<Event> {
        let mut seen = Vec::new();
        loop {
            let event = events.recv_timeout(WAIT).unwrap();
            let done = event == Event::Finish;
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    fn packets(events: &[Event]) -> Vec<&Frame> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Packet(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_plays_to_finish() {
        let (player, events) = loaded(
            ScriptedDecoder::tone(8000, 1, 1.0, 800),
            config(Pacing::Unpaced, (2, 48000)),
        );
        assert_eq!(player.state(), PlaybackState::Ready);
        assert_eq!(player.duration().unwrap(), Some(1.0));

        player.start().unwrap();
        let seen = until_finish(&events);
        let frames = packets(&seen);

        assert!(frames.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert!(frames.iter().all(|f| f.channels == 2 && f.sample_rate == 48000));
        let produced: usize = frames.iter().map(|f| f.frames()).sum();
        assert!(produced.abs_diff(48000) < 1024, "{produced}");

        assert_eq!(player.state(), PlaybackState::Stopped);
        assert_eq!(player.frames_dropped().unwrap(), 0);
        assert_eq!(player.total_packets().unwrap(), frames.len() as u64);
        assert!(player.total_frames().unwrap() >= 10);
    }

    #[test]
    fn test_seek_mid_stream() {
        let mut config = config(Pacing::Realtime, (2, 48000));
        config.max_lateness_ms = 10_000;
        let (player, events) = Player::new(config).unwrap();
        player.set_buffer(wav_bytes(44100, 1, 10.0)).unwrap();
        assert_eq!(events.recv_timeout(WAIT), Some(Event::Ready));

        player.start().unwrap();
        for _ in 0..3 {
            next_packet(&events);
        }
        let dropped = player.frames_dropped().unwrap();

        player.seek(5.0).unwrap();
        assert!((player.time().unwrap() - 5.0).abs() < 0.05);
        assert_eq!(player.state(), PlaybackState::Playing);

        let frame = next_packet(&events);
        let tolerance = frame.duration().max(0.05);
        assert!(
            (frame.timestamp - 5.0).abs() <= tolerance,
            "first packet after seek at {}",
            frame.timestamp
        );
        assert!((player.time().unwrap() - 5.0).abs() <= tolerance * 2.0);
        assert_eq!(player.frames_dropped().unwrap(), dropped);
    }

    #[test]
    fn test_seek_clamps_to_duration() {
        let (player, events) = loaded(
            ScriptedDecoder::tone(8000, 1, 1.0, 400),
            config(Pacing::Unpaced, (1, 8000)),
        );
        player.start().unwrap();
        next_packet(&events);
        player.seek(30.0).unwrap();
        assert!((player.time().unwrap() - 1.0).abs() <= 0.05);
        until_finish(&events);
    }

    #[test]
    fn test_output_change_mid_stream() {
        let (player, events) = loaded(
            ScriptedDecoder::tone(22050, 1, 2.0, 700),
            config(Pacing::Unpaced, (1, 48000)),
        );
        player.start().unwrap();
        let first = next_packet(&events);
        assert_eq!((first.channels, first.sample_rate), (1, 48000));

        assert!(matches!(
            player.set_output(0, 48000, 128_000),
            Err(Error::InvalidFormat(_))
        ));
        assert_eq!(player.state(), PlaybackState::Playing);

        player.set_output(2, 48000, 128_000).unwrap();
        assert_eq!(
            player.output_format().unwrap(),
            OutputFormat::new(2, 48000, 128_000).unwrap()
        );

        let seen = until_finish(&events);
        let frames = packets(&seen);
        let switched = frames.iter().position(|f| f.channels == 2).unwrap();
        assert!(frames[switched..]
            .iter()
            .all(|f| (f.channels, f.sample_rate) == (2, 48000)));
        assert!(frames.windows(2).all(|w| w[0].sequence < w[1].sequence));

        // Nothing buffered in the mono layout is lost by the switch.
        let played = first.duration() + frames.iter().map(|f| f.duration()).sum::<f64>();
        assert!((played - 2.0).abs() < 0.01, "{played}");
        assert_eq!(player.frames_dropped().unwrap(), 0);
    }

    #[test]
    fn test_corrupt_packet_is_absorbed() {
        let decoder = ScriptedDecoder::tone(8000, 1, 1.0, 400).with_step_at(5, Step::Corrupt);
        let (player, events) = loaded(decoder, config(Pacing::Unpaced, (1, 8000)));
        player.start().unwrap();

        let seen = until_finish(&events);
        let debug = seen.iter().filter(|e| matches!(e, Event::Debug(_))).count();
        assert_eq!(debug, 1);
        assert!(!seen.iter().any(|e| matches!(e, Event::Error { .. })));
        assert_eq!(packets(&seen).len(), 20);

        assert_eq!(player.frames_dropped().unwrap(), 1);
        assert_eq!(player.total_frames().unwrap(), 21);
        assert_eq!(player.state(), PlaybackState::Stopped);
    }

    #[test]
    fn test_pause_resume_keeps_sequence() {
        let (player, events) = loaded(
            ScriptedDecoder::tone(8000, 1, 2.0, 400),
            config(Pacing::Unpaced, (1, 8000)),
        );
        player.start().unwrap();
        let mut sequences: Vec<u64> = (0..3).map(|_| next_packet(&events).sequence).collect();

        player.set_paused(true).unwrap();
        player.set_paused(true).unwrap();
        assert_eq!(player.state(), PlaybackState::Paused);
        thread::sleep(Duration::from_millis(100));
        let frozen = player.time().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!((player.time().unwrap() - frozen).abs() < f64::EPSILON);

        player.set_paused(false).unwrap();
        assert_eq!(player.state(), PlaybackState::Playing);

        sequences.extend(packets(&until_finish(&events)).iter().map(|f| f.sequence));
        assert_eq!(sequences, (0..40).collect::<Vec<u64>>());
        assert_eq!(player.frames_dropped().unwrap(), 0);
    }

    #[test]
    fn test_stop_then_start_rewinds() {
        let (player, events) = loaded(
            ScriptedDecoder::tone(8000, 1, 1.0, 400),
            config(Pacing::Unpaced, (1, 8000)),
        );
        player.start().unwrap();
        let mut last = 0;
        for _ in 0..3 {
            last = next_packet(&events).sequence;
        }

        player.stop().unwrap();
        player.stop().unwrap();
        assert_eq!(player.state(), PlaybackState::Stopped);
        assert!(player.time().unwrap().abs() < f64::EPSILON);

        player.start().unwrap();
        let frame = next_packet(&events);
        assert!(frame.timestamp.abs() < 1e-9);
        assert!(frame.sequence > last);
    }

    #[test]
    fn test_stop_uncounts_unread_packets() {
        let mut config = config(Pacing::Unpaced, (1, 8000));
        config.queue_depth = 4;
        let (player, events) = loaded(ScriptedDecoder::tone(8000, 1, 2.0, 400), config);
        player.start().unwrap();
        next_packet(&events);
        thread::sleep(Duration::from_millis(100));

        player.stop().unwrap();
        let mut unread = 0;
        while let Some(event) = events.try_recv() {
            if matches!(event, Event::Packet(_)) {
                unread += 1;
            }
        }
        assert_eq!(unread, 0);
        assert_eq!(player.total_packets().unwrap(), 1);
        assert_eq!(player.frames_dropped().unwrap(), 0);
    }

    #[test]
    fn test_finished_live_stream_cannot_restart() {
        let (player, events) = loaded(
            ScriptedDecoder::tone(8000, 1, 0.25, 400).unseekable(),
            config(Pacing::Unpaced, (1, 8000)),
        );
        player.start().unwrap();
        until_finish(&events);
        assert_eq!(player.state(), PlaybackState::Stopped);

        assert!(matches!(player.start(), Err(Error::Unsupported(_))));
        assert_eq!(player.state(), PlaybackState::Stopped);
        assert!(events.recv_timeout(Duration::from_millis(100)).is_none());
    }

    #[test]
    fn test_seek_while_stopped_is_kept() {
        let (player, events) = loaded(
            ScriptedDecoder::tone(8000, 1, 1.0, 400),
            config(Pacing::Unpaced, (1, 8000)),
        );
        player.start().unwrap();
        next_packet(&events);
        player.stop().unwrap();

        player.seek(0.5).unwrap();
        assert_eq!(player.state(), PlaybackState::Stopped);
        player.start().unwrap();
        assert!((next_packet(&events).timestamp - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (player, events) = loaded(
            ScriptedDecoder::tone(8000, 1, 1.0, 400),
            config(Pacing::Unpaced, (1, 8000)),
        );
        player.start().unwrap();
        next_packet(&events);

        player.destroy().unwrap();
        while events.try_recv().is_some() {}
        player.destroy().unwrap();
        assert!(events.try_recv().is_none());
        assert_eq!(player.state(), PlaybackState::Destroyed);
        assert!(matches!(player.start(), Err(Error::Destroyed)));
        assert!(matches!(player.time(), Err(Error::Destroyed)));
        assert!(matches!(player.set_volume(0.5), Err(Error::Destroyed)));
        assert!(matches!(player.set_buffer(Vec::new()), Err(Error::Destroyed)));
    }

    #[test]
    fn test_fatal_error_ends_session() {
        let decoder = ScriptedDecoder::tone(8000, 1, 1.0, 400).with_step_at(3, Step::Fatal);
        let (player, events) = loaded(decoder, config(Pacing::Unpaced, (1, 8000)));
        player.start().unwrap();

        let kind = loop {
            if let Event::Error { kind, .. } = events.recv_timeout(WAIT).unwrap() {
                break kind;
            }
        };
        assert_eq!(kind, ErrorKind::DecodeError);
        assert_eq!(player.state(), PlaybackState::Error);

        assert!(matches!(player.start(), Err(Error::Failed(_))));
        assert!(matches!(player.seek(0.0), Err(Error::Failed(_))));
        assert!(matches!(player.frames_dropped(), Err(Error::Failed(_))));
        assert!(events.recv_timeout(Duration::from_millis(100)).is_none());

        player.destroy().unwrap();
        assert!(matches!(player.time(), Err(Error::Destroyed)));
    }

    #[test]
    fn test_missing_file_keeps_idle() {
        let (player, events) = Player::new(PlayerConfig::default()).unwrap();
        let err = player.set_url("/nonexistent/sange/track.wav", true).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(player.state(), PlaybackState::Idle);
        assert!(matches!(
            events.recv_timeout(WAIT),
            Some(Event::Error {
                kind: ErrorKind::NotFound,
                ..
            })
        ));
    }

    #[test]
    fn test_plays_local_file() {
        let mut file = tempfile::Builder::new().suffix(".wav").tempfile().unwrap();
        file.write_all(&wav_bytes(22050, 1, 0.5)).unwrap();

        let (player, events) = Player::new(config(Pacing::Unpaced, (2, 48000))).unwrap();
        player
            .set_url(file.path().to_str().unwrap(), true)
            .unwrap();
        assert_eq!(events.recv_timeout(WAIT), Some(Event::Ready));
        assert!((player.duration().unwrap().unwrap() - 0.5).abs() < 1e-3);

        player.start().unwrap();
        let seen = until_finish(&events);
        assert!(packets(&seen)
            .iter()
            .all(|f| f.channels == 2 && f.sample_rate == 48000));
    }

    #[test]
    fn test_seek_on_live_source_fails() {
        let (player, events) = loaded(
            ScriptedDecoder::tone(8000, 1, 1.0, 400).unseekable().without_duration(),
            config(Pacing::Unpaced, (1, 8000)),
        );
        assert_eq!(player.duration().unwrap(), None);
        player.start().unwrap();
        next_packet(&events);

        assert!(matches!(player.seek(0.5), Err(Error::SeekError(_))));
        assert_eq!(player.state(), PlaybackState::Playing);
    }

    #[test]
    fn test_control_input_is_validated() {
        let (player, _events) = Player::new(PlayerConfig::default()).unwrap();

        for err in [
            player.set_volume(-1.0).unwrap_err(),
            player.set_volume(f32::NAN).unwrap_err(),
            player.set_rate(0.0).unwrap_err(),
            player.set_tempo(f64::INFINITY).unwrap_err(),
            player.set_tremolo(2.0, 1.0).unwrap_err(),
            player
                .set_equalizer(&[EqualizerBand::new(0.0, 3.0)])
                .unwrap_err(),
            player.seek(-1.0).unwrap_err(),
        ] {
            assert!(matches!(err, Error::InvalidArgument(_)), "{err}");
        }
        assert!(matches!(player.set_bitrate(0), Err(Error::InvalidFormat(_))));

        assert!(matches!(player.start(), Err(Error::InvalidState { .. })));
        assert!(matches!(player.seek(1.0), Err(Error::InvalidState { .. })));
        assert!(matches!(player.set_paused(true), Err(Error::InvalidState { .. })));
        player.set_paused(false).unwrap();
        player.stop().unwrap();
        assert_eq!(player.state(), PlaybackState::Idle);

        player.set_rate(100.0).unwrap();
        player.set_bitrate(96_000).unwrap();
        let params = player.params().unwrap();
        assert!((params.rate - MAX_SPEED_FACTOR).abs() < f64::EPSILON);
        assert_eq!(params.output.bitrate, 96_000);
    }

    #[test]
    fn test_counters_stay_consistent() {
        let mut decoder = ScriptedDecoder::tone(8000, 1, 2.0, 200);
        for index in [3, 10, 11, 40] {
            decoder = decoder.with_step_at(index, Step::Corrupt);
        }
        let (player, events) = loaded(decoder, config(Pacing::Unpaced, (2, 48000)));
        player.set_tempo(1.5).unwrap();
        player.start().unwrap();

        loop {
            let snapshot = player.counters().unwrap();
            assert!(snapshot.dropped <= snapshot.total);
            if events.recv_timeout(WAIT).unwrap() == Event::Finish {
                break;
            }
        }
        let snapshot = player.counters().unwrap();
        assert_eq!(snapshot.dropped, 4);
        assert!(snapshot.dropped <= snapshot.total);
    }

    #[test]
    fn test_late_frames_are_dropped() {
        let mut config = config(Pacing::Realtime, (1, 8000));
        config.queue_depth = 1;
        config.max_lateness_ms = 0;
        let (player, events) = loaded(ScriptedDecoder::tone(8000, 1, 2.0, 400), config);

        player.start().unwrap();
        thread::sleep(Duration::from_millis(300));
        until_finish(&events);

        let snapshot = player.counters().unwrap();
        assert!(snapshot.dropped > 0);
        assert_eq!(snapshot.packets + snapshot.dropped, snapshot.total);
    }

    #[test]
    fn test_replacing_source_keeps_numbering() {
        let (player, events) = loaded(
            ScriptedDecoder::tone(8000, 1, 0.5, 400),
            config(Pacing::Unpaced, (1, 8000)),
        );
        player.start().unwrap();
        let last = packets(&until_finish(&events)).last().unwrap().sequence;

        player
            .load_decoder(Box::new(ScriptedDecoder::tone(8000, 1, 0.5, 400)))
            .unwrap();
        assert_eq!(events.recv_timeout(WAIT), Some(Event::Ready));
        assert_eq!(player.state(), PlaybackState::Ready);
        player.start().unwrap();
        assert!(next_packet(&events).sequence > last);
    }

    #[test]
    fn test_dropping_player_closes_events() {
        let (player, events) = loaded(
            ScriptedDecoder::tone(8000, 1, 5.0, 400),
            config(Pacing::Unpaced, (1, 8000)),
        );
        player.start().unwrap();
        next_packet(&events);
        drop(player);

        while events.try_recv().is_some() {}
        let begin = Instant::now();
        assert!(events.recv_timeout(WAIT).is_none());
        assert!(begin.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_sink_can_start_on_ready() {
        let slot: Arc<OnceLock<Weak<Player>>> = Arc::new(OnceLock::new());
        let started = Arc::new(Mutex::new(None));
        let (sink_slot, sink_started) = (Arc::clone(&slot), Arc::clone(&started));

        let player = Arc::new(
            Player::with_sink(config(Pacing::Unpaced, (1, 8000)), move |event: Event| {
                if event == Event::Ready {
                    if let Some(player) = sink_slot.get().and_then(Weak::upgrade) {
                        *sink_started.lock() = Some(player.start().is_ok());
                    }
                }
            })
            .unwrap(),
        );
        slot.set(Arc::downgrade(&player)).unwrap();

        player
            .load_decoder(Box::new(ScriptedDecoder::tone(8000, 1, 0.5, 400)))
            .unwrap();
        assert_eq!(*started.lock(), Some(true));
        assert_ne!(player.state(), PlaybackState::Ready);
    }

    #[test]
    fn test_closure_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let player = Player::with_sink(config(Pacing::Unpaced, (1, 8000)), move |event: Event| {
            sink_seen.lock().push(event.name());
        })
        .unwrap();

        player
            .load_decoder(Box::new(ScriptedDecoder::tone(8000, 1, 0.25, 400)))
            .unwrap();
        player.start().unwrap();

        let begin = Instant::now();
        while !seen.lock().contains(&"finish") {
            assert!(begin.elapsed() < WAIT);
            thread::sleep(Duration::from_millis(5));
        }
        let seen = seen.lock();
        assert_eq!(seen.first(), Some(&"ready"));
        assert_eq!(seen.iter().filter(|name| **name == "packet").count(), 5);
    }
}
