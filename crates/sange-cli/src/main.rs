//! # sange
//!
//! Plays a file or URL through the default audio device with the sange
//! engine.

mod output;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use output::DeviceOutput;
use sange_audio::buffer::shared_sample_ring;
use sange_audio::Player;
use sange_core::{EqualizerBand, Event, OutputFormat, Pacing, PlayerConfig};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Room for about half a second of 48 kHz stereo.
const RING_CAPACITY: usize = 48000;

/// Longest wait for the device to play out what is left in the ring.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "sange")]
#[command(about = "Play audio through the sange engine")]
#[command(version)]
struct Cli {
    /// Local path or http(s) URL
    input: String,

    /// JSON player config; unset fields keep their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Linear gain
    #[arg(long, default_value = "1.0")]
    volume: f32,

    /// Varispeed factor (pitch follows)
    #[arg(long, default_value = "1.0")]
    rate: f64,

    /// Time-stretch factor (pitch kept)
    #[arg(long, default_value = "1.0")]
    tempo: f64,

    /// Tremolo as DEPTH:RATE_HZ, e.g. 0.5:4
    #[arg(long)]
    tremolo: Option<String>,

    /// Equalizer band as FREQ_HZ:GAIN_DB; repeat for more bands
    #[arg(long = "eq")]
    equalizer: Vec<String>,

    /// Start position in seconds
    #[arg(long)]
    seek: Option<f64>,

    /// Log packets instead of sending them to an audio device
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sange=info,sange_audio=info".into()),
        )
        .init();

    let cli = Cli::parse();
    info!("Starting sange v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            PlayerConfig::from_json_str(&json)?
        }
        // The device paces playback through the ring buffer.
        None => PlayerConfig {
            pacing: Pacing::Unpaced,
            ..PlayerConfig::default()
        },
    };

    let ring = shared_sample_ring(RING_CAPACITY);
    let device = if cli.dry_run {
        None
    } else {
        let device = DeviceOutput::open_default(ring.clone())?;
        config.output = OutputFormat::new(
            device.channels(),
            device.sample_rate(),
            config.output.bitrate,
        )?;
        info!(
            "Output: {} ({} ch @ {}Hz)",
            device.device_name(),
            device.channels(),
            device.sample_rate()
        );
        Some(device)
    };

    let (player, events) = Player::new(config)?;
    apply_effects(&player, &cli)?;

    let is_local_file = !(cli.input.starts_with("http://") || cli.input.starts_with("https://"));
    player.set_url(&cli.input, is_local_file)?;
    if let Some(duration) = player.duration()? {
        info!("Duration: {duration:.1}s");
    }

    player.start()?;
    if let Some(position) = cli.seek {
        player.seek(position)?;
    }

    let stop = AtomicBool::new(false);
    while let Some(event) = events.recv() {
        match event {
            Event::Ready => {}
            Event::Packet(frame) => {
                if device.is_some() {
                    ring.push(&frame.samples, &stop);
                } else {
                    debug!(
                        "Packet {} at {:.3}s: {} frames",
                        frame.sequence,
                        frame.timestamp,
                        frame.frames()
                    );
                }
            }
            Event::Debug(message) => info!("{message}"),
            Event::Finish => break,
            Event::Error { kind, message } => {
                bail!("Playback failed ({kind:?}): {message}");
            }
        }
    }

    if let Some(device) = &device {
        let began = Instant::now();
        while !ring.is_empty() && began.elapsed() < DRAIN_TIMEOUT {
            thread::sleep(Duration::from_millis(10));
        }
        if device.underruns() > 0 {
            warn!("{} buffer underruns", device.underruns());
        }
    }

    let counters = player.counters()?;
    info!(
        "Played {} packets, {} of {} frames dropped",
        counters.packets, counters.dropped, counters.total
    );
    player.destroy()?;
    Ok(())
}

fn apply_effects(player: &Player, cli: &Cli) -> Result<()> {
    player.set_volume(cli.volume)?;
    player.set_rate(cli.rate)?;
    player.set_tempo(cli.tempo)?;

    if let Some(arg) = &cli.tremolo {
        let (depth, rate_hz) = parse_pair(arg, "tremolo")?;
        player.set_tremolo(depth, rate_hz)?;
    }

    if !cli.equalizer.is_empty() {
        let bands = cli
            .equalizer
            .iter()
            .map(|arg| {
                parse_pair(arg, "equalizer band")
                    .map(|(frequency, gain)| EqualizerBand::new(frequency, gain))
            })
            .collect::<Result<Vec<_>>>()?;
        player.set_equalizer(&bands)?;
    }
    Ok(())
}

/// Parse `A:B` into two floats.
fn parse_pair(arg: &str, what: &str) -> Result<(f32, f32)> {
    let (a, b) = arg
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid {what} '{arg}', expected A:B"))?;
    let a = a
        .trim()
        .parse()
        .with_context(|| format!("Invalid {what} '{arg}'"))?;
    let b = b
        .trim()
        .parse()
        .with_context(|| format!("Invalid {what} '{arg}'"))?;
    Ok((a, b))
}
