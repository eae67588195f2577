//! Command-line front end for the playback engine.

use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::context::AudioContext;
use crate::audio::device::get_output_devices;
use crate::audio::driver::AudioDriver;
use crate::config::{AudioConfig, DeviceSelector};
use crate::error::{AudioError, Result};

#[derive(Parser)]
#[command(name = "cadenza")]
#[command(about = "Streaming music and sound effect playback")]
pub struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List output devices
    Devices,
    /// List the tracks registered in an audio index file
    Tracks {
        /// Index file with `name<TAB>file` lines
        index: PathBuf,
    },
    /// Play a track from an audio index file
    Play {
        /// Index file with `name<TAB>file` lines
        index: PathBuf,

        /// Track name in the index
        track: String,

        /// Play the track on repeat
        #[arg(long, short)]
        repeat: bool,

        /// Output device name
        #[arg(long)]
        device: Option<String>,

        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<f64>,

        /// Fade out over this many seconds before stopping
        #[arg(long)]
        fade_out: Option<f64>,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<AudioConfig> {
    match path.or_else(AudioConfig::default_path) {
        Some(p) => AudioConfig::load(&p),
        None => Ok(AudioConfig::default()),
    }
}

pub fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Devices => {
            for dev in get_output_devices() {
                let marker = if dev.is_default { " (default)" } else { "" };
                println!("{}{}", dev.name, marker);
            }
            Ok(())
        }
        Commands::Tracks { index } => {
            let mut config = load_config(cli.config)?;
            config.device = DeviceSelector::Headless {
                sample_rate: 44100,
                channels: 2,
            };
            let mut ctx = AudioContext::open(config)?;
            ctx.load_index(&index)?;
            for name in ctx.track_names() {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Play {
            index,
            track,
            repeat,
            device,
            seconds,
            fade_out,
        } => {
            let mut config = load_config(cli.config)?;
            if let Some(name) = device {
                config.device = DeviceSelector::Named(name);
            }
            play(config, &index, &track, repeat, seconds, fade_out)
        }
    }
}

fn play(
    config: AudioConfig,
    index: &std::path::Path,
    track: &str,
    repeat: bool,
    seconds: Option<f64>,
    fade_out: Option<f64>,
) -> Result<()> {
    if matches!(config.device, DeviceSelector::Headless { .. }) {
        return Err(AudioError::Config("playback needs an output device".into()));
    }
    let interval = Duration::from_millis(config.tick_interval_ms);
    let mut ctx = AudioContext::open(config)?;
    ctx.load_index(index)?;
    ctx.play_music(track, repeat)?;
    println!(
        "Playing '{}' ({:.1}s) on {}",
        track,
        ctx.music_duration_secs(),
        ctx.device_name().unwrap_or("?")
    );

    let shared = Arc::new(Mutex::new(ctx));
    let driver = AudioDriver::spawn(shared.clone(), interval)?;

    let limit = seconds.map(Duration::from_secs_f64);
    let started = Instant::now();
    while shared.lock().is_music_playing() {
        if limit.is_some_and(|l| started.elapsed() >= l) {
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    if let Some(fade) = fade_out {
        shared
            .lock()
            .set_music_fade(1.0, 0.0, Duration::from_secs_f64(fade), true);
        while shared.lock().is_music_playing() {
            thread::sleep(Duration::from_millis(50));
        }
    }

    drop(driver);
    shared.lock().destroy_context();
    Ok(())
}
