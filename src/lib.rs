pub mod audio;
pub mod cli;
pub mod config;
pub mod error;

pub use audio::context::AudioContext;
pub use audio::driver::AudioDriver;
pub use config::AudioConfig;
pub use error::{AudioError, Result};

use clap::Parser;

pub fn run() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = cli::Cli::parse();
    if let Err(e) = cli::execute(cli) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
