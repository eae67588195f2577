use thiserror::Error;

use crate::audio::mixer::HardwareError;

#[derive(Error, Debug)]
pub enum AudioError {
    /// A sound effect name that was never loaded.
    #[error("Could not find sound effect '{0}'")]
    UnknownSound(String),

    /// A music track name that was never loaded.
    #[error("Could not find music track '{0}'")]
    UnknownTrack(String),

    /// Output device could not be opened or the stream could not be built.
    #[error("Audio device error: {0}")]
    Device(String),

    /// An operation needed the device but `init_context` was not called.
    #[error("No audio context has been created")]
    NoContext,

    /// The encoded data could not be opened or decoded.
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// The track decoded to zero samples.
    #[error("Music track '{0}' contains no audio")]
    EmptyStream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AudioError>;
