//! Mixer error types.

use thiserror::Error;

/// Status returned by fallible mixer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MixerError {
    /// An argument was out of range or otherwise unusable.
    #[error("invalid parameter")]
    InvalidParameter,

    /// The requested file does not exist.
    #[error("file not found")]
    FileNotFound,

    /// The file exists but could not be decoded.
    #[error("file load failed")]
    FileLoadFailed,

    /// The audio backend could not be opened or started.
    #[error("audio backend not found")]
    BackendNotFound,

    /// An allocation could not be satisfied.
    #[error("out of memory")]
    OutOfMemory,

    /// The operation is not supported by this source.
    #[error("not implemented")]
    NotImplemented,

    /// Catch-all for failures without a better status.
    #[error("unknown error")]
    UnknownError,

    /// A seek ran past the end of the stream.
    #[error("end of stream")]
    EndOfStream,

    /// A fixed-size pool has no free entries.
    #[error("pool exhausted")]
    PoolExhausted,

    /// No output device is available.
    #[error("no audio device")]
    NoAudioDevice,
}

/// Result alias used across the mixer.
pub type Result<T> = std::result::Result<T, MixerError>;

/// Errors that can occur while loading audio files.
#[derive(Debug, Error)]
pub enum SampleLoadError {
    /// Failed to open the audio file.
    #[error("failed to open file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to decode the audio file.
    #[error("failed to decode audio file: {0}")]
    Decode(#[from] symphonia::core::errors::Error),

    /// Audio file has no default track.
    #[error("audio file has no default track")]
    NoDefaultTrack,

    /// Audio file is missing sample rate information.
    #[error("audio file is missing a sample rate")]
    MissingSampleRate,

    /// Audio file is missing channel information.
    #[error("audio file is missing channel information")]
    MissingChannels,

    /// The file uses a channel layout the mixer cannot expand.
    #[error("unsupported channel count: {channels} (expected 1, 2, 4, 6 or 8)")]
    UnsupportedChannels {
        /// Number of channels in the source file.
        channels: usize,
    },
}

impl From<SampleLoadError> for MixerError {
    fn from(err: SampleLoadError) -> Self {
        match err {
            SampleLoadError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                MixerError::FileNotFound
            }
            _ => MixerError::FileLoadFailed,
        }
    }
}
