//! Domain-level error types.
//!
//! These are framework-agnostic; `ev-server` maps them onto HTTP status
//! codes and JSON bodies at the gateway boundary.

use thiserror::Error;

/// Errors raised by the audio decode/scoring pipeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScoringError {
    /// The WAV buffer is malformed or uses an unsupported encoding.
    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    /// Decoded audio is shorter than the minimum scorable duration.
    #[error("audio too short")]
    TooShort,

    /// Decoded audio exceeds the maximum scorable duration.
    #[error("audio too long")]
    TooLong,
}

/// Top-level error type for `ev-common` operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Scoring(#[from] ScoringError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
