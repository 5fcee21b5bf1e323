//! Combinator error types.

use mc_audio::AudioError;
use mc_common::EngineError;
use mc_mux::MuxError;
use thiserror::Error;

/// Errors that end a composition session.
#[derive(Error, Debug)]
pub enum CombinatorError {
    /// A source failed to produce its tick.
    #[error("Source error: {0}")]
    Source(#[from] EngineError),

    #[error("Mux error: {0}")]
    Mux(#[from] MuxError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Invalid combinator config: {0}")]
    InvalidConfig(String),

    #[error("Nothing to render: no sprites were added")]
    NoSources,

    /// The session task panicked or was aborted.
    #[error("Session task failed: {0}")]
    Task(String),
}

pub type CombinatorResult<T> = Result<T, CombinatorError>;
