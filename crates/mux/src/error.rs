//! Muxer error types.

use mc_common::{CodecError, DemuxError, EncodeError, StoreError, TrackKind};
use thiserror::Error;

/// Errors that can occur while encoding and muxing.
#[derive(Error, Debug)]
pub enum MuxError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid session or track configuration.
    #[error("Invalid muxer config: {0}")]
    InvalidConfig(String),

    /// Track-related error (missing metadata, mismatched inputs).
    #[error("Track error: {0}")]
    TrackError(String),

    /// A box outgrew its 32-bit size field.
    #[error("Buffer full: {0}")]
    BufferFull(String),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Demux error: {0}")]
    Demux(#[from] DemuxError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("{} encoder did not finish flushing within {waited_ms}ms", .kind.as_str())]
    FlushTimeout { kind: TrackKind, waited_ms: u64 },
}

/// Convenience Result type for mux operations.
pub type MuxResult<T> = Result<T, MuxError>;
