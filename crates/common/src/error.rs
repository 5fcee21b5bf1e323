//! Central error types for the engine (thiserror-based).

use std::fmt;

use thiserror::Error;

use crate::sample::TrackKind;
use crate::types::Micros;

/// Top-level engine error.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Demux error: {0}")]
    Demux(#[from] DemuxError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Edit error: {0}")]
    Edit(#[from] EditError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Byte store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Read out of range: {offset}+{size} exceeds store length {len}")]
    OutOfRange { offset: u64, size: u32, len: u64 },

    #[error("Store has been closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Demuxer/container parsing errors.
#[derive(Error, Debug)]
pub enum DemuxError {
    #[error("Invalid box at offset {offset}: {reason}")]
    InvalidStructure { offset: u64, reason: String },

    #[error("Unsupported sample entry: {0}")]
    UnsupportedCodec(String),

    #[error("Invalid {record} record: {reason}")]
    InvalidCodecConfig {
        record: &'static str,
        reason: String,
    },

    #[error("Truncated data: expected {expected} bytes, got {got}")]
    TruncatedData { expected: usize, got: usize },

    #[error("Stream ended before the movie header was complete")]
    Incomplete,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a codec service failure should be treated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecErrorKind {
    /// Codec was reclaimed by the platform after inactivity. The handle is
    /// dead but may simply be re-created.
    Reclaimed,
    /// Bitstream could not be decoded/encoded with the current configuration.
    Decoding,
    /// Any other failure.
    Fatal,
}

/// Error reported by a codec service, either synchronously or on its event channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecError {
    pub kind: CodecErrorKind,
    pub message: String,
}

impl CodecError {
    pub fn new(kind: CodecErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn reclaimed(message: impl Into<String>) -> Self {
        Self::new(CodecErrorKind::Reclaimed, message)
    }

    pub fn decoding(message: impl Into<String>) -> Self {
        Self::new(CodecErrorKind::Decoding, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(CodecErrorKind::Fatal, message)
    }

    pub fn is_reclaimed(&self) -> bool {
        self.kind == CodecErrorKind::Reclaimed
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CodecError {}

/// Frame finder / decoder errors.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Decode failed after software fallback: {0}")]
    FallbackFailed(CodecError),

    #[error("Decode timed out after {waited_ms}ms ({diagnostics})")]
    Timeout { waited_ms: u64, diagnostics: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Finder has been closed")]
    Closed,
}

/// Encoder errors.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("No {} track configured", .0.as_str())]
    TrackNotConfigured(TrackKind),

    #[error("Encoder session already closed")]
    Closed,
}

/// Sample table editing errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EditError {
    #[error("Split time {time}us is outside (0, {duration}us)")]
    OutOfBounds { time: Micros, duration: Micros },

    #[error("No {} samples to edit", .0.as_str())]
    NotFound(TrackKind),

    #[error("Invalid range [{start}, {end})")]
    InvalidRange { start: Micros, end: Micros },
}

/// Convenience Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edit_error_messages() {
        assert_eq!(
            EditError::NotFound(TrackKind::Audio).to_string(),
            "No audio samples to edit"
        );
        let err = EditError::OutOfBounds {
            time: 5,
            duration: 4,
        };
        assert!(err.to_string().contains("outside (0, 4us)"));
    }

    #[test]
    fn codec_error_converts_into_engine_error() {
        let err: DecodeError = CodecError::reclaimed("idle").into();
        let engine: EngineError = err.into();
        assert!(matches!(
            engine,
            EngineError::Decode(DecodeError::Codec(CodecError {
                kind: CodecErrorKind::Reclaimed,
                ..
            }))
        ));
    }
}
