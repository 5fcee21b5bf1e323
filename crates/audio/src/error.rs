//! Audio error types (thiserror-based).

use thiserror::Error;

/// PCM processing error type.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AudioError {
    /// Buffers of different rates cannot be combined without resampling.
    #[error("Sample rate mismatch: expected {expected}Hz, got {got}Hz")]
    SampleRateMismatch { expected: u32, got: u32 },

    /// Appended buffer does not match the queue's channel layout.
    #[error("Channel count mismatch: expected {expected}, got {got}")]
    ChannelMismatch { expected: usize, got: usize },

    /// Planar channels of one buffer differ in length.
    #[error("Ragged buffer: channel {channel} has {got} frames, expected {expected}")]
    RaggedChannels {
        channel: usize,
        expected: usize,
        got: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = AudioError::SampleRateMismatch {
            expected: 48_000,
            got: 44_100,
        };
        assert_eq!(
            err.to_string(),
            "Sample rate mismatch: expected 48000Hz, got 44100Hz"
        );
    }
}
