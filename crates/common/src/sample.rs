//! Sample-table data model shared by the demuxer, editor, and finders.

use serde::{Deserialize, Serialize};

use crate::types::Micros;

/// Which media track a sample table belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

/// One coded access unit, stored by reference into a byte store.
///
/// Samples of a track live in a single `Vec<Sample>` ordered by `dts`.
/// Editing never moves or drops entries: trimmed samples are flagged with
/// `deleted` and keep their byte range so the GoP can still be decoded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Decode timestamp.
    pub dts: Micros,
    /// Presentation timestamp.
    pub cts: Micros,
    /// Presentation duration.
    pub duration: Micros,
    /// Absolute byte offset of the payload in the byte store.
    pub offset: u64,
    /// Payload size in bytes.
    pub size: u32,
    /// Sync sample (GoP-starting keyframe).
    pub is_sync: bool,
    /// Soft-delete marker set by trim/split.
    pub deleted: bool,
    /// For keyframes whose access unit starts with SEI/AUD NAL units, the
    /// offset of the first picture NAL inside the payload.
    pub payload_offset: Option<u32>,
}

impl Sample {
    /// End of the presentation interval.
    pub fn end(&self) -> Micros {
        self.cts + self.duration
    }

    /// Whether the presentation interval `[cts, cts + duration)` intersects `[start, end)`.
    pub fn intersects(&self, start: Micros, end: Micros) -> bool {
        self.cts < end && self.end() > start
    }

    /// Byte range actually fed to a decoder (skips a detected prefix).
    pub fn decode_range(&self) -> (u64, u32) {
        match self.payload_offset {
            Some(skip) if skip < self.size => (self.offset + skip as u64, self.size - skip),
            _ => (self.offset, self.size),
        }
    }
}

/// Duration of a sample table: the furthest presentation end among non-deleted samples.
pub fn track_duration(samples: &[Sample]) -> Micros {
    samples
        .iter()
        .filter(|s| !s.deleted)
        .map(Sample::end)
        .max()
        .unwrap_or(0)
        .max(0)
}
