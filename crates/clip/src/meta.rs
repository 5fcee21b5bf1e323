//! Plain data returned by a clip: ready metadata, tick output, thumbnail
//! request options.

use mc_common::{AudioData, Micros, VideoFrame};
use serde::{Deserialize, Serialize};

/// Derived clip properties, valid once ingest has finished.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipMeta {
    /// Coded width; 0 for audio-only clips.
    pub width: u32,
    pub height: u32,
    /// Longest track duration.
    pub duration: Micros,
    /// Source audio sample rate, 0 without audio.
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
}

impl ClipMeta {
    pub fn has_video(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickState {
    Success,
    /// The requested time is at or past the end of the clip.
    Done,
}

/// Media for one tick.
#[derive(Clone, Debug)]
pub struct TickOutput {
    pub video: Option<VideoFrame>,
    /// Audio since the previous tick, at the finder's output rate.
    pub audio: AudioData,
    pub state: TickState,
}

impl TickOutput {
    pub fn is_done(&self) -> bool {
        self.state == TickState::Done
    }
}

/// Time range and spacing of a thumbnail strip. Without a `step` one
/// thumbnail per keyframe is produced.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailOptions {
    pub start: Micros,
    pub end: Option<Micros>,
    pub step: Option<Micros>,
}
