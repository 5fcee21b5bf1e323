//! Configuration structs for frame finders, clips, the mux engine and the
//! combinator.
//!
//! All of them load from JSON with missing fields filled from `Default`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{
    AudioCodec, AudioEncoderConfig, HardwareAcceleration, VideoCodec, VideoEncoderConfig,
};
use crate::types::{Micros, Rational, Resolution};

/// Decode-cache tuning shared by the video and audio frame finders.
///
/// The windows and timeouts are empirical; none of them is load-bearing for
/// correctness, only for latency and memory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinderConfig {
    /// A video request further than this past the cursor forces a reset.
    pub reset_window: Micros,
    /// Wall-clock bound on a decode that makes no progress.
    pub decode_timeout_ms: u64,
    /// Sleep between decoder queue polls.
    pub poll_interval_ms: u64,
    /// Pre-decode the next GoP when fewer frames than this are queued.
    pub low_water_frames: usize,
    /// Skip submitting a GoP while the decoder already holds this many units.
    pub max_decode_queue: usize,
    /// Audio samples submitted per decode batch.
    pub audio_batch_size: usize,
    /// Only submit an audio batch while the decode queue is at most this deep.
    pub audio_max_decode_queue: usize,
    /// Reset window for audio requests.
    pub audio_reset_window: Micros,
    pub audio_timeout_ms: u64,
    /// Output sample rate of the audio finder.
    pub target_sample_rate: u32,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            reset_window: 3_000_000,
            decode_timeout_ms: 6_000,
            poll_interval_ms: 15,
            low_water_frames: 10,
            max_decode_queue: 600,
            audio_batch_size: 10,
            audio_max_decode_queue: 10,
            audio_reset_window: 3_000_000,
            audio_timeout_ms: 3_000,
            target_sample_rate: 48_000,
        }
    }
}

impl FinderConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn decode_timeout(&self) -> Duration {
        Duration::from_millis(self.decode_timeout_ms)
    }

    pub fn audio_timeout(&self) -> Duration {
        Duration::from_millis(self.audio_timeout_ms)
    }
}

/// Per-clip settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipConfig {
    /// Demux and decode the audio track.
    pub include_audio: bool,
    /// Linear gain applied to decoded PCM.
    pub volume: f32,
    pub hardware_acceleration: HardwareAcceleration,
    /// A first visible frame starting later than zero but earlier than this
    /// is stretched back to zero.
    pub black_frame_threshold: Micros,
    pub finder: FinderConfig,
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            include_audio: true,
            volume: 1.0,
            hardware_acceleration: HardwareAcceleration::NoPreference,
            black_frame_threshold: 200_000,
            finder: FinderConfig::default(),
        }
    }
}

impl ClipConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Mux engine session settings. A `None` track is not written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    pub video: Option<VideoEncoderConfig>,
    pub audio: Option<AudioEncoderConfig>,
    /// Request a keyframe this often.
    pub keyframe_interval: Micros,
    /// Interval between incremental output drains.
    pub flush_interval_ms: u64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            video: Some(VideoEncoderConfig::default()),
            audio: Some(AudioEncoderConfig::default()),
            keyframe_interval: 3_000_000,
            flush_interval_ms: 500,
        }
    }
}

impl MuxConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Number of video frames between forced keyframes.
    pub fn keyframe_every(&self) -> u64 {
        let Some(video) = &self.video else {
            return 1;
        };
        let frames = video.fps.as_f64() * self.keyframe_interval as f64 / 1e6;
        (frames.round() as u64).max(1)
    }
}

/// Output session of a combinator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombinatorConfig {
    pub width: u32,
    pub height: u32,
    pub fps: Rational,
    pub bitrate: u64,
    pub codec: VideoCodec,
    pub hardware_acceleration: HardwareAcceleration,
    /// Write an audio track.
    pub audio: bool,
    pub audio_codec: AudioCodec,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    pub audio_bitrate: u64,
    /// RGBA canvas fill behind all sprites.
    pub background: [u8; 4],
    /// This instance stops ticking while its own encode queue is deeper
    /// than this.
    pub instance_queue_threshold: usize,
    /// Every instance stops ticking while the summed depth of all running
    /// instances exceeds this.
    pub global_queue_threshold: usize,
    pub admission_poll_ms: u64,
    pub keyframe_interval: Micros,
    pub flush_interval_ms: u64,
}

impl Default for CombinatorConfig {
    fn default() -> Self {
        Self {
            width: Resolution::HD.width,
            height: Resolution::HD.height,
            fps: Rational::FPS_30,
            bitrate: 10_000_000,
            codec: VideoCodec::H264,
            hardware_acceleration: HardwareAcceleration::NoPreference,
            audio: true,
            audio_codec: AudioCodec::Aac,
            audio_sample_rate: 48_000,
            audio_channels: 2,
            audio_bitrate: 128_000,
            background: [0, 0, 0, 255],
            instance_queue_threshold: 50,
            global_queue_threshold: 150,
            admission_poll_ms: 10,
            keyframe_interval: 3_000_000,
            flush_interval_ms: 500,
        }
    }
}

impl CombinatorConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Scheduler step: one frame at `fps`.
    pub fn tick(&self) -> Micros {
        self.fps.frame_duration()
    }

    pub fn admission_poll_interval(&self) -> Duration {
        Duration::from_millis(self.admission_poll_ms)
    }

    /// Encoder settings for the mux engine.
    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            video: Some(VideoEncoderConfig {
                codec: self.codec,
                resolution: self.resolution(),
                fps: self.fps,
                bitrate: self.bitrate,
                hardware_acceleration: self.hardware_acceleration,
            }),
            audio: self.audio.then(|| AudioEncoderConfig {
                codec: self.audio_codec,
                sample_rate: self.audio_sample_rate,
                channels: self.audio_channels,
                bitrate: self.audio_bitrate,
            }),
            keyframe_interval: self.keyframe_interval,
            flush_interval_ms: self.flush_interval_ms,
        }
    }
}
