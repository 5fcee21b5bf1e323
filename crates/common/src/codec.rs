//! Video/audio codec identifiers and codec service configurations.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{Rational, Resolution};

/// Video codec identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::H264 => "H.264/AVC",
            Self::H265 => "H.265/HEVC",
        }
    }

    /// Sample entry fourcc used when writing this codec into an MP4.
    pub fn sample_entry(self) -> &'static [u8; 4] {
        match self {
            Self::H264 => b"avc1",
            Self::H265 => b"hvc1",
        }
    }
}

/// Audio codec identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioCodec {
    Aac,
    Opus,
}

impl AudioCodec {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Aac => "AAC",
            Self::Opus => "Opus",
        }
    }
}

/// Hint passed to codec services about hardware usage.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HardwareAcceleration {
    #[default]
    NoPreference,
    PreferHardware,
    PreferSoftware,
}

/// Configuration handed to a video decoder service.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoDecoderConfig {
    pub codec: VideoCodec,
    /// RFC 6381 codec string, e.g. `avc1.64001f`.
    pub codec_string: String,
    pub coded: Resolution,
    /// Raw `avcC` / `hvcC` record body.
    pub description: Option<Bytes>,
    pub hardware_acceleration: HardwareAcceleration,
}

impl VideoDecoderConfig {
    /// Copy of this config forced onto the software path.
    pub fn software(&self) -> Self {
        Self {
            hardware_acceleration: HardwareAcceleration::PreferSoftware,
            ..self.clone()
        }
    }
}

/// Configuration handed to an audio decoder service.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioDecoderConfig {
    pub codec: AudioCodec,
    /// RFC 6381 codec string, e.g. `mp4a.40.2` or `opus`.
    pub codec_string: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// AudioSpecificConfig for AAC, OpusHead-style body for Opus.
    pub description: Option<Bytes>,
}

/// Video encoder session settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VideoEncoderConfig {
    pub codec: VideoCodec,
    pub resolution: Resolution,
    pub fps: Rational,
    /// Target bitrate in bits/sec.
    pub bitrate: u64,
    #[serde(default)]
    pub hardware_acceleration: HardwareAcceleration,
}

impl Default for VideoEncoderConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            resolution: Resolution::HD,
            fps: Rational::FPS_30,
            bitrate: 10_000_000,
            hardware_acceleration: HardwareAcceleration::NoPreference,
        }
    }
}

/// Audio encoder session settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioEncoderConfig {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u64,
}

impl Default for AudioEncoderConfig {
    fn default() -> Self {
        Self {
            codec: AudioCodec::Aac,
            sample_rate: 48_000,
            channels: 2,
            bitrate: 128_000,
        }
    }
}
