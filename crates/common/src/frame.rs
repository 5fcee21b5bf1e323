//! Media units exchanged with codec services: encoded chunks, decoded video
//! frames, and planar PCM buffers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{Micros, Resolution};

/// Timestamp given to samples that must be decoded for reference but whose
/// output is dropped.
pub const DISCARD_TIMESTAMP: Micros = -1;

/// Pixel layout of a decoded or rendered frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 4 channels, 8 bits each.
    Rgba8,
    /// BGRA8 (some platform decoders prefer this ordering).
    Bgra8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        4
    }
}

/// Keyframe or dependent frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkType {
    Key,
    Delta,
}

/// One compressed access unit, as fed to a decoder or produced by an encoder.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedChunk {
    pub kind: ChunkType,
    pub timestamp: Micros,
    pub duration: Micros,
    pub data: Bytes,
}

impl EncodedChunk {
    pub fn is_key(&self) -> bool {
        self.kind == ChunkType::Key
    }

    pub fn is_discard(&self) -> bool {
        self.timestamp == DISCARD_TIMESTAMP
    }
}

/// A decoded picture in host memory.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoFrame {
    pub timestamp: Micros,
    pub duration: Micros,
    pub resolution: Resolution,
    pub format: PixelFormat,
    /// Tightly packed rows, `resolution.width * 4` bytes each.
    pub data: Bytes,
}

impl VideoFrame {
    /// Presentation interval end.
    pub fn end(&self) -> Micros {
        self.timestamp + self.duration
    }

    /// Whether this frame should be shown at `time`.
    pub fn covers(&self, time: Micros) -> bool {
        time >= self.timestamp && time < self.end()
    }

    /// RGBA component quad for pixel (x, y), converting from BGRA if needed.
    pub fn rgba_at(&self, x: u32, y: u32) -> [u8; 4] {
        let idx = (y as usize * self.resolution.width as usize + x as usize) * 4;
        let Some(px) = self.data.get(idx..idx + 4) else {
            return [0; 4];
        };
        match self.format {
            PixelFormat::Rgba8 => [px[0], px[1], px[2], px[3]],
            PixelFormat::Bgra8 => [px[2], px[1], px[0], px[3]],
        }
    }
}

/// Planar f32 PCM: one `Vec` per channel, all of equal length.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioData {
    pub timestamp: Micros,
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl AudioData {
    pub fn new(timestamp: Micros, sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self {
            timestamp,
            sample_rate,
            channels,
        }
    }

    /// Zero-valued buffer.
    pub fn silence(timestamp: Micros, sample_rate: u32, channels: usize, frames: usize) -> Self {
        Self::new(timestamp, sample_rate, vec![vec![0.0; frames]; channels])
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Sample frames per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    pub fn duration(&self) -> Micros {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.frames() as i64 * 1_000_000) / self.sample_rate as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_covers_half_open_interval() {
        let frame = VideoFrame {
            timestamp: 100,
            duration: 50,
            resolution: Resolution::new(1, 1),
            format: PixelFormat::Rgba8,
            data: Bytes::from_static(&[1, 2, 3, 4]),
        };
        assert!(frame.covers(100));
        assert!(frame.covers(149));
        assert!(!frame.covers(150));
        assert!(!frame.covers(99));
    }

    #[test]
    fn bgra_is_swizzled() {
        let frame = VideoFrame {
            timestamp: 0,
            duration: 1,
            resolution: Resolution::new(1, 1),
            format: PixelFormat::Bgra8,
            data: Bytes::from_static(&[1, 2, 3, 4]),
        };
        assert_eq!(frame.rgba_at(0, 0), [3, 2, 1, 4]);
        assert_eq!(frame.rgba_at(5, 5), [0; 4]);
    }

    #[test]
    fn silence_shape() {
        let audio = AudioData::silence(0, 48_000, 2, 1_600);
        assert_eq!(audio.channel_count(), 2);
        assert_eq!(audio.frames(), 1_600);
        assert_eq!(audio.duration(), 33_333);
        assert!(audio.channels.iter().flatten().all(|s| *s == 0.0));
    }
}
