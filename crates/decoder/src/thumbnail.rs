//! Thumbnail images: decoded frames scaled down for timeline strips.

use bytes::Bytes;
use mc_common::{Micros, Resolution, VideoFrame};

/// RGBA thumbnail with tightly packed rows.
#[derive(Clone, Debug, PartialEq)]
pub struct Thumbnail {
    /// Presentation time of the source frame.
    pub timestamp: Micros,
    pub width: u32,
    pub height: u32,
    pub rgba: Bytes,
}

impl Thumbnail {
    pub fn byte_size(&self) -> usize {
        self.rgba.len()
    }
}

/// Nearest-neighbour scale of `frame` to `width`, keeping the aspect ratio.
/// A `width` of 0 or one at least as wide as the frame keeps the frame size.
pub fn scale_to_width(frame: &VideoFrame, width: u32) -> Thumbnail {
    let src = frame.resolution;
    let dst = if width == 0 || width >= src.width {
        src
    } else {
        Resolution::new(width, src.scaled_height(width).max(1))
    };

    let mut rgba = Vec::with_capacity(dst.rgba_byte_size());
    for y in 0..dst.height {
        let sy = (y as u64 * src.height as u64 / dst.height.max(1) as u64) as u32;
        for x in 0..dst.width {
            let sx = (x as u64 * src.width as u64 / dst.width.max(1) as u64) as u32;
            rgba.extend_from_slice(&frame.rgba_at(sx, sy));
        }
    }

    Thumbnail {
        timestamp: frame.timestamp,
        width: dst.width,
        height: dst.height,
        rgba: Bytes::from(rgba),
    }
}
