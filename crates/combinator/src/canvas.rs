//! Frame compositing.
//!
//! The [`Compositor`] trait is the seam for a rendering backend; the
//! scheduler only clears, draws sprites bottom to top and reads the result
//! back. [`CpuCanvas`] is the host-memory implementation: nearest-neighbour
//! scaling into the placement rectangle and source-over alpha blending.

use bytes::Bytes;
use mc_common::{Micros, PixelFormat, Resolution, VideoFrame};
use tracing::trace;

/// Where and how a sprite's frame lands on the canvas.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Placement {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// 0.0 = invisible, 1.0 = frame alpha only.
    pub opacity: f32,
}

impl Placement {
    /// Cover the whole canvas.
    pub fn fill(resolution: Resolution) -> Self {
        Self {
            x: 0,
            y: 0,
            width: resolution.width,
            height: resolution.height,
            opacity: 1.0,
        }
    }

    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            opacity: 1.0,
        }
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity.clamp(0.0, 1.0);
        self
    }
}

/// Rendering backend used by the scheduler, one instance per session.
pub trait Compositor: Send {
    fn resolution(&self) -> Resolution;

    /// Fill the whole canvas with an RGBA color.
    fn clear(&mut self, color: [u8; 4]);

    /// Blend `frame` over the current canvas contents.
    fn draw(&mut self, frame: &VideoFrame, placement: &Placement);

    /// The composited picture, stamped for the encoder.
    fn render(&mut self, timestamp: Micros, duration: Micros) -> VideoFrame;
}

/// RGBA8 canvas in host memory.
pub struct CpuCanvas {
    resolution: Resolution,
    pixels: Vec<u8>,
}

impl CpuCanvas {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            pixels: vec![0; resolution.rgba_byte_size()],
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let idx = (y as usize * self.resolution.width as usize + x as usize) * 4;
        match self.pixels.get(idx..idx + 4) {
            Some(px) => [px[0], px[1], px[2], px[3]],
            None => [0; 4],
        }
    }
}

impl Compositor for CpuCanvas {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn clear(&mut self, color: [u8; 4]) {
        for px in self.pixels.chunks_exact_mut(4) {
            px.copy_from_slice(&color);
        }
    }

    fn draw(&mut self, frame: &VideoFrame, placement: &Placement) {
        let src = frame.resolution;
        if src.is_empty() || placement.width == 0 || placement.height == 0 || placement.opacity <= 0.0 {
            return;
        }
        let canvas_w = self.resolution.width as i64;
        let canvas_h = self.resolution.height as i64;

        // Visible part of the placement rectangle.
        let x0 = (placement.x as i64).max(0);
        let y0 = (placement.y as i64).max(0);
        let x1 = (placement.x as i64 + placement.width as i64).min(canvas_w);
        let y1 = (placement.y as i64 + placement.height as i64).min(canvas_h);
        if x0 >= x1 || y0 >= y1 {
            return;
        }
        trace!(
            x = placement.x,
            y = placement.y,
            width = placement.width,
            height = placement.height,
            "draw sprite"
        );

        for y in y0..y1 {
            let sy = ((y - placement.y as i64) * src.height as i64 / placement.height as i64) as u32;
            for x in x0..x1 {
                let sx = ((x - placement.x as i64) * src.width as i64 / placement.width as i64) as u32;
                let [r, g, b, a] = frame.rgba_at(sx, sy);
                let alpha = a as f32 / 255.0 * placement.opacity;
                if alpha <= 0.0 {
                    continue;
                }
                let idx = (y as usize * canvas_w as usize + x as usize) * 4;
                let dst = &mut self.pixels[idx..idx + 4];
                for (d, s) in dst.iter_mut().zip([r, g, b]) {
                    *d = (s as f32 * alpha + *d as f32 * (1.0 - alpha)).round() as u8;
                }
                dst[3] = (255.0 * alpha + dst[3] as f32 * (1.0 - alpha)).round() as u8;
            }
        }
    }

    fn render(&mut self, timestamp: Micros, duration: Micros) -> VideoFrame {
        VideoFrame {
            timestamp,
            duration,
            resolution: self.resolution,
            format: PixelFormat::Rgba8,
            data: Bytes::copy_from_slice(&self.pixels),
        }
    }
}
