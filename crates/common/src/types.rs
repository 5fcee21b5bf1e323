//! Core value types: microsecond timestamps, frame rates, resolutions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp or duration in microseconds.
///
/// Every sample, frame, and timeline position in the engine is expressed in
/// this unit. Container timescales are converted on ingest.
pub type Micros = i64;

pub const MICROS_PER_SEC: Micros = 1_000_000;

/// Convert seconds to microseconds (rounded).
pub fn secs_to_micros(secs: f64) -> Micros {
    (secs * MICROS_PER_SEC as f64).round() as Micros
}

/// Convert microseconds to seconds.
pub fn micros_to_secs(us: Micros) -> f64 {
    us as f64 / MICROS_PER_SEC as f64
}

/// Rescale a value expressed in `timescale` ticks into microseconds.
pub fn ticks_to_micros(ticks: i64, timescale: u32) -> Micros {
    if timescale == 0 {
        return 0;
    }
    ((ticks as i128 * MICROS_PER_SEC as i128) / timescale as i128) as Micros
}

/// Rescale microseconds into `timescale` ticks (rounded to nearest).
pub fn micros_to_ticks(us: Micros, timescale: u32) -> i64 {
    let scaled = us as i128 * timescale as i128;
    let half = MICROS_PER_SEC as i128 / 2;
    let rounded = if scaled >= 0 {
        (scaled + half) / MICROS_PER_SEC as i128
    } else {
        (scaled - half) / MICROS_PER_SEC as i128
    };
    rounded as i64
}

/// Rational number for frame rates (e.g., 30000/1001 for 29.97fps).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

impl Rational {
    pub const FPS_24: Self = Self { num: 24, den: 1 };
    pub const FPS_25: Self = Self { num: 25, den: 1 };
    pub const FPS_30: Self = Self { num: 30, den: 1 };
    pub const FPS_29_97: Self = Self {
        num: 30000,
        den: 1001,
    };
    pub const FPS_60: Self = Self { num: 60, den: 1 };

    pub fn new(num: u32, den: u32) -> Self {
        assert!(den > 0, "Rational denominator must be > 0");
        Self { num, den }
    }

    pub fn as_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Duration of one frame in microseconds, rounded to the nearest unit.
    pub fn frame_duration(self) -> Micros {
        if self.num == 0 {
            return 0;
        }
        (self.den as f64 * MICROS_PER_SEC as f64 / self.num as f64).round() as Micros
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

/// Video/image resolution.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD: Self = Self {
        width: 1920,
        height: 1080,
    };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Byte size for RGBA8 pixel data.
    pub fn rgba_byte_size(self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Height that keeps the aspect ratio when scaled to `width`.
    pub fn scaled_height(self, width: u32) -> u32 {
        if self.width == 0 {
            return 0;
        }
        ((self.height as f64 * width as f64 / self.width as f64).round() as u32).max(1)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rational_display() {
        assert_eq!(Rational::FPS_30.to_string(), "30");
        assert_eq!(Rational::FPS_29_97.to_string(), "30000/1001");
    }

    #[test]
    fn frame_duration_at_30fps() {
        assert_eq!(Rational::FPS_30.frame_duration(), 33_333);
    }

    #[test]
    fn tick_conversion() {
        assert_eq!(ticks_to_micros(90_000, 90_000), MICROS_PER_SEC);
        assert_eq!(ticks_to_micros(1024, 48_000), 21_333);
        assert_eq!(micros_to_ticks(21_333, 48_000), 1024);
        assert_eq!(ticks_to_micros(5, 0), 0);
    }

    #[test]
    fn scaled_height_keeps_aspect() {
        assert_eq!(Resolution::HD.scaled_height(100), 56);
        assert_eq!(Resolution::new(0, 10).scaled_height(100), 0);
    }

    #[test]
    fn seconds_roundtrip() {
        assert_eq!(secs_to_micros(1.5), 1_500_000);
        assert!((micros_to_secs(250_000) - 0.25).abs() < 1e-12);
    }
}
