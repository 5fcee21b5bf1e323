//! Session notifications and progress accounting.

use mc_common::Micros;

/// Share of progress attributed to rendering input; the rest is encoder drain.
const INPUT_WEIGHT: f64 = 0.9;

#[derive(Clone, Debug, PartialEq)]
pub enum CombinatorEvent {
    /// Fraction in `[0, 1]`, non-decreasing over a session.
    OutputProgress(f64),
    /// All output has been sent; the output channel closes next.
    Ended { duration: Micros, bytes: u64 },
    Error(String),
}

/// Blends timeline position with encode-queue drain once input is exhausted.
#[derive(Debug)]
pub(crate) struct Progress {
    duration: Micros,
    drain_from: Option<usize>,
    last: f64,
}

impl Progress {
    pub(crate) fn new(duration: Micros) -> Self {
        Self {
            duration,
            drain_from: None,
            last: 0.0,
        }
    }

    /// Progress after rendering up to `time` with `queue_depth` units still
    /// waiting in the encoders.
    pub(crate) fn update(&mut self, time: Micros, queue_depth: usize) -> f64 {
        let input = if self.duration > 0 {
            (time as f64 / self.duration as f64).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let drain = if input >= 1.0 {
            let from = *self.drain_from.get_or_insert(queue_depth.max(1));
            1.0 - (queue_depth.min(from) as f64 / from as f64)
        } else {
            0.0
        };
        let value = INPUT_WEIGHT * input + (1.0 - INPUT_WEIGHT) * drain;
        self.last = self.last.max(value);
        self.last
    }

    pub(crate) fn finish(&mut self) -> f64 {
        self.last = 1.0;
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_phase_counts_ninety_percent() {
        let mut progress = Progress::new(1_000_000);
        assert_eq!(progress.update(0, 10), 0.0);
        assert!((progress.update(500_000, 10) - 0.45).abs() < 1e-9);
    }

    #[test]
    fn drain_phase_tracks_queue() {
        let mut progress = Progress::new(1_000_000);
        assert!((progress.update(1_000_000, 20) - 0.9).abs() < 1e-9);
        assert!((progress.update(1_000_000, 10) - 0.95).abs() < 1e-9);
        assert!((progress.update(1_000_000, 0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn never_goes_backwards() {
        let mut progress = Progress::new(1_000_000);
        progress.update(1_000_000, 4);
        let before = progress.update(1_000_000, 1);
        assert!(progress.update(1_000_000, 3) >= before);
        assert_eq!(progress.finish(), 1.0);
    }
}
