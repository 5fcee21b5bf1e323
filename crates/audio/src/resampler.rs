//! Sample rate conversion using linear interpolation.
//!
//! Streaming over planar buffers: the fractional read position and the last
//! frame of each call are carried into the next so consecutive buffers join
//! without clicks.

use mc_common::AudioData;

/// Linear interpolation resampler for planar multi-channel audio.
#[derive(Clone, Debug)]
pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
    /// Input frames advanced per output frame.
    step: f64,
    /// Read position relative to the start of the next input buffer.
    /// Negative values point back into `last_frame`.
    position: f64,
    /// Last input frame per channel, for interpolation across buffers.
    last_frame: Vec<f32>,
    /// Output frames produced so far, used to timestamp output buffers.
    produced: u64,
    /// Timestamp of the first input buffer.
    origin: Option<i64>,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate,
            to_rate,
            step: from_rate as f64 / to_rate.max(1) as f64,
            position: 0.0,
            last_frame: Vec::new(),
            produced: 0,
            origin: None,
        }
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Whether the rates match and `process` only copies.
    pub fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate
    }

    /// Resample one planar channel set. All channels must have equal length.
    pub fn process_planar(&mut self, input: &[Vec<f32>]) -> Vec<Vec<f32>> {
        let frames = input.first().map_or(0, Vec::len);
        if input.is_empty() || frames == 0 {
            return vec![Vec::new(); input.len()];
        }
        if self.is_passthrough() {
            return input.to_vec();
        }
        if self.last_frame.len() != input.len() {
            // First buffer, or the channel layout changed: start clean.
            self.last_frame = input.iter().map(|ch| ch[0]).collect();
            self.position = 0.0;
        }

        let estimated = (frames as f64 / self.step).ceil() as usize + 1;
        let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(estimated); input.len()];
        let mut pos = self.position;

        // Interpolate between input[idx] and input[idx + 1]; index -1 is the
        // carried-over last frame.
        while pos < (frames - 1) as f64 {
            let base = pos.floor();
            let frac = (pos - base) as f32;
            let idx = base as isize;
            for (c, channel) in input.iter().enumerate() {
                let a = if idx < 0 {
                    self.last_frame[c]
                } else {
                    channel[idx as usize]
                };
                let b = channel[(idx + 1) as usize];
                output[c].push(a + (b - a) * frac);
            }
            pos += self.step;
        }

        // Carry the tail: the next buffer's frame 0 sits one frame past our last.
        self.position = pos - frames as f64;
        for (c, channel) in input.iter().enumerate() {
            self.last_frame[c] = channel[frames - 1];
        }
        self.produced += output.first().map_or(0, Vec::len) as u64;
        output
    }

    /// Resample a whole buffer, timestamping the output contiguously from
    /// the first buffer seen since the last reset.
    pub fn process(&mut self, input: &AudioData) -> AudioData {
        if self.is_passthrough() {
            return input.clone();
        }
        let origin = *self.origin.get_or_insert(input.timestamp);
        let timestamp = origin + (self.produced as i64 * 1_000_000) / self.to_rate.max(1) as i64;
        let channels = self.process_planar(&input.channels);
        AudioData::new(timestamp, self.to_rate, channels)
    }

    /// Forget carried state. Call when seeking.
    pub fn reset(&mut self) {
        self.position = 0.0;
        self.last_frame.clear();
        self.produced = 0;
        self.origin = None;
    }
}

/// One-shot resample without keeping state.
pub fn resample_buffer(input: &AudioData, to_rate: u32) -> AudioData {
    Resampler::new(input.sample_rate, to_rate).process(input)
}
