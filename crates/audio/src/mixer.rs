//! Additive multi-source mixing of planar PCM.
//!
//! Inputs are summed sample by sample into one output buffer. There is no
//! normalization or clipping: levels above 1.0 are left for the encoder.

use mc_common::{AudioData, Micros};
use tracing::trace;

use crate::error::AudioError;

/// An individual input to the mixer.
#[derive(Clone, Debug)]
pub struct MixerInput<'a> {
    pub audio: &'a AudioData,
    /// Linear gain. Values > 1.0 amplify.
    pub volume: f32,
    /// If true, this input contributes nothing.
    pub muted: bool,
}

impl<'a> MixerInput<'a> {
    pub fn new(audio: &'a AudioData) -> Self {
        Self {
            audio,
            volume: 1.0,
            muted: false,
        }
    }
}

/// Mixer for a fixed output format.
#[derive(Clone, Debug)]
pub struct AudioMixer {
    pub sample_rate: u32,
    pub channels: usize,
}

impl AudioMixer {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Sum `inputs` into a buffer of `output_frames` frames stamped `timestamp`.
    ///
    /// Inputs shorter than `output_frames` are zero-padded, longer ones are
    /// truncated. Mono inputs feed every output channel; multi-channel inputs
    /// mapped into mono output are averaged.
    pub fn mix(
        &self,
        timestamp: Micros,
        inputs: &[MixerInput<'_>],
        output_frames: usize,
    ) -> Result<AudioData, AudioError> {
        let mut output = AudioData::silence(timestamp, self.sample_rate, self.channels, output_frames);
        for input in inputs {
            if input.muted || input.volume == 0.0 || input.audio.is_empty() {
                continue;
            }
            if input.audio.sample_rate != self.sample_rate {
                return Err(AudioError::SampleRateMismatch {
                    expected: self.sample_rate,
                    got: input.audio.sample_rate,
                });
            }
            mix_into(&mut output.channels, &input.audio.channels, input.volume);
        }
        trace!(
            inputs = inputs.len(),
            frames = output_frames,
            "mixed audio tick"
        );
        Ok(output)
    }
}

/// Add `src` into `dst` channel by channel with `gain`.
pub fn mix_into(dst: &mut [Vec<f32>], src: &[Vec<f32>], gain: f32) {
    match (src.len(), dst.len()) {
        (0, _) | (_, 0) => {}
        (1, _) => {
            for out in dst.iter_mut() {
                add_scaled(out, &src[0], gain);
            }
        }
        (n, 1) => {
            let scale = gain / n as f32;
            for channel in src {
                add_scaled(&mut dst[0], channel, scale);
            }
        }
        _ => {
            for (out, channel) in dst.iter_mut().zip(src) {
                add_scaled(out, channel, gain);
            }
        }
    }
}

fn add_scaled(out: &mut [f32], input: &[f32], gain: f32) {
    for (o, s) in out.iter_mut().zip(input) {
        *o += s * gain;
    }
}
