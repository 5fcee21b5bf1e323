//! Small planar PCM helpers: frame arithmetic, gain, channel expansion and
//! interleaving.

use mc_common::{AudioData, Micros};

use crate::error::AudioError;

/// Frames needed to cover `delta` microseconds at `sample_rate`, rounded up.
pub fn frames_for(delta: Micros, sample_rate: u32) -> usize {
    if delta <= 0 {
        return 0;
    }
    let num = delta as u128 * sample_rate as u128;
    num.div_ceil(1_000_000) as usize
}

/// Multiply every sample by `volume`, in place.
pub fn apply_volume(audio: &mut AudioData, volume: f32) {
    if volume == 1.0 {
        return;
    }
    for channel in &mut audio.channels {
        for s in channel.iter_mut() {
            *s *= volume;
        }
    }
}

/// Duplicate a mono buffer into two identical channels. Other layouts pass through.
pub fn expand_mono(mut audio: AudioData) -> AudioData {
    if audio.channels.len() == 1 {
        let left = audio.channels[0].clone();
        audio.channels.push(left);
    }
    audio
}

/// Planar to interleaved (`L R L R ...`).
pub fn interleave(audio: &AudioData) -> Vec<f32> {
    let frames = audio.frames();
    let channels = audio.channel_count();
    let mut out = Vec::with_capacity(frames * channels);
    for i in 0..frames {
        for channel in &audio.channels {
            out.push(channel.get(i).copied().unwrap_or(0.0));
        }
    }
    out
}

/// Interleaved to planar. A trailing partial frame is dropped.
pub fn deinterleave(samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
    if channels == 0 {
        return Vec::new();
    }
    let frames = samples.len() / channels;
    let mut out = vec![Vec::with_capacity(frames); channels];
    for frame in samples.chunks_exact(channels) {
        for (c, s) in frame.iter().enumerate() {
            out[c].push(*s);
        }
    }
    out
}

/// Reject buffers whose channels differ in length.
pub fn validate(audio: &AudioData) -> Result<(), AudioError> {
    let expected = audio.frames();
    for (channel, data) in audio.channels.iter().enumerate() {
        if data.len() != expected {
            return Err(AudioError::RaggedChannels {
                channel,
                expected,
                got: data.len(),
            });
        }
    }
    Ok(())
}
