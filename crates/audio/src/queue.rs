//! FIFO of planar PCM used to hand out exact-size runs from
//! arbitrarily sized decoder outputs.

use std::collections::VecDeque;

use mc_common::{AudioData, Micros};

use crate::error::AudioError;
use crate::pcm;

#[derive(Clone, Debug)]
pub struct PcmQueue {
    sample_rate: u32,
    channels: Vec<VecDeque<f32>>,
    /// Timestamp of the first frame ever queued since the last clear.
    origin: Option<Micros>,
    /// Frames taken since `origin`.
    consumed: u64,
}

impl PcmQueue {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels: vec![VecDeque::new(); channels],
            origin: None,
            consumed: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Frames currently buffered.
    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timestamp of the next frame `take` would return.
    pub fn head_timestamp(&self) -> Option<Micros> {
        self.origin
            .map(|o| o + (self.consumed as i64 * 1_000_000) / self.sample_rate.max(1) as i64)
    }

    pub fn push(&mut self, audio: &AudioData) -> Result<(), AudioError> {
        if audio.sample_rate != self.sample_rate {
            return Err(AudioError::SampleRateMismatch {
                expected: self.sample_rate,
                got: audio.sample_rate,
            });
        }
        if audio.channel_count() != self.channels.len() {
            return Err(AudioError::ChannelMismatch {
                expected: self.channels.len(),
                got: audio.channel_count(),
            });
        }
        pcm::validate(audio)?;
        if self.origin.is_none() {
            self.origin = Some(audio.timestamp);
        }
        for (queue, data) in self.channels.iter_mut().zip(&audio.channels) {
            queue.extend(data.iter().copied());
        }
        Ok(())
    }

    /// Remove up to `frames` frames from the head.
    pub fn take(&mut self, frames: usize) -> AudioData {
        let timestamp = self.head_timestamp().unwrap_or(0);
        let n = frames.min(self.len());
        let channels = self
            .channels
            .iter_mut()
            .map(|q| q.drain(..n).collect())
            .collect();
        self.consumed += n as u64;
        AudioData::new(timestamp, self.sample_rate, channels)
    }

    /// Remove exactly `frames` frames, padding with silence when short.
    pub fn take_exact(&mut self, frames: usize) -> AudioData {
        let mut audio = self.take(frames);
        for channel in &mut audio.channels {
            channel.resize(frames, 0.0);
        }
        audio
    }

    pub fn clear(&mut self) {
        for q in &mut self.channels {
            q.clear();
        }
        self.origin = None;
        self.consumed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(ts: Micros, start: usize, frames: usize) -> AudioData {
        let data: Vec<f32> = (start..start + frames).map(|i| i as f32).collect();
        AudioData::new(ts, 48_000, vec![data.clone(), data])
    }

    #[test]
    fn takes_across_pushed_buffers() {
        let mut q = PcmQueue::new(48_000, 2);
        q.push(&ramp(1_000, 0, 1024)).unwrap();
        q.push(&ramp(22_333, 1024, 1024)).unwrap();
        assert_eq!(q.len(), 2048);

        let first = q.take(1600);
        assert_eq!(first.timestamp, 1_000);
        assert_eq!(first.frames(), 1600);
        assert_eq!(first.channels[1][1599], 1599.0);

        let second = q.take(1600);
        assert_eq!(second.timestamp, 1_000 + 33_333);
        assert_eq!(second.frames(), 448);
        assert!(q.is_empty());
    }

    #[test]
    fn take_exact_pads_with_silence() {
        let mut q = PcmQueue::new(48_000, 2);
        q.push(&ramp(0, 1, 10)).unwrap();
        let out = q.take_exact(16);
        assert_eq!(out.frames(), 16);
        assert_eq!(out.channels[0][9], 10.0);
        assert_eq!(out.channels[0][10], 0.0);
    }

    #[test]
    fn mismatched_input_is_rejected() {
        let mut q = PcmQueue::new(48_000, 2);
        let mono = AudioData::silence(0, 48_000, 1, 10);
        assert!(matches!(
            q.push(&mono),
            Err(AudioError::ChannelMismatch { expected: 2, got: 1 })
        ));
        let other_rate = AudioData::silence(0, 44_100, 2, 10);
        assert!(q.push(&other_rate).is_err());
        assert!(q.is_empty());
    }

    #[test]
    fn clear_resets_timeline() {
        let mut q = PcmQueue::new(48_000, 1);
        q.push(&AudioData::silence(500, 48_000, 1, 10)).unwrap();
        q.take(5);
        q.clear();
        assert_eq!(q.head_timestamp(), None);
        q.push(&AudioData::silence(9_000, 48_000, 1, 10)).unwrap();
        assert_eq!(q.head_timestamp(), Some(9_000));
    }
}
