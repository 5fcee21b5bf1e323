//! Incremental fragmented MP4 writer.
//!
//! Usage:
//! ```ignore
//! let mut writer = FragmentedWriter::new();
//! writer.write_header(vec![TrackSpec::new(1, video_config)], 0)?;
//! writer.push(1, sample)?;
//! writer.flush_fragment()?;
//! let bytes = writer.take_output();
//! ```
//!
//! Samples are buffered per track until [`FragmentedWriter::flush_fragment`]
//! turns everything buffered into one `moof` + `mdat`. Serialized bytes
//! accumulate until taken, so the caller decides when output leaves.

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{MuxError, MuxResult};
use crate::fragment::{write_fragment, FragmentSample, TrackRun};
use crate::init::{write_init_segment, TrackSpec};

struct TrackState {
    spec: TrackSpec,
    pending: Vec<FragmentSample>,
    /// Decode time one past the last written sample, in track ticks.
    next_dts: u64,
    samples_written: u64,
}

/// Writes an init segment once, then media fragments on demand.
#[derive(Default)]
pub struct FragmentedWriter {
    tracks: Vec<TrackState>,
    output: Vec<u8>,
    sequence: u32,
    header_written: bool,
    bytes_written: u64,
}

impl FragmentedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `ftyp` + `moov` for `tracks`. Must precede any sample.
    pub fn write_header(&mut self, tracks: Vec<TrackSpec>, duration: mc_common::Micros) -> MuxResult<()> {
        if self.header_written {
            return Err(MuxError::InvalidConfig("header already written".into()));
        }
        let init = write_init_segment(&tracks, duration)?;
        debug!(
            "Init segment: {} bytes, {} tracks, duration={}us",
            init.len(),
            tracks.len(),
            duration
        );
        self.append(&init);
        self.tracks = tracks
            .into_iter()
            .map(|spec| TrackState {
                spec,
                pending: Vec::new(),
                next_dts: 0,
                samples_written: 0,
            })
            .collect();
        self.header_written = true;
        Ok(())
    }

    pub fn header_written(&self) -> bool {
        self.header_written
    }

    pub fn tracks(&self) -> impl Iterator<Item = &TrackSpec> {
        self.tracks.iter().map(|t| &t.spec)
    }

    pub fn track(&self, track_id: u32) -> Option<&TrackSpec> {
        self.tracks().find(|t| t.track_id == track_id)
    }

    /// Buffer one sample for the next fragment.
    pub fn push(&mut self, track_id: u32, sample: FragmentSample) -> MuxResult<()> {
        if !self.header_written {
            return Err(MuxError::InvalidConfig("sample before header".into()));
        }
        let track = self
            .tracks
            .iter_mut()
            .find(|t| t.spec.track_id == track_id)
            .ok_or_else(|| MuxError::TrackError(format!("unknown track id {track_id}")))?;
        track.next_dts = track.next_dts.max(sample.dts + sample.duration as u64);
        track.pending.push(sample);
        Ok(())
    }

    /// Samples buffered but not yet serialized.
    pub fn buffered_samples(&self) -> usize {
        self.tracks.iter().map(|t| t.pending.len()).sum()
    }

    /// Decode time the next sample of `track_id` would start at.
    pub fn next_dts(&self, track_id: u32) -> Option<u64> {
        self.tracks
            .iter()
            .find(|t| t.spec.track_id == track_id)
            .map(|t| t.next_dts)
    }

    /// Serialize everything buffered as one fragment. Returns the number of
    /// bytes appended (0 when nothing was buffered).
    pub fn flush_fragment(&mut self) -> MuxResult<usize> {
        if self.buffered_samples() == 0 {
            return Ok(0);
        }
        let sequence = self.sequence + 1;
        let runs: Vec<TrackRun<'_>> = self
            .tracks
            .iter()
            .map(|t| TrackRun {
                track_id: t.spec.track_id,
                samples: &t.pending,
            })
            .collect();
        let fragment = write_fragment(sequence, &runs)?;
        trace!(
            "Fragment {}: {} samples, {} bytes",
            sequence,
            self.buffered_samples(),
            fragment.len()
        );

        self.sequence = sequence;
        for track in &mut self.tracks {
            track.samples_written += track.pending.len() as u64;
            track.pending.clear();
        }
        self.append(&fragment);
        Ok(fragment.len())
    }

    /// Take the bytes serialized since the last call.
    pub fn take_output(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.output))
    }

    /// Fragments written so far.
    pub fn fragments(&self) -> u32 {
        self.sequence
    }

    pub fn samples_written(&self, track_id: u32) -> u64 {
        self.tracks
            .iter()
            .find(|t| t.spec.track_id == track_id)
            .map_or(0, |t| t.samples_written)
    }

    /// Total bytes produced, taken or not.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn append(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
        self.bytes_written += bytes.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mc_common::testing::FAKE_AVCC;
    use mc_common::{HardwareAcceleration, Resolution, TrackConfig, VideoCodec, VideoDecoderConfig};
    use mc_demux::testing::demux_all;

    fn video_track() -> TrackSpec {
        TrackSpec::new(
            1,
            TrackConfig::Video(VideoDecoderConfig {
                codec: VideoCodec::H264,
                codec_string: "avc1.42001f".into(),
                coded: Resolution::new(16, 16),
                description: Some(Bytes::from_static(FAKE_AVCC)),
                hardware_acceleration: HardwareAcceleration::NoPreference,
            }),
        )
    }

    fn frame(i: u64) -> FragmentSample {
        FragmentSample {
            data: Bytes::from(vec![i as u8; 4]),
            dts: i * 3000,
            duration: 3000,
            cts_offset: 0,
            is_sync: i % 10 == 0,
        }
    }

    #[test]
    fn rejects_samples_before_header() {
        let mut writer = FragmentedWriter::new();
        assert!(matches!(writer.push(1, frame(0)), Err(MuxError::InvalidConfig(_))));
        assert_eq!(writer.flush_fragment().unwrap(), 0);
    }

    #[test]
    fn rejects_unknown_track_and_second_header() {
        let mut writer = FragmentedWriter::new();
        writer.write_header(vec![video_track()], 0).unwrap();
        assert!(matches!(writer.push(9, frame(0)), Err(MuxError::TrackError(_))));
        assert!(matches!(
            writer.write_header(vec![video_track()], 0),
            Err(MuxError::InvalidConfig(_))
        ));
    }

    #[test]
    fn output_is_taken_incrementally() {
        let mut writer = FragmentedWriter::new();
        writer.write_header(vec![video_track()], 1_000_000).unwrap();
        let mut file = writer.take_output().to_vec();
        assert!(!file.is_empty());

        for batch in 0..3u64 {
            for i in batch * 10..(batch + 1) * 10 {
                writer.push(1, frame(i)).unwrap();
            }
            assert_eq!(writer.buffered_samples(), 10);
            assert!(writer.flush_fragment().unwrap() > 0);
            file.extend_from_slice(&writer.take_output());
        }
        assert!(writer.take_output().is_empty());
        assert_eq!(writer.fragments(), 3);
        assert_eq!(writer.samples_written(1), 30);
        assert_eq!(writer.next_dts(1), Some(90_000));
        assert_eq!(writer.bytes_written(), file.len() as u64);

        let demuxed = demux_all(&file).unwrap();
        assert_eq!(demuxed.video.len(), 30);
        assert_eq!(mc_common::track_duration(&demuxed.video), 1_000_000);
        assert_eq!(demuxed.video.iter().filter(|s| s.is_sync).count(), 3);
    }
}
