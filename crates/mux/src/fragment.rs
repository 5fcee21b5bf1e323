//! Media segment writer: one `moof` + `mdat` pair per call.
//!
//! Each track gets a `traf` with `tfhd` (default-base-is-moof), a version 1
//! `tfdt` carrying the absolute base decode time and a version 1 `trun`
//! with explicit duration, size, flags and signed composition offset per
//! sample. Track payloads are laid out back to back in the `mdat` in the
//! order the tracks are given.

use byteorder::{BigEndian, WriteBytesExt};
use bytes::Bytes;

use crate::atoms::{fill_box_size, new_buf, open_box, open_full_box, BoxBuf};
use crate::error::{MuxError, MuxResult};

const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x02_0000;

const TRUN_DATA_OFFSET: u32 = 0x000001;
const TRUN_SAMPLE_DURATION: u32 = 0x000100;
const TRUN_SAMPLE_SIZE: u32 = 0x000200;
const TRUN_SAMPLE_FLAGS: u32 = 0x000400;
const TRUN_SAMPLE_CTS_OFFSET: u32 = 0x000800;

/// sample_depends_on = 2 (independent).
const SYNC_SAMPLE_FLAGS: u32 = 0x0200_0000;
/// sample_depends_on = 1, sample_is_non_sync_sample = 1.
const NON_SYNC_SAMPLE_FLAGS: u32 = 0x0101_0000;

/// One encoded sample, timed in its track's timescale.
#[derive(Clone, Debug, PartialEq)]
pub struct FragmentSample {
    pub data: Bytes,
    /// Decode time in track ticks.
    pub dts: u64,
    pub duration: u32,
    /// Presentation minus decode time, in track ticks.
    pub cts_offset: i32,
    pub is_sync: bool,
}

impl FragmentSample {
    fn flags(&self) -> u32 {
        if self.is_sync {
            SYNC_SAMPLE_FLAGS
        } else {
            NON_SYNC_SAMPLE_FLAGS
        }
    }
}

/// Samples of one track inside a fragment.
#[derive(Clone, Copy, Debug)]
pub struct TrackRun<'a> {
    pub track_id: u32,
    pub samples: &'a [FragmentSample],
}

impl TrackRun<'_> {
    fn payload_len(&self) -> u64 {
        self.samples.iter().map(|s| s.data.len() as u64).sum()
    }

    /// Base decode time: the first sample's dts.
    fn base_dts(&self) -> u64 {
        self.samples.first().map_or(0, |s| s.dts)
    }
}

/// Serialize one `moof` + `mdat`. Runs without samples are skipped; if no
/// run has samples the result is empty.
pub fn write_fragment(sequence: u32, runs: &[TrackRun<'_>]) -> MuxResult<Vec<u8>> {
    let runs: Vec<TrackRun<'_>> = runs
        .iter()
        .copied()
        .filter(|r| !r.samples.is_empty())
        .collect();
    if runs.is_empty() {
        return Ok(Vec::new());
    }

    // The moof size does not depend on the offsets it contains, so a first
    // pass with zero offsets tells where the mdat payload starts.
    let probe = write_moof(sequence, &runs, 0)?;
    let moof = write_moof(sequence, &runs, probe.len() as u64 + 8)?;

    let payload_len: u64 = runs.iter().map(TrackRun::payload_len).sum();
    let mdat_size = payload_len + 8;
    if mdat_size > u32::MAX as u64 {
        return Err(MuxError::BufferFull(format!(
            "mdat of {payload_len} bytes exceeds 32-bit box size"
        )));
    }

    let mut out = moof;
    out.reserve(mdat_size as usize);
    out.write_u32::<BigEndian>(mdat_size as u32)?;
    out.extend_from_slice(b"mdat");
    for run in &runs {
        for sample in run.samples {
            out.extend_from_slice(&sample.data);
        }
    }
    Ok(out)
}

fn write_moof(sequence: u32, runs: &[TrackRun<'_>], first_data_offset: u64) -> MuxResult<Vec<u8>> {
    let mut w = new_buf();
    let moof = open_box(&mut w, b"moof")?;

    let mfhd = open_full_box(&mut w, b"mfhd", 0, 0)?;
    w.write_u32::<BigEndian>(sequence)?;
    fill_box_size(&mut w, mfhd)?;

    let mut data_offset = first_data_offset;
    for run in runs {
        write_traf(&mut w, run, data_offset)?;
        data_offset += run.payload_len();
    }

    fill_box_size(&mut w, moof)?;
    Ok(w.into_inner())
}

fn write_traf(w: &mut BoxBuf, run: &TrackRun<'_>, data_offset: u64) -> MuxResult<()> {
    let data_offset = i32::try_from(data_offset).map_err(|_| {
        MuxError::BufferFull(format!("trun data offset {data_offset} exceeds 32 bits"))
    })?;

    let traf = open_box(w, b"traf")?;

    let tfhd = open_full_box(w, b"tfhd", 0, TFHD_DEFAULT_BASE_IS_MOOF)?;
    w.write_u32::<BigEndian>(run.track_id)?;
    fill_box_size(w, tfhd)?;

    let tfdt = open_full_box(w, b"tfdt", 1, 0)?;
    w.write_u64::<BigEndian>(run.base_dts())?;
    fill_box_size(w, tfdt)?;

    let flags = TRUN_DATA_OFFSET
        | TRUN_SAMPLE_DURATION
        | TRUN_SAMPLE_SIZE
        | TRUN_SAMPLE_FLAGS
        | TRUN_SAMPLE_CTS_OFFSET;
    let trun = open_full_box(w, b"trun", 1, flags)?;
    w.write_u32::<BigEndian>(run.samples.len() as u32)?;
    w.write_i32::<BigEndian>(data_offset)?;
    for sample in run.samples {
        w.write_u32::<BigEndian>(sample.duration)?;
        w.write_u32::<BigEndian>(sample.data.len() as u32)?;
        w.write_u32::<BigEndian>(sample.flags())?;
        w.write_i32::<BigEndian>(sample.cts_offset)?;
    }
    fill_box_size(w, trun)?;

    fill_box_size(w, traf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::{write_init_segment, TrackSpec};
    use mc_common::testing::{aac_specific_config, FAKE_AVCC};
    use mc_common::{
        AudioCodec, AudioDecoderConfig, HardwareAcceleration, Resolution, TrackConfig, VideoCodec,
        VideoDecoderConfig,
    };
    use mc_demux::testing::demux_all;

    fn sample(payload: &[u8], dts: u64, duration: u32, is_sync: bool) -> FragmentSample {
        FragmentSample {
            data: Bytes::copy_from_slice(payload),
            dts,
            duration,
            cts_offset: 0,
            is_sync,
        }
    }

    fn tracks() -> Vec<TrackSpec> {
        vec![
            TrackSpec::new(
                1,
                TrackConfig::Video(VideoDecoderConfig {
                    codec: VideoCodec::H264,
                    codec_string: "avc1.42001f".into(),
                    coded: Resolution::new(32, 18),
                    description: Some(Bytes::from_static(FAKE_AVCC)),
                    hardware_acceleration: HardwareAcceleration::NoPreference,
                }),
            ),
            TrackSpec::new(
                2,
                TrackConfig::Audio(AudioDecoderConfig {
                    codec: AudioCodec::Aac,
                    codec_string: "mp4a.40.2".into(),
                    sample_rate: 48_000,
                    channels: 2,
                    description: Some(Bytes::copy_from_slice(&aac_specific_config(48_000, 2))),
                }),
            ),
        ]
    }

    #[test]
    fn empty_runs_write_nothing() {
        let out = write_fragment(1, &[TrackRun { track_id: 1, samples: &[] }]).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn moof_header_layout() {
        let video = [sample(&[1, 2, 3], 0, 3000, true)];
        let out = write_fragment(7, &[TrackRun { track_id: 1, samples: &video }]).unwrap();
        assert_eq!(&out[4..8], b"moof");
        assert_eq!(&out[12..16], b"mfhd");
        assert_eq!(&out[20..24], &7u32.to_be_bytes());

        let moof_len = u32::from_be_bytes([out[0], out[1], out[2], out[3]]) as usize;
        assert_eq!(&out[moof_len + 4..moof_len + 8], b"mdat");
        assert_eq!(&out[moof_len + 8..], &[1, 2, 3]);
    }

    #[test]
    fn fragments_demux_with_offsets_and_timing() {
        let video = [
            sample(b"key0", 0, 3000, true),
            sample(b"delta1", 3000, 3000, false),
            sample(b"key2", 6000, 3000, true),
        ];
        let audio = [sample(b"aa", 0, 1024, true), sample(b"bbb", 1024, 1024, true)];
        let later = [sample(b"delta3", 9000, 3000, false)];

        let mut file = write_init_segment(&tracks(), 0).unwrap();
        let first = write_fragment(
            1,
            &[
                TrackRun { track_id: 1, samples: &video },
                TrackRun { track_id: 2, samples: &audio },
            ],
        )
        .unwrap();
        let first_start = file.len() as u64;
        file.extend_from_slice(&first);
        file.extend(write_fragment(2, &[TrackRun { track_id: 1, samples: &later }]).unwrap());

        let demuxed = demux_all(&file).unwrap();
        assert_eq!(demuxed.video.len(), 4);
        assert_eq!(demuxed.audio.len(), 2);

        let cts: Vec<i64> = demuxed.video.iter().map(|s| s.cts).collect();
        assert_eq!(cts, vec![0, 33_333, 66_666, 100_000]);
        let sync: Vec<bool> = demuxed.video.iter().map(|s| s.is_sync).collect();
        assert_eq!(sync, vec![true, false, true, false]);

        // Payloads land where the trun says they are.
        for (s, expected) in demuxed.video.iter().zip([&b"key0"[..], b"delta1", b"key2", b"delta3"]) {
            let start = s.offset as usize;
            assert_eq!(&file[start..start + s.size as usize], expected);
        }
        let audio_start = demuxed.audio[0].offset;
        assert!(audio_start > first_start);
        assert_eq!(&file[audio_start as usize..audio_start as usize + 2], b"aa");
        assert_eq!(demuxed.audio[1].cts, 21_333);
    }

    #[test]
    fn composition_offsets_are_signed() {
        let mut reordered = sample(b"b", 3000, 3000, false);
        reordered.cts_offset = -3000;
        let video = [sample(b"k", 0, 3000, true), reordered];

        let mut file = write_init_segment(&tracks()[..1], 0).unwrap();
        file.extend(write_fragment(1, &[TrackRun { track_id: 1, samples: &video }]).unwrap());
        let demuxed = demux_all(&file).unwrap();
        assert_eq!(demuxed.video[1].cts, 0);
        assert_eq!(demuxed.video[1].dts, 33_333);
    }
}
