//! Fragmented MP4 (moof/traf) sample resolution.
//!
//! Per-sample fields fall back from trun to tfhd defaults to the trex
//! defaults declared in moov/mvex.

use mc_common::DemuxError;
use std::collections::HashMap;
use std::io::{Read, Seek};
use tracing::{debug, warn};

use super::boxes::{
    parse_tfdt, parse_tfhd, parse_trun, read_box_header, BoxHeader, TfhdBox, TrexBox, TrunBox,
    SAMPLE_FLAG_NON_SYNC, TFDT, TFHD, TRAF, TRUN,
};
use super::sample::SampleEntry;

/// Samples of one track found in a moof.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackFragment {
    pub track_id: u32,
    pub samples: Vec<SampleEntry>,
}

/// Cross-fragment state: trex defaults and the running decode time of each
/// track, used when a traf carries no tfdt.
#[derive(Clone, Debug, Default)]
pub struct FragmentState {
    trex: HashMap<u32, TrexBox>,
    next_dts: HashMap<u32, u64>,
}

impl FragmentState {
    pub fn new(trex: &[TrexBox]) -> Self {
        Self {
            trex: trex.iter().map(|t| (t.track_id, t.clone())).collect(),
            next_dts: HashMap::new(),
        }
    }

    /// Continue decode time after the samples a moov sample table declared.
    pub fn set_next_dts(&mut self, track_id: u32, dts: u64) {
        self.next_dts.insert(track_id, dts);
    }

    /// Parse a moof box. The reader must be positioned at the content start;
    /// `moof_start` is the absolute stream offset of the box, the default base
    /// for data offsets.
    pub fn parse_moof<R: Read + Seek>(
        &mut self,
        reader: &mut R,
        header: &BoxHeader,
        moof_start: u64,
    ) -> Result<Vec<TrackFragment>, DemuxError> {
        let moof_end = header.definite_end("moof")?;
        let mut fragments = Vec::new();

        while reader.stream_position()? + 8 <= moof_end {
            let Some(child) = read_box_header(reader)? else {
                break;
            };
            if child.box_type == TRAF {
                if let Some(fragment) = self.parse_traf(reader, &child, moof_start)? {
                    fragments.push(fragment);
                }
            }
            let end = child.end_offset().unwrap_or(moof_end).min(moof_end);
            reader.seek(std::io::SeekFrom::Start(end))?;
        }
        Ok(fragments)
    }

    fn parse_traf<R: Read + Seek>(
        &mut self,
        reader: &mut R,
        header: &BoxHeader,
        moof_start: u64,
    ) -> Result<Option<TrackFragment>, DemuxError> {
        let traf_end = header.definite_end("traf")?;
        let mut tfhd: Option<TfhdBox> = None;
        let mut base_dts: Option<u64> = None;
        let mut runs: Vec<TrunBox> = Vec::new();

        while reader.stream_position()? + 8 <= traf_end {
            let Some(child) = read_box_header(reader)? else {
                break;
            };
            match child.box_type {
                TFHD => tfhd = Some(parse_tfhd(reader)?),
                TFDT => base_dts = Some(parse_tfdt(reader)?),
                TRUN => runs.push(parse_trun(reader)?),
                _ => {}
            }
            let end = child.end_offset().unwrap_or(traf_end).min(traf_end);
            reader.seek(std::io::SeekFrom::Start(end))?;
        }

        let tfhd = tfhd.ok_or_else(|| DemuxError::InvalidStructure {
            offset: moof_start + header.offset,
            reason: "traf has no tfhd".into(),
        })?;
        let track_id = tfhd.track_id;
        let Some(trex) = self.trex.get(&track_id) else {
            warn!("traf for track {} without trex defaults, skipping", track_id);
            return Ok(None);
        };

        let default_duration = tfhd
            .default_sample_duration
            .unwrap_or(trex.default_sample_duration);
        let default_size = tfhd.default_sample_size.unwrap_or(trex.default_sample_size);
        let default_flags = tfhd
            .default_sample_flags
            .unwrap_or(trex.default_sample_flags);

        let mut dts = base_dts
            .or_else(|| self.next_dts.get(&track_id).copied())
            .unwrap_or(0);
        let base_offset = tfhd.base_data_offset.unwrap_or(moof_start);
        let mut data_cursor = base_offset;
        let mut samples = Vec::new();

        for run in &runs {
            if let Some(rel) = run.data_offset {
                data_cursor = base_offset.checked_add_signed(rel as i64).ok_or_else(|| {
                    DemuxError::InvalidStructure {
                        offset: moof_start + header.offset,
                        reason: format!("trun data offset {rel} underflows base {base_offset}"),
                    }
                })?;
            }
            for s in &run.samples {
                let duration = s.duration.unwrap_or(default_duration);
                let size = s.size.unwrap_or(default_size);
                let flags = s.flags.unwrap_or(default_flags);
                samples.push(SampleEntry {
                    offset: data_cursor,
                    size,
                    dts,
                    cts: dts as i64 + s.cts_offset as i64,
                    duration,
                    is_sync: flags & SAMPLE_FLAG_NON_SYNC == 0,
                });
                data_cursor += size as u64;
                dts += duration as u64;
            }
        }

        self.next_dts.insert(track_id, dts);
        debug!(
            "traf: track {} with {} samples in {} runs",
            track_id,
            samples.len(),
            runs.len()
        );
        Ok(Some(TrackFragment { track_id, samples }))
    }
}
