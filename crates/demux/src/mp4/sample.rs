//! Sample table interpretation: maps sample indices to byte offsets, sizes,
//! timestamps, and keyframe status.
//!
//! Combines the parsed stsc, stsz, stco/co64, stts, ctts, and stss data into
//! one flat list of [`SampleEntry`] in decode order.

use mc_common::DemuxError;
use tracing::debug;

use crate::mp4::boxes::{CttsEntry, StscEntry, StszBox, SttsEntry};

/// One sample in container units, before conversion to the engine timebase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleEntry {
    /// Absolute byte offset of the sample data.
    pub offset: u64,
    pub size: u32,
    /// Decode timestamp in media timescale units.
    pub dts: u64,
    /// Composition timestamp in media timescale units.
    pub cts: i64,
    pub duration: u32,
    pub is_sync: bool,
}

/// The stbl children needed to build a sample table.
#[derive(Clone, Debug, Default)]
pub struct SampleTableBoxes {
    pub stts: Vec<SttsEntry>,
    pub ctts: Vec<CttsEntry>,
    pub stsc: Vec<StscEntry>,
    pub stsz: Option<StszBox>,
    pub chunk_offsets: Vec<u64>,
    /// 1-based sync sample numbers. `None` (no stss box) means every
    /// sample is a sync sample.
    pub sync_samples: Option<Vec<u32>>,
}

impl SampleTableBoxes {
    pub fn sample_count(&self) -> usize {
        self.stsz.as_ref().map_or(0, |s| s.sample_count as usize)
    }

    /// Flatten into per-sample entries.
    pub fn build(&self) -> Result<Vec<SampleEntry>, DemuxError> {
        let sample_count = self.sample_count();
        let Some(stsz) = self.stsz.as_ref().filter(|_| sample_count > 0) else {
            return Ok(Vec::new());
        };

        let offsets_and_sizes = build_sample_offsets(
            &self.stsc,
            &self.chunk_offsets,
            &stsz.sample_sizes,
            stsz.default_sample_size,
            sample_count,
        )?;
        let timing = build_timing(&self.stts, sample_count);
        let cts_offsets = build_cts_offsets(&self.ctts, sample_count);

        let samples: Vec<SampleEntry> = offsets_and_sizes
            .into_iter()
            .zip(timing)
            .zip(cts_offsets)
            .enumerate()
            .map(|(i, (((offset, size), (dts, duration)), cts_offset))| {
                let number = i as u32 + 1;
                SampleEntry {
                    offset,
                    size,
                    dts,
                    cts: dts as i64 + cts_offset as i64,
                    duration,
                    is_sync: self
                        .sync_samples
                        .as_ref()
                        .map_or(true, |sync| sync.binary_search(&number).is_ok()),
                }
            })
            .collect();

        debug!(
            "SampleTable: {} samples, {} sync",
            samples.len(),
            samples.iter().filter(|s| s.is_sync).count()
        );
        Ok(samples)
    }
}

/// (file_offset, size) for each sample, from stsc + stco + stsz.
fn build_sample_offsets(
    stsc: &[StscEntry],
    chunk_offsets: &[u64],
    sample_sizes: &[u32],
    default_sample_size: u32,
    sample_count: usize,
) -> Result<Vec<(u64, u32)>, DemuxError> {
    let mut result = Vec::with_capacity(sample_count);

    'chunks: for (chunk_idx, &chunk_offset) in chunk_offsets.iter().enumerate() {
        // chunk numbers are 1-based in stsc
        let samples_in_chunk = samples_per_chunk_for(stsc, chunk_idx as u32 + 1);
        let mut offset = chunk_offset;

        for _ in 0..samples_in_chunk {
            let sample_idx = result.len();
            if sample_idx >= sample_count {
                break 'chunks;
            }
            let size = if default_sample_size > 0 {
                default_sample_size
            } else {
                *sample_sizes
                    .get(sample_idx)
                    .ok_or_else(|| DemuxError::InvalidStructure {
                        offset: 0,
                        reason: format!(
                            "Sample index {} exceeds stsz table length {}",
                            sample_idx,
                            sample_sizes.len()
                        ),
                    })?
            };
            result.push((offset, size));
            offset += size as u64;
        }
    }

    if result.len() != sample_count {
        return Err(DemuxError::InvalidStructure {
            offset: 0,
            reason: format!(
                "Built {} sample offsets but expected {} (stsc/stco/stsz mismatch)",
                result.len(),
                sample_count
            ),
        });
    }
    Ok(result)
}

/// Samples in the given 1-based chunk: the last stsc entry whose
/// `first_chunk` is not after it applies.
fn samples_per_chunk_for(stsc: &[StscEntry], chunk_num: u32) -> u32 {
    stsc.iter()
        .take_while(|e| e.first_chunk <= chunk_num)
        .last()
        .map_or(1, |e| e.samples_per_chunk)
}

/// (dts, duration) per sample from stts. A short table repeats its last delta.
fn build_timing(stts: &[SttsEntry], sample_count: usize) -> Vec<(u64, u32)> {
    let mut timing = Vec::with_capacity(sample_count);
    let mut dts: u64 = 0;

    for entry in stts {
        for _ in 0..entry.sample_count {
            if timing.len() >= sample_count {
                return timing;
            }
            timing.push((dts, entry.sample_delta));
            dts += entry.sample_delta as u64;
        }
    }

    let last_delta = stts.last().map_or(1, |e| e.sample_delta);
    while timing.len() < sample_count {
        timing.push((dts, last_delta));
        dts += last_delta as u64;
    }
    timing
}

/// Composition offset per sample from ctts, zero where it is absent.
fn build_cts_offsets(ctts: &[CttsEntry], sample_count: usize) -> Vec<i32> {
    let mut offsets: Vec<i32> = ctts
        .iter()
        .flat_map(|e| std::iter::repeat(e.sample_offset).take(e.sample_count as usize))
        .take(sample_count)
        .collect();
    offsets.resize(sample_count, 0);
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stsz(sizes: Vec<u32>) -> Option<StszBox> {
        Some(StszBox {
            default_sample_size: 0,
            sample_count: sizes.len() as u32,
            sample_sizes: sizes,
        })
    }

    #[test]
    fn offsets_follow_chunk_layout() {
        // Two chunks: 2 samples in the first, 1 in the second.
        let boxes = SampleTableBoxes {
            stts: vec![SttsEntry {
                sample_count: 3,
                sample_delta: 1000,
            }],
            stsc: vec![
                StscEntry {
                    first_chunk: 1,
                    samples_per_chunk: 2,
                },
                StscEntry {
                    first_chunk: 2,
                    samples_per_chunk: 1,
                },
            ],
            stsz: stsz(vec![100, 50, 70]),
            chunk_offsets: vec![1000, 5000],
            sync_samples: Some(vec![1]),
            ..Default::default()
        };

        let samples = boxes.build().unwrap();
        let offsets: Vec<_> = samples.iter().map(|s| (s.offset, s.size)).collect();
        assert_eq!(offsets, vec![(1000, 100), (1100, 50), (5000, 70)]);
        assert_eq!(samples[2].dts, 2000);
        assert_eq!(samples[2].duration, 1000);
        assert!(samples[0].is_sync);
        assert!(!samples[1].is_sync);
    }

    #[test]
    fn ctts_shifts_presentation() {
        let boxes = SampleTableBoxes {
            stts: vec![SttsEntry {
                sample_count: 3,
                sample_delta: 10,
            }],
            ctts: vec![
                CttsEntry {
                    sample_count: 1,
                    sample_offset: 20,
                },
                CttsEntry {
                    sample_count: 1,
                    sample_offset: -10,
                },
            ],
            stsc: vec![StscEntry {
                first_chunk: 1,
                samples_per_chunk: 3,
            }],
            stsz: stsz(vec![1, 1, 1]),
            chunk_offsets: vec![0],
            sync_samples: None,
            ..Default::default()
        };
        let samples = boxes.build().unwrap();
        let cts: Vec<_> = samples.iter().map(|s| s.cts).collect();
        assert_eq!(cts, vec![20, 0, 20]);
        assert!(samples.iter().all(|s| s.is_sync));
    }

    #[test]
    fn short_stts_repeats_last_delta() {
        let timing = build_timing(
            &[SttsEntry {
                sample_count: 1,
                sample_delta: 512,
            }],
            3,
        );
        assert_eq!(timing, vec![(0, 512), (512, 512), (1024, 512)]);
    }

    #[test]
    fn chunk_table_mismatch_is_error() {
        let boxes = SampleTableBoxes {
            stsc: vec![StscEntry {
                first_chunk: 1,
                samples_per_chunk: 1,
            }],
            stsz: stsz(vec![10, 10]),
            chunk_offsets: vec![0],
            ..Default::default()
        };
        assert!(matches!(
            boxes.build(),
            Err(DemuxError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn empty_table() {
        assert!(SampleTableBoxes::default().build().unwrap().is_empty());
    }
}
