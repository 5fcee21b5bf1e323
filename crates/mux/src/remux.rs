//! Remux passes over finished files: no decoding, no encoding.
//!
//! [`fast_concat`] appends MP4 inputs (progressive or fragmented) into one
//! fragmented output. Each output track continues where the same track of
//! the previous input ended, so timestamps stay monotonic. The init segment
//! carries the summed duration, which is what [`fix_duration`] relies on to
//! repair outputs written with an unknown duration.

use std::collections::HashMap;

use mc_common::{ticks_to_micros, DemuxError, Micros, TrackKind};
use mc_demux::{DemuxEvent, MovieInfo, SampleEntry, StreamDemuxer, TrackInfo};
use mc_store::ByteStore;
use tracing::{debug, info};

use crate::error::{MuxError, MuxResult};
use crate::fragment::{write_fragment, FragmentSample, TrackRun};
use crate::init::{write_init_segment, TrackSpec};

/// Chunk size for reading an input through the demuxer.
const READ_CHUNK: u64 = 1 << 20;

/// Outcome of a remux pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConcatSummary {
    pub inputs: usize,
    pub duration: Micros,
    pub video_samples: usize,
    pub audio_samples: usize,
    pub bytes_written: u64,
}

/// One demuxed input: the first track of each kind with its raw entries.
struct Input {
    video: Option<(TrackInfo, Vec<SampleEntry>)>,
    audio: Option<(TrackInfo, Vec<SampleEntry>)>,
}

impl Input {
    fn track(&self, kind: TrackKind) -> Option<&(TrackInfo, Vec<SampleEntry>)> {
        match kind {
            TrackKind::Video => self.video.as_ref(),
            TrackKind::Audio => self.audio.as_ref(),
        }
    }

    fn kinds(&self) -> Vec<TrackKind> {
        [
            self.video.as_ref().map(|_| TrackKind::Video),
            self.audio.as_ref().map(|_| TrackKind::Audio),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

async fn read_input(store: &dyn ByteStore) -> MuxResult<Input> {
    let mut demuxer = StreamDemuxer::new();
    let mut entries: HashMap<u32, Vec<SampleEntry>> = HashMap::new();
    let len = store.len();
    let mut offset = 0;
    while offset < len {
        let size = READ_CHUNK.min(len - offset);
        let chunk = store.read(offset, size as u32).await?;
        for event in demuxer.push(&chunk)? {
            if let DemuxEvent::Samples {
                track_id, samples, ..
            } = event
            {
                entries.entry(track_id).or_default().extend(samples);
            }
        }
        offset += size;
    }
    demuxer.finish()?;
    let movie: MovieInfo = demuxer.movie().cloned().ok_or(DemuxError::Incomplete)?;

    let mut take = |track: Option<&TrackInfo>| {
        track.map(|t| (t.clone(), entries.remove(&t.track_id).unwrap_or_default()))
    };
    let video = take(movie.video());
    let audio = take(movie.audio());
    Ok(Input { video, audio })
}

/// Rescale a tick count between timescales, rounding to nearest.
fn rescale(ticks: i64, from: u32, to: u32) -> i64 {
    if from == to || from == 0 {
        return ticks;
    }
    let scaled = ticks as i128 * to as i128;
    let half = from as i128 / 2;
    let rounded = if scaled >= 0 {
        (scaled + half) / from as i128
    } else {
        (scaled - half) / from as i128
    };
    rounded as i64
}

/// Output-side state of one track across inputs.
struct ConcatTrack {
    kind: TrackKind,
    spec: TrackSpec,
    /// Where the next input's first sample starts, in output ticks.
    next_dts: u64,
}

/// Concatenate `inputs` into `output` as a single fragmented MP4.
///
/// Every input must carry the same set of track kinds. Decoder
/// configuration is taken from the first input.
pub async fn fast_concat(
    inputs: &[mc_store::SharedStore],
    output: &dyn ByteStore,
) -> MuxResult<ConcatSummary> {
    if inputs.is_empty() {
        return Err(MuxError::InvalidConfig("concat without inputs".into()));
    }

    let mut parsed = Vec::with_capacity(inputs.len());
    for store in inputs {
        parsed.push(read_input(store.as_ref()).await?);
    }

    let kinds = parsed[0].kinds();
    if kinds.is_empty() {
        return Err(MuxError::TrackError("first input has no audio or video track".into()));
    }
    for (index, input) in parsed.iter().enumerate().skip(1) {
        if input.kinds() != kinds {
            return Err(MuxError::TrackError(format!(
                "input {index} has tracks {:?}, expected {:?}",
                input.kinds(),
                kinds
            )));
        }
    }

    let mut tracks: Vec<ConcatTrack> = Vec::new();
    for (i, kind) in kinds.iter().enumerate() {
        if let Some((info, _)) = parsed[0].track(*kind) {
            tracks.push(ConcatTrack {
                kind: *kind,
                spec: TrackSpec {
                    track_id: i as u32 + 1,
                    timescale: info.timescale.max(1),
                    config: info.config.clone(),
                },
                next_dts: 0,
            });
        }
    }

    // Total duration per track, to put the real value in the header.
    let mut duration: Micros = 0;
    for track in &tracks {
        let mut ticks = 0i64;
        for input in &parsed {
            if let Some((info, entries)) = input.track(track.kind) {
                ticks += rescale(span(entries), info.timescale, track.spec.timescale);
            }
        }
        duration = duration.max(ticks_to_micros(ticks, track.spec.timescale));
    }

    let specs: Vec<TrackSpec> = tracks.iter().map(|t| t.spec.clone()).collect();
    let init = write_init_segment(&specs, duration)?;
    output.append(&init).await?;

    let mut summary = ConcatSummary {
        inputs: inputs.len(),
        duration,
        bytes_written: init.len() as u64,
        ..Default::default()
    };

    for (index, (input, store)) in parsed.iter().zip(inputs).enumerate() {
        let mut runs: Vec<(u32, Vec<FragmentSample>)> = Vec::new();
        for track in &mut tracks {
            let Some((info, entries)) = input.track(track.kind) else {
                continue;
            };
            let samples = remap_samples(store.as_ref(), info, entries, track).await?;
            match track.kind {
                TrackKind::Video => summary.video_samples += samples.len(),
                TrackKind::Audio => summary.audio_samples += samples.len(),
            }
            runs.push((track.spec.track_id, samples));
        }

        let track_runs: Vec<TrackRun<'_>> = runs
            .iter()
            .map(|(track_id, samples)| TrackRun {
                track_id: *track_id,
                samples,
            })
            .collect();
        let fragment = write_fragment(index as u32 + 1, &track_runs)?;
        debug!(input = index, bytes = fragment.len(), "Remuxed input");
        output.append(&fragment).await?;
        summary.bytes_written += fragment.len() as u64;
    }

    info!(
        inputs = summary.inputs,
        duration = summary.duration,
        video_samples = summary.video_samples,
        audio_samples = summary.audio_samples,
        "Concat finished"
    );
    Ok(summary)
}

/// Rewrite a file through the concat path so its header carries the real
/// duration.
pub async fn fix_duration(
    input: mc_store::SharedStore,
    output: &dyn ByteStore,
) -> MuxResult<ConcatSummary> {
    fast_concat(&[input], output).await
}

/// Decode-time span of a track: first dts to the end of the last sample.
fn span(entries: &[SampleEntry]) -> i64 {
    match (entries.first(), entries.last()) {
        (Some(first), Some(last)) => (last.dts + last.duration as u64) as i64 - first.dts as i64,
        _ => 0,
    }
}

async fn remap_samples(
    store: &dyn ByteStore,
    info: &TrackInfo,
    entries: &[SampleEntry],
    track: &mut ConcatTrack,
) -> MuxResult<Vec<FragmentSample>> {
    let Some(first) = entries.first() else {
        return Ok(Vec::new());
    };
    let from = info.timescale;
    let to = track.spec.timescale;
    let origin = first.dts;

    let mut samples = Vec::with_capacity(entries.len());
    for entry in entries {
        let dts = track.next_dts as i64 + rescale((entry.dts - origin) as i64, from, to);
        let end = track.next_dts as i64
            + rescale((entry.dts - origin) as i64 + entry.duration as i64, from, to);
        let cts_offset = rescale(entry.cts - entry.dts as i64, from, to);
        samples.push(FragmentSample {
            data: store.read(entry.offset, entry.size).await?,
            dts: dts.max(0) as u64,
            duration: (end - dts).max(0) as u32,
            cts_offset: cts_offset as i32,
            is_sync: entry.is_sync,
        });
    }
    track.next_dts += rescale(span(entries), from, to).max(0) as u64;
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_demux::testing::{demux_all, fragmented_mp4, progressive_mp4, Fixture};
    use mc_store::{MemoryStore, SharedStore};
    use std::sync::Arc;

    async fn collect(store: &MemoryStore) -> Vec<u8> {
        store.read(0, store.len() as u32).await.unwrap().to_vec()
    }

    #[test]
    fn rescale_rounds() {
        assert_eq!(rescale(3000, 90_000, 90_000), 3000);
        assert_eq!(rescale(1024, 48_000, 1000), 21);
        assert_eq!(rescale(1, 3, 2), 1);
        assert_eq!(rescale(-3000, 90_000, 1000), -33);
    }

    #[tokio::test]
    async fn concat_offsets_each_input() {
        let a: SharedStore = Arc::new(MemoryStore::from_bytes(progressive_mp4(&Fixture::default())));
        let b: SharedStore = Arc::new(MemoryStore::from_bytes(fragmented_mp4(&Fixture::default(), 2)));
        let out = MemoryStore::new();

        let summary = fast_concat(&[a, b], &out).await.unwrap();
        assert_eq!(summary.inputs, 2);
        assert_eq!(summary.video_samples, 120);
        assert_eq!(summary.audio_samples, 188);
        assert_eq!(summary.bytes_written, out.len());

        let demuxed = demux_all(&collect(&out).await).unwrap();
        assert_eq!(demuxed.video.len(), 120);
        assert_eq!(mc_common::track_duration(&demuxed.video), 4_000_000);
        assert_eq!(demuxed.video[60].cts, 2_000_000);
        assert!(demuxed.video[60].is_sync);
        assert!(demuxed.audio.windows(2).all(|w| w[0].dts < w[1].dts));
        assert_eq!(demuxed.movie.duration_micros(), 4_011_000);

        // Payloads are copied unchanged.
        let bytes = collect(&out).await;
        let s = &demuxed.video[61];
        assert_eq!(
            &bytes[s.offset as usize..(s.offset + s.size as u64) as usize],
            &Fixture::default().video_payload(1)[..]
        );
    }

    #[tokio::test]
    async fn mismatched_tracks_are_rejected() {
        let a: SharedStore = Arc::new(MemoryStore::from_bytes(progressive_mp4(&Fixture::default())));
        let b: SharedStore =
            Arc::new(MemoryStore::from_bytes(progressive_mp4(&Fixture::audio_only(2))));
        let out = MemoryStore::new();
        let err = fast_concat(&[a, b], &out).await.unwrap_err();
        assert!(matches!(err, MuxError::TrackError(_)));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn fix_duration_fills_in_header() {
        let fixture = Fixture::audio_only(3);
        let input: SharedStore = Arc::new(MemoryStore::from_bytes(fragmented_mp4(&fixture, 3)));
        let before = demux_all(&collect_shared(&input).await).unwrap();

        let out = MemoryStore::new();
        let summary = fix_duration(input, &out).await.unwrap();
        let after = demux_all(&collect(&out).await).unwrap();

        assert_eq!(after.audio.len(), before.audio.len());
        assert_eq!(summary.duration, mc_common::track_duration(&after.audio));
        assert!(after.movie.duration_micros() >= 3_000_000);
    }

    async fn collect_shared(store: &SharedStore) -> Vec<u8> {
        store.read(0, store.len() as u32).await.unwrap().to_vec()
    }
}
