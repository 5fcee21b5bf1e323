//! Sample Transform: container-unit [`SampleEntry`]s to engine [`Sample`]s.
//!
//! Timestamps are rescaled from the track timescale to microseconds and
//! shifted so the first decoded sample of the track sits at dts 0.
//! Durations are derived from rounded end points so they never drift.

use mc_common::{ticks_to_micros, Sample, StoreError, TrackConfig, VideoCodec};
use mc_store::ByteStore;
use tracing::debug;

use crate::mp4::moov::TrackInfo;
use crate::mp4::sample::SampleEntry;
use crate::nal;

/// Upper bound on the bytes read to find a keyframe's picture NAL.
const PAYLOAD_PROBE_BYTES: u32 = 64 * 1024;

/// Per-track converter. Keeps the dts origin across batches.
#[derive(Clone, Debug)]
pub struct SampleTransform {
    timescale: u32,
    origin: Option<u64>,
    /// Codec and NAL length size for keyframe payload probing.
    video: Option<(VideoCodec, u8)>,
}

impl SampleTransform {
    pub fn new(track: &TrackInfo) -> Self {
        let video = match &track.config {
            TrackConfig::Video(config) => Some((
                config.codec,
                nal::length_size(config.codec, config.description.as_deref()),
            )),
            TrackConfig::Audio(_) => None,
        };
        Self {
            timescale: track.timescale,
            origin: None,
            video,
        }
    }

    fn to_micros(&self, ticks: i64) -> i64 {
        ticks_to_micros(ticks - self.origin.unwrap_or(0) as i64, self.timescale)
    }

    /// Convert one demuxed batch.
    pub fn convert(&mut self, entries: &[SampleEntry]) -> Vec<Sample> {
        if self.origin.is_none() {
            self.origin = entries.first().map(|e| e.dts);
        }
        entries
            .iter()
            .map(|e| {
                let cts = self.to_micros(e.cts);
                Sample {
                    dts: self.to_micros(e.dts as i64),
                    cts,
                    duration: self.to_micros(e.cts + e.duration as i64) - cts,
                    offset: e.offset,
                    size: e.size,
                    is_sync: e.is_sync,
                    deleted: false,
                    payload_offset: None,
                }
            })
            .collect()
    }

    /// Record the picture-NAL offset of every keyframe whose access unit
    /// starts with SEI/AUD units. The payload bytes must already be stored.
    pub async fn detect_payload_offsets(
        &self,
        store: &dyn ByteStore,
        samples: &mut [Sample],
    ) -> Result<usize, StoreError> {
        let Some((codec, length_size)) = self.video else {
            return Ok(0);
        };
        let mut found = 0;
        for sample in samples.iter_mut().filter(|s| s.is_sync) {
            let probe = sample.size.min(PAYLOAD_PROBE_BYTES);
            let data = store.read(sample.offset, probe).await?;
            sample.payload_offset = nal::payload_offset(&data, codec, length_size);
            if sample.payload_offset.is_some() {
                found += 1;
            }
        }
        if found > 0 {
            debug!("{} keyframes carry a prefix before the picture NAL", found);
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{DemuxEvent, StreamDemuxer};
    use crate::testing::{progressive_mp4, Fixture};
    use mc_common::{AudioCodec, AudioDecoderConfig, Resolution, TrackKind};
    use mc_store::MemoryStore;

    fn audio_track(timescale: u32) -> TrackInfo {
        TrackInfo {
            track_id: 2,
            kind: TrackKind::Audio,
            timescale,
            duration: 0,
            resolution: Resolution::default(),
            config: TrackConfig::Audio(AudioDecoderConfig {
                codec: AudioCodec::Aac,
                codec_string: "mp4a.40.2".into(),
                sample_rate: timescale,
                channels: 2,
                description: None,
            }),
        }
    }

    fn entry(dts: u64, duration: u32) -> SampleEntry {
        SampleEntry {
            offset: 0,
            size: 1,
            dts,
            cts: dts as i64,
            duration,
            is_sync: true,
        }
    }

    #[test]
    fn rebases_to_first_dts_and_keeps_durations_exact() {
        let mut transform = SampleTransform::new(&audio_track(44_100));
        let first = transform.convert(&[entry(88_200, 1024), entry(89_224, 1024)]);
        assert_eq!(first[0].dts, 0);
        assert_eq!(first[0].cts, 0);
        // Origin survives across batches.
        let second = transform.convert(&[entry(90_248, 1024)]);
        assert_eq!(second[0].cts, ticks_to_micros(2048, 44_100));
        let total: i64 = first.iter().chain(&second).map(|s| s.duration).sum();
        assert_eq!(total, ticks_to_micros(3 * 1024, 44_100));
    }

    #[tokio::test]
    async fn keyframe_prefix_is_detected_from_store() {
        let fixture = Fixture {
            sei_prefix: true,
            ..Fixture::default()
        };
        let bytes = progressive_mp4(&fixture);
        let store = MemoryStore::from_bytes(bytes.clone());

        let mut demuxer = StreamDemuxer::new();
        let events = demuxer.push(&bytes).unwrap();
        let movie = demuxer.movie().unwrap().clone();
        let video = movie.video().unwrap();
        let entries = events
            .into_iter()
            .find_map(|e| match e {
                DemuxEvent::Samples {
                    kind: TrackKind::Video,
                    samples,
                    ..
                } => Some(samples),
                _ => None,
            })
            .unwrap();

        let mut transform = SampleTransform::new(video);
        let mut samples = transform.convert(&entries);
        let found = transform
            .detect_payload_offsets(&store, &mut samples)
            .await
            .unwrap();
        assert_eq!(found, 2);
        assert_eq!(samples[0].payload_offset, Some(7));
        assert_eq!(samples[1].payload_offset, None);
        assert_eq!(samples[1].cts, 33_333);
    }
}
