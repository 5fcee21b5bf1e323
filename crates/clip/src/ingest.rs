//! Ingestion: byte stream or filled store to per-track sample tables.
//!
//! Each chunk is appended to the byte store and pushed through the demuxer
//! in the same pass, so the bytes referenced by a sample are always stored
//! before the sample exists. Keyframe payload offsets are probed once the
//! stream has ended.

use std::collections::HashMap;
use std::io;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use mc_common::{
    AudioDecoderConfig, EngineResult, Sample, TrackConfig, TrackKind, VideoDecoderConfig,
};
use mc_demux::{DemuxEvent, MovieInfo, SampleTransform, StreamDemuxer};
use mc_store::ByteStore;
use tracing::{debug, info, warn};

/// Chunk size used when re-reading a store that is already filled.
const STORE_READ_CHUNK: u64 = 1 << 20;

/// Demuxed tracks of one container. Only the first track of each kind is kept.
#[derive(Clone, Debug)]
pub struct Ingested {
    pub movie: MovieInfo,
    pub video: Option<(VideoDecoderConfig, Vec<Sample>)>,
    pub audio: Option<(AudioDecoderConfig, Vec<Sample>)>,
}

/// Stateful demux pass; bytes go in, sample tables come out.
struct Ingest {
    demuxer: StreamDemuxer,
    include_audio: bool,
    transforms: HashMap<u32, SampleTransform>,
    video_track: Option<u32>,
    audio_track: Option<u32>,
    video: Vec<Sample>,
    audio: Vec<Sample>,
}

impl Ingest {
    fn new(include_audio: bool) -> Self {
        Self {
            demuxer: StreamDemuxer::new(),
            include_audio,
            transforms: HashMap::new(),
            video_track: None,
            audio_track: None,
            video: Vec::new(),
            audio: Vec::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> EngineResult<()> {
        for event in self.demuxer.push(chunk)? {
            match event {
                DemuxEvent::Ready(movie) => self.on_ready(&movie),
                DemuxEvent::Samples {
                    track_id, samples, ..
                } => {
                    let Some(transform) = self.transforms.get_mut(&track_id) else {
                        continue;
                    };
                    let converted = transform.convert(&samples);
                    if Some(track_id) == self.video_track {
                        self.video.extend(converted);
                    } else if Some(track_id) == self.audio_track {
                        self.audio.extend(converted);
                    }
                }
            }
        }
        Ok(())
    }

    fn on_ready(&mut self, movie: &MovieInfo) {
        self.video_track = movie.video().map(|t| t.track_id);
        self.audio_track = movie
            .audio()
            .filter(|_| self.include_audio)
            .map(|t| t.track_id);
        for track in &movie.tracks {
            if Some(track.track_id) == self.video_track || Some(track.track_id) == self.audio_track
            {
                self.transforms
                    .insert(track.track_id, SampleTransform::new(track));
            }
        }
        if self.video_track.is_none() {
            warn!("Container has no video track");
        }
        if movie.audio().is_none() {
            warn!("Container has no audio track");
        }
    }

    async fn finish(mut self, store: &dyn ByteStore) -> EngineResult<Ingested> {
        self.demuxer.finish()?;
        let movie = self
            .demuxer
            .movie()
            .cloned()
            .ok_or(mc_common::DemuxError::Incomplete)?;

        let video = match self.video_track.and_then(|id| movie.track(id)) {
            Some(track) => {
                if let Some(transform) = self.transforms.get(&track.track_id) {
                    transform
                        .detect_payload_offsets(store, &mut self.video)
                        .await?;
                }
                match &track.config {
                    TrackConfig::Video(config) => Some((config.clone(), self.video)),
                    TrackConfig::Audio(_) => None,
                }
            }
            None => None,
        };
        let audio = match self.audio_track.and_then(|id| movie.track(id)) {
            Some(track) => match &track.config {
                TrackConfig::Audio(config) => Some((config.clone(), self.audio)),
                TrackConfig::Video(_) => None,
            },
            None => None,
        };

        info!(
            brand = %movie.major_brand,
            fragmented = movie.fragmented,
            video_samples = video.as_ref().map_or(0, |(_, s)| s.len()),
            audio_samples = audio.as_ref().map_or(0, |(_, s)| s.len()),
            "Ingest complete"
        );
        Ok(Ingested {
            movie,
            video,
            audio,
        })
    }
}

/// Store every chunk of `stream` in `store` while demuxing it.
pub async fn ingest_stream<S>(
    stream: S,
    store: &dyn ByteStore,
    include_audio: bool,
) -> EngineResult<Ingested>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    futures::pin_mut!(stream);
    let mut ingest = Ingest::new(include_audio);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        store.append(&chunk).await?;
        ingest.push(&chunk)?;
    }
    debug!(bytes = store.len(), "Stream ingested");
    ingest.finish(store).await
}

/// Demux a store that already holds a whole container.
pub async fn ingest_store(store: &dyn ByteStore, include_audio: bool) -> EngineResult<Ingested> {
    let len = store.len();
    let mut ingest = Ingest::new(include_audio);
    let mut offset = 0u64;
    while offset < len {
        let size = STORE_READ_CHUNK.min(len - offset) as u32;
        let chunk = store.read(offset, size).await?;
        ingest.push(&chunk)?;
        offset += size as u64;
    }
    ingest.finish(store).await
}

/// Which track kinds an ingest produced.
pub fn track_kinds(ingested: &Ingested) -> Vec<TrackKind> {
    let mut kinds = Vec::new();
    if ingested.video.is_some() {
        kinds.push(TrackKind::Video);
    }
    if ingested.audio.is_some() {
        kinds.push(TrackKind::Audio);
    }
    kinds
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_demux::testing::{fragmented_mp4, progressive_mp4, Fixture};
    use mc_store::MemoryStore;

    fn chunked(bytes: Vec<u8>, size: usize) -> impl Stream<Item = io::Result<Bytes>> {
        let chunks: Vec<io::Result<Bytes>> = bytes
            .chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        futures::stream::iter(chunks)
    }

    #[tokio::test]
    async fn stream_fills_store_and_tables() {
        let fixture = Fixture::default();
        let bytes = progressive_mp4(&fixture);
        let store = MemoryStore::new();
        let ingested = ingest_stream(chunked(bytes.clone(), 333), &store, true)
            .await
            .unwrap();

        assert_eq!(store.len(), bytes.len() as u64);
        let (_, video) = ingested.video.unwrap();
        let (audio_cfg, audio) = ingested.audio.unwrap();
        assert_eq!(video.len(), fixture.video_frames);
        assert_eq!(audio.len(), fixture.audio_frames);
        assert_eq!(audio_cfg.sample_rate, fixture.sample_rate);

        let first = store.read(video[0].offset, video[0].size).await.unwrap();
        assert_eq!(first.as_ref(), fixture.video_payload(0).as_slice());
    }

    #[tokio::test]
    async fn store_ingest_matches_fragmented_stream() {
        let fixture = Fixture::default();
        let store = MemoryStore::from_bytes(fragmented_mp4(&fixture, 4));
        let ingested = ingest_store(&store, false).await.unwrap();
        assert!(ingested.movie.fragmented);
        assert!(ingested.audio.is_none());
        assert_eq!(track_kinds(&ingested), vec![TrackKind::Video]);
        assert_eq!(ingested.video.unwrap().1.len(), fixture.video_frames);
    }

    #[tokio::test]
    async fn audio_only_container() {
        let fixture = Fixture::audio_only(1);
        let store = MemoryStore::from_bytes(progressive_mp4(&fixture));
        let ingested = ingest_store(&store, true).await.unwrap();
        assert_eq!(track_kinds(&ingested), vec![TrackKind::Audio]);
    }

    #[tokio::test]
    async fn truncated_stream_is_incomplete() {
        let bytes = progressive_mp4(&Fixture::default());
        let store = MemoryStore::new();
        let err = ingest_stream(chunked(bytes[..16].to_vec(), 8), &store, true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            mc_common::EngineError::Demux(mc_common::DemuxError::Incomplete)
        ));
    }
}
