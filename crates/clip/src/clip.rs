//! `Mp4Clip`: sample tables of one ingested container plus lazily created
//! frame finders.
//!
//! A clip owns its tables behind `Arc`s and replaces them wholesale on every
//! edit, so clones and split halves never observe each other's changes while
//! still sharing the byte store. Finders are per instance and are dropped
//! whenever the tables they index change.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use mc_common::{
    track_duration, AudioData, AudioDecoderConfig, ClipConfig, DecodeError, DecoderFactory,
    EditError, EngineResult, Micros, Sample, TrackKind, VideoDecoderConfig,
};
use mc_decoder::audio::OUTPUT_CHANNELS;
use mc_decoder::{scale_to_width, AudioFrameFinder, Thumbnail, VideoFrameFinder};
use mc_store::SharedStore;
use tracing::{debug, info};

use crate::editor;
use crate::ingest::{ingest_store, ingest_stream, Ingested};
use crate::meta::{ClipMeta, ThumbnailOptions, TickOutput, TickState};

/// Decoder configuration plus the sample table it decodes.
#[derive(Clone, Debug)]
struct Track<C> {
    config: C,
    samples: Arc<Vec<Sample>>,
}

impl<C: Clone> Track<C> {
    fn with_samples(&self, samples: Vec<Sample>) -> Self {
        Self {
            config: self.config.clone(),
            samples: Arc::new(samples),
        }
    }

    /// `None` once nothing in the table is left to play.
    fn live(self) -> Option<Self> {
        self.samples.iter().any(|s| !s.deleted).then_some(self)
    }
}

pub struct Mp4Clip {
    store: SharedStore,
    factory: Arc<dyn DecoderFactory>,
    config: ClipConfig,
    video: Option<Track<VideoDecoderConfig>>,
    audio: Option<Track<AudioDecoderConfig>>,
    meta: ClipMeta,
    video_finder: Option<VideoFrameFinder>,
    audio_finder: Option<AudioFrameFinder>,
    destroyed: bool,
}

impl Mp4Clip {
    /// Ingest `stream` into `store` and build a clip over it.
    pub async fn from_stream<S>(
        stream: S,
        store: SharedStore,
        factory: Arc<dyn DecoderFactory>,
        config: ClipConfig,
    ) -> EngineResult<Self>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let ingested = ingest_stream(stream, store.as_ref(), config.include_audio).await?;
        Ok(Self::from_ingested(ingested, store, factory, config))
    }

    /// Build a clip over a store that already holds a whole container.
    pub async fn from_store(
        store: SharedStore,
        factory: Arc<dyn DecoderFactory>,
        config: ClipConfig,
    ) -> EngineResult<Self> {
        let ingested = ingest_store(store.as_ref(), config.include_audio).await?;
        Ok(Self::from_ingested(ingested, store, factory, config))
    }

    fn from_ingested(
        ingested: Ingested,
        store: SharedStore,
        factory: Arc<dyn DecoderFactory>,
        config: ClipConfig,
    ) -> Self {
        let video = ingested.video.map(|(mut decoder_config, mut samples)| {
            decoder_config.hardware_acceleration = config.hardware_acceleration;
            editor::fix_black_frame(&mut samples, config.black_frame_threshold);
            Track {
                config: decoder_config,
                samples: Arc::new(samples),
            }
        });
        let audio = ingested.audio.map(|(decoder_config, samples)| Track {
            config: decoder_config,
            samples: Arc::new(samples),
        });
        let clip = Self::assemble(store, factory, config, video, audio);
        info!(
            width = clip.meta.width,
            height = clip.meta.height,
            duration = clip.meta.duration,
            audio_sample_rate = clip.meta.audio_sample_rate,
            "Clip ready"
        );
        clip
    }

    fn assemble(
        store: SharedStore,
        factory: Arc<dyn DecoderFactory>,
        config: ClipConfig,
        video: Option<Track<VideoDecoderConfig>>,
        audio: Option<Track<AudioDecoderConfig>>,
    ) -> Self {
        let mut clip = Self {
            store,
            factory,
            config,
            video,
            audio,
            meta: ClipMeta::default(),
            video_finder: None,
            audio_finder: None,
            destroyed: false,
        };
        clip.refresh_meta();
        clip
    }

    fn refresh_meta(&mut self) {
        let video_duration = self.video.as_ref().map_or(0, |t| track_duration(&t.samples));
        let audio_duration = self.audio.as_ref().map_or(0, |t| track_duration(&t.samples));
        let coded = self.video.as_ref().map(|t| t.config.coded).unwrap_or_default();
        self.meta = ClipMeta {
            width: coded.width,
            height: coded.height,
            duration: video_duration.max(audio_duration),
            audio_sample_rate: self.audio.as_ref().map_or(0, |t| t.config.sample_rate),
            audio_channels: self.audio.as_ref().map_or(0, |t| t.config.channels),
        };
    }

    pub fn meta(&self) -> &ClipMeta {
        &self.meta
    }

    pub fn duration(&self) -> Micros {
        self.meta.duration
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Current sample table of one track.
    pub fn samples(&self, kind: TrackKind) -> Option<&[Sample]> {
        match kind {
            TrackKind::Video => self.video.as_ref().map(|t| t.samples.as_slice()),
            TrackKind::Audio => self.audio.as_ref().map(|t| t.samples.as_slice()),
        }
    }

    fn ensure_alive(&self) -> Result<(), DecodeError> {
        if self.destroyed {
            return Err(DecodeError::Closed);
        }
        Ok(())
    }

    fn video_finder(&mut self) -> Option<&mut VideoFrameFinder> {
        let track = self.video.as_ref()?;
        if self.video_finder.is_none() {
            self.video_finder = Some(VideoFrameFinder::new(
                self.store.clone(),
                track.samples.clone(),
                track.config.clone(),
                self.factory.clone(),
                self.config.finder.clone(),
            ));
        }
        self.video_finder.as_mut()
    }

    fn audio_finder(&mut self) -> Option<&mut AudioFrameFinder> {
        let track = self.audio.as_ref()?;
        if self.audio_finder.is_none() {
            self.audio_finder = Some(AudioFrameFinder::new(
                self.store.clone(),
                track.samples.clone(),
                track.config.clone(),
                self.factory.clone(),
                self.config.finder.clone(),
                self.config.volume,
            ));
        }
        self.audio_finder.as_mut()
    }

    /// Video frame covering `time` and the audio since the previous tick.
    ///
    /// Past the end the state is [`TickState::Done`], no frame is returned
    /// and the audio carries whatever remained of the track.
    pub async fn tick(&mut self, time: Micros) -> EngineResult<TickOutput> {
        self.ensure_alive()?;
        let state = if time >= self.meta.duration {
            TickState::Done
        } else {
            TickState::Success
        };

        let video = match (state, self.video_finder()) {
            (TickState::Success, Some(finder)) => finder.find(time).await?,
            _ => None,
        };
        let rate = self.config.finder.target_sample_rate;
        let audio = match self.audio_finder() {
            Some(finder) => finder.find(time).await?,
            None => AudioData::new(time, rate, vec![Vec::new(); OUTPUT_CHANNELS]),
        };
        Ok(TickOutput {
            video,
            audio,
            state,
        })
    }

    /// Cut the clip at `time` into two independent clips over the same store.
    ///
    /// A half leaves out any track with nothing left in it. Only the video
    /// halves get the black-frame correction; audio is cut as is.
    pub fn split(&self, time: Micros) -> EngineResult<(Mp4Clip, Mp4Clip)> {
        self.ensure_alive()?;
        let duration = self.meta.duration;
        if time <= 0 || time >= duration {
            return Err(EditError::OutOfBounds { time, duration }.into());
        }

        let threshold = self.config.black_frame_threshold;
        let (video_pre, video_post) = match &self.video {
            Some(track) => {
                let (mut pre, mut post) = editor::split(&track.samples, TrackKind::Video, time)?;
                editor::fix_black_frame(&mut pre, threshold);
                editor::fix_black_frame(&mut post, threshold);
                (track.with_samples(pre).live(), track.with_samples(post).live())
            }
            None => (None, None),
        };
        let (audio_pre, audio_post) = match &self.audio {
            Some(track) => {
                let (pre, post) = editor::split(&track.samples, TrackKind::Audio, time)?;
                (track.with_samples(pre).live(), track.with_samples(post).live())
            }
            None => (None, None),
        };

        let pre = self.derive(video_pre, audio_pre);
        let post = self.derive(video_post, audio_post);
        debug!(
            time,
            pre = pre.meta.duration,
            post = post.meta.duration,
            "Split clip"
        );
        Ok((pre, post))
    }

    fn derive(
        &self,
        video: Option<Track<VideoDecoderConfig>>,
        audio: Option<Track<AudioDecoderConfig>>,
    ) -> Self {
        Self::assemble(
            self.store.clone(),
            self.factory.clone(),
            self.config.clone(),
            video,
            audio,
        )
    }

    /// Remove `[start, end)` from every track. Either all tracks are edited
    /// or, on error, none is.
    pub fn delete_range(&mut self, start: Micros, end: Micros) -> EngineResult<()> {
        self.ensure_alive()?;
        if self.video.is_none() && self.audio.is_none() {
            return Err(EditError::NotFound(TrackKind::Video).into());
        }

        let video = match &self.video {
            Some(track) => {
                let mut samples = track.samples.as_ref().clone();
                editor::delete_range(&mut samples, TrackKind::Video, start, end)?;
                Some(track.with_samples(samples))
            }
            None => None,
        };
        let audio = match &self.audio {
            Some(track) => {
                let mut samples = track.samples.as_ref().clone();
                editor::delete_range(&mut samples, TrackKind::Audio, start, end)?;
                Some(track.with_samples(samples))
            }
            None => None,
        };

        self.video = video;
        self.audio = audio;
        self.drop_finders();
        self.refresh_meta();
        debug!(start, end, duration = self.meta.duration, "Deleted range from clip");
        Ok(())
    }

    /// Scaled RGBA thumbnails between `options.start` and `options.end`
    /// (clip end by default). Uses its own finder so playback state is
    /// left alone.
    pub async fn thumbnails(
        &self,
        width: u32,
        options: ThumbnailOptions,
    ) -> EngineResult<Vec<Thumbnail>> {
        self.ensure_alive()?;
        let Some(track) = &self.video else {
            return Ok(Vec::new());
        };
        let end = options
            .end
            .unwrap_or(self.meta.duration)
            .min(self.meta.duration);
        let start = options.start.max(0);

        let times: Vec<Micros> = match options.step {
            Some(step) if step <= 0 => {
                return Err(EditError::InvalidRange {
                    start,
                    end: start + step,
                }
                .into())
            }
            Some(step) => (0..)
                .map(|i: i64| start + i * step)
                .take_while(|t| *t < end)
                .collect(),
            None => {
                let mut keyframes: Vec<Micros> = track
                    .samples
                    .iter()
                    .filter(|s| s.is_sync && !s.deleted && s.duration > 0)
                    .map(|s| s.cts)
                    .filter(|t| *t >= start && *t < end)
                    .collect();
                keyframes.sort_unstable();
                keyframes.dedup();
                keyframes
            }
        };

        let mut finder = VideoFrameFinder::new(
            self.store.clone(),
            track.samples.clone(),
            track.config.clone(),
            self.factory.clone(),
            self.config.finder.clone(),
        );
        let mut thumbnails = Vec::with_capacity(times.len());
        for time in times {
            if let Some(frame) = finder.find(time).await? {
                thumbnails.push(scale_to_width(&frame, width));
            }
        }
        finder.close();
        debug!(count = thumbnails.len(), width, "Thumbnails rendered");
        Ok(thumbnails)
    }

    fn drop_finders(&mut self) {
        if let Some(mut finder) = self.video_finder.take() {
            finder.close();
        }
        if let Some(mut finder) = self.audio_finder.take() {
            finder.close();
        }
    }

    /// Release decoders. Any later request fails with [`DecodeError::Closed`].
    pub fn destroy(&mut self) {
        self.drop_finders();
        self.destroyed = true;
        debug!("Clip destroyed");
    }
}

/// Clones share the store and tables; finders are not carried over.
impl Clone for Mp4Clip {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            factory: self.factory.clone(),
            config: self.config.clone(),
            video: self.video.clone(),
            audio: self.audio.clone(),
            meta: self.meta.clone(),
            video_finder: None,
            audio_finder: None,
            destroyed: self.destroyed,
        }
    }
}

impl std::fmt::Debug for Mp4Clip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mp4Clip")
            .field("meta", &self.meta)
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_common::testing::FakeCodecs;
    use mc_common::EngineError;
    use mc_demux::testing::{progressive_mp4, Fixture};
    use mc_store::MemoryStore;

    async fn clip(fixture: &Fixture, config: ClipConfig) -> Mp4Clip {
        let store: SharedStore = Arc::new(MemoryStore::from_bytes(progressive_mp4(fixture)));
        Mp4Clip::from_store(store, Arc::new(FakeCodecs::default()), config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn meta_reflects_tracks() {
        let clip = clip(&Fixture::default(), ClipConfig::default()).await;
        let meta = clip.meta();
        assert_eq!((meta.width, meta.height), (64, 36));
        assert_eq!(meta.audio_sample_rate, 48_000);
        assert_eq!(meta.audio_channels, 2);
        // 94 AAC frames outlast 60 video frames.
        assert_eq!(meta.duration, 94 * 1024 * 1_000_000 / 48_000);

        let audio_only = clip_without_video().await;
        assert_eq!(audio_only.meta().width, 0);
        assert!(!audio_only.meta().has_video());
    }

    async fn clip_without_video() -> Mp4Clip {
        clip(&Fixture::audio_only(1), ClipConfig::default()).await
    }

    #[tokio::test]
    async fn include_audio_false_drops_audio() {
        let config = ClipConfig {
            include_audio: false,
            ..ClipConfig::default()
        };
        let clip = clip(&Fixture::default(), config).await;
        assert!(clip.samples(TrackKind::Audio).is_none());
        assert_eq!(clip.duration(), 2_000_000);
    }

    #[tokio::test]
    async fn tick_until_done() {
        let fixture = Fixture::default();
        let mut clip = clip(&fixture, ClipConfig::default()).await;

        let first = clip.tick(0).await.unwrap();
        assert_eq!(first.state, TickState::Success);
        assert_eq!(first.video.unwrap().timestamp, 0);
        assert!(first.audio.is_empty());

        let second = clip.tick(100_000).await.unwrap();
        assert_eq!(second.audio.frames(), 4_800);
        assert_eq!(second.audio.channel_count(), 2);

        let done = clip.tick(clip.duration()).await.unwrap();
        assert!(done.is_done());
        assert!(done.video.is_none());
    }

    #[tokio::test]
    async fn split_bounds_and_halves() {
        let clip = clip(&Fixture::default(), ClipConfig::default()).await;
        let duration = clip.duration();
        for bad in [0, duration, duration + 1, -5] {
            let err = clip.split(bad).unwrap_err();
            assert!(matches!(
                err,
                EngineError::Edit(EditError::OutOfBounds { .. })
            ));
        }

        let (pre, post) = clip.split(1_000_000).unwrap();
        assert_eq!(pre.samples(TrackKind::Video).map(track_duration), Some(1_000_000));
        assert_eq!(
            post.samples(TrackKind::Video).map(track_duration),
            Some(1_000_000)
        );
        assert_eq!(pre.duration() + post.duration(), duration);
        // The source is untouched.
        assert_eq!(clip.duration(), duration);
    }

    #[tokio::test]
    async fn split_past_video_end_drops_the_video_track() {
        let fixture = Fixture {
            video_frames: 30,
            audio_frames: 141,
            ..Fixture::default()
        };
        let clip = clip(&fixture, ClipConfig::default()).await;
        assert_eq!(clip.duration(), 3_008_000);

        let (pre, mut post) = clip.split(1_500_000).unwrap();
        assert!(pre.samples(TrackKind::Video).is_some());
        assert!(post.samples(TrackKind::Video).is_none());
        assert_eq!(post.meta().width, 0);
        let audio = post.samples(TrackKind::Audio).unwrap();
        assert!(audio.iter().any(|s| !s.deleted));
        assert_eq!(post.duration(), 1_508_000);

        post.delete_range(0, 500_000).unwrap();
        assert_eq!(post.duration(), 1_008_000);
        let (head, tail) = post.split(500_000).unwrap();
        assert!(head.samples(TrackKind::Video).is_none());
        assert!(tail.samples(TrackKind::Video).is_none());
        assert_eq!(head.duration() + tail.duration(), 1_008_000);
    }

    #[tokio::test]
    async fn edits_do_not_leak_into_clones() {
        let mut original = clip(&Fixture::default(), ClipConfig::default()).await;
        let copy = original.clone();
        original.delete_range(0, 1_000_000).unwrap();
        assert!(original.duration() < copy.duration());
        assert!(copy
            .samples(TrackKind::Video)
            .unwrap()
            .iter()
            .all(|s| !s.deleted));
    }

    #[tokio::test]
    async fn failed_edit_leaves_clip_intact() {
        let mut clip = clip(&Fixture::default(), ClipConfig::default()).await;
        let before = clip.duration();
        let err = clip.delete_range(10, 10).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Edit(EditError::InvalidRange { start: 10, end: 10 })
        ));
        assert_eq!(clip.duration(), before);
    }

    #[tokio::test]
    async fn keyframe_thumbnails() {
        let mut clip = clip(&Fixture::default(), ClipConfig::default()).await;
        let thumbs = clip.thumbnails(32, ThumbnailOptions::default()).await.unwrap();
        assert_eq!(thumbs.len(), 2);
        assert_eq!(thumbs[0].timestamp, 0);
        assert_eq!(thumbs[1].timestamp, 1_000_000);
        assert_eq!((thumbs[0].width, thumbs[0].height), (32, 18));

        let stepped = clip
            .thumbnails(
                64,
                ThumbnailOptions {
                    start: 0,
                    end: Some(1_000_000),
                    step: Some(250_000),
                },
            )
            .await
            .unwrap();
        assert_eq!(stepped.len(), 4);

        clip.destroy();
        assert!(clip.tick(0).await.is_err());
        assert!(clip.thumbnails(32, ThumbnailOptions::default()).await.is_err());
    }
}
