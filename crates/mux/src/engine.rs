//! Mux engine: raw frames and PCM in, fragmented MP4 bytes out.
//!
//! Each configured track owns an encoder from an [`EncoderFactory`]. Encoded
//! units are cached until every configured track has produced its first
//! unit (which carries the decoder configuration); the init segment is then
//! written exactly once and the cache replayed. After that, units go
//! straight into the fragment writer. Output is drained by the caller with
//! [`MuxEngine::take_output`].

use std::time::Duration;

use bytes::Bytes;
use mc_common::{
    micros_to_ticks, AudioData, EncodeError, EncodedChunk, EncoderEvent, EncoderFactory,
    EncoderHandle, MuxConfig, TrackConfig, TrackKind, VideoFrame,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, trace, warn};

use crate::error::{MuxError, MuxResult};
use crate::fragment::FragmentSample;
use crate::init::TrackSpec;
use crate::writer::FragmentedWriter;

/// How long `flush` waits for each encoder to report completion.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

struct TrackEncoder<I> {
    track_id: u32,
    handle: EncoderHandle<I>,
    metadata: Option<TrackConfig>,
    units: u64,
}

impl<I> TrackEncoder<I> {
    fn new(track_id: u32, handle: EncoderHandle<I>) -> Self {
        Self {
            track_id,
            handle,
            metadata: None,
            units: 0,
        }
    }
}

/// Encodes and muxes one output session.
pub struct MuxEngine {
    config: MuxConfig,
    video: Option<TrackEncoder<VideoFrame>>,
    audio: Option<TrackEncoder<AudioData>>,
    writer: FragmentedWriter,
    /// Units produced before the header could be written.
    cache: Vec<(TrackKind, EncodedChunk)>,
    video_frames: u64,
    keyframe_every: u64,
    closed: bool,
}

impl MuxEngine {
    /// Create encoders for every track in `config`. At least one is required.
    pub fn new(config: MuxConfig, factory: &dyn EncoderFactory) -> MuxResult<Self> {
        if config.video.is_none() && config.audio.is_none() {
            return Err(MuxError::InvalidConfig("no tracks configured".into()));
        }

        let video = match &config.video {
            Some(cfg) => {
                info!(
                    codec = ?cfg.codec,
                    resolution = %cfg.resolution,
                    fps = %cfg.fps,
                    "Added video track"
                );
                Some(TrackEncoder::new(1, factory.create_video(cfg)?))
            }
            None => None,
        };
        let audio = match &config.audio {
            Some(cfg) => {
                let track_id = if video.is_some() { 2 } else { 1 };
                info!(
                    codec = ?cfg.codec,
                    sample_rate = cfg.sample_rate,
                    channels = cfg.channels,
                    "Added audio track"
                );
                Some(TrackEncoder::new(track_id, factory.create_audio(cfg)?))
            }
            None => None,
        };

        let keyframe_every = config.keyframe_every();
        Ok(Self {
            config,
            video,
            audio,
            writer: FragmentedWriter::new(),
            cache: Vec::new(),
            video_frames: 0,
            keyframe_every,
            closed: false,
        })
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub fn header_written(&self) -> bool {
        self.writer.header_written()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Units waiting for the header.
    pub fn cached_units(&self) -> usize {
        self.cache.len()
    }

    /// Sum of the encoders' queue sizes. This is the backpressure signal.
    pub fn queue_depth(&self) -> usize {
        let video = self
            .video
            .as_ref()
            .map_or(0, |t| t.handle.encoder.encode_queue_size());
        let audio = self
            .audio
            .as_ref()
            .map_or(0, |t| t.handle.encoder.encode_queue_size());
        video + audio
    }

    /// Submit a video frame. A keyframe is requested every
    /// `keyframe_interval` worth of frames, starting with the first.
    pub fn encode_video(&mut self, frame: VideoFrame) -> MuxResult<()> {
        if self.closed {
            return Err(EncodeError::Closed.into());
        }
        let track = self
            .video
            .as_mut()
            .ok_or(EncodeError::TrackNotConfigured(TrackKind::Video))?;
        let keyframe = self.video_frames % self.keyframe_every == 0;
        trace!(timestamp = frame.timestamp, keyframe, "encode video");
        track.handle.encoder.encode(frame, keyframe)?;
        self.video_frames += 1;
        self.poll()
    }

    pub fn encode_audio(&mut self, audio: AudioData) -> MuxResult<()> {
        if self.closed {
            return Err(EncodeError::Closed.into());
        }
        let track = self
            .audio
            .as_mut()
            .ok_or(EncodeError::TrackNotConfigured(TrackKind::Audio))?;
        trace!(timestamp = audio.timestamp, frames = audio.frames(), "encode audio");
        track.handle.encoder.encode(audio, false)?;
        self.poll()
    }

    /// Handle every encoder event already delivered, without waiting.
    pub fn poll(&mut self) -> MuxResult<()> {
        let mut events = Vec::new();
        if let Some(track) = &mut self.video {
            while let Ok(event) = track.handle.events.try_recv() {
                events.push((TrackKind::Video, event));
            }
        }
        if let Some(track) = &mut self.audio {
            while let Ok(event) = track.handle.events.try_recv() {
                events.push((TrackKind::Audio, event));
            }
        }
        for (kind, event) in events {
            self.handle_event(kind, event)?;
        }
        Ok(())
    }

    /// Serialize what has been muxed so far and hand it out.
    pub fn take_output(&mut self) -> MuxResult<Bytes> {
        self.poll()?;
        self.writer.flush_fragment()?;
        Ok(self.writer.take_output())
    }

    /// Drain every encoder and write out all pending units. If a track never
    /// produced output, the header is written with the tracks that did.
    pub async fn flush(&mut self) -> MuxResult<()> {
        self.poll()?;
        let kinds: Vec<TrackKind> = [
            self.video.as_ref().map(|_| TrackKind::Video),
            self.audio.as_ref().map(|_| TrackKind::Audio),
        ]
        .into_iter()
        .flatten()
        .collect();

        for kind in &kinds {
            match kind {
                TrackKind::Video => {
                    if let Some(track) = &mut self.video {
                        track.handle.encoder.flush()?;
                    }
                }
                TrackKind::Audio => {
                    if let Some(track) = &mut self.audio {
                        track.handle.encoder.flush()?;
                    }
                }
            }
        }
        for kind in kinds {
            self.await_flushed(kind).await?;
        }

        if !self.writer.header_written() {
            let specs = self.track_specs();
            if specs.is_empty() {
                warn!("Flush without any encoded output; nothing to write");
                return Ok(());
            }
            warn!(
                tracks = specs.len(),
                "Not every track produced output; writing header with the available tracks"
            );
            self.open_gate(specs)?;
        }
        self.writer.flush_fragment()?;
        Ok(())
    }

    /// Flush, close the encoders and return the remaining output.
    pub async fn close(&mut self) -> MuxResult<Bytes> {
        if self.closed {
            return Ok(Bytes::new());
        }
        self.flush().await?;
        if let Some(track) = &mut self.video {
            track.handle.encoder.close();
        }
        if let Some(track) = &mut self.audio {
            track.handle.encoder.close();
        }
        self.closed = true;
        info!(
            video_frames = self.video_frames,
            fragments = self.writer.fragments(),
            bytes = self.writer.bytes_written(),
            "Mux session closed"
        );
        Ok(self.writer.take_output())
    }

    fn events_mut(&mut self, kind: TrackKind) -> Option<&mut UnboundedReceiver<EncoderEvent>> {
        match kind {
            TrackKind::Video => self.video.as_mut().map(|t| &mut t.handle.events),
            TrackKind::Audio => self.audio.as_mut().map(|t| &mut t.handle.events),
        }
    }

    async fn await_flushed(&mut self, kind: TrackKind) -> MuxResult<()> {
        let deadline = tokio::time::Instant::now() + FLUSH_TIMEOUT;
        loop {
            let event = {
                let Some(events) = self.events_mut(kind) else {
                    return Ok(());
                };
                match tokio::time::timeout_at(deadline, events.recv()).await {
                    Ok(Some(event)) => event,
                    Ok(None) => return Err(EncodeError::Closed.into()),
                    Err(_) => {
                        return Err(MuxError::FlushTimeout {
                            kind,
                            waited_ms: FLUSH_TIMEOUT.as_millis() as u64,
                        })
                    }
                }
            };
            let flushed = matches!(event, EncoderEvent::Flushed);
            self.handle_event(kind, event)?;
            if flushed {
                debug!(kind = kind.as_str(), "Encoder flushed");
                return Ok(());
            }
        }
    }

    fn handle_event(&mut self, kind: TrackKind, event: EncoderEvent) -> MuxResult<()> {
        match event {
            EncoderEvent::Output(output) => {
                if let Some(metadata) = output.metadata {
                    self.record_metadata(kind, metadata);
                }
                if self.writer.header_written() {
                    self.write_chunk(kind, output.chunk)
                } else {
                    self.cache.push((kind, output.chunk));
                    self.try_open_gate()
                }
            }
            EncoderEvent::Flushed => Ok(()),
            EncoderEvent::Error(err) => {
                warn!(kind = kind.as_str(), "Encoder error: {}", err);
                Err(err.into())
            }
        }
    }

    fn record_metadata(&mut self, kind: TrackKind, metadata: TrackConfig) {
        let slot = match kind {
            TrackKind::Video => self.video.as_mut().map(|t| &mut t.metadata),
            TrackKind::Audio => self.audio.as_mut().map(|t| &mut t.metadata),
        };
        if let Some(slot) = slot {
            if slot.is_none() {
                debug!(kind = kind.as_str(), "Track metadata received");
                *slot = Some(metadata);
            }
        }
    }

    /// Specs for every track that has reported metadata, in track id order.
    fn track_specs(&self) -> Vec<TrackSpec> {
        let video = self
            .video
            .as_ref()
            .and_then(|t| t.metadata.clone().map(|m| TrackSpec::new(t.track_id, m)));
        let audio = self
            .audio
            .as_ref()
            .and_then(|t| t.metadata.clone().map(|m| TrackSpec::new(t.track_id, m)));
        video.into_iter().chain(audio).collect()
    }

    fn try_open_gate(&mut self) -> MuxResult<()> {
        let video_ready = self.video.as_ref().map_or(true, |t| t.metadata.is_some());
        let audio_ready = self.audio.as_ref().map_or(true, |t| t.metadata.is_some());
        if video_ready && audio_ready {
            let specs = self.track_specs();
            self.open_gate(specs)?;
        }
        Ok(())
    }

    fn open_gate(&mut self, specs: Vec<TrackSpec>) -> MuxResult<()> {
        info!(
            tracks = specs.len(),
            cached = self.cache.len(),
            "All tracks ready; writing header"
        );
        self.writer.write_header(specs, 0)?;
        for (kind, chunk) in std::mem::take(&mut self.cache) {
            self.write_chunk(kind, chunk)?;
        }
        Ok(())
    }

    fn write_chunk(&mut self, kind: TrackKind, chunk: EncodedChunk) -> MuxResult<()> {
        let track_id = match kind {
            TrackKind::Video => self.video.as_ref().map(|t| t.track_id),
            TrackKind::Audio => self.audio.as_ref().map(|t| t.track_id),
        };
        let Some(spec) = track_id.and_then(|id| self.writer.track(id)) else {
            warn!(kind = kind.as_str(), "Dropping unit for a track missing from the header");
            return Ok(());
        };
        let track_id = spec.track_id;
        let timescale = spec.timescale;

        let start = micros_to_ticks(chunk.timestamp, timescale).max(0);
        let end = micros_to_ticks(chunk.timestamp + chunk.duration, timescale);
        let mut duration = (end - start).max(0);
        if duration == 0 {
            if let (TrackKind::Video, Some(video)) = (kind, &self.config.video) {
                duration = micros_to_ticks(video.fps.frame_duration(), timescale);
            }
        }

        let sample = FragmentSample {
            is_sync: kind == TrackKind::Audio || chunk.is_key(),
            data: chunk.data,
            dts: start as u64,
            duration: duration as u32,
            cts_offset: 0,
        };
        self.writer.push(track_id, sample)?;
        match kind {
            TrackKind::Video => {
                if let Some(t) = &mut self.video {
                    t.units += 1;
                }
            }
            TrackKind::Audio => {
                if let Some(t) = &mut self.audio {
                    t.units += 1;
                }
            }
        }
        Ok(())
    }

    /// Units written per track: (video, audio).
    pub fn units_written(&self) -> (u64, u64) {
        (
            self.video.as_ref().map_or(0, |t| t.units),
            self.audio.as_ref().map_or(0, |t| t.units),
        )
    }
}

impl std::fmt::Debug for MuxEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxEngine")
            .field("video", &self.video.as_ref().map(|t| t.track_id))
            .field("audio", &self.audio.as_ref().map(|t| t.track_id))
            .field("header_written", &self.writer.header_written())
            .field("cached", &self.cache.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_common::testing::{FakeCodecs, FakeOptions};
    use mc_common::{AudioEncoderConfig, PixelFormat, Resolution, VideoEncoderConfig};
    use mc_demux::testing::demux_all;

    fn video_config() -> VideoEncoderConfig {
        VideoEncoderConfig {
            resolution: Resolution::new(32, 18),
            ..Default::default()
        }
    }

    fn frame(i: i64) -> VideoFrame {
        let resolution = Resolution::new(32, 18);
        VideoFrame {
            timestamp: i * 33_333,
            duration: 33_333,
            resolution,
            format: PixelFormat::Rgba8,
            data: Bytes::from(vec![0u8; resolution.rgba_byte_size()]),
        }
    }

    fn pcm(i: i64) -> AudioData {
        AudioData::silence(i * 20_000, 48_000, 2, 960)
    }

    #[test]
    fn requires_a_track() {
        let config = MuxConfig {
            video: None,
            audio: None,
            ..Default::default()
        };
        let err = MuxEngine::new(config, &FakeCodecs::default()).unwrap_err();
        assert!(matches!(err, MuxError::InvalidConfig(_)));
    }

    #[test]
    fn unconfigured_track_is_rejected() {
        let config = MuxConfig {
            video: Some(video_config()),
            audio: None,
            ..Default::default()
        };
        let mut engine = MuxEngine::new(config, &FakeCodecs::default()).unwrap();
        let err = engine.encode_audio(pcm(0)).unwrap_err();
        assert!(matches!(
            err,
            MuxError::Encode(EncodeError::TrackNotConfigured(TrackKind::Audio))
        ));
    }

    #[test]
    fn single_track_writes_header_immediately() {
        let config = MuxConfig {
            video: None,
            audio: Some(AudioEncoderConfig::default()),
            ..Default::default()
        };
        let mut engine = MuxEngine::new(config, &FakeCodecs::default()).unwrap();
        engine.encode_audio(pcm(0)).unwrap();
        assert!(engine.header_written());
        assert_eq!(engine.cached_units(), 0);
        assert!(!engine.take_output().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn header_waits_for_both_tracks() {
        let codecs = FakeCodecs::new(FakeOptions {
            hold_video: true,
            ..Default::default()
        });
        let config = MuxConfig {
            video: Some(video_config()),
            ..Default::default()
        };
        let mut engine = MuxEngine::new(config, &codecs).unwrap();

        for i in 0..10 {
            engine.encode_video(frame(i)).unwrap();
        }
        for i in 0..15 {
            engine.encode_audio(pcm(i)).unwrap();
        }
        assert!(!engine.header_written());
        assert_eq!(engine.cached_units(), 15);
        assert_eq!(engine.queue_depth(), 10);
        assert!(engine.take_output().unwrap().is_empty());

        engine.flush().await.unwrap();
        assert!(engine.header_written());
        assert_eq!(engine.cached_units(), 0);
        assert_eq!(engine.queue_depth(), 0);
        assert_eq!(engine.units_written(), (10, 15));

        let mut file = engine.take_output().unwrap().to_vec();
        file.extend_from_slice(&engine.close().await.unwrap());
        assert_eq!(file.windows(4).filter(|w| *w == b"moov").count(), 1);

        let demuxed = demux_all(&file).unwrap();
        assert_eq!(demuxed.movie.tracks.len(), 2);
        assert_eq!(demuxed.video.len(), 10);
        assert_eq!(demuxed.audio.len(), 15);
        assert!(demuxed.video[0].is_sync);
        assert!(!demuxed.video[1].is_sync);
    }

    #[tokio::test(start_paused = true)]
    async fn keyframes_follow_interval() {
        let config = MuxConfig {
            video: Some(video_config()),
            audio: None,
            keyframe_interval: 1_000_000,
            ..Default::default()
        };
        let mut engine = MuxEngine::new(config, &FakeCodecs::default()).unwrap();
        for i in 0..75 {
            engine.encode_video(frame(i)).unwrap();
        }
        let file = engine.close().await.unwrap();
        let demuxed = demux_all(&file).unwrap();
        let keys: Vec<usize> = demuxed
            .video
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_sync)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(keys, vec![0, 30, 60]);
        assert!(engine.is_closed());
        assert!(matches!(
            engine.encode_video(frame(75)),
            Err(MuxError::Encode(EncodeError::Closed))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_opens_gate_with_available_tracks() {
        let config = MuxConfig {
            video: Some(video_config()),
            ..Default::default()
        };
        let mut engine = MuxEngine::new(config, &FakeCodecs::default()).unwrap();
        for i in 0..5 {
            engine.encode_audio(pcm(i)).unwrap();
        }
        assert!(!engine.header_written());

        let file = engine.close().await.unwrap();
        let demuxed = demux_all(&file).unwrap();
        assert_eq!(demuxed.movie.tracks.len(), 1);
        assert_eq!(demuxed.audio.len(), 5);
    }
}
