//! Video Frame Finder: serves the decoded frame covering an arbitrary time.
//!
//! One decoder stays warm while requests move forward in small steps. A
//! request behind the last one, or further ahead than the reset window,
//! tears the decoder down and restarts from the sync sample of the GoP that
//! contains the requested time. Output earlier than the request is dropped.
//!
//! GoPs are submitted whole (sync sample first, then `flush`). Deleted
//! samples are still fed for reference but carry [`DISCARD_TIMESTAMP`], and
//! their frames never reach the queue.

use std::collections::VecDeque;
use std::sync::Arc;

use mc_common::{
    ChunkType, CodecError, CodecState, DecodeError, Decoder, DecoderEvent, DecoderFactory,
    EncodedChunk, FinderConfig, HardwareAcceleration, Micros, Sample, VideoDecoderConfig,
    VideoDecoderHandle, VideoFrame, DISCARD_TIMESTAMP,
};
use mc_store::SharedStore;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, trace, warn};

use crate::abort::AbortSignal;
use crate::diagnostics::FinderDiagnostics;

/// GoPs that may be flushed but not yet drained.
const MAX_PENDING_GOPS: usize = 2;

pub struct VideoFrameFinder {
    store: SharedStore,
    samples: Arc<Vec<Sample>>,
    config: VideoDecoderConfig,
    factory: Arc<dyn DecoderFactory>,
    settings: FinderConfig,
    decoder: Option<VideoDecoderHandle>,
    /// Index of the next sample to submit.
    cursor: usize,
    /// Time of the last request.
    cursor_time: Option<Micros>,
    frames: VecDeque<VideoFrame>,
    pending_flushes: usize,
    /// Frames emitted by the current decoder, discarded ones included.
    outputs: usize,
    software: bool,
    abort: AbortSignal,
}

impl VideoFrameFinder {
    pub fn new(
        store: SharedStore,
        samples: Arc<Vec<Sample>>,
        config: VideoDecoderConfig,
        factory: Arc<dyn DecoderFactory>,
        settings: FinderConfig,
    ) -> Self {
        let software = config.hardware_acceleration == HardwareAcceleration::PreferSoftware;
        Self {
            store,
            samples,
            config,
            factory,
            settings,
            decoder: None,
            cursor: 0,
            cursor_time: None,
            frames: VecDeque::new(),
            pending_flushes: 0,
            outputs: 0,
            software,
            abort: AbortSignal::new(),
        }
    }

    /// Handle that cancels this finder from elsewhere.
    pub fn abort_handle(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Whether the software fallback has been engaged.
    pub fn is_software(&self) -> bool {
        self.software
    }

    /// Frame whose presentation interval covers `time`.
    ///
    /// Returns `None` once every sample has been decoded and no queued frame
    /// reaches `time`, or when `time` falls in a gap before the next frame.
    pub async fn find(&mut self, time: Micros) -> Result<Option<VideoFrame>, DecodeError> {
        self.check_abort()?;
        if self.needs_reset(time) {
            self.reset(time)?;
        }
        self.cursor_time = Some(time);

        let mut last_progress = Instant::now();
        loop {
            if self.poll_events()? > 0 {
                last_progress = Instant::now();
            }
            if self.decoder_lost()? {
                self.reset(time)?;
                last_progress = Instant::now();
                continue;
            }

            self.drop_stale(time);
            if let Some(front) = self.frames.front() {
                let hit = front.covers(time).then(|| front.clone());
                self.prefetch().await?;
                return Ok(hit);
            }

            if self.cursor >= self.samples.len() && self.pending_flushes == 0 {
                trace!(time, "Video samples exhausted");
                return Ok(None);
            }
            if self.pending_flushes < MAX_PENDING_GOPS && self.submit_gop().await? {
                last_progress = Instant::now();
                continue;
            }

            let waited = last_progress.elapsed();
            if waited >= self.settings.decode_timeout() {
                let diagnostics = self.diagnostics();
                error!(%diagnostics, "Video decode made no progress");
                return Err(DecodeError::Timeout {
                    waited_ms: waited.as_millis() as u64,
                    diagnostics: diagnostics.to_string(),
                });
            }
            sleep(self.settings.poll_interval()).await;
            self.check_abort()?;
        }
    }

    /// Cancel outstanding work and release the decoder.
    pub fn close(&mut self) {
        self.abort.trigger();
        self.decoder = None;
        self.frames.clear();
        self.pending_flushes = 0;
    }

    pub fn diagnostics(&self) -> FinderDiagnostics {
        FinderDiagnostics {
            cursor: self.cursor,
            samples: self.samples.len(),
            requested: self.cursor_time,
            queued: self.frames.len(),
            decode_queue: self
                .decoder
                .as_ref()
                .map_or(0, |h| h.decoder.decode_queue_size()),
            pending_flushes: self.pending_flushes,
            decoder_state: self.decoder.as_ref().map(|h| h.decoder.state()),
            outputs: self.outputs,
            software: self.software,
        }
    }

    fn check_abort(&self) -> Result<(), DecodeError> {
        if self.abort.is_aborted() {
            return Err(DecodeError::Closed);
        }
        Ok(())
    }

    /// Only a request strictly before the cursor counts as a seek. Asking
    /// for the cursor time again is served from the queue.
    fn needs_reset(&self, time: Micros) -> bool {
        if self.decoder.is_none() {
            return true;
        }
        match self.cursor_time {
            None => true,
            Some(last) => time < last || time - last > self.settings.reset_window,
        }
    }

    /// Index of the sync sample that starts the GoP holding `time`.
    fn gop_start(&self, time: Micros) -> usize {
        let Some(target) = self
            .samples
            .iter()
            .position(|s| !s.deleted && s.end() > time)
        else {
            return self.samples.len();
        };
        self.samples[..=target]
            .iter()
            .rposition(|s| s.is_sync)
            .unwrap_or(0)
    }

    /// Fresh decoder positioned at the GoP covering `time`.
    fn reset(&mut self, time: Micros) -> Result<(), DecodeError> {
        self.decoder = None;
        self.frames.clear();
        self.pending_flushes = 0;
        self.outputs = 0;
        self.cursor = self.gop_start(time);

        loop {
            let mut handle = self.factory.create_video()?;
            let config = if self.software {
                self.config.software()
            } else {
                self.config.clone()
            };
            match handle.decoder.configure(&config) {
                Ok(()) => {
                    self.decoder = Some(handle);
                    break;
                }
                Err(err) => self.recover(err)?,
            }
        }
        debug!(
            time,
            cursor = self.cursor,
            software = self.software,
            "Video finder reset"
        );
        Ok(())
    }

    /// Decide what a codec failure means. `Ok` leaves the finder without a
    /// decoder so the next loop iteration rebuilds it.
    fn recover(&mut self, err: CodecError) -> Result<(), DecodeError> {
        self.decoder = None;
        if err.is_reclaimed() {
            debug!(error = %err, "Video decoder reclaimed, re-creating lazily");
            return Ok(());
        }
        if self.outputs == 0 && !self.software {
            warn!(error = %err, "Video decode failed before the first frame, retrying in software");
            self.software = true;
            return Ok(());
        }
        error!(error = %err, software = self.software, "Video decode failed");
        if self.software {
            Err(DecodeError::FallbackFailed(err))
        } else {
            Err(DecodeError::Codec(err))
        }
    }

    /// Closed decoders that did not say why are treated as failures.
    fn decoder_lost(&mut self) -> Result<bool, DecodeError> {
        let closed = match &self.decoder {
            None => return Ok(true),
            Some(handle) => handle.decoder.state() == CodecState::Closed,
        };
        if closed {
            self.recover(CodecError::fatal("decoder closed unexpectedly"))?;
        }
        Ok(closed)
    }

    /// Drain the output channel. Returns the number of events seen.
    fn poll_events(&mut self) -> Result<usize, DecodeError> {
        let Some(handle) = self.decoder.as_mut() else {
            return Ok(0);
        };
        let mut received = 0;
        let mut failure = None;
        while let Ok(event) = handle.events.try_recv() {
            received += 1;
            match event {
                DecoderEvent::Output(frame) => {
                    self.outputs += 1;
                    if frame.timestamp != DISCARD_TIMESTAMP {
                        self.frames.push_back(frame);
                    }
                }
                DecoderEvent::Flushed => {
                    self.pending_flushes = self.pending_flushes.saturating_sub(1);
                }
                DecoderEvent::Error(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = failure {
            self.recover(err)?;
        }
        Ok(received)
    }

    fn drop_stale(&mut self, time: Micros) {
        while self.frames.front().is_some_and(|f| f.end() <= time) {
            self.frames.pop_front();
        }
    }

    /// Keep one GoP decoding ahead while the queue runs low.
    async fn prefetch(&mut self) -> Result<(), DecodeError> {
        if self.frames.len() < self.settings.low_water_frames
            && self.pending_flushes == 0
            && self.cursor < self.samples.len()
        {
            self.submit_gop().await?;
        }
        Ok(())
    }

    /// Submit the GoP at the cursor and flush it. Returns whether anything was
    /// submitted.
    async fn submit_gop(&mut self) -> Result<bool, DecodeError> {
        let start = self.cursor;
        if start >= self.samples.len() {
            return Ok(false);
        }
        match &self.decoder {
            Some(handle)
                if handle.decoder.decode_queue_size() <= self.settings.max_decode_queue => {}
            Some(handle) => {
                debug!(
                    queue = handle.decoder.decode_queue_size(),
                    "Decoder queue full, holding back next GoP"
                );
                return Ok(false);
            }
            None => return Ok(false),
        }

        let end = self.samples[start + 1..]
            .iter()
            .position(|s| s.is_sync)
            .map_or(self.samples.len(), |i| start + 1 + i);
        let samples = Arc::clone(&self.samples);

        for (i, sample) in samples[start..end].iter().enumerate() {
            let (offset, size) = sample.decode_range();
            let data = self.store.read(offset, size).await?;
            self.check_abort()?;
            let chunk = EncodedChunk {
                kind: if i == 0 && sample.is_sync {
                    ChunkType::Key
                } else {
                    ChunkType::Delta
                },
                timestamp: if sample.deleted {
                    DISCARD_TIMESTAMP
                } else {
                    sample.cts
                },
                duration: sample.duration,
                data,
            };
            if !self.submit(|d| d.decode(chunk))? {
                return Ok(false);
            }
        }
        if !self.submit(|d| d.flush())? {
            return Ok(false);
        }

        self.pending_flushes += 1;
        self.cursor = end;
        trace!(start, end, "Submitted GoP");
        Ok(true)
    }

    /// Run one decoder call. A synchronous error on a decoder that already
    /// closed itself is left for the event channel to explain.
    fn submit<F>(&mut self, op: F) -> Result<bool, DecodeError>
    where
        F: FnOnce(&mut Box<dyn Decoder<VideoDecoderConfig>>) -> Result<(), CodecError>,
    {
        let Some(handle) = self.decoder.as_mut() else {
            return Ok(false);
        };
        match op(&mut handle.decoder) {
            Ok(()) => Ok(true),
            Err(_) if handle.decoder.state() == CodecState::Closed => Ok(false),
            Err(err) => {
                self.recover(err)?;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_common::testing::{FakeCodecs, FakeOptions, FakeStats};
    use mc_common::TrackConfig;
    use mc_demux::testing::{demux_all, progressive_mp4, Fixture};
    use mc_store::MemoryStore;

    fn setup(
        fixture: &Fixture,
        options: FakeOptions,
        edit: impl FnOnce(&mut Vec<Sample>),
    ) -> (VideoFrameFinder, FakeCodecs, Arc<Vec<Sample>>) {
        let bytes = progressive_mp4(fixture);
        let mut demuxed = demux_all(&bytes).unwrap();
        let config = match &demuxed.movie.video().unwrap().config {
            TrackConfig::Video(c) => c.clone(),
            TrackConfig::Audio(_) => unreachable!(),
        };
        edit(&mut demuxed.video);
        let samples = Arc::new(demuxed.video);
        let codecs = FakeCodecs::new(options);
        let finder = VideoFrameFinder::new(
            Arc::new(MemoryStore::from_bytes(bytes)),
            samples.clone(),
            config,
            Arc::new(codecs.clone()),
            FinderConfig::default(),
        );
        (finder, codecs, samples)
    }

    #[tokio::test]
    async fn sequential_requests_return_each_frame_in_order() {
        let (mut finder, codecs, samples) = setup(&Fixture::default(), FakeOptions::default(), |_| {});
        let mut last = -1;
        for sample in samples.iter() {
            let frame = finder.find(sample.cts).await.unwrap().unwrap();
            assert_eq!(frame.timestamp, sample.cts);
            assert!(frame.timestamp > last);
            last = frame.timestamp;
        }
        assert_eq!(finder.find(2_000_000).await.unwrap(), None);
        assert_eq!(FakeStats::get(&codecs.stats.video_decoders), 1);
        assert_eq!(FakeStats::get(&codecs.stats.video_units), 60);
    }

    #[tokio::test]
    async fn repeated_time_is_served_from_queue() {
        let (mut finder, codecs, _) = setup(&Fixture::default(), FakeOptions::default(), |_| {});
        let a = finder.find(50_000).await.unwrap().unwrap();
        let b = finder.find(50_000).await.unwrap().unwrap();
        assert_eq!(a.timestamp, b.timestamp);
        assert!(a.covers(50_000));
        assert_eq!(FakeStats::get(&codecs.stats.video_decoders), 1);

        // Equal to the cursor is not a backward request.
        let c = finder.find(100_000).await.unwrap().unwrap();
        let d = finder.find(100_000).await.unwrap().unwrap();
        assert_eq!(c.timestamp, d.timestamp);
        assert_eq!(FakeStats::get(&codecs.stats.video_decoders), 1);
    }

    #[tokio::test]
    async fn backward_request_resets_from_gop_start() {
        let (mut finder, codecs, samples) = setup(&Fixture::default(), FakeOptions::default(), |_| {});
        finder.find(samples[50].cts).await.unwrap().unwrap();
        let frame = finder.find(samples[10].cts).await.unwrap().unwrap();
        assert_eq!(frame.timestamp, samples[10].cts);
        assert_eq!(FakeStats::get(&codecs.stats.video_decoders), 2);
    }

    #[tokio::test]
    async fn far_jump_resets_but_near_jump_decodes_forward() {
        let (mut finder, codecs, samples) =
            setup(&Fixture::seconds(10), FakeOptions::default(), |_| {});
        finder.find(0).await.unwrap().unwrap();
        finder.find(samples[45].cts).await.unwrap().unwrap();
        assert_eq!(FakeStats::get(&codecs.stats.video_decoders), 1);

        // 45 -> 200 is more than three seconds ahead.
        let frame = finder.find(samples[200].cts).await.unwrap().unwrap();
        assert_eq!(frame.timestamp, samples[200].cts);
        assert_eq!(FakeStats::get(&codecs.stats.video_decoders), 2);
    }

    #[tokio::test]
    async fn hardware_failure_falls_back_to_software_once() {
        let options = FakeOptions {
            fail_hardware: true,
            ..Default::default()
        };
        let (mut finder, codecs, samples) = setup(&Fixture::default(), options, |_| {});
        let frame = finder.find(samples[3].cts).await.unwrap().unwrap();
        assert_eq!(frame.timestamp, samples[3].cts);
        assert!(finder.is_software());
        assert_eq!(FakeStats::get(&codecs.stats.software_configures), 1);
        assert_eq!(FakeStats::get(&codecs.stats.video_decoders), 2);
    }

    #[tokio::test]
    async fn second_failure_is_fatal() {
        let options = FakeOptions {
            fail_always: true,
            ..Default::default()
        };
        let (mut finder, _, _) = setup(&Fixture::default(), options, |_| {});
        let err = finder.find(0).await.unwrap_err();
        assert!(matches!(err, DecodeError::FallbackFailed(_)), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_decoder_times_out_with_diagnostics() {
        let options = FakeOptions {
            stall: true,
            ..Default::default()
        };
        let (mut finder, _, _) = setup(&Fixture::default(), options, |_| {});
        match finder.find(0).await {
            Err(DecodeError::Timeout {
                waited_ms,
                diagnostics,
            }) => {
                assert!(waited_ms >= 6_000);
                assert!(diagnostics.contains("cursor 60/60"), "{diagnostics}");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deleted_samples_are_decoded_but_not_shown() {
        let (mut finder, codecs, samples) = setup(&Fixture::default(), FakeOptions::default(), |s| {
            for sample in &mut s[5..10] {
                sample.deleted = true;
            }
        });
        assert_eq!(finder.find(samples[5].cts).await.unwrap(), None);
        let frame = finder.find(samples[10].cts).await.unwrap().unwrap();
        assert_eq!(frame.timestamp, samples[10].cts);
        // The whole first GoP went through the decoder for reference.
        assert_eq!(FakeStats::get(&codecs.stats.video_units), 30);
    }

    #[tokio::test]
    async fn close_aborts_further_requests() {
        let (mut finder, _, _) = setup(&Fixture::default(), FakeOptions::default(), |_| {});
        finder.find(0).await.unwrap();
        finder.abort_handle().trigger();
        assert!(matches!(finder.find(40_000).await, Err(DecodeError::Closed)));
        finder.close();
        assert!(finder.diagnostics().decoder_state.is_none());
    }
}
