//! Audio Frame Finder: continuous PCM runs keyed by request time.
//!
//! Each `find(time)` returns the audio between the previous request and
//! `time`, exactly `ceil(Δt · rate / 1e6)` frames, resampled to the target
//! rate, scaled by the clip volume and always stereo. Decoded surplus waits
//! in a FIFO for the next call. The reset policy mirrors the video finder.

use std::sync::Arc;

use mc_audio::{apply_volume, expand_mono, frames_for, PcmQueue, Resampler};
use mc_common::{
    AudioData, AudioDecoderConfig, AudioDecoderHandle, ChunkType, CodecError, DecodeError,
    DecoderEvent, DecoderFactory, EncodedChunk, FinderConfig, Micros, Sample,
};
use mc_store::SharedStore;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, trace};

use crate::abort::AbortSignal;
use crate::diagnostics::FinderDiagnostics;

/// Output channel layout.
pub const OUTPUT_CHANNELS: usize = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Tail {
    /// More samples to submit.
    Open,
    /// Final flush sent, waiting for `Flushed`.
    Flushing,
    Drained,
}

pub struct AudioFrameFinder {
    store: SharedStore,
    samples: Arc<Vec<Sample>>,
    config: AudioDecoderConfig,
    factory: Arc<dyn DecoderFactory>,
    settings: FinderConfig,
    volume: f32,
    decoder: Option<AudioDecoderHandle>,
    cursor: usize,
    cursor_time: Option<Micros>,
    resampler: Resampler,
    queue: PcmQueue,
    /// Decoded audio before this time is dropped once it arrives.
    trim_before: Option<Micros>,
    tail: Tail,
    outputs: usize,
    abort: AbortSignal,
}

impl AudioFrameFinder {
    pub fn new(
        store: SharedStore,
        samples: Arc<Vec<Sample>>,
        config: AudioDecoderConfig,
        factory: Arc<dyn DecoderFactory>,
        settings: FinderConfig,
        volume: f32,
    ) -> Self {
        let target = settings.target_sample_rate;
        Self {
            resampler: Resampler::new(config.sample_rate, target),
            queue: PcmQueue::new(target, OUTPUT_CHANNELS),
            store,
            samples,
            config,
            factory,
            settings,
            volume,
            decoder: None,
            cursor: 0,
            cursor_time: None,
            trim_before: None,
            tail: Tail::Open,
            outputs: 0,
            abort: AbortSignal::new(),
        }
    }

    pub fn abort_handle(&self) -> AbortSignal {
        self.abort.clone()
    }

    pub fn sample_rate(&self) -> u32 {
        self.settings.target_sample_rate
    }

    /// Audio covering `[previous request, time)`.
    ///
    /// The first request, and any request that triggers a reset, returns an
    /// empty buffer positioned at `time`. Near the end of the track the run
    /// may be shorter than requested; once drained it is empty.
    pub async fn find(&mut self, time: Micros) -> Result<AudioData, DecodeError> {
        self.check_abort()?;
        let start = match self.cursor_time {
            Some(last)
                if self.decoder.is_some()
                    && time >= last
                    && time - last <= self.settings.audio_reset_window =>
            {
                last
            }
            _ => {
                self.seek(time)?;
                time
            }
        };
        self.cursor_time = Some(time);

        let rate = self.settings.target_sample_rate;
        let need = frames_for(time - start, rate);
        self.fill(need, start).await?;

        let mut out = self.queue.take(need);
        out.timestamp = start;
        trace!(start, time, frames = out.frames(), "Audio run");
        Ok(out)
    }

    pub fn close(&mut self) {
        self.abort.trigger();
        self.decoder = None;
        self.queue.clear();
    }

    pub fn diagnostics(&self) -> FinderDiagnostics {
        FinderDiagnostics {
            cursor: self.cursor,
            samples: self.samples.len(),
            requested: self.cursor_time,
            queued: self.queue.len(),
            decode_queue: self
                .decoder
                .as_ref()
                .map_or(0, |h| h.decoder.decode_queue_size()),
            pending_flushes: usize::from(self.tail == Tail::Flushing),
            decoder_state: self.decoder.as_ref().map(|h| h.decoder.state()),
            outputs: self.outputs,
            software: false,
        }
    }

    fn check_abort(&self) -> Result<(), DecodeError> {
        if self.abort.is_aborted() {
            return Err(DecodeError::Closed);
        }
        Ok(())
    }

    /// New decoder, empty buffers, cursor on the first sample still audible at `time`.
    fn seek(&mut self, time: Micros) -> Result<(), DecodeError> {
        self.decoder = None;
        let mut handle = self.factory.create_audio()?;
        handle.decoder.configure(&self.config)?;
        self.decoder = Some(handle);

        self.cursor = self
            .samples
            .iter()
            .position(|s| !s.deleted && s.end() > time)
            .unwrap_or(self.samples.len());
        self.queue.clear();
        self.resampler.reset();
        self.trim_before = Some(time);
        self.tail = Tail::Open;
        self.outputs = 0;
        debug!(time, cursor = self.cursor, "Audio finder reset");
        Ok(())
    }

    async fn fill(&mut self, need: usize, start: Micros) -> Result<(), DecodeError> {
        let mut last_progress = Instant::now();
        while self.queue.len() < need {
            self.check_abort()?;
            if self.poll_events()? > 0 {
                last_progress = Instant::now();
                continue;
            }
            if self.decoder.is_none() {
                // Reclaimed: rebuild and decode this run again.
                self.seek(start)?;
                last_progress = Instant::now();
                continue;
            }
            if self.tail == Tail::Drained {
                break;
            }
            if self.submit_batch().await? {
                last_progress = Instant::now();
                continue;
            }

            let waited = last_progress.elapsed();
            if waited >= self.settings.audio_timeout() {
                let diagnostics = self.diagnostics();
                error!(%diagnostics, "Audio decode made no progress");
                return Err(DecodeError::Timeout {
                    waited_ms: waited.as_millis() as u64,
                    diagnostics: diagnostics.to_string(),
                });
            }
            sleep(self.settings.poll_interval()).await;
        }
        Ok(())
    }

    /// Submit the next batch, or the final flush once samples run out.
    async fn submit_batch(&mut self) -> Result<bool, DecodeError> {
        match &self.decoder {
            Some(h) if h.decoder.decode_queue_size() <= self.settings.audio_max_decode_queue => {}
            _ => return Ok(false),
        }
        if self.cursor >= self.samples.len() {
            if self.tail != Tail::Open {
                return Ok(false);
            }
            if let Some(handle) = self.decoder.as_mut() {
                handle.decoder.flush()?;
            }
            self.tail = Tail::Flushing;
            return Ok(true);
        }

        let end = (self.cursor + self.settings.audio_batch_size.max(1)).min(self.samples.len());
        let samples = Arc::clone(&self.samples);
        for sample in samples[self.cursor..end].iter().filter(|s| !s.deleted) {
            let (offset, size) = sample.decode_range();
            let data = self.store.read(offset, size).await?;
            self.check_abort()?;
            let Some(handle) = self.decoder.as_mut() else {
                return Ok(false);
            };
            handle.decoder.decode(EncodedChunk {
                kind: ChunkType::Key,
                timestamp: sample.cts,
                duration: sample.duration,
                data,
            })?;
        }
        self.cursor = end;
        Ok(true)
    }

    fn poll_events(&mut self) -> Result<usize, DecodeError> {
        let Some(handle) = self.decoder.as_mut() else {
            return Ok(0);
        };
        let mut received = 0;
        let mut decoded = Vec::new();
        let mut failure = None;
        while let Ok(event) = handle.events.try_recv() {
            received += 1;
            match event {
                DecoderEvent::Output(audio) => decoded.push(audio),
                DecoderEvent::Flushed => {
                    if self.tail == Tail::Flushing {
                        self.tail = Tail::Drained;
                    }
                }
                DecoderEvent::Error(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        for audio in decoded {
            self.accept(audio)?;
        }
        if let Some(err) = failure {
            self.decoder = None;
            if !err.is_reclaimed() {
                error!(error = %err, "Audio decode failed");
                return Err(DecodeError::Codec(err));
            }
            debug!(error = %err, "Audio decoder reclaimed, re-creating");
        }
        Ok(received)
    }

    /// Normalize one decoder output and queue it.
    fn accept(&mut self, audio: AudioData) -> Result<(), DecodeError> {
        self.outputs += 1;
        if audio.sample_rate != self.resampler.from_rate() {
            debug!(
                from = self.resampler.from_rate(),
                to = audio.sample_rate,
                "Decoder output rate differs from track config"
            );
            self.resampler = Resampler::new(audio.sample_rate, self.settings.target_sample_rate);
        }
        let mut audio = self.resampler.process(&audio);
        audio.channels.truncate(OUTPUT_CHANNELS);
        let mut audio = expand_mono(audio);
        apply_volume(&mut audio, self.volume);
        self.queue
            .push(&audio)
            .map_err(|e| DecodeError::Codec(CodecError::decoding(e.to_string())))?;

        if let Some(start) = self.trim_before.take() {
            if let Some(head) = self.queue.head_timestamp() {
                let skip = ((start - head).max(0) as i128 * self.queue.sample_rate() as i128
                    / 1_000_000) as usize;
                if skip > 0 {
                    self.queue.take(skip);
                }
            }
        }
        Ok(())
    }
}
