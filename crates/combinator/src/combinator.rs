//! The timeline scheduler.
//!
//! A session advances in fixed steps of one output frame. Every step it
//! expires finished sprites, ticks the ones covering the current time in
//! layer order, composites their frames, mixes their audio and hands both to
//! the [`MuxEngine`]. Muxed bytes leave through a channel every flush
//! interval; the channel closes once the final fragment has been sent.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mc_audio::{frames_for, resample_buffer, AudioMixer, MixerInput};
use mc_common::{AudioData, CombinatorConfig, EncoderFactory, Micros, MICROS_PER_SEC};
use mc_mux::MuxEngine;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::admission::{AdmissionHandle, AdmissionRegistry};
use crate::canvas::{Compositor, CpuCanvas, Placement};
use crate::error::{CombinatorError, CombinatorResult};
use crate::events::{CombinatorEvent, Progress};
use crate::sprite::Sprite;

/// Totals of a finished session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CombinatorSummary {
    pub frames: u64,
    pub duration: Micros,
    pub bytes: u64,
}

/// Collects sprites, then renders them in a background task.
pub struct Combinator {
    config: CombinatorConfig,
    factory: Arc<dyn EncoderFactory>,
    admission: Arc<AdmissionRegistry>,
    compositor: Option<Box<dyn Compositor>>,
    sprites: Vec<Sprite>,
}

impl Combinator {
    pub fn new(
        config: CombinatorConfig,
        factory: Arc<dyn EncoderFactory>,
        admission: Arc<AdmissionRegistry>,
    ) -> Self {
        Self {
            config,
            factory,
            admission,
            compositor: None,
            sprites: Vec::new(),
        }
    }

    /// Replace the default [`CpuCanvas`].
    pub fn with_compositor(mut self, compositor: Box<dyn Compositor>) -> Self {
        self.compositor = Some(compositor);
        self
    }

    pub fn add(&mut self, sprite: Sprite) {
        debug!(
            offset = sprite.offset,
            end = sprite.end(),
            layer = sprite.layer,
            main = sprite.main,
            "Combinator: sprite added"
        );
        self.sprites.push(sprite);
    }

    pub fn sprites(&self) -> &[Sprite] {
        &self.sprites
    }

    /// Output length: the main sprite's end, else the latest end.
    pub fn duration(&self) -> Micros {
        timeline_duration(&self.sprites)
    }

    /// Spawn the session on the current runtime.
    pub fn start(self) -> CombinatorHandle {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(output_tx, events_tx));
        CombinatorHandle {
            output: output_rx,
            events: events_rx,
            task,
        }
    }

    async fn run(
        self,
        output: mpsc::UnboundedSender<Bytes>,
        events: mpsc::UnboundedSender<CombinatorEvent>,
    ) -> CombinatorResult<CombinatorSummary> {
        let mut session = match Session::new(self, output, events.clone()) {
            Ok(session) => session,
            Err(err) => {
                error!("Combinator failed to start: {}", err);
                let _ = events.send(CombinatorEvent::Error(err.to_string()));
                return Err(err);
            }
        };
        match session.render().await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                error!("Combinator session failed: {}", err);
                session.destroy_sprites();
                let _ = events.send(CombinatorEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for Combinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Combinator")
            .field("resolution", &self.config.resolution())
            .field("fps", &self.config.fps)
            .field("sprites", &self.sprites)
            .finish()
    }
}

/// Receiving end of a running session.
pub struct CombinatorHandle {
    /// Muxed MP4 bytes in order. Closes after the last fragment.
    pub output: mpsc::UnboundedReceiver<Bytes>,
    pub events: mpsc::UnboundedReceiver<CombinatorEvent>,
    task: JoinHandle<CombinatorResult<CombinatorSummary>>,
}

impl CombinatorHandle {
    /// Wait for the session to finish.
    pub async fn join(self) -> CombinatorResult<CombinatorSummary> {
        self.task
            .await
            .map_err(|e| CombinatorError::Task(e.to_string()))?
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

fn timeline_duration(sprites: &[Sprite]) -> Micros {
    sprites
        .iter()
        .find(|s| s.main)
        .map(Sprite::end)
        .unwrap_or_else(|| sprites.iter().map(Sprite::end).max().unwrap_or(0))
}

/// Sum one tick of audio. When no source produced anything the tick is
/// filled with silence of the length a source would have delivered.
pub(crate) fn mix_tick(
    mixer: &AudioMixer,
    timestamp: Micros,
    buffers: &[(AudioData, f32)],
    tick: Micros,
) -> CombinatorResult<AudioData> {
    let frames = buffers.iter().map(|(a, _)| a.frames()).max().unwrap_or(0);
    if frames == 0 {
        return Ok(AudioData::silence(
            timestamp,
            mixer.sample_rate,
            mixer.channels,
            frames_for(tick, mixer.sample_rate),
        ));
    }
    let inputs: Vec<MixerInput<'_>> = buffers
        .iter()
        .map(|(audio, volume)| MixerInput {
            audio,
            volume: *volume,
            muted: false,
        })
        .collect();
    Ok(mixer.mix(timestamp, &inputs, frames)?)
}

// ─── Session ────────────────────────────────────────────────────

struct Session {
    config: CombinatorConfig,
    engine: MuxEngine,
    compositor: Box<dyn Compositor>,
    mixer: AudioMixer,
    admission: AdmissionHandle,
    sprites: Vec<Sprite>,
    output: mpsc::UnboundedSender<Bytes>,
    events: mpsc::UnboundedSender<CombinatorEvent>,
    progress: Progress,
    duration: Micros,
    /// Audio frames handed to the encoder; stamps the next buffer.
    audio_frames: u64,
    bytes: u64,
    last_flush: Instant,
}

impl Session {
    fn new(
        combinator: Combinator,
        output: mpsc::UnboundedSender<Bytes>,
        events: mpsc::UnboundedSender<CombinatorEvent>,
    ) -> CombinatorResult<Self> {
        let Combinator {
            config,
            factory,
            admission,
            compositor,
            sprites,
        } = combinator;

        if sprites.is_empty() {
            return Err(CombinatorError::NoSources);
        }
        if config.resolution().is_empty() {
            return Err(CombinatorError::InvalidConfig(format!(
                "empty canvas {}",
                config.resolution()
            )));
        }
        if config.fps.num == 0 || config.fps.den == 0 || config.tick() <= 0 {
            return Err(CombinatorError::InvalidConfig(format!("frame rate {}", config.fps)));
        }
        if config.audio && (config.audio_sample_rate == 0 || config.audio_channels == 0) {
            return Err(CombinatorError::InvalidConfig(
                "audio enabled without sample rate or channels".into(),
            ));
        }

        let engine = MuxEngine::new(config.mux_config(), factory.as_ref())?;
        let compositor =
            compositor.unwrap_or_else(|| Box::new(CpuCanvas::new(config.resolution())));
        let duration = timeline_duration(&sprites);
        info!(
            resolution = %config.resolution(),
            fps = %config.fps,
            sprites = sprites.len(),
            duration,
            audio = config.audio,
            "Combinator session starting"
        );

        Ok(Self {
            mixer: AudioMixer::new(config.audio_sample_rate, config.audio_channels as usize),
            admission: admission.register(),
            progress: Progress::new(duration),
            config,
            engine,
            compositor,
            sprites,
            output,
            events,
            duration,
            audio_frames: 0,
            bytes: 0,
            last_flush: Instant::now(),
        })
    }

    async fn render(&mut self) -> CombinatorResult<CombinatorSummary> {
        let tick = self.config.tick();
        let mut frames: u64 = 0;
        let mut time: Micros = 0;

        while time < self.duration {
            self.wait_for_admission().await?;
            if self.expire(time) {
                info!(time, "Main sprite ended, closing session");
                break;
            }
            self.render_tick(time, tick).await?;
            frames += 1;
            time = frames as Micros * tick;
            self.maybe_flush(time)?;
        }

        self.destroy_sprites();
        let progress = self.progress.update(self.duration, self.engine.queue_depth());
        self.send_event(CombinatorEvent::OutputProgress(progress));

        let tail = self.engine.close().await?;
        self.send_output(tail);
        let (video_units, audio_units) = self.engine.units_written();
        info!(
            frames,
            video_units,
            audio_units,
            bytes = self.bytes,
            "Combinator session finished"
        );

        let summary = CombinatorSummary {
            frames,
            duration: time.min(self.duration),
            bytes: self.bytes,
        };
        let progress = self.progress.finish();
        self.send_event(CombinatorEvent::OutputProgress(progress));
        self.send_event(CombinatorEvent::Ended {
            duration: summary.duration,
            bytes: summary.bytes,
        });
        self.admission.update(0);
        Ok(summary)
    }

    /// Hold the next tick while this session or the whole process is over
    /// its queue threshold.
    async fn wait_for_admission(&mut self) -> CombinatorResult<()> {
        let poll = self.config.admission_poll_interval();
        let mut waited = Duration::ZERO;
        loop {
            self.engine.poll()?;
            self.admission.update(self.engine.queue_depth());
            if !self.admission.should_wait(
                self.config.instance_queue_threshold,
                self.config.global_queue_threshold,
            ) {
                if !waited.is_zero() {
                    debug!(
                        waited_ms = waited.as_millis() as u64,
                        depth = self.admission.depth(),
                        "Admission granted"
                    );
                }
                return Ok(());
            }
            trace!(
                depth = self.admission.depth(),
                total = self.admission.total_depth(),
                "Admission backoff"
            );
            tokio::time::sleep(poll).await;
            waited += poll;
        }
    }

    /// Drop sprites that ended at or before `time`. Returns true when the
    /// main sprite was among them.
    fn expire(&mut self, time: Micros) -> bool {
        let mut main_ended = false;
        self.sprites.retain_mut(|sprite| {
            if sprite.end() > time {
                return true;
            }
            debug!(end = sprite.end(), main = sprite.main, "Sprite expired");
            sprite.source.destroy();
            main_ended |= sprite.main;
            false
        });
        main_ended
    }

    async fn render_tick(&mut self, time: Micros, tick: Micros) -> CombinatorResult<()> {
        self.compositor.clear(self.config.background);

        let mut order: Vec<usize> = (0..self.sprites.len())
            .filter(|&i| self.sprites[i].covers(time))
            .collect();
        order.sort_by_key(|&i| self.sprites[i].layer);

        let canvas = self.compositor.resolution();
        let mut buffers: Vec<(AudioData, f32)> = Vec::new();
        for index in order {
            let sprite = &mut self.sprites[index];
            let local = sprite.local_time(time);
            let output = sprite.source.tick(local).await?;

            if let Some(frame) = &output.video {
                let placement = sprite.placement.unwrap_or_else(|| Placement::fill(canvas));
                self.compositor.draw(frame, &placement);
            }
            if self.config.audio && !sprite.muted && !output.audio.is_empty() {
                let audio = if output.audio.sample_rate == self.config.audio_sample_rate {
                    output.audio
                } else {
                    resample_buffer(&output.audio, self.config.audio_sample_rate)
                };
                buffers.push((audio, sprite.volume));
            }
        }

        let frame = self.compositor.render(time, tick);
        self.engine.encode_video(frame)?;

        if self.config.audio {
            let timestamp =
                (self.audio_frames * MICROS_PER_SEC as u64 / self.config.audio_sample_rate as u64) as Micros;
            let audio = mix_tick(&self.mixer, timestamp, &buffers, tick)?;
            self.audio_frames += audio.frames() as u64;
            self.engine.encode_audio(audio)?;
        }
        Ok(())
    }

    fn maybe_flush(&mut self, time: Micros) -> CombinatorResult<()> {
        let interval = Duration::from_millis(self.config.flush_interval_ms);
        if self.last_flush.elapsed() < interval {
            return Ok(());
        }
        self.last_flush = Instant::now();
        let bytes = self.engine.take_output()?;
        self.send_output(bytes);
        let progress = self.progress.update(time, self.engine.queue_depth());
        self.send_event(CombinatorEvent::OutputProgress(progress));
        Ok(())
    }

    fn send_output(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.bytes += bytes.len() as u64;
        if self.output.send(bytes).is_err() {
            warn!("Combinator output receiver dropped");
        }
    }

    fn send_event(&self, event: CombinatorEvent) {
        let _ = self.events.send(event);
    }

    fn destroy_sprites(&mut self) {
        for sprite in &mut self.sprites {
            sprite.source.destroy();
        }
        self.sprites.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(frames: usize, level: f32) -> AudioData {
        AudioData::new(0, 48_000, vec![vec![level; frames]; 2])
    }

    #[test]
    fn silence_matches_real_tick_length() {
        let mixer = AudioMixer::new(48_000, 2);
        let tick = 33_333;
        let silence = mix_tick(&mixer, 0, &[], tick).unwrap();
        assert_eq!(silence.frames(), 1600);
        assert_eq!(silence.frames(), frames_for(tick, 48_000));
        assert_eq!(silence.channels.len(), 2);
        assert!(silence.channels[0].iter().all(|s| *s == 0.0));

        let empty = AudioData::new(0, 48_000, vec![Vec::new(); 2]);
        let also_silent = mix_tick(&mixer, 0, &[(empty, 1.0)], tick).unwrap();
        assert_eq!(also_silent.frames(), silence.frames());
    }

    #[test]
    fn sources_are_summed() {
        let mixer = AudioMixer::new(48_000, 2);
        let mixed = mix_tick(
            &mixer,
            100,
            &[(tone(1600, 0.25), 1.0), (tone(1200, 0.25), 2.0)],
            33_333,
        )
        .unwrap();
        assert_eq!(mixed.timestamp, 100);
        assert_eq!(mixed.frames(), 1600);
        assert!((mixed.channels[1][0] - 0.75).abs() < 1e-6);
        assert!((mixed.channels[1][1500] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn duration_prefers_main_sprite() {
        use crate::source::Source;
        use async_trait::async_trait;
        use mc_clip::{TickOutput, TickState};
        use mc_common::EngineResult;

        struct Fixed(Micros);

        #[async_trait]
        impl Source for Fixed {
            fn duration(&self) -> Micros {
                self.0
            }
            async fn tick(&mut self, time: Micros) -> EngineResult<TickOutput> {
                Ok(TickOutput {
                    video: None,
                    audio: AudioData::new(time, 48_000, vec![Vec::new(); 2]),
                    state: TickState::Success,
                })
            }
            fn destroy(&mut self) {}
        }

        let mut sprites = vec![
            Sprite::new(Box::new(Fixed(5_000_000))),
            Sprite::new(Box::new(Fixed(1_000_000))).offset(1_000_000),
        ];
        assert_eq!(timeline_duration(&sprites), 5_000_000);
        sprites[1].main = true;
        assert_eq!(timeline_duration(&sprites), 2_000_000);
        assert_eq!(timeline_duration(&[]), 0);
    }
}
