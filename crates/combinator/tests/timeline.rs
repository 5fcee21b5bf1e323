//! Whole sessions over fake encoders: timeline length, main sprite cut-off,
//! draw order, error teardown and admission bookkeeping.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use mc_clip::{Mp4Clip, TickOutput, TickState};
use mc_combinator::{
    AdmissionRegistry, Combinator, CombinatorError, CombinatorEvent, CombinatorHandle,
    CombinatorSummary, Compositor, CpuCanvas, Placement, Source, Sprite,
};
use mc_common::testing::FakeCodecs;
use mc_common::{
    track_duration, AudioData, ClipConfig, CombinatorConfig, DecodeError, EngineResult, Micros,
    PixelFormat, Resolution, VideoFrame,
};
use mc_demux::testing::{demux_all, progressive_mp4, DemuxedFixture, Fixture};
use mc_store::{MemoryStore, SharedStore};

const TICK: Micros = 33_333;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn small_config() -> CombinatorConfig {
    CombinatorConfig {
        width: 32,
        height: 18,
        ..CombinatorConfig::default()
    }
}

async fn audio_clip(secs: u32) -> Mp4Clip {
    let store: SharedStore = Arc::new(MemoryStore::from_bytes(progressive_mp4(
        &Fixture::audio_only(secs),
    )));
    Mp4Clip::from_store(store, Arc::new(FakeCodecs::default()), ClipConfig::default())
        .await
        .unwrap()
}

struct Finished {
    bytes: Vec<u8>,
    events: Vec<CombinatorEvent>,
    result: Result<CombinatorSummary, CombinatorError>,
}

async fn finish(mut handle: CombinatorHandle) -> Finished {
    let mut bytes = Vec::new();
    while let Some(chunk) = handle.output.recv().await {
        bytes.extend_from_slice(&chunk);
    }
    let mut events = Vec::new();
    while let Some(event) = handle.events.recv().await {
        events.push(event);
    }
    let result = handle.join().await;
    Finished {
        bytes,
        events,
        result,
    }
}

fn demux(bytes: &[u8]) -> DemuxedFixture {
    demux_all(bytes).unwrap()
}

/// Solid-color source with observable lifecycle.
struct Tone {
    duration: Micros,
    color: [u8; 4],
    fail_at: Option<Micros>,
    ticks: Arc<AtomicUsize>,
    destroyed: Arc<AtomicBool>,
}

impl Tone {
    fn new(duration: Micros, color: [u8; 4]) -> Self {
        Self {
            duration,
            color,
            fail_at: None,
            ticks: Arc::new(AtomicUsize::new(0)),
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Source for Tone {
    fn duration(&self) -> Micros {
        self.duration
    }

    async fn tick(&mut self, time: Micros) -> EngineResult<TickOutput> {
        if self.fail_at.is_some_and(|at| time >= at) {
            return Err(DecodeError::Closed.into());
        }
        self.ticks.fetch_add(1, Ordering::SeqCst);
        let resolution = Resolution::new(2, 2);
        Ok(TickOutput {
            video: Some(VideoFrame {
                timestamp: time,
                duration: TICK,
                resolution,
                format: PixelFormat::Rgba8,
                data: Bytes::from(self.color.repeat(4)),
            }),
            audio: AudioData::new(time, 48_000, vec![vec![0.1; 1600]; 2]),
            state: TickState::Success,
        })
    }

    fn destroy(&mut self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Records the color of every frame drawn, per tick.
struct Recording {
    inner: CpuCanvas,
    ticks: Arc<Mutex<Vec<Vec<[u8; 4]>>>>,
}

impl Compositor for Recording {
    fn resolution(&self) -> Resolution {
        self.inner.resolution()
    }

    fn clear(&mut self, color: [u8; 4]) {
        self.ticks.lock().unwrap().push(Vec::new());
        self.inner.clear(color);
    }

    fn draw(&mut self, frame: &VideoFrame, placement: &Placement) {
        if let Some(tick) = self.ticks.lock().unwrap().last_mut() {
            tick.push(frame.rgba_at(0, 0));
        }
        self.inner.draw(frame, placement);
    }

    fn render(&mut self, timestamp: Micros, duration: Micros) -> VideoFrame {
        self.inner.render(timestamp, duration)
    }
}

#[tokio::test(start_paused = true)]
async fn audio_sources_without_main_run_to_longest() {
    init_tracing();
    let registry = AdmissionRegistry::new();
    let mut combinator = Combinator::new(
        small_config(),
        Arc::new(FakeCodecs::default()),
        registry.clone(),
    );
    combinator.add(Sprite::new(Box::new(audio_clip(5).await)));
    combinator.add(Sprite::new(Box::new(audio_clip(4).await)));
    assert_eq!(combinator.duration(), 5_013_333);

    let done = finish(combinator.start()).await;
    let summary = done.result.unwrap();
    assert_eq!(summary.frames, 151);
    assert_eq!(summary.bytes, done.bytes.len() as u64);

    let output = demux(&done.bytes);
    assert_eq!(output.video.len(), 151);
    // One audio buffer per tick, silence included.
    assert_eq!(output.audio.len(), 151);
    let video = track_duration(&output.video);
    let audio = track_duration(&output.audio);
    assert!((video - 5_000_000).abs() < 50_000, "video lasts {video}us");
    assert!((audio - 5_000_000).abs() < 50_000, "audio lasts {audio}us");
    // GoP of three seconds at 30fps.
    assert_eq!(output.video.iter().filter(|s| s.is_sync).count(), 2);

    assert_eq!(registry.instances(), 0);
    assert_eq!(registry.total_depth(), 0);
}

#[tokio::test(start_paused = true)]
async fn main_sprite_ends_the_session() {
    let long = Tone::new(5_000_000, [255, 0, 0, 255]);
    let long_destroyed = long.destroyed.clone();
    let main = Tone::new(1_000_000, [0, 0, 255, 255]);
    let main_ticks = main.ticks.clone();

    let mut combinator = Combinator::new(
        small_config(),
        Arc::new(FakeCodecs::default()),
        AdmissionRegistry::new(),
    );
    combinator.add(Sprite::new(Box::new(long)));
    combinator.add(Sprite::new(Box::new(main)).offset(500_000).main());
    assert_eq!(combinator.duration(), 1_500_000);

    let done = finish(combinator.start()).await;
    let summary = done.result.unwrap();
    // Ticks at 0, 33_333, ... up to the last one before 1.5s.
    assert_eq!(summary.frames, 46);
    assert_eq!(summary.duration, 1_500_000);
    assert_eq!(main_ticks.load(Ordering::SeqCst), 30);
    assert!(long_destroyed.load(Ordering::SeqCst));
    assert_eq!(demux(&done.bytes).video.len(), 46);
}

#[tokio::test(start_paused = true)]
async fn higher_layers_draw_last() {
    let ticks = Arc::new(Mutex::new(Vec::new()));
    let recording = Recording {
        inner: CpuCanvas::new(Resolution::new(32, 18)),
        ticks: ticks.clone(),
    };
    let top = [0, 255, 0, 255];
    let bottom = [255, 0, 0, 255];
    let late = [0, 0, 255, 255];

    let mut combinator = Combinator::new(
        small_config(),
        Arc::new(FakeCodecs::default()),
        AdmissionRegistry::new(),
    )
    .with_compositor(Box::new(recording));
    combinator.add(Sprite::new(Box::new(Tone::new(200_000, top))).layer(2));
    combinator.add(Sprite::new(Box::new(Tone::new(200_000, bottom))));
    combinator.add(
        Sprite::new(Box::new(Tone::new(100_000, late)))
            .offset(100_000)
            .layer(1)
            .placement(Placement::new(0, 0, 8, 8).with_opacity(0.5)),
    );

    let done = finish(combinator.start()).await;
    assert_eq!(done.result.unwrap().frames, 7);

    let ticks = ticks.lock().unwrap();
    assert_eq!(ticks.len(), 7);
    assert_eq!(ticks[0], vec![bottom, top]);
    // 99_999 is still before the late sprite's offset.
    assert_eq!(ticks[3], vec![bottom, top]);
    assert_eq!(ticks[4], vec![bottom, late, top]);
    assert_eq!(ticks[6], vec![bottom, late, top]);
}

#[tokio::test(start_paused = true)]
async fn source_error_halts_and_releases_everything() {
    let mut failing = Tone::new(2_000_000, [255, 255, 255, 255]);
    failing.fail_at = Some(1_000_000);
    let failing_destroyed = failing.destroyed.clone();
    let other = Tone::new(2_000_000, [0, 0, 0, 255]);
    let other_destroyed = other.destroyed.clone();

    let registry = AdmissionRegistry::new();
    let mut combinator =
        Combinator::new(small_config(), Arc::new(FakeCodecs::default()), registry.clone());
    combinator.add(Sprite::new(Box::new(failing)));
    combinator.add(Sprite::new(Box::new(other)));

    let done = finish(combinator.start()).await;
    assert!(matches!(done.result, Err(CombinatorError::Source(_))));
    assert!(matches!(done.events.last(), Some(CombinatorEvent::Error(_))));
    assert!(!done
        .events
        .iter()
        .any(|e| matches!(e, CombinatorEvent::Ended { .. })));
    assert!(failing_destroyed.load(Ordering::SeqCst));
    assert!(other_destroyed.load(Ordering::SeqCst));
    assert_eq!(registry.instances(), 0);
}

#[tokio::test(start_paused = true)]
async fn progress_is_monotonic_and_ends_at_one() {
    let config = CombinatorConfig {
        flush_interval_ms: 0,
        ..small_config()
    };
    let mut combinator =
        Combinator::new(config, Arc::new(FakeCodecs::default()), AdmissionRegistry::new());
    combinator.add(Sprite::new(Box::new(Tone::new(500_000, [9, 9, 9, 255]))).main());

    let done = finish(combinator.start()).await;
    let summary = done.result.unwrap();

    let progress: Vec<f64> = done
        .events
        .iter()
        .filter_map(|e| match e {
            CombinatorEvent::OutputProgress(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert!(progress.len() > 2);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last().copied(), Some(1.0));
    assert_eq!(
        done.events.last(),
        Some(&CombinatorEvent::Ended {
            duration: summary.duration,
            bytes: summary.bytes,
        })
    );
    assert_eq!(summary.duration, 500_000);
}

#[tokio::test]
async fn empty_timeline_is_an_error() {
    let combinator = Combinator::new(
        small_config(),
        Arc::new(FakeCodecs::default()),
        AdmissionRegistry::new(),
    );
    let done = finish(combinator.start()).await;
    assert!(matches!(done.result, Err(CombinatorError::NoSources)));
    assert!(done.bytes.is_empty());
    assert!(matches!(done.events.as_slice(), [CombinatorEvent::Error(_)]));
}

#[tokio::test(start_paused = true)]
async fn global_queue_depth_holds_a_quiet_session() {
    let registry = AdmissionRegistry::new();
    // Four busy neighbours, each under its own limit, together over 150.
    let mut neighbours: Vec<_> = (0..4).map(|_| registry.register()).collect();
    for neighbour in &mut neighbours {
        neighbour.update(40);
    }
    assert_eq!(registry.total_depth(), 160);

    let tone = Tone::new(300_000, [1, 2, 3, 255]);
    let ticks = tone.ticks.clone();
    let mut combinator =
        Combinator::new(small_config(), Arc::new(FakeCodecs::default()), registry.clone());
    combinator.add(Sprite::new(Box::new(tone)).main());
    let handle = combinator.start();

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 0);
    assert_eq!(registry.instances(), 5);

    neighbours[0].update(0);
    let done = finish(handle).await;
    assert_eq!(done.result.unwrap().frames, 10);
    assert_eq!(ticks.load(Ordering::SeqCst), 10);
    drop(neighbours);
    assert_eq!(registry.instances(), 0);
    assert_eq!(registry.total_depth(), 0);
}
