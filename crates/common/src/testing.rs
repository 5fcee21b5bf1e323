//! Deterministic in-process codec doubles.
//!
//! `FakeCodecs` implements both factory traits. Decoders hold submitted units
//! until `flush()` and then emit them sorted by timestamp, which mimics the
//! reordering a real B-frame decoder performs. Encoders emit immediately
//! unless told to hold their output.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::codec::{
    AudioCodec, AudioDecoderConfig, AudioEncoderConfig, HardwareAcceleration, VideoCodec,
    VideoDecoderConfig, VideoEncoderConfig,
};
use crate::error::CodecError;
use crate::frame::{AudioData, ChunkType, EncodedChunk, PixelFormat, VideoFrame};
use crate::service::{
    AudioDecoderHandle, CodecState, Decoder, DecoderEvent, DecoderFactory, Encoder, EncoderEvent,
    EncoderFactory, EncoderHandle, EncoderOutput, TrackConfig, VideoDecoderHandle,
};
use crate::types::{Micros, Resolution};

/// A minimal `avcC` record (Baseline, level 3.1, one SPS, one PPS).
pub const FAKE_AVCC: &[u8] = &[
    0x01, 0x42, 0x00, 0x1f, 0xff, 0xe1, 0x00, 0x04, 0x67, 0x42, 0x00, 0x1f, 0x01, 0x00, 0x02,
    0x68, 0xce,
];

/// PCM value emitted by fake audio decoders.
pub const FAKE_PCM_LEVEL: f32 = 0.25;

/// Two-byte AAC-LC AudioSpecificConfig for the given rate and channel count.
pub fn aac_specific_config(sample_rate: u32, channels: u16) -> [u8; 2] {
    const RATES: [u32; 13] = [
        96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025,
        8_000, 7_350,
    ];
    let idx = RATES.iter().position(|r| *r == sample_rate).unwrap_or(3) as u8;
    let aot = 2u8;
    [
        (aot << 3) | (idx >> 1),
        ((idx & 1) << 7) | (((channels as u8) & 0x0f) << 3),
    ]
}

/// Behaviour switches for the fakes.
#[derive(Clone, Debug, Default)]
pub struct FakeOptions {
    /// Video decoders not configured for software report a decoding error on
    /// their first unit.
    pub fail_hardware: bool,
    /// Every video decoder reports a decoding error on its first unit.
    pub fail_always: bool,
    /// Video decoders accept input but never emit anything.
    pub stall: bool,
    /// Video encoders hold output until `flush()`.
    pub hold_video: bool,
    /// Audio encoders hold output until `flush()`.
    pub hold_audio: bool,
}

/// Counters observable from tests.
#[derive(Debug, Default)]
pub struct FakeStats {
    pub video_decoders: AtomicUsize,
    pub audio_decoders: AtomicUsize,
    pub software_configures: AtomicUsize,
    pub video_units: AtomicUsize,
    pub audio_units: AtomicUsize,
    pub video_encoded: AtomicUsize,
    pub audio_encoded: AtomicUsize,
}

impl FakeStats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Factory for all fake codecs.
#[derive(Clone, Default)]
pub struct FakeCodecs {
    pub options: FakeOptions,
    pub stats: Arc<FakeStats>,
}

impl FakeCodecs {
    pub fn new(options: FakeOptions) -> Self {
        Self {
            options,
            stats: Arc::new(FakeStats::default()),
        }
    }
}

impl DecoderFactory for FakeCodecs {
    fn create_video(&self) -> Result<VideoDecoderHandle, CodecError> {
        self.stats.video_decoders.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let decoder = FakeVideoDecoder {
            options: self.options.clone(),
            stats: self.stats.clone(),
            tx,
            config: None,
            pending: Vec::new(),
            state: CodecState::Unconfigured,
            needs_key: true,
        };
        Ok(VideoDecoderHandle::new(Box::new(decoder), rx))
    }

    fn create_audio(&self) -> Result<AudioDecoderHandle, CodecError> {
        self.stats.audio_decoders.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let decoder = FakeAudioDecoder {
            stats: self.stats.clone(),
            tx,
            config: None,
            state: CodecState::Unconfigured,
        };
        Ok(AudioDecoderHandle::new(Box::new(decoder), rx))
    }
}

impl EncoderFactory for FakeCodecs {
    fn create_video(
        &self,
        config: &VideoEncoderConfig,
    ) -> Result<EncoderHandle<VideoFrame>, CodecError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let encoder = FakeVideoEncoder {
            config: config.clone(),
            stats: self.stats.clone(),
            hold: self.options.hold_video,
            tx,
            pending: Vec::new(),
            sent_metadata: false,
            state: CodecState::Configured,
        };
        Ok(EncoderHandle::new(Box::new(encoder), rx))
    }

    fn create_audio(
        &self,
        config: &AudioEncoderConfig,
    ) -> Result<EncoderHandle<AudioData>, CodecError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let encoder = FakeAudioEncoder {
            config: config.clone(),
            stats: self.stats.clone(),
            hold: self.options.hold_audio,
            tx,
            pending: Vec::new(),
            sent_metadata: false,
            state: CodecState::Configured,
        };
        Ok(EncoderHandle::new(Box::new(encoder), rx))
    }
}

// ─── Decoders ───────────────────────────────────────────────────

struct FakeVideoDecoder {
    options: FakeOptions,
    stats: Arc<FakeStats>,
    tx: mpsc::UnboundedSender<DecoderEvent<VideoFrame>>,
    config: Option<VideoDecoderConfig>,
    pending: Vec<EncodedChunk>,
    state: CodecState,
    needs_key: bool,
}

impl FakeVideoDecoder {
    fn fail(&mut self, message: &str) {
        self.state = CodecState::Closed;
        self.pending.clear();
        let _ = self.tx.send(DecoderEvent::Error(CodecError::decoding(message)));
    }

    fn frame_for(&self, chunk: &EncodedChunk) -> VideoFrame {
        let resolution = self
            .config
            .as_ref()
            .map(|c| c.coded)
            .filter(|r| !r.is_empty())
            .unwrap_or(Resolution::new(2, 2));
        let shade = (chunk.timestamp / 1_000).rem_euclid(256) as u8;
        let data: Vec<u8> = [shade, shade, shade, 255]
            .iter()
            .copied()
            .cycle()
            .take(resolution.rgba_byte_size())
            .collect();
        VideoFrame {
            timestamp: chunk.timestamp,
            duration: chunk.duration,
            resolution,
            format: PixelFormat::Rgba8,
            data: Bytes::from(data),
        }
    }
}

impl Decoder<VideoDecoderConfig> for FakeVideoDecoder {
    fn configure(&mut self, config: &VideoDecoderConfig) -> Result<(), CodecError> {
        if self.state == CodecState::Closed {
            return Err(CodecError::fatal("configure on closed decoder"));
        }
        if config.hardware_acceleration == HardwareAcceleration::PreferSoftware {
            self.stats.software_configures.fetch_add(1, Ordering::SeqCst);
        }
        self.config = Some(config.clone());
        self.state = CodecState::Configured;
        self.needs_key = true;
        Ok(())
    }

    fn decode(&mut self, chunk: EncodedChunk) -> Result<(), CodecError> {
        if self.state != CodecState::Configured {
            return Err(CodecError::fatal("decode on unconfigured decoder"));
        }
        self.stats.video_units.fetch_add(1, Ordering::SeqCst);
        let software = self
            .config
            .as_ref()
            .is_some_and(|c| c.hardware_acceleration == HardwareAcceleration::PreferSoftware);
        if self.options.fail_always || (self.options.fail_hardware && !software) {
            self.fail("unsupported bitstream");
            return Ok(());
        }
        if self.needs_key && !chunk.is_key() {
            self.fail("key frame required after configure or flush");
            return Ok(());
        }
        self.needs_key = false;
        self.pending.push(chunk);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        if self.state != CodecState::Configured {
            return Err(CodecError::fatal("flush on unconfigured decoder"));
        }
        if self.options.stall {
            return Ok(());
        }
        self.pending.sort_by_key(|c| c.timestamp);
        for chunk in std::mem::take(&mut self.pending) {
            let frame = self.frame_for(&chunk);
            let _ = self.tx.send(DecoderEvent::Output(frame));
        }
        self.needs_key = true;
        let _ = self.tx.send(DecoderEvent::Flushed);
        Ok(())
    }

    fn decode_queue_size(&self) -> usize {
        self.pending.len()
    }

    fn state(&self) -> CodecState {
        self.state
    }

    fn close(&mut self) {
        self.pending.clear();
        self.state = CodecState::Closed;
    }
}

struct FakeAudioDecoder {
    stats: Arc<FakeStats>,
    tx: mpsc::UnboundedSender<DecoderEvent<AudioData>>,
    config: Option<AudioDecoderConfig>,
    state: CodecState,
}

impl Decoder<AudioDecoderConfig> for FakeAudioDecoder {
    fn configure(&mut self, config: &AudioDecoderConfig) -> Result<(), CodecError> {
        self.config = Some(config.clone());
        self.state = CodecState::Configured;
        Ok(())
    }

    fn decode(&mut self, chunk: EncodedChunk) -> Result<(), CodecError> {
        let Some(config) = &self.config else {
            return Err(CodecError::fatal("decode on unconfigured decoder"));
        };
        self.stats.audio_units.fetch_add(1, Ordering::SeqCst);
        let frames = ((chunk.duration as i128 * config.sample_rate as i128 + 500_000) / 1_000_000) as usize;
        let channels = vec![vec![FAKE_PCM_LEVEL; frames]; config.channels.max(1) as usize];
        let data = AudioData::new(chunk.timestamp, config.sample_rate, channels);
        let _ = self.tx.send(DecoderEvent::Output(data));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        let _ = self.tx.send(DecoderEvent::Flushed);
        Ok(())
    }

    fn decode_queue_size(&self) -> usize {
        0
    }

    fn state(&self) -> CodecState {
        self.state
    }

    fn close(&mut self) {
        self.state = CodecState::Closed;
    }
}

// ─── Encoders ───────────────────────────────────────────────────

fn send_or_hold(
    tx: &mpsc::UnboundedSender<EncoderEvent>,
    pending: &mut Vec<EncoderOutput>,
    hold: bool,
    output: EncoderOutput,
) {
    if hold {
        pending.push(output);
    } else {
        let _ = tx.send(EncoderEvent::Output(output));
    }
}

fn drain_pending(tx: &mpsc::UnboundedSender<EncoderEvent>, pending: &mut Vec<EncoderOutput>) {
    for output in pending.drain(..) {
        let _ = tx.send(EncoderEvent::Output(output));
    }
    let _ = tx.send(EncoderEvent::Flushed);
}

struct FakeVideoEncoder {
    config: VideoEncoderConfig,
    stats: Arc<FakeStats>,
    hold: bool,
    tx: mpsc::UnboundedSender<EncoderEvent>,
    pending: Vec<EncoderOutput>,
    sent_metadata: bool,
    state: CodecState,
}

impl Encoder<VideoFrame> for FakeVideoEncoder {
    fn encode(&mut self, frame: VideoFrame, keyframe: bool) -> Result<(), CodecError> {
        if self.state == CodecState::Closed {
            return Err(CodecError::fatal("encode on closed encoder"));
        }
        self.stats.video_encoded.fetch_add(1, Ordering::SeqCst);
        let nal_type = if keyframe { 0x65 } else { 0x41 };
        let mut data = vec![0, 0, 0, 5, nal_type];
        data.extend_from_slice(&(frame.timestamp as u32).to_be_bytes());
        let metadata = (!self.sent_metadata).then(|| {
            TrackConfig::Video(VideoDecoderConfig {
                codec: VideoCodec::H264,
                codec_string: "avc1.42001f".into(),
                coded: self.config.resolution,
                description: Some(Bytes::from_static(FAKE_AVCC)),
                hardware_acceleration: HardwareAcceleration::NoPreference,
            })
        });
        self.sent_metadata = true;
        let output = EncoderOutput {
            chunk: EncodedChunk {
                kind: if keyframe { ChunkType::Key } else { ChunkType::Delta },
                timestamp: frame.timestamp,
                duration: frame.duration,
                data: Bytes::from(data),
            },
            metadata,
        };
        send_or_hold(&self.tx, &mut self.pending, self.hold, output);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        drain_pending(&self.tx, &mut self.pending);
        Ok(())
    }

    fn encode_queue_size(&self) -> usize {
        self.pending.len()
    }

    fn state(&self) -> CodecState {
        self.state
    }

    fn close(&mut self) {
        self.pending.clear();
        self.state = CodecState::Closed;
    }
}

struct FakeAudioEncoder {
    config: AudioEncoderConfig,
    stats: Arc<FakeStats>,
    hold: bool,
    tx: mpsc::UnboundedSender<EncoderEvent>,
    pending: Vec<EncoderOutput>,
    sent_metadata: bool,
    state: CodecState,
}

impl Encoder<AudioData> for FakeAudioEncoder {
    fn encode(&mut self, audio: AudioData, _keyframe: bool) -> Result<(), CodecError> {
        if self.state == CodecState::Closed {
            return Err(CodecError::fatal("encode on closed encoder"));
        }
        self.stats.audio_encoded.fetch_add(1, Ordering::SeqCst);
        let duration: Micros = audio.duration();
        let metadata = (!self.sent_metadata).then(|| {
            let asc = aac_specific_config(self.config.sample_rate, self.config.channels);
            TrackConfig::Audio(AudioDecoderConfig {
                codec: AudioCodec::Aac,
                codec_string: "mp4a.40.2".into(),
                sample_rate: self.config.sample_rate,
                channels: self.config.channels,
                description: Some(Bytes::copy_from_slice(&asc)),
            })
        });
        self.sent_metadata = true;
        let output = EncoderOutput {
            chunk: EncodedChunk {
                kind: ChunkType::Key,
                timestamp: audio.timestamp,
                duration,
                data: Bytes::from(vec![0x21, audio.frames() as u8, 0x00, 0x00]),
            },
            metadata,
        };
        send_or_hold(&self.tx, &mut self.pending, self.hold, output);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        drain_pending(&self.tx, &mut self.pending);
        Ok(())
    }

    fn encode_queue_size(&self) -> usize {
        self.pending.len()
    }

    fn state(&self) -> CodecState {
        self.state
    }

    fn close(&mut self) {
        self.pending.clear();
        self.state = CodecState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(ts: Micros, key: bool) -> EncodedChunk {
        EncodedChunk {
            kind: if key { ChunkType::Key } else { ChunkType::Delta },
            timestamp: ts,
            duration: 10,
            data: Bytes::new(),
        }
    }

    fn video_config(hw: HardwareAcceleration) -> VideoDecoderConfig {
        VideoDecoderConfig {
            codec: VideoCodec::H264,
            codec_string: "avc1.42001f".into(),
            coded: Resolution::new(2, 2),
            description: None,
            hardware_acceleration: hw,
        }
    }

    #[test]
    fn aac_config_for_48k_stereo() {
        assert_eq!(aac_specific_config(48_000, 2), [0x11, 0x90]);
        assert_eq!(aac_specific_config(44_100, 2), [0x12, 0x10]);
    }

    #[test]
    fn decoder_reorders_on_flush() {
        let codecs = FakeCodecs::default();
        let mut handle = DecoderFactory::create_video(&codecs).unwrap();
        handle
            .decoder
            .configure(&video_config(HardwareAcceleration::NoPreference))
            .unwrap();
        handle.decoder.decode(chunk(0, true)).unwrap();
        handle.decoder.decode(chunk(30, false)).unwrap();
        handle.decoder.decode(chunk(10, false)).unwrap();
        assert_eq!(handle.decoder.decode_queue_size(), 3);
        handle.decoder.flush().unwrap();

        let mut stamps = Vec::new();
        while let Ok(DecoderEvent::Output(frame)) = handle.events.try_recv() {
            stamps.push(frame.timestamp);
        }
        assert_eq!(stamps, vec![0, 10, 30]);
    }

    #[test]
    fn hardware_failure_only_hits_hardware() {
        let codecs = FakeCodecs::new(FakeOptions {
            fail_hardware: true,
            ..Default::default()
        });
        let mut hw = DecoderFactory::create_video(&codecs).unwrap();
        hw.decoder
            .configure(&video_config(HardwareAcceleration::PreferHardware))
            .unwrap();
        hw.decoder.decode(chunk(0, true)).unwrap();
        assert!(matches!(hw.events.try_recv(), Ok(DecoderEvent::Error(_))));
        assert_eq!(hw.decoder.state(), CodecState::Closed);

        let mut sw = DecoderFactory::create_video(&codecs).unwrap();
        sw.decoder
            .configure(&video_config(HardwareAcceleration::PreferSoftware))
            .unwrap();
        sw.decoder.decode(chunk(0, true)).unwrap();
        assert!(sw.events.try_recv().is_err());
    }

    #[test]
    fn held_encoder_output_released_on_flush() {
        let codecs = FakeCodecs::new(FakeOptions {
            hold_audio: true,
            ..Default::default()
        });
        let mut handle =
            EncoderFactory::create_audio(&codecs, &AudioEncoderConfig::default()).unwrap();
        handle
            .encoder
            .encode(AudioData::silence(0, 48_000, 2, 480), false)
            .unwrap();
        assert_eq!(handle.encoder.encode_queue_size(), 1);
        assert!(handle.events.try_recv().is_err());
        handle.encoder.flush().unwrap();
        match handle.events.try_recv() {
            Ok(EncoderEvent::Output(out)) => {
                assert_eq!(out.chunk.duration, 10_000);
                assert!(matches!(out.metadata, Some(TrackConfig::Audio(_))));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(handle.events.try_recv(), Ok(EncoderEvent::Flushed)));
    }
}
