//! Codec service abstraction.
//!
//! Decoders and encoders are opaque request/response services. Work is
//! submitted synchronously (`decode`, `encode`, `flush`) and results come back
//! on an explicit output channel as [`DecoderEvent`]s / [`EncoderEvent`]s, in
//! presentation order. A real hardware codec, a software library, or a test
//! double (see `testing`) can sit behind these traits.

use tokio::sync::mpsc;

use crate::codec::{AudioDecoderConfig, AudioEncoderConfig, VideoDecoderConfig, VideoEncoderConfig};
use crate::error::CodecError;
use crate::frame::{AudioData, EncodedChunk, VideoFrame};

/// Lifecycle state of a codec service.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecState {
    Unconfigured,
    Configured,
    Closed,
}

/// Message delivered on a decoder's output channel.
#[derive(Debug)]
pub enum DecoderEvent<O> {
    Output(O),
    /// Every unit submitted before the matching `flush()` has been emitted.
    Flushed,
    Error(CodecError),
}

/// Decoder service, configured with `C`.
pub trait Decoder<C>: Send {
    fn configure(&mut self, config: &C) -> Result<(), CodecError>;

    /// Enqueue one access unit. Units must arrive in decode order.
    fn decode(&mut self, chunk: EncodedChunk) -> Result<(), CodecError>;

    /// Request that all pending output be emitted, followed by `Flushed`.
    fn flush(&mut self) -> Result<(), CodecError>;

    /// Units accepted but not yet turned into output.
    fn decode_queue_size(&self) -> usize;

    fn state(&self) -> CodecState;

    fn close(&mut self);
}

/// A decoder together with the receiving end of its output channel.
pub struct DecoderHandle<C, O> {
    pub decoder: Box<dyn Decoder<C>>,
    pub events: mpsc::UnboundedReceiver<DecoderEvent<O>>,
}

impl<C, O> DecoderHandle<C, O> {
    pub fn new(
        decoder: Box<dyn Decoder<C>>,
        events: mpsc::UnboundedReceiver<DecoderEvent<O>>,
    ) -> Self {
        Self { decoder, events }
    }
}

impl<C, O> Drop for DecoderHandle<C, O> {
    fn drop(&mut self) {
        if self.decoder.state() != CodecState::Closed {
            self.decoder.close();
        }
    }
}

pub type VideoDecoderHandle = DecoderHandle<VideoDecoderConfig, VideoFrame>;
pub type AudioDecoderHandle = DecoderHandle<AudioDecoderConfig, AudioData>;

/// Creates unconfigured decoders.
pub trait DecoderFactory: Send + Sync {
    fn create_video(&self) -> Result<VideoDecoderHandle, CodecError>;
    fn create_audio(&self) -> Result<AudioDecoderHandle, CodecError>;
}

/// Decoder configuration of one track: what a demuxer reports for an input
/// track and what an encoder reports with its first output.
#[derive(Clone, Debug, PartialEq)]
pub enum TrackConfig {
    Video(VideoDecoderConfig),
    Audio(AudioDecoderConfig),
}

/// An encoded unit plus, on the first unit of a session, its track metadata.
#[derive(Clone, Debug)]
pub struct EncoderOutput {
    pub chunk: EncodedChunk,
    pub metadata: Option<TrackConfig>,
}

/// Message delivered on an encoder's output channel.
#[derive(Debug)]
pub enum EncoderEvent {
    Output(EncoderOutput),
    Flushed,
    Error(CodecError),
}

/// Encoder service consuming raw units `I`. Configured at creation.
pub trait Encoder<I>: Send {
    fn encode(&mut self, input: I, keyframe: bool) -> Result<(), CodecError>;

    fn flush(&mut self) -> Result<(), CodecError>;

    /// Units accepted but not yet emitted. This is the backpressure signal.
    fn encode_queue_size(&self) -> usize;

    fn state(&self) -> CodecState;

    fn close(&mut self);
}

/// An encoder together with the receiving end of its output channel.
pub struct EncoderHandle<I> {
    pub encoder: Box<dyn Encoder<I>>,
    pub events: mpsc::UnboundedReceiver<EncoderEvent>,
}

impl<I> EncoderHandle<I> {
    pub fn new(encoder: Box<dyn Encoder<I>>, events: mpsc::UnboundedReceiver<EncoderEvent>) -> Self {
        Self { encoder, events }
    }
}

impl<I> Drop for EncoderHandle<I> {
    fn drop(&mut self) {
        if self.encoder.state() != CodecState::Closed {
            self.encoder.close();
        }
    }
}

/// Creates configured encoders.
pub trait EncoderFactory: Send + Sync {
    fn create_video(&self, config: &VideoEncoderConfig)
        -> Result<EncoderHandle<VideoFrame>, CodecError>;
    fn create_audio(&self, config: &AudioEncoderConfig)
        -> Result<EncoderHandle<AudioData>, CodecError>;
}
