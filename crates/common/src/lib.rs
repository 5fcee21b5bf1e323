//! `mc-common` — Shared types, traits, and errors for the mediaclip engine.
//!
//! This crate is the foundation that all other engine crates depend on.
//! It defines the core abstractions:
//!
//! - **Types**: `Micros` timestamps, `Resolution`, `Rational`
//! - **Samples**: `Sample`, `TrackKind` (the sample-table data model)
//! - **Media units**: `EncodedChunk`, `VideoFrame`, `AudioData`
//! - **Codec services**: `Decoder`, `Encoder`, `DecoderFactory`, `EncoderFactory`
//!   (opaque request/response codecs with an explicit output channel)
//! - **Errors**: `EngineError`, `DemuxError`, `DecodeError`, etc. (thiserror-based)
//! - **Config**: `FinderConfig`, `ClipConfig`, `MuxConfig`, `CombinatorConfig`

pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod sample;
pub mod service;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used items at crate root
pub use codec::{
    AudioCodec, AudioDecoderConfig, AudioEncoderConfig, HardwareAcceleration, VideoCodec,
    VideoDecoderConfig, VideoEncoderConfig,
};
pub use config::{ClipConfig, CombinatorConfig, FinderConfig, MuxConfig};
pub use error::{
    CodecError, CodecErrorKind, DecodeError, DemuxError, EditError, EncodeError, EngineError,
    EngineResult, StoreError,
};
pub use frame::{AudioData, ChunkType, EncodedChunk, PixelFormat, VideoFrame, DISCARD_TIMESTAMP};
pub use sample::{track_duration, Sample, TrackKind};
pub use service::{
    AudioDecoderHandle, CodecState, Decoder, DecoderEvent, DecoderFactory, DecoderHandle, Encoder,
    EncoderEvent, EncoderFactory, EncoderHandle, EncoderOutput, TrackConfig, VideoDecoderHandle,
};
pub use types::{
    micros_to_secs, micros_to_ticks, secs_to_micros, ticks_to_micros, Micros, Rational,
    Resolution, MICROS_PER_SEC,
};
