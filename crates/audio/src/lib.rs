//! `mc-audio` — Planar PCM processing for the mediaclip engine.
//!
//! - **Resampler**: streaming linear interpolation to a fixed target rate
//! - **Mixer**: additive multi-source mixing with zero padding
//! - **PCM helpers**: volume, mono expansion, interleaving, frame arithmetic
//! - **Queue**: FIFO that hands out exact-size runs from decoder output
//!
//! ```text
//! decoder output -> Resampler -> volume / expand_mono -> PcmQueue -> AudioMixer
//! ```

pub mod error;
pub mod mixer;
pub mod pcm;
pub mod queue;
pub mod resampler;

pub use error::AudioError;
pub use mixer::{mix_into, AudioMixer, MixerInput};
pub use pcm::{apply_volume, deinterleave, expand_mono, frames_for, interleave};
pub use queue::PcmQueue;
pub use resampler::{resample_buffer, Resampler};
