//! `mc-demux` — Incremental MP4 demuxer and sample transform.
//!
//! Turns an arbitrarily chunked ISO BMFF byte stream (progressive or
//! fragmented) into a `Ready` event with per-track decoder configuration,
//! followed by batches of sample descriptors that reference the bytes by
//! absolute offset. [`SampleTransform`] converts those into engine
//! [`Sample`](mc_common::Sample)s in microseconds.

pub mod mp4;
pub mod nal;
pub mod stream;
pub mod transform;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use mp4::{MovieInfo, SampleEntry, TrackInfo};
pub use stream::{DemuxEvent, StreamDemuxer};
pub use transform::SampleTransform;
