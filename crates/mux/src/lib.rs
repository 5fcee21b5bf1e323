//! `mc-mux` — fragmented MP4 output for the mediaclip engine.
//!
//! # Architecture
//!
//! - **Box writing** ([`atoms`]): size-patched nested boxes over an in-memory cursor
//! - **Init segment** ([`init`]): `ftyp` + `moov` with empty sample tables and `mvex`
//! - **Fragments** ([`fragment`], [`writer`]): `moof` + `mdat` pairs, drainable as they are produced
//! - **Mux engine** ([`engine`]): encoders per track, header gated on every track's first unit,
//!   queue depth as backpressure, flush/close draining
//! - **Remux** ([`remux`]): concatenation and duration repair without re-encoding
//!
//! # Usage
//!
//! ```ignore
//! use mc_mux::MuxEngine;
//!
//! let mut engine = MuxEngine::new(MuxConfig::default(), &factory)?;
//! engine.encode_video(frame)?;
//! engine.encode_audio(pcm)?;
//! sink.write_all(&engine.take_output()?)?;
//! sink.write_all(&engine.close().await?)?;
//! ```

pub mod atoms;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod init;
pub mod remux;
pub mod writer;

pub use engine::MuxEngine;
pub use error::{MuxError, MuxResult};
pub use fragment::FragmentSample;
pub use init::TrackSpec;
pub use remux::{fast_concat, fix_duration, ConcatSummary};
pub use writer::FragmentedWriter;
