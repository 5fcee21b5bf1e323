//! `mc-clip` — Editable clips over ingested MP4 data.
//!
//! - [`ingest`]: stream or store to per-track sample tables
//! - [`editor`]: soft-delete trim, split, GoP leader protection
//! - [`Mp4Clip`]: ready metadata, `tick`, `split`, `delete_range`,
//!   thumbnails, clone and destroy
//!
//! ```text
//! bytes ─► ByteStore ─┐
//!        StreamDemuxer ─► SampleTransform ─► Vec<Sample> ─► editor ─► Frame finders
//! ```

mod clip;
pub mod editor;
pub mod ingest;
pub mod meta;

pub use clip::Mp4Clip;
pub use ingest::{ingest_store, ingest_stream, Ingested};
pub use meta::{ClipMeta, ThumbnailOptions, TickOutput, TickState};
