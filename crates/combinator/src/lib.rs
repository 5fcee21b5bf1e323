//! `mc-combinator` — Timeline scheduler for the mediaclip engine.
//!
//! Composites any number of sources into a single encoded, fragmented MP4
//! stream at a fixed frame rate.
//!
//! # Architecture
//!
//! ```text
//! Sprite (Source + offset/layer/placement)
//!      │ tick(time - offset)
//!      ▼
//! Compositor ──► VideoFrame ─┐
//! AudioMixer ──► AudioData ──┴─► MuxEngine ──► Bytes channel
//!                                   │
//!                       AdmissionRegistry (queue depth)
//! ```
//!
//! Every running session registers its encode-queue depth with a shared
//! [`AdmissionRegistry`] and pauses while either it or the whole process
//! is over its threshold.
//!
//! # Usage
//!
//! ```ignore
//! let registry = AdmissionRegistry::new();
//! let mut combinator = Combinator::new(CombinatorConfig::default(), encoders, registry);
//! combinator.add(Sprite::new(Box::new(clip)).main());
//! let mut handle = combinator.start();
//! while let Some(bytes) = handle.output.recv().await {
//!     sink.write_all(&bytes).await?;
//! }
//! let summary = handle.join().await?;
//! ```

pub mod admission;
pub mod canvas;
mod combinator;
pub mod error;
pub mod events;
pub mod source;
pub mod sprite;

pub use admission::{AdmissionHandle, AdmissionRegistry};
pub use canvas::{Compositor, CpuCanvas, Placement};
pub use combinator::{Combinator, CombinatorHandle, CombinatorSummary};
pub use error::{CombinatorError, CombinatorResult};
pub use events::CombinatorEvent;
pub use source::Source;
pub use sprite::Sprite;
