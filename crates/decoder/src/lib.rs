//! `mc-decoder` — Time-indexed decode caches over external codec services.
//!
//! - [`VideoFrameFinder`]: frame covering an arbitrary time, with a warm
//!   decoder, GoP look-ahead, software fallback and stall detection
//! - [`AudioFrameFinder`]: continuous stereo PCM runs at a fixed rate
//! - [`thumbnail`]: nearest-neighbour frame scaling
//!
//! Finders own their decoder exclusively and are never shared between
//! clips. Every suspension point (store reads, decoder polls) checks the
//! finder's [`AbortSignal`].

pub mod abort;
pub mod audio;
pub mod diagnostics;
pub mod thumbnail;
pub mod video;

pub use abort::AbortSignal;
pub use audio::AudioFrameFinder;
pub use diagnostics::FinderDiagnostics;
pub use thumbnail::{scale_to_width, Thumbnail};
pub use video::VideoFrameFinder;
