//! MP4/MOV (ISO BMFF) container parsing.
//!
//! Box parsers are synchronous functions over `Read + Seek`; the incremental
//! [`StreamDemuxer`](crate::StreamDemuxer) feeds them complete structural
//! boxes.

pub mod boxes;
pub mod codec;
pub mod fragment;
pub mod moov;
pub mod sample;

pub use codec::{avc_codec_string, hevc_codec_string, parse_es_descriptor, EsdsInfo};
pub use fragment::{FragmentState, TrackFragment};
pub use moov::{parse_moov, MovieInfo, ParsedMoov, ParsedTrack, TrackInfo};
pub use sample::{SampleEntry, SampleTableBoxes};
