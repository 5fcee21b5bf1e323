//! moov parsing: movie header, per-track metadata and sample tables, and the
//! mvex defaults that fragmented files rely on.

use byteorder::{BigEndian, ReadBytesExt};
use mc_common::{ticks_to_micros, DemuxError, Micros, Resolution, TrackConfig, TrackKind};
use std::io::{Read, Seek, SeekFrom};
use tracing::{debug, warn};

use super::boxes::{
    fourcc_to_string, parse_chunk_offsets, parse_ctts, parse_hdlr, parse_media_header, parse_stsc,
    parse_stss, parse_stsz, parse_stts, parse_tkhd, parse_trex, read_box_header, read_full_box,
    BoxHeader, MediaHeader, TkhdBox, TrexBox, CO64, CTTS, HDLR, MDHD, MDIA, MEHD, MINF, MVEX,
    MVHD, SOUN, STBL, STCO, STSC, STSD, STSS, STSZ, STTS, TKHD, TRAK, TREX, VIDE,
};
use super::codec::parse_stsd;
use super::sample::{SampleEntry, SampleTableBoxes};

/// Metadata of one audio or video track.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackInfo {
    pub track_id: u32,
    pub kind: TrackKind,
    /// Media timescale (ticks per second).
    pub timescale: u32,
    /// Media duration in timescale ticks; 0 if unknown.
    pub duration: u64,
    pub resolution: Resolution,
    pub config: TrackConfig,
}

impl TrackInfo {
    pub fn duration_micros(&self) -> Micros {
        ticks_to_micros(self.duration as i64, self.timescale)
    }
}

/// Everything the movie header says about the file.
#[derive(Clone, Debug, PartialEq)]
pub struct MovieInfo {
    pub major_brand: String,
    pub compatible_brands: Vec<String>,
    /// Movie timescale from mvhd.
    pub timescale: u32,
    /// Movie duration in movie ticks (from mehd when the file is fragmented).
    pub duration: u64,
    /// Whether samples arrive in moof fragments.
    pub fragmented: bool,
    pub tracks: Vec<TrackInfo>,
}

impl MovieInfo {
    pub fn duration_micros(&self) -> Micros {
        ticks_to_micros(self.duration as i64, self.timescale)
    }

    pub fn track(&self, track_id: u32) -> Option<&TrackInfo> {
        self.tracks.iter().find(|t| t.track_id == track_id)
    }

    /// First video track.
    pub fn video(&self) -> Option<&TrackInfo> {
        self.tracks.iter().find(|t| t.kind == TrackKind::Video)
    }

    /// First audio track.
    pub fn audio(&self) -> Option<&TrackInfo> {
        self.tracks.iter().find(|t| t.kind == TrackKind::Audio)
    }
}

/// A track plus the samples its moov sample table describes.
#[derive(Clone, Debug)]
pub struct ParsedTrack {
    pub info: TrackInfo,
    pub samples: Vec<SampleEntry>,
}

/// Result of parsing a complete moov box.
#[derive(Clone, Debug)]
pub struct ParsedMoov {
    pub header: MediaHeader,
    pub fragment_duration: Option<u64>,
    pub fragmented: bool,
    pub tracks: Vec<ParsedTrack>,
    pub trex: Vec<TrexBox>,
}

impl ParsedMoov {
    /// Movie duration in movie ticks, preferring mvhd over mehd.
    pub fn duration(&self) -> u64 {
        if self.header.duration > 0 {
            self.header.duration
        } else {
            self.fragment_duration.unwrap_or(0)
        }
    }
}

/// Visit each child box in `[current, parent_end)`, leaving the reader at
/// the end of each child afterwards regardless of how much was consumed.
fn for_each_child<R, F>(reader: &mut R, parent_end: u64, mut visit: F) -> Result<(), DemuxError>
where
    R: Read + Seek,
    F: FnMut(&mut R, &BoxHeader) -> Result<(), DemuxError>,
{
    while reader.stream_position()? + 8 <= parent_end {
        let Some(child) = read_box_header(reader)? else {
            break;
        };
        visit(reader, &child)?;
        let end = child.end_offset().unwrap_or(parent_end).min(parent_end);
        reader.seek(SeekFrom::Start(end))?;
    }
    Ok(())
}

/// Parse a moov box. Reader must be positioned at the content start.
pub fn parse_moov<R: Read + Seek>(
    reader: &mut R,
    header: &BoxHeader,
) -> Result<ParsedMoov, DemuxError> {
    let moov_end = header.definite_end("moov")?;
    let mut mvhd = None;
    let mut fragment_duration = None;
    let mut fragmented = false;
    let mut tracks = Vec::new();
    let mut trex = Vec::new();

    for_each_child(reader, moov_end, |reader, child| {
        match child.box_type {
            MVHD => mvhd = Some(parse_media_header(reader)?),
            TRAK => {
                if let Some(track) = parse_trak(reader, child)? {
                    tracks.push(track);
                }
            }
            MVEX => {
                fragmented = true;
                let mvex_end = child.definite_end("mvex")?;
                for_each_child(reader, mvex_end, |reader, child| {
                    match child.box_type {
                        MEHD => fragment_duration = Some(parse_mehd(reader)?),
                        TREX => trex.push(parse_trex(reader)?),
                        _ => {}
                    }
                    Ok(())
                })?;
            }
            _ => {}
        }
        Ok(())
    })?;

    let header = mvhd.ok_or_else(|| DemuxError::InvalidStructure {
        offset: header.offset,
        reason: "moov has no mvhd".into(),
    })?;
    debug!(
        "moov: timescale={}, duration={}, {} A/V tracks, fragmented={}",
        header.timescale,
        header.duration,
        tracks.len(),
        fragmented
    );

    Ok(ParsedMoov {
        header,
        fragment_duration,
        fragmented,
        tracks,
        trex,
    })
}

fn parse_mehd<R: Read>(reader: &mut R) -> Result<u64, DemuxError> {
    let full = read_full_box(reader)?;
    Ok(if full.version == 1 {
        reader.read_u64::<BigEndian>()?
    } else {
        reader.read_u32::<BigEndian>()? as u64
    })
}

/// Accumulates the pieces of one trak as its children are visited.
#[derive(Default)]
struct TrakBuilder {
    tkhd: Option<TkhdBox>,
    media: Option<MediaHeader>,
    handler: Option<u32>,
    config: Option<TrackConfig>,
    tables: SampleTableBoxes,
}

impl TrakBuilder {
    /// None for tracks that are neither audio nor video.
    fn finish(self, offset: u64) -> Result<Option<ParsedTrack>, DemuxError> {
        let kind = match self.handler {
            Some(VIDE) => TrackKind::Video,
            Some(SOUN) => TrackKind::Audio,
            other => {
                debug!(
                    "Skipping track with handler '{}'",
                    other.map(fourcc_to_string).unwrap_or_default()
                );
                return Ok(None);
            }
        };
        let missing = |what: &str| DemuxError::InvalidStructure {
            offset,
            reason: format!("{} track has no {what}", kind.as_str()),
        };
        let tkhd = self.tkhd.ok_or_else(|| missing("tkhd"))?;
        let media = self.media.ok_or_else(|| missing("mdhd"))?;
        let config = self.config.ok_or_else(|| missing("stsd"))?;

        let resolution = match &config {
            TrackConfig::Video(video) if !video.coded.is_empty() => video.coded,
            TrackConfig::Video(_) => Resolution::new(tkhd.width, tkhd.height),
            TrackConfig::Audio(_) => Resolution::default(),
        };
        let samples = self.tables.build()?;

        debug!(
            "Track {}: {} {} samples, timescale={}, {}",
            tkhd.track_id,
            samples.len(),
            kind.as_str(),
            media.timescale,
            resolution
        );

        Ok(Some(ParsedTrack {
            info: TrackInfo {
                track_id: tkhd.track_id,
                kind,
                timescale: media.timescale,
                duration: media.duration,
                resolution,
                config,
            },
            samples,
        }))
    }
}

fn parse_trak<R: Read + Seek>(
    reader: &mut R,
    header: &BoxHeader,
) -> Result<Option<ParsedTrack>, DemuxError> {
    let mut trak = TrakBuilder::default();
    for_each_child(reader, header.definite_end("trak")?, |reader, child| {
        match child.box_type {
            TKHD => trak.tkhd = Some(parse_tkhd(reader)?),
            MDIA => parse_mdia(reader, child, &mut trak)?,
            _ => {}
        }
        Ok(())
    })?;
    trak.finish(header.offset)
}

fn parse_mdia<R: Read + Seek>(
    reader: &mut R,
    header: &BoxHeader,
    trak: &mut TrakBuilder,
) -> Result<(), DemuxError> {
    for_each_child(reader, header.definite_end("mdia")?, |reader, child| {
        match child.box_type {
            MDHD => trak.media = Some(parse_media_header(reader)?),
            HDLR => trak.handler = Some(parse_hdlr(reader)?),
            MINF => {
                let minf_end = child.definite_end("minf")?;
                for_each_child(reader, minf_end, |reader, child| {
                    if child.box_type == STBL {
                        parse_stbl(reader, child, trak)?;
                    }
                    Ok(())
                })?;
            }
            _ => {}
        }
        Ok(())
    })
}

fn parse_stbl<R: Read + Seek>(
    reader: &mut R,
    header: &BoxHeader,
    trak: &mut TrakBuilder,
) -> Result<(), DemuxError> {
    let handler = trak.handler;
    for_each_child(reader, header.definite_end("stbl")?, |reader, child| {
        let tables = &mut trak.tables;
        match child.box_type {
            STSD => match handler {
                Some(h @ (VIDE | SOUN)) => trak.config = Some(parse_stsd(reader, child, h)?),
                Some(_) => {}
                None => warn!("stsd before hdlr; track will be skipped"),
            },
            STTS => tables.stts = parse_stts(reader)?,
            CTTS => tables.ctts = parse_ctts(reader)?,
            STSC => tables.stsc = parse_stsc(reader)?,
            STSZ => tables.stsz = Some(parse_stsz(reader)?),
            STCO => tables.chunk_offsets = parse_chunk_offsets(reader, false)?,
            CO64 => tables.chunk_offsets = parse_chunk_offsets(reader, true)?,
            STSS => tables.sync_samples = Some(parse_stss(reader)?),
            _ => {}
        }
        Ok(())
    })
}
