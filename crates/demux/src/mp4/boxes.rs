//! ISO BMFF box (atom) parsers.
//!
//! Structural boxes (`ftyp`, `moov`, `moof`) are parsed from an in-memory
//! cursor once the incremental demuxer has buffered them completely, so every
//! parser here is a plain `Read + Seek` function.
//!
//! Reference: ISO 14496-12 (ISO Base Media File Format).

use byteorder::{BigEndian, ReadBytesExt};
use mc_common::DemuxError;
use std::io::{Read, Seek, SeekFrom};
use tracing::{debug, trace};

// ─── Box FourCC constants ────────────────────────────────────────────

/// Convert 4 ASCII bytes to a u32 FourCC code.
pub const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    ((a as u32) << 24) | ((b as u32) << 16) | ((c as u32) << 8) | (d as u32)
}

pub const FTYP: u32 = fourcc(b'f', b't', b'y', b'p');
pub const MOOV: u32 = fourcc(b'm', b'o', b'o', b'v');
pub const MVHD: u32 = fourcc(b'm', b'v', b'h', b'd');
pub const TRAK: u32 = fourcc(b't', b'r', b'a', b'k');
pub const TKHD: u32 = fourcc(b't', b'k', b'h', b'd');
pub const MDIA: u32 = fourcc(b'm', b'd', b'i', b'a');
pub const MDHD: u32 = fourcc(b'm', b'd', b'h', b'd');
pub const HDLR: u32 = fourcc(b'h', b'd', b'l', b'r');
pub const MINF: u32 = fourcc(b'm', b'i', b'n', b'f');
pub const STBL: u32 = fourcc(b's', b't', b'b', b'l');
pub const STSD: u32 = fourcc(b's', b't', b's', b'd');
pub const STTS: u32 = fourcc(b's', b't', b't', b's');
pub const STSC: u32 = fourcc(b's', b't', b's', b'c');
pub const STSZ: u32 = fourcc(b's', b't', b's', b'z');
pub const STCO: u32 = fourcc(b's', b't', b'c', b'o');
pub const CO64: u32 = fourcc(b'c', b'o', b'6', b'4');
pub const STSS: u32 = fourcc(b's', b't', b's', b's');
pub const CTTS: u32 = fourcc(b'c', b't', b't', b's');
pub const MVEX: u32 = fourcc(b'm', b'v', b'e', b'x');
pub const MEHD: u32 = fourcc(b'm', b'e', b'h', b'd');
pub const TREX: u32 = fourcc(b't', b'r', b'e', b'x');
pub const MOOF: u32 = fourcc(b'm', b'o', b'o', b'f');
pub const MFHD: u32 = fourcc(b'm', b'f', b'h', b'd');
pub const TRAF: u32 = fourcc(b't', b'r', b'a', b'f');
pub const TFHD: u32 = fourcc(b't', b'f', b'h', b'd');
pub const TFDT: u32 = fourcc(b't', b'f', b'd', b't');
pub const TRUN: u32 = fourcc(b't', b'r', b'u', b'n');
pub const MDAT: u32 = fourcc(b'm', b'd', b'a', b't');
pub const AVCC: u32 = fourcc(b'a', b'v', b'c', b'C');
pub const AVC1: u32 = fourcc(b'a', b'v', b'c', b'1');
pub const AVC3: u32 = fourcc(b'a', b'v', b'c', b'3');
pub const HEV1: u32 = fourcc(b'h', b'e', b'v', b'1');
pub const HVC1: u32 = fourcc(b'h', b'v', b'c', b'1');
pub const HVCC: u32 = fourcc(b'h', b'v', b'c', b'C');
pub const VIDE: u32 = fourcc(b'v', b'i', b'd', b'e');
pub const SOUN: u32 = fourcc(b's', b'o', b'u', b'n');
pub const MP4A: u32 = fourcc(b'm', b'p', b'4', b'a');
pub const ESDS: u32 = fourcc(b'e', b's', b'd', b's');
pub const OPUS: u32 = fourcc(b'O', b'p', b'u', b's');
pub const DOPS: u32 = fourcc(b'd', b'O', b'p', b's');
pub const WAVE: u32 = fourcc(b'w', b'a', b'v', b'e');

/// Convert a FourCC u32 to a human-readable string for logging.
pub fn fourcc_to_string(cc: u32) -> String {
    cc.to_be_bytes()
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            }
        })
        .collect()
}

// ─── Box Header ─────────────────────────────────────────────────────

/// A parsed ISO BMFF box header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoxHeader {
    pub box_type: u32,
    /// Total box size (including header). 0 means "extends to end of stream".
    pub size: u64,
    /// Offset of the box start, relative to whatever the reader is positioned over.
    pub offset: u64,
    /// 8, or 16 for a 64-bit `largesize` header.
    pub header_size: u8,
}

impl BoxHeader {
    pub fn content_offset(&self) -> u64 {
        self.offset + self.header_size as u64
    }

    /// Payload size, or None if the box extends to the end of the stream.
    pub fn content_size(&self) -> Option<u64> {
        (self.size != 0).then(|| self.size - self.header_size as u64)
    }

    pub fn end_offset(&self) -> Option<u64> {
        (self.size != 0).then(|| self.offset + self.size)
    }

    pub(crate) fn definite_end(&self, what: &str) -> Result<u64, DemuxError> {
        self.end_offset().ok_or_else(|| DemuxError::InvalidStructure {
            offset: self.offset,
            reason: format!("{what} box has no definite size"),
        })
    }
}

/// Decode a box header from the start of `bytes` without consuming them.
///
/// Returns None when `bytes` does not yet hold a complete header. Used by the
/// incremental demuxer, which sees the stream one chunk at a time.
pub fn peek_box_header(bytes: &[u8], offset: u64) -> Result<Option<BoxHeader>, DemuxError> {
    if bytes.len() < 8 {
        return Ok(None);
    }
    let size32 = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let box_type = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let (size, header_size) = match size32 {
        0 => (0, 8),
        1 => {
            if bytes.len() < 16 {
                return Ok(None);
            }
            let mut large = [0u8; 8];
            large.copy_from_slice(&bytes[8..16]);
            (u64::from_be_bytes(large), 16)
        }
        _ => (size32 as u64, 8),
    };
    validate_header(BoxHeader {
        box_type,
        size,
        offset,
        header_size,
    })
    .map(Some)
}

fn validate_header(header: BoxHeader) -> Result<BoxHeader, DemuxError> {
    if header.size != 0 && header.size < header.header_size as u64 {
        return Err(DemuxError::InvalidStructure {
            offset: header.offset,
            reason: format!(
                "Box '{}' has invalid size {} (less than header)",
                fourcc_to_string(header.box_type),
                header.size
            ),
        });
    }
    trace!(
        "Box '{}' at offset {}, size {}",
        fourcc_to_string(header.box_type),
        header.offset,
        header.size
    );
    Ok(header)
}

/// Read a box header from the current position. Returns None at EOF.
pub fn read_box_header<R: Read + Seek>(reader: &mut R) -> Result<Option<BoxHeader>, DemuxError> {
    let offset = reader.stream_position()?;

    let size32 = match reader.read_u32::<BigEndian>() {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(DemuxError::Io(e)),
    };
    let box_type = reader.read_u32::<BigEndian>()?;

    let (size, header_size) = match size32 {
        0 => (0u64, 8u8),
        1 => (reader.read_u64::<BigEndian>()?, 16u8),
        _ => (size32 as u64, 8u8),
    };

    validate_header(BoxHeader {
        box_type,
        size,
        offset,
        header_size,
    })
    .map(Some)
}

/// Seek past the current box.
pub fn skip_box<R: Read + Seek>(reader: &mut R, header: &BoxHeader) -> Result<(), DemuxError> {
    match header.end_offset() {
        Some(end) => reader.seek(SeekFrom::Start(end))?,
        None => reader.seek(SeekFrom::End(0))?,
    };
    Ok(())
}

/// Seek to the end of a box whose content was (possibly partially) consumed.
pub fn seek_past<R: Read + Seek>(reader: &mut R, header: &BoxHeader) -> Result<(), DemuxError> {
    if let Some(end) = header.end_offset() {
        reader.seek(SeekFrom::Start(end))?;
    }
    Ok(())
}

/// Version and 24-bit flags of a full box.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FullBox {
    pub version: u8,
    pub flags: u32,
}

pub fn read_full_box<R: Read>(reader: &mut R) -> Result<FullBox, DemuxError> {
    let word = reader.read_u32::<BigEndian>()?;
    Ok(FullBox {
        version: (word >> 24) as u8,
        flags: word & 0x00FF_FFFF,
    })
}

// ─── ftyp ───────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct FtypBox {
    pub major_brand: u32,
    pub minor_version: u32,
    pub compatible_brands: Vec<u32>,
}

/// Parse an ftyp box. Reader must be positioned at the content start.
pub fn parse_ftyp<R: Read + Seek>(
    reader: &mut R,
    header: &BoxHeader,
) -> Result<FtypBox, DemuxError> {
    let content_size = header
        .content_size()
        .ok_or_else(|| DemuxError::InvalidStructure {
            offset: header.offset,
            reason: "ftyp box cannot extend to EOF".into(),
        })?;

    let major_brand = reader.read_u32::<BigEndian>()?;
    let minor_version = reader.read_u32::<BigEndian>()?;
    let brand_count = content_size.saturating_sub(8) / 4;
    let compatible_brands = (0..brand_count)
        .map(|_| reader.read_u32::<BigEndian>())
        .collect::<Result<Vec<_>, _>>()?;

    debug!(
        "ftyp: major_brand='{}', {} compatible brands",
        fourcc_to_string(major_brand),
        compatible_brands.len()
    );

    Ok(FtypBox {
        major_brand,
        minor_version,
        compatible_brands,
    })
}

// ─── mvhd / mdhd / tkhd / hdlr ──────────────────────────────────────

/// Timescale and duration, shared layout of mvhd and mdhd.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MediaHeader {
    pub timescale: u32,
    pub duration: u64,
}

/// Parse the common prefix of mvhd and mdhd: creation/modification times,
/// timescale, and duration in 32- or 64-bit form.
pub fn parse_media_header<R: Read>(reader: &mut R) -> Result<MediaHeader, DemuxError> {
    let full = read_full_box(reader)?;
    let (timescale, duration) = if full.version == 1 {
        let _creation_time = reader.read_u64::<BigEndian>()?;
        let _modification_time = reader.read_u64::<BigEndian>()?;
        (reader.read_u32::<BigEndian>()?, reader.read_u64::<BigEndian>()?)
    } else {
        let _creation_time = reader.read_u32::<BigEndian>()?;
        let _modification_time = reader.read_u32::<BigEndian>()?;
        let timescale = reader.read_u32::<BigEndian>()?;
        let duration = reader.read_u32::<BigEndian>()?;
        // All-ones marks an unknown duration.
        let duration = if duration == u32::MAX { 0 } else { duration as u64 };
        (timescale, duration)
    };
    Ok(MediaHeader {
        timescale,
        duration,
    })
}

#[derive(Clone, Debug)]
pub struct TkhdBox {
    pub track_id: u32,
    pub width: u32,
    pub height: u32,
}

pub fn parse_tkhd<R: Read>(reader: &mut R) -> Result<TkhdBox, DemuxError> {
    let full = read_full_box(reader)?;
    let track_id = if full.version == 1 {
        let mut times = [0u8; 16];
        reader.read_exact(&mut times)?;
        let track_id = reader.read_u32::<BigEndian>()?;
        let mut rest = [0u8; 12];
        reader.read_exact(&mut rest)?;
        track_id
    } else {
        let mut times = [0u8; 8];
        reader.read_exact(&mut times)?;
        let track_id = reader.read_u32::<BigEndian>()?;
        let mut rest = [0u8; 8];
        reader.read_exact(&mut rest)?;
        track_id
    };

    // reserved (8), layer (2), alt_group (2), volume (2), reserved (2), matrix (36)
    let mut skip = [0u8; 52];
    reader.read_exact(&mut skip)?;

    // 16.16 fixed point
    let width = reader.read_u32::<BigEndian>()? >> 16;
    let height = reader.read_u32::<BigEndian>()? >> 16;

    debug!("tkhd: track_id={}, {}x{}", track_id, width, height);
    Ok(TkhdBox {
        track_id,
        width,
        height,
    })
}

/// Handler type FourCC of an hdlr box ('vide', 'soun', ...).
pub fn parse_hdlr<R: Read>(reader: &mut R) -> Result<u32, DemuxError> {
    let _full = read_full_box(reader)?;
    let _pre_defined = reader.read_u32::<BigEndian>()?;
    let handler_type = reader.read_u32::<BigEndian>()?;
    debug!("hdlr: handler_type='{}'", fourcc_to_string(handler_type));
    Ok(handler_type)
}

// ─── Sample Table Boxes (stbl children) ─────────────────────────────

/// stts entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SttsEntry {
    pub sample_count: u32,
    pub sample_delta: u32,
}

pub fn parse_stts<R: Read>(reader: &mut R) -> Result<Vec<SttsEntry>, DemuxError> {
    let _full = read_full_box(reader)?;
    let entry_count = reader.read_u32::<BigEndian>()?;
    (0..entry_count)
        .map(|_| -> Result<SttsEntry, DemuxError> {
            Ok(SttsEntry {
                sample_count: reader.read_u32::<BigEndian>()?,
                sample_delta: reader.read_u32::<BigEndian>()?,
            })
        })
        .collect()
}

/// ctts entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CttsEntry {
    pub sample_count: u32,
    /// Composition offset (signed in version 1).
    pub sample_offset: i32,
}

pub fn parse_ctts<R: Read>(reader: &mut R) -> Result<Vec<CttsEntry>, DemuxError> {
    let full = read_full_box(reader)?;
    let entry_count = reader.read_u32::<BigEndian>()?;
    let mut entries = Vec::with_capacity(entry_count.min(1 << 16) as usize);
    for _ in 0..entry_count {
        let sample_count = reader.read_u32::<BigEndian>()?;
        let sample_offset = if full.version == 0 {
            reader.read_u32::<BigEndian>()? as i32
        } else {
            reader.read_i32::<BigEndian>()?
        };
        entries.push(CttsEntry {
            sample_count,
            sample_offset,
        });
    }
    debug!("ctts: {} entries (version {})", entries.len(), full.version);
    Ok(entries)
}

/// stsc entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StscEntry {
    /// 1-based.
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
}

pub fn parse_stsc<R: Read>(reader: &mut R) -> Result<Vec<StscEntry>, DemuxError> {
    let _full = read_full_box(reader)?;
    let entry_count = reader.read_u32::<BigEndian>()?;
    (0..entry_count)
        .map(|_| -> Result<StscEntry, DemuxError> {
            let first_chunk = reader.read_u32::<BigEndian>()?;
            let samples_per_chunk = reader.read_u32::<BigEndian>()?;
            let _sample_description_index = reader.read_u32::<BigEndian>()?;
            Ok(StscEntry {
                first_chunk,
                samples_per_chunk,
            })
        })
        .collect()
}

/// Parsed stsz.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StszBox {
    /// Non-zero when every sample has this size.
    pub default_sample_size: u32,
    pub sample_count: u32,
    pub sample_sizes: Vec<u32>,
}

pub fn parse_stsz<R: Read>(reader: &mut R) -> Result<StszBox, DemuxError> {
    let _full = read_full_box(reader)?;
    let default_sample_size = reader.read_u32::<BigEndian>()?;
    let sample_count = reader.read_u32::<BigEndian>()?;
    let sample_sizes = if default_sample_size == 0 {
        (0..sample_count)
            .map(|_| reader.read_u32::<BigEndian>())
            .collect::<Result<Vec<_>, _>>()?
    } else {
        Vec::new()
    };
    debug!(
        "stsz: {} samples, default_size={}",
        sample_count, default_sample_size
    );
    Ok(StszBox {
        default_sample_size,
        sample_count,
        sample_sizes,
    })
}

/// stco (32-bit) or co64 (64-bit) chunk offsets.
pub fn parse_chunk_offsets<R: Read>(reader: &mut R, wide: bool) -> Result<Vec<u64>, DemuxError> {
    let _full = read_full_box(reader)?;
    let entry_count = reader.read_u32::<BigEndian>()?;
    (0..entry_count)
        .map(|_| {
            if wide {
                reader.read_u64::<BigEndian>()
            } else {
                reader.read_u32::<BigEndian>().map(u64::from)
            }
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(DemuxError::Io)
}

/// 1-based sync sample numbers.
pub fn parse_stss<R: Read>(reader: &mut R) -> Result<Vec<u32>, DemuxError> {
    let _full = read_full_box(reader)?;
    let entry_count = reader.read_u32::<BigEndian>()?;
    (0..entry_count)
        .map(|_| reader.read_u32::<BigEndian>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(DemuxError::Io)
}

// ─── Fragment boxes (mvex / moof) ───────────────────────────────────

/// Per-track fragment defaults from moov/mvex/trex.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrexBox {
    pub track_id: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

pub fn parse_trex<R: Read>(reader: &mut R) -> Result<TrexBox, DemuxError> {
    let _full = read_full_box(reader)?;
    let track_id = reader.read_u32::<BigEndian>()?;
    let _default_sample_description_index = reader.read_u32::<BigEndian>()?;
    Ok(TrexBox {
        track_id,
        default_sample_duration: reader.read_u32::<BigEndian>()?,
        default_sample_size: reader.read_u32::<BigEndian>()?,
        default_sample_flags: reader.read_u32::<BigEndian>()?,
    })
}

pub const TFHD_BASE_DATA_OFFSET: u32 = 0x000001;
pub const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x000002;
pub const TFHD_DEFAULT_DURATION: u32 = 0x000008;
pub const TFHD_DEFAULT_SIZE: u32 = 0x000010;
pub const TFHD_DEFAULT_FLAGS: u32 = 0x000020;
pub const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

/// Track fragment header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TfhdBox {
    pub track_id: u32,
    pub flags: u32,
    pub base_data_offset: Option<u64>,
    pub default_sample_duration: Option<u32>,
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<u32>,
}

pub fn parse_tfhd<R: Read>(reader: &mut R) -> Result<TfhdBox, DemuxError> {
    let full = read_full_box(reader)?;
    let flags = full.flags;
    let track_id = reader.read_u32::<BigEndian>()?;
    let base_data_offset = if flags & TFHD_BASE_DATA_OFFSET != 0 {
        Some(reader.read_u64::<BigEndian>()?)
    } else {
        None
    };
    if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
        let _index = reader.read_u32::<BigEndian>()?;
    }
    let mut optional = |bit: u32| -> Result<Option<u32>, DemuxError> {
        if flags & bit != 0 {
            Ok(Some(reader.read_u32::<BigEndian>()?))
        } else {
            Ok(None)
        }
    };
    let default_sample_duration = optional(TFHD_DEFAULT_DURATION)?;
    let default_sample_size = optional(TFHD_DEFAULT_SIZE)?;
    let default_sample_flags = optional(TFHD_DEFAULT_FLAGS)?;
    Ok(TfhdBox {
        track_id,
        flags,
        base_data_offset,
        default_sample_duration,
        default_sample_size,
        default_sample_flags,
    })
}

/// baseMediaDecodeTime of a track fragment.
pub fn parse_tfdt<R: Read>(reader: &mut R) -> Result<u64, DemuxError> {
    let full = read_full_box(reader)?;
    if full.version == 1 {
        Ok(reader.read_u64::<BigEndian>()?)
    } else {
        Ok(reader.read_u32::<BigEndian>()? as u64)
    }
}

pub const TRUN_DATA_OFFSET: u32 = 0x000001;
pub const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x000004;
pub const TRUN_SAMPLE_DURATION: u32 = 0x000100;
pub const TRUN_SAMPLE_SIZE: u32 = 0x000200;
pub const TRUN_SAMPLE_FLAGS: u32 = 0x000400;
pub const TRUN_SAMPLE_CTS_OFFSET: u32 = 0x000800;

/// `sample_is_non_sync_sample` bit of the sample flags word.
pub const SAMPLE_FLAG_NON_SYNC: u32 = 0x0001_0000;

/// One run entry; absent fields fall back to tfhd/trex defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrunSample {
    pub duration: Option<u32>,
    pub size: Option<u32>,
    pub flags: Option<u32>,
    pub cts_offset: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrunBox {
    pub data_offset: Option<i32>,
    pub samples: Vec<TrunSample>,
}

pub fn parse_trun<R: Read>(reader: &mut R) -> Result<TrunBox, DemuxError> {
    let full = read_full_box(reader)?;
    let flags = full.flags;
    let sample_count = reader.read_u32::<BigEndian>()?;
    let data_offset = if flags & TRUN_DATA_OFFSET != 0 {
        Some(reader.read_i32::<BigEndian>()?)
    } else {
        None
    };
    let first_sample_flags = if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
        Some(reader.read_u32::<BigEndian>()?)
    } else {
        None
    };

    let mut samples = Vec::with_capacity(sample_count.min(1 << 16) as usize);
    for i in 0..sample_count {
        let duration = (flags & TRUN_SAMPLE_DURATION != 0)
            .then(|| reader.read_u32::<BigEndian>())
            .transpose()?;
        let size = (flags & TRUN_SAMPLE_SIZE != 0)
            .then(|| reader.read_u32::<BigEndian>())
            .transpose()?;
        let mut sample_flags = (flags & TRUN_SAMPLE_FLAGS != 0)
            .then(|| reader.read_u32::<BigEndian>())
            .transpose()?;
        if i == 0 && first_sample_flags.is_some() {
            sample_flags = first_sample_flags;
        }
        let cts_offset = if flags & TRUN_SAMPLE_CTS_OFFSET != 0 {
            if full.version == 0 {
                reader.read_u32::<BigEndian>()? as i32
            } else {
                reader.read_i32::<BigEndian>()?
            }
        } else {
            0
        };
        samples.push(TrunSample {
            duration,
            size,
            flags: sample_flags,
            cts_offset,
        });
    }
    trace!("trun: {} samples, data_offset={:?}", samples.len(), data_offset);
    Ok(TrunBox {
        data_offset,
        samples,
    })
}

// ─── Tests ──────────────────────────────────────────────────────────
