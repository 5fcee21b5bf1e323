//! Box writing helpers shared by the init segment and fragment writers.
//!
//! Boxes are written into a [`BoxBuf`]: [`open_box`] leaves a zero size
//! field behind and returns its position, [`fill_box_size`] patches it once
//! the children are in. Leaf boxes whose size is known up front use
//! [`write_box_header`] / [`write_full_box_header`] directly.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::{Cursor, Seek, SeekFrom, Write};

use crate::error::{MuxError, MuxResult};

/// Media timescale of encoded video tracks.
pub const VIDEO_TIMESCALE: u32 = 90_000;

/// `mvhd`/`tkhd`/`mehd` timescale.
pub const MOVIE_TIMESCALE: u32 = 1000;

/// Seconds between the MP4 epoch (1904-01-01) and the Unix epoch.
pub const MP4_EPOCH_OFFSET: u64 = 2_082_844_800;

/// In-memory box buffer.
pub type BoxBuf = Cursor<Vec<u8>>;

pub fn new_buf() -> BoxBuf {
    Cursor::new(Vec::new())
}

/// Write a standard box header: 4-byte size + 4-byte type.
pub fn write_box_header<W: Write>(writer: &mut W, box_type: &[u8; 4], size: u32) -> MuxResult<()> {
    writer.write_u32::<BigEndian>(size)?;
    writer.write_all(box_type)?;
    Ok(())
}

/// Write a "full box" header: size + type + 1-byte version + 3-byte flags.
pub fn write_full_box_header<W: Write>(
    writer: &mut W,
    box_type: &[u8; 4],
    size: u32,
    version: u8,
    flags: u32,
) -> MuxResult<()> {
    writer.write_u32::<BigEndian>(size)?;
    writer.write_all(box_type)?;
    write_version_flags(writer, version, flags)
}

pub fn write_version_flags<W: Write>(writer: &mut W, version: u8, flags: u32) -> MuxResult<()> {
    let version_flags = ((version as u32) << 24) | (flags & 0x00FF_FFFF);
    writer.write_u32::<BigEndian>(version_flags)?;
    Ok(())
}

/// Write a size placeholder followed by the box type, returning the
/// position to patch with [`fill_box_size`].
pub fn open_box<W: Write + Seek>(writer: &mut W, box_type: &[u8; 4]) -> MuxResult<u64> {
    let pos = writer.stream_position()?;
    writer.write_u32::<BigEndian>(0)?;
    writer.write_all(box_type)?;
    Ok(pos)
}

/// Like [`open_box`], followed by version and flags.
pub fn open_full_box<W: Write + Seek>(
    writer: &mut W,
    box_type: &[u8; 4],
    version: u8,
    flags: u32,
) -> MuxResult<u64> {
    let pos = open_box(writer, box_type)?;
    write_version_flags(writer, version, flags)?;
    Ok(pos)
}

/// Patch the box size at `size_pos` with the distance to the current position.
pub fn fill_box_size<W: Write + Seek>(writer: &mut W, size_pos: u64) -> MuxResult<()> {
    let current = writer.stream_position()?;
    let size = current - size_pos;
    if size > u32::MAX as u64 {
        return Err(MuxError::BufferFull(format!(
            "Box size {} exceeds 32-bit limit",
            size
        )));
    }

    writer.seek(SeekFrom::Start(size_pos))?;
    writer.write_u32::<BigEndian>(size as u32)?;
    writer.seek(SeekFrom::Start(current))?;
    Ok(())
}

/// Write a fixed-point 16.16 number.
pub fn write_fixed_point_16_16<W: Write>(writer: &mut W, value: f64) -> MuxResult<()> {
    let fixed = (value * 65536.0).round() as i32;
    writer.write_i32::<BigEndian>(fixed)?;
    Ok(())
}

/// Write a fixed-point 8.8 number.
pub fn write_fixed_point_8_8<W: Write>(writer: &mut W, value: f64) -> MuxResult<()> {
    let fixed = (value * 256.0).round() as i16;
    writer.write_i16::<BigEndian>(fixed)?;
    Ok(())
}

/// Unity transformation matrix used by mvhd and tkhd.
pub fn write_unity_matrix<W: Write>(writer: &mut W) -> MuxResult<()> {
    for value in [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0] {
        write_fixed_point_16_16(writer, value)?;
    }
    writer.write_u32::<BigEndian>(0x4000_0000)?; // 1.0 in 2.30
    Ok(())
}

pub fn write_zeros<W: Write>(writer: &mut W, count: usize) -> MuxResult<()> {
    writer.write_all(&vec![0u8; count])?;
    Ok(())
}

/// ISO 639-2/T language code packed into 3x5 bits.
/// Anything that is not three lowercase letters encodes as "und".
pub fn encode_language(lang: &str) -> u16 {
    let bytes = lang.as_bytes();
    if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_lowercase) {
        return encode_language("und");
    }
    let a = (bytes[0] - 0x60) as u16;
    let b = (bytes[1] - 0x60) as u16;
    let c = (bytes[2] - 0x60) as u16;
    (a << 10) | (b << 5) | c
}

/// Creation time written into headers: 2024-01-01 00:00:00 UTC, fixed so
/// output is reproducible.
pub fn mp4_creation_time() -> u64 {
    MP4_EPOCH_OFFSET + 1_704_067_200
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_header() {
        let mut buf = Vec::new();
        write_box_header(&mut buf, b"mdat", 0x0102_0304).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, b'm', b'd', b'a', b't']);
    }

    #[test]
    fn full_header_masks_flags() {
        let mut buf = Vec::new();
        write_full_box_header(&mut buf, b"trun", 20, 1, 0xFF00_0F01).unwrap();
        assert_eq!(&buf[4..8], b"trun");
        assert_eq!(&buf[8..12], &[0x01, 0x00, 0x0F, 0x01]);
    }

    #[test]
    fn nested_sizes_are_patched() {
        let mut cursor = new_buf();
        let outer = open_box(&mut cursor, b"traf").unwrap();
        let inner = open_full_box(&mut cursor, b"tfhd", 0, 3).unwrap();
        cursor.write_all(&[0xAA; 4]).unwrap();
        fill_box_size(&mut cursor, inner).unwrap();
        fill_box_size(&mut cursor, outer).unwrap();

        let buf = cursor.into_inner();
        assert_eq!(buf.len(), 8 + 12 + 4);
        assert_eq!(&buf[0..4], &[0, 0, 0, 24]);
        assert_eq!(&buf[8..12], &[0, 0, 0, 16]);
        assert_eq!(&buf[16..20], &[0, 0, 0, 3]);
    }

    #[test]
    fn fixed_point_encodings() {
        let mut buf = Vec::new();
        write_fixed_point_16_16(&mut buf, 1920.0).unwrap();
        write_fixed_point_8_8(&mut buf, 0.5).unwrap();
        assert_eq!(&buf, &[0x07, 0x80, 0x00, 0x00, 0x00, 0x80]);
    }

    #[test]
    fn unity_matrix_layout() {
        let mut buf = Vec::new();
        write_unity_matrix(&mut buf).unwrap();
        assert_eq!(buf.len(), 36);
        assert_eq!(&buf[32..36], &[0x40, 0, 0, 0]);
    }

    #[test]
    fn language_codes() {
        assert_eq!(encode_language("und"), 0x55C4);
        assert_eq!(encode_language("eng"), 5575);
        assert_eq!(encode_language("EN"), 0x55C4);
    }

    #[test]
    fn creation_time_is_fixed() {
        assert_eq!(mp4_creation_time(), mp4_creation_time());
        assert_eq!(mp4_creation_time() - MP4_EPOCH_OFFSET, 1_704_067_200);
    }
}
