//! Length-prefixed NAL unit walking and keyframe payload-offset detection.
//!
//! Some encoders put SEI or access unit delimiter NALs ahead of the IDR
//! slice. Decoders that expect the picture to come first choke on these, so
//! keyframes record where the first picture-carrying NAL starts.

use mc_common::VideoCodec;

/// NAL unit type for H.264.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum H264NalType {
    Slice,
    Idr,
    Sei,
    Sps,
    Pps,
    Aud,
    Other(u8),
}

impl From<u8> for H264NalType {
    fn from(val: u8) -> Self {
        match val & 0x1F {
            1 => Self::Slice,
            5 => Self::Idr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            other => Self::Other(other),
        }
    }
}

/// NAL unit type for H.265 (6 bits after the forbidden-zero bit).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum H265NalType {
    IdrWRadl,
    IdrNLp,
    Cra,
    Vps,
    Sps,
    Pps,
    Aud,
    PrefixSei,
    Other(u8),
}

impl From<u8> for H265NalType {
    fn from(val: u8) -> Self {
        match (val >> 1) & 0x3F {
            19 => Self::IdrWRadl,
            20 => Self::IdrNLp,
            21 => Self::Cra,
            32 => Self::Vps,
            33 => Self::Sps,
            34 => Self::Pps,
            35 => Self::Aud,
            39 => Self::PrefixSei,
            other => Self::Other(other),
        }
    }
}

/// Whether a NAL of this codec carries no picture data and may be skipped
/// ahead of a keyframe.
fn is_skippable_prefix(codec: VideoCodec, header: u8) -> bool {
    match codec {
        VideoCodec::H264 => matches!(H264NalType::from(header), H264NalType::Sei | H264NalType::Aud),
        VideoCodec::H265 => matches!(
            H265NalType::from(header),
            H265NalType::Aud | H265NalType::PrefixSei
        ),
    }
}

/// NAL length-field size declared by an avcC / hvcC record, 4 if unknown.
pub fn length_size(codec: VideoCodec, description: Option<&[u8]>) -> u8 {
    let byte = match codec {
        VideoCodec::H264 => description.and_then(|d| d.get(4)),
        VideoCodec::H265 => description.and_then(|d| d.get(21)),
    };
    byte.map_or(4, |b| (b & 0x03) + 1)
}

/// Read a variable-length NAL unit size (1 to 4 bytes big-endian).
fn read_nal_length(data: &[u8], length_size: usize) -> usize {
    data[..length_size]
        .iter()
        .fold(0usize, |val, &byte| (val << 8) | byte as usize)
}

/// Iterator over `(offset, nal)` of a length-prefixed access unit, where
/// `offset` points at the length field. Stops at the first truncated unit.
pub struct NalUnits<'a> {
    data: &'a [u8],
    length_size: usize,
    pos: usize,
}

impl<'a> NalUnits<'a> {
    pub fn new(data: &'a [u8], length_size: u8) -> Self {
        Self {
            data,
            length_size: length_size.clamp(1, 4) as usize,
            pos: 0,
        }
    }
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = (usize, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.pos;
        let body = start + self.length_size;
        if body > self.data.len() {
            return None;
        }
        let len = read_nal_length(&self.data[start..], self.length_size);
        let end = body.checked_add(len)?;
        if end > self.data.len() || len == 0 {
            return None;
        }
        self.pos = end;
        Some((start, &self.data[body..end]))
    }
}

/// Offset of the first picture-carrying NAL in a keyframe, if any
/// SEI/AUD NALs precede it.
pub fn payload_offset(data: &[u8], codec: VideoCodec, length_size: u8) -> Option<u32> {
    let (offset, _) = NalUnits::new(data, length_size)
        .find(|(_, nal)| !is_skippable_prefix(codec, nal[0]))?;
    (offset > 0).then_some(offset as u32)
}
