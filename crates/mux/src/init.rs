//! Init segment writer for fragmented MP4 (ISO 14496-12).
//!
//! Writes `ftyp` + `moov`. Sample tables inside `moov` are empty; samples
//! follow in `moof`/`mdat` pairs (see [`crate::fragment`]). `mvex` carries a
//! `trex` per track and, when the total duration is known, an `mehd`.

use byteorder::{BigEndian, WriteBytesExt};
use mc_common::{
    micros_to_ticks, AudioCodec, AudioDecoderConfig, Micros, TrackConfig, TrackKind, VideoCodec,
    VideoDecoderConfig,
};
use std::io::{Seek, Write};

use crate::atoms::{
    encode_language, fill_box_size, mp4_creation_time, new_buf, open_box, open_full_box,
    write_box_header, write_fixed_point_16_16, write_fixed_point_8_8, write_full_box_header,
    write_unity_matrix, write_zeros, MOVIE_TIMESCALE, VIDEO_TIMESCALE,
};
use crate::error::{MuxError, MuxResult};

/// One output track: id, media timescale and the decoder configuration
/// reported by its encoder (or copied from an input file).
#[derive(Clone, Debug, PartialEq)]
pub struct TrackSpec {
    pub track_id: u32,
    pub timescale: u32,
    pub config: TrackConfig,
}

impl TrackSpec {
    /// Video tracks use a 90kHz timescale, audio tracks their sample rate.
    pub fn new(track_id: u32, config: TrackConfig) -> Self {
        let timescale = match &config {
            TrackConfig::Video(_) => VIDEO_TIMESCALE,
            TrackConfig::Audio(audio) => audio.sample_rate.max(1),
        };
        Self {
            track_id,
            timescale,
            config,
        }
    }

    pub fn kind(&self) -> TrackKind {
        match self.config {
            TrackConfig::Video(_) => TrackKind::Video,
            TrackConfig::Audio(_) => TrackKind::Audio,
        }
    }

    pub fn to_ticks(&self, us: Micros) -> i64 {
        micros_to_ticks(us, self.timescale)
    }
}

/// Serialize `ftyp` + `moov` for `tracks`. A `duration` of 0 means unknown.
pub fn write_init_segment(tracks: &[TrackSpec], duration: Micros) -> MuxResult<Vec<u8>> {
    if tracks.is_empty() {
        return Err(MuxError::InvalidConfig("init segment without tracks".into()));
    }
    let mut w = new_buf();
    write_ftyp(&mut w)?;

    let moov = open_box(&mut w, b"moov")?;
    let next_track_id = tracks.iter().map(|t| t.track_id).max().unwrap_or(0) + 1;
    write_mvhd(&mut w, duration, next_track_id)?;
    for track in tracks {
        write_trak(&mut w, track, duration)?;
    }
    write_mvex(&mut w, tracks, duration)?;
    fill_box_size(&mut w, moov)?;

    Ok(w.into_inner())
}

/// ftyp: major brand iso5, compatible iso5, iso6, mp41.
pub fn write_ftyp<W: Write>(writer: &mut W) -> MuxResult<()> {
    write_box_header(writer, b"ftyp", 8 + 4 + 4 + 4 * 3)?;
    writer.write_all(b"iso5")?;
    writer.write_u32::<BigEndian>(0x200)?;
    writer.write_all(b"iso5")?;
    writer.write_all(b"iso6")?;
    writer.write_all(b"mp41")?;
    Ok(())
}

fn write_mvhd<W: Write + Seek>(w: &mut W, duration: Micros, next_track_id: u32) -> MuxResult<()> {
    let pos = open_full_box(w, b"mvhd", 0, 0)?;
    let creation_time = mp4_creation_time() as u32;
    w.write_u32::<BigEndian>(creation_time)?;
    w.write_u32::<BigEndian>(creation_time)?;
    w.write_u32::<BigEndian>(MOVIE_TIMESCALE)?;
    w.write_u32::<BigEndian>(micros_to_ticks(duration, MOVIE_TIMESCALE) as u32)?;
    write_fixed_point_16_16(w, 1.0)?; // rate
    write_fixed_point_8_8(w, 1.0)?; // volume
    write_zeros(w, 10)?;
    write_unity_matrix(w)?;
    write_zeros(w, 24)?; // pre_defined
    w.write_u32::<BigEndian>(next_track_id)?;
    fill_box_size(w, pos)
}

fn write_trak<W: Write + Seek>(w: &mut W, track: &TrackSpec, duration: Micros) -> MuxResult<()> {
    let pos = open_box(w, b"trak")?;
    write_tkhd(w, track, duration)?;

    let mdia = open_box(w, b"mdia")?;
    write_mdhd(w, track.timescale, track.to_ticks(duration).max(0) as u64)?;
    write_hdlr(w, track.kind())?;
    write_minf(w, track)?;
    fill_box_size(w, mdia)?;

    fill_box_size(w, pos)
}

fn write_tkhd<W: Write + Seek>(w: &mut W, track: &TrackSpec, duration: Micros) -> MuxResult<()> {
    // enabled | in_movie
    let pos = open_full_box(w, b"tkhd", 0, 0x000003)?;
    let creation_time = mp4_creation_time() as u32;
    w.write_u32::<BigEndian>(creation_time)?;
    w.write_u32::<BigEndian>(creation_time)?;
    w.write_u32::<BigEndian>(track.track_id)?;
    write_zeros(w, 4)?;
    w.write_u32::<BigEndian>(micros_to_ticks(duration, MOVIE_TIMESCALE) as u32)?;
    write_zeros(w, 8)?;
    w.write_i16::<BigEndian>(0)?; // layer
    w.write_i16::<BigEndian>(0)?; // alternate_group
    let (volume, width, height) = match &track.config {
        TrackConfig::Video(video) => (0.0, video.coded.width, video.coded.height),
        TrackConfig::Audio(_) => (1.0, 0, 0),
    };
    write_fixed_point_8_8(w, volume)?;
    write_zeros(w, 2)?;
    write_unity_matrix(w)?;
    write_fixed_point_16_16(w, width as f64)?;
    write_fixed_point_16_16(w, height as f64)?;
    fill_box_size(w, pos)
}

fn write_mdhd<W: Write + Seek>(w: &mut W, timescale: u32, duration: u64) -> MuxResult<()> {
    let pos = open_full_box(w, b"mdhd", 0, 0)?;
    let creation_time = mp4_creation_time() as u32;
    w.write_u32::<BigEndian>(creation_time)?;
    w.write_u32::<BigEndian>(creation_time)?;
    w.write_u32::<BigEndian>(timescale)?;
    w.write_u32::<BigEndian>(duration as u32)?;
    w.write_u16::<BigEndian>(encode_language("und"))?;
    w.write_u16::<BigEndian>(0)?;
    fill_box_size(w, pos)
}

fn write_hdlr<W: Write + Seek>(w: &mut W, kind: TrackKind) -> MuxResult<()> {
    let (handler, name): (&[u8; 4], &str) = match kind {
        TrackKind::Video => (b"vide", "VideoHandler\0"),
        TrackKind::Audio => (b"soun", "SoundHandler\0"),
    };
    let pos = open_full_box(w, b"hdlr", 0, 0)?;
    write_zeros(w, 4)?; // pre_defined
    w.write_all(handler)?;
    write_zeros(w, 12)?;
    w.write_all(name.as_bytes())?;
    fill_box_size(w, pos)
}

fn write_minf<W: Write + Seek>(w: &mut W, track: &TrackSpec) -> MuxResult<()> {
    let pos = open_box(w, b"minf")?;
    match track.kind() {
        TrackKind::Video => {
            write_full_box_header(w, b"vmhd", 20, 0, 0x000001)?;
            w.write_u16::<BigEndian>(0)?; // graphicsmode
            write_zeros(w, 6)?; // opcolor
        }
        TrackKind::Audio => {
            write_full_box_header(w, b"smhd", 16, 0, 0)?;
            w.write_i16::<BigEndian>(0)?; // balance
            write_zeros(w, 2)?;
        }
    }

    let dinf = open_box(w, b"dinf")?;
    let dref = open_full_box(w, b"dref", 0, 0)?;
    w.write_u32::<BigEndian>(1)?;
    // Self-contained: data lives in this file.
    write_full_box_header(w, b"url ", 12, 0, 0x000001)?;
    fill_box_size(w, dref)?;
    fill_box_size(w, dinf)?;

    let stbl = open_box(w, b"stbl")?;
    write_stsd(w, &track.config)?;
    for table in [b"stts", b"stsc", b"stco"] {
        write_full_box_header(w, table, 16, 0, 0)?;
        w.write_u32::<BigEndian>(0)?; // entry_count
    }
    write_full_box_header(w, b"stsz", 20, 0, 0)?;
    w.write_u32::<BigEndian>(0)?; // sample_size
    w.write_u32::<BigEndian>(0)?; // sample_count
    fill_box_size(w, stbl)?;

    fill_box_size(w, pos)
}

fn write_stsd<W: Write + Seek>(w: &mut W, config: &TrackConfig) -> MuxResult<()> {
    let pos = open_full_box(w, b"stsd", 0, 0)?;
    w.write_u32::<BigEndian>(1)?; // entry_count
    match config {
        TrackConfig::Video(video) => write_visual_entry(w, video)?,
        TrackConfig::Audio(audio) => write_audio_entry(w, audio)?,
    }
    fill_box_size(w, pos)
}

fn write_visual_entry<W: Write + Seek>(w: &mut W, video: &VideoDecoderConfig) -> MuxResult<()> {
    let record = video.description.as_deref().ok_or_else(|| {
        MuxError::TrackError(format!(
            "{} track has no decoder configuration record",
            video.codec.display_name()
        ))
    })?;

    let pos = open_box(w, video.codec.sample_entry())?;
    write_zeros(w, 6)?;
    w.write_u16::<BigEndian>(1)?; // data_reference_index
    write_zeros(w, 16)?; // pre_defined + reserved
    w.write_u16::<BigEndian>(video.coded.width as u16)?;
    w.write_u16::<BigEndian>(video.coded.height as u16)?;
    w.write_u32::<BigEndian>(0x0048_0000)?; // 72 dpi
    w.write_u32::<BigEndian>(0x0048_0000)?;
    write_zeros(w, 4)?;
    w.write_u16::<BigEndian>(1)?; // frame_count
    write_zeros(w, 32)?; // compressorname
    w.write_u16::<BigEndian>(0x0018)?; // depth
    w.write_i16::<BigEndian>(-1)?;

    let record_type = match video.codec {
        VideoCodec::H264 => b"avcC",
        VideoCodec::H265 => b"hvcC",
    };
    let config_box = open_box(w, record_type)?;
    w.write_all(record)?;
    fill_box_size(w, config_box)?;

    fill_box_size(w, pos)
}

fn write_audio_entry<W: Write + Seek>(w: &mut W, audio: &AudioDecoderConfig) -> MuxResult<()> {
    let entry_type = match audio.codec {
        AudioCodec::Aac => b"mp4a",
        AudioCodec::Opus => b"Opus",
    };
    let pos = open_box(w, entry_type)?;
    write_zeros(w, 6)?;
    w.write_u16::<BigEndian>(1)?; // data_reference_index
    write_zeros(w, 8)?;
    w.write_u16::<BigEndian>(audio.channels)?;
    w.write_u16::<BigEndian>(16)?; // samplesize
    write_zeros(w, 4)?;
    w.write_u32::<BigEndian>(audio.sample_rate.min(0xFFFF) << 16)?;

    match audio.codec {
        AudioCodec::Aac => {
            let asc = audio.description.as_deref().ok_or_else(|| {
                MuxError::TrackError("AAC track has no AudioSpecificConfig".into())
            })?;
            write_esds(w, asc)?;
        }
        AudioCodec::Opus => write_dops(w, audio.sample_rate, audio.channels)?,
    }
    fill_box_size(w, pos)
}

fn write_esds<W: Write + Seek>(w: &mut W, asc: &[u8]) -> MuxResult<()> {
    let pos = open_full_box(w, b"esds", 0, 0)?;

    let dec_specific_len = asc.len();
    let dec_config_len = 13 + descr_header_len(dec_specific_len) + dec_specific_len;
    let sl_config_len = 1;
    let es_len =
        3 + descr_header_len(dec_config_len) + dec_config_len + descr_header_len(sl_config_len) + sl_config_len;

    w.write_u8(0x03)?; // ES_DescrTag
    write_descr_length(w, es_len)?;
    w.write_u16::<BigEndian>(1)?; // ES_ID
    w.write_u8(0)?; // flags

    w.write_u8(0x04)?; // DecoderConfigDescrTag
    write_descr_length(w, dec_config_len)?;
    w.write_u8(0x40)?; // Audio ISO/IEC 14496-3
    w.write_u8(0x15)?; // AudioStream
    write_zeros(w, 3)?; // bufferSizeDB
    w.write_u32::<BigEndian>(128_000)?; // maxBitrate
    w.write_u32::<BigEndian>(128_000)?; // avgBitrate

    w.write_u8(0x05)?; // DecSpecificInfoTag
    write_descr_length(w, dec_specific_len)?;
    w.write_all(asc)?;

    w.write_u8(0x06)?; // SLConfigDescrTag
    write_descr_length(w, sl_config_len)?;
    w.write_u8(0x02)?;

    fill_box_size(w, pos)
}

/// Tag byte plus the expandable length field.
fn descr_header_len(len: usize) -> usize {
    1 + descr_length_bytes(len)
}

fn descr_length_bytes(len: usize) -> usize {
    match len {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        _ => 4,
    }
}

/// MPEG-4 expandable descriptor length (1-4 bytes, 7 bits each).
fn write_descr_length<W: Write>(w: &mut W, len: usize) -> MuxResult<()> {
    let n = descr_length_bytes(len);
    for i in (0..n).rev() {
        let byte = ((len >> (7 * i)) & 0x7F) as u8;
        w.write_u8(if i > 0 { byte | 0x80 } else { byte })?;
    }
    Ok(())
}

fn write_dops<W: Write + Seek>(w: &mut W, sample_rate: u32, channels: u16) -> MuxResult<()> {
    let pos = open_box(w, b"dOps")?;
    w.write_u8(0)?; // version
    w.write_u8(channels as u8)?;
    w.write_u16::<BigEndian>(312)?; // PreSkip
    w.write_u32::<BigEndian>(sample_rate)?;
    w.write_i16::<BigEndian>(0)?; // OutputGain
    w.write_u8(0)?; // ChannelMappingFamily
    fill_box_size(w, pos)
}

fn write_mvex<W: Write + Seek>(w: &mut W, tracks: &[TrackSpec], duration: Micros) -> MuxResult<()> {
    let pos = open_box(w, b"mvex")?;
    if duration > 0 {
        write_full_box_header(w, b"mehd", 16, 0, 0)?;
        w.write_u32::<BigEndian>(micros_to_ticks(duration, MOVIE_TIMESCALE) as u32)?;
    }
    for track in tracks {
        write_full_box_header(w, b"trex", 32, 0, 0)?;
        w.write_u32::<BigEndian>(track.track_id)?;
        w.write_u32::<BigEndian>(1)?; // default_sample_description_index
        w.write_u32::<BigEndian>(0)?; // default_sample_duration
        w.write_u32::<BigEndian>(0)?; // default_sample_size
        w.write_u32::<BigEndian>(0)?; // default_sample_flags
    }
    fill_box_size(w, pos)
}
