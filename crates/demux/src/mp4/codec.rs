//! Sample description (stsd) parsing: turns an `avc1`/`hvc1`/`mp4a`/`Opus`
//! sample entry into the decoder configuration handed to codec services,
//! including the RFC 6381 codec string.

use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;
use mc_common::{
    AudioCodec, AudioDecoderConfig, DemuxError, HardwareAcceleration, Resolution, TrackConfig,
    VideoCodec, VideoDecoderConfig,
};
use std::io::{Read, Seek, SeekFrom};
use tracing::debug;

use super::boxes::{
    fourcc_to_string, read_box_header, read_full_box, skip_box, BoxHeader, AVC1, AVC3, AVCC,
    DOPS, ESDS, HEV1, HVC1, HVCC, MP4A, OPUS, SOUN, VIDE, WAVE,
};

/// AAC sampling frequency table (ISO 14496-3, Table 1.16).
const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

fn invalid(record: &'static str, reason: impl Into<String>) -> DemuxError {
    DemuxError::InvalidCodecConfig {
        record,
        reason: reason.into(),
    }
}

/// Parse stsd for a track with the given handler, returning the first
/// sample entry's decoder configuration.
///
/// Video and audio tracks must carry a supported entry; anything else is a
/// terminal error because no decoder could be configured for it.
pub fn parse_stsd<R: Read + Seek>(
    reader: &mut R,
    header: &BoxHeader,
    handler: u32,
) -> Result<TrackConfig, DemuxError> {
    let box_end = header.definite_end("stsd")?;
    let _full = read_full_box(reader)?;
    let entry_count = reader.read_u32::<BigEndian>()?;
    if entry_count == 0 {
        return Err(DemuxError::InvalidStructure {
            offset: header.offset,
            reason: "stsd has no sample entries".into(),
        });
    }

    let entry = read_box_header(reader)?.ok_or_else(|| DemuxError::InvalidStructure {
        offset: header.offset,
        reason: "Unexpected end of stsd".into(),
    })?;
    debug!(
        "stsd: {} entries, first '{}'",
        entry_count,
        fourcc_to_string(entry.box_type)
    );

    let config = match (handler, entry.box_type) {
        (VIDE, AVC1 | AVC3 | HEV1 | HVC1) => TrackConfig::Video(parse_visual_entry(reader, &entry)?),
        (SOUN, MP4A) => TrackConfig::Audio(parse_mp4a_entry(reader, &entry)?),
        (SOUN, OPUS) => TrackConfig::Audio(parse_opus_entry(reader, &entry)?),
        (_, other) => return Err(DemuxError::UnsupportedCodec(fourcc_to_string(other))),
    };

    reader.seek(SeekFrom::Start(box_end))?;
    Ok(config)
}

// ─── Visual sample entries ──────────────────────────────────────────

fn parse_visual_entry<R: Read + Seek>(
    reader: &mut R,
    entry: &BoxHeader,
) -> Result<VideoDecoderConfig, DemuxError> {
    let entry_end = entry.definite_end("visual sample entry")?;

    // reserved (6), data_ref_index (2), pre_defined (2), reserved (2), pre_defined (12)
    let mut skip = [0u8; 24];
    reader.read_exact(&mut skip)?;
    let width = reader.read_u16::<BigEndian>()?;
    let height = reader.read_u16::<BigEndian>()?;
    // horiz_res (4), vert_res (4), reserved (4), frame_count (2),
    // compressor_name (32), depth (2), pre_defined (2)
    let mut skip = [0u8; 50];
    reader.read_exact(&mut skip)?;

    let is_hevc = matches!(entry.box_type, HEV1 | HVC1);
    let wanted = if is_hevc { HVCC } else { AVCC };
    let mut record = None;
    while reader.stream_position()? < entry_end {
        let Some(sub) = read_box_header(reader)? else {
            break;
        };
        if sub.box_type == wanted {
            let size = sub.content_size().unwrap_or(0) as usize;
            let mut data = vec![0u8; size];
            reader.read_exact(&mut data)?;
            record = Some(data);
        } else {
            skip_box(reader, &sub)?;
        }
    }

    let entry_name = fourcc_to_string(entry.box_type);
    let (codec, codec_string, record) = if is_hevc {
        let record = record.ok_or_else(|| invalid("hvcC", "missing from sample entry"))?;
        let codec_string = hevc_codec_string(&entry_name, &record)?;
        (VideoCodec::H265, codec_string, record)
    } else {
        let record = record.ok_or_else(|| invalid("avcC", "missing from sample entry"))?;
        let codec_string = avc_codec_string(&entry_name, &record)?;
        (VideoCodec::H264, codec_string, record)
    };

    debug!("Video sample entry: {} {}x{}", codec_string, width, height);
    Ok(VideoDecoderConfig {
        codec,
        codec_string,
        coded: Resolution::new(width as u32, height as u32),
        description: Some(Bytes::from(record)),
        hardware_acceleration: HardwareAcceleration::NoPreference,
    })
}

/// `avc1.PPCCLL` from an AVCDecoderConfigurationRecord.
pub fn avc_codec_string(entry: &str, avcc: &[u8]) -> Result<String, DemuxError> {
    if avcc.len() < 7 {
        return Err(invalid("avcC", format!("record too short ({} bytes)", avcc.len())));
    }
    if avcc[0] != 1 {
        return Err(invalid("avcC", format!("unexpected version {}", avcc[0])));
    }
    Ok(format!(
        "{}.{:02x}{:02x}{:02x}",
        entry, avcc[1], avcc[2], avcc[3]
    ))
}

/// HEVC codec string per ISO 14496-15 Annex E, e.g. `hvc1.1.6.L93.B0`.
pub fn hevc_codec_string(entry: &str, hvcc: &[u8]) -> Result<String, DemuxError> {
    if hvcc.len() < 23 {
        return Err(invalid("hvcC", format!("record too short ({} bytes)", hvcc.len())));
    }
    if hvcc[0] != 1 {
        return Err(invalid("hvcC", format!("unexpected version {}", hvcc[0])));
    }
    let profile_space = hvcc[1] >> 6;
    let tier_flag = (hvcc[1] >> 5) & 1;
    let profile_idc = hvcc[1] & 0x1f;
    let compat = u32::from_be_bytes([hvcc[2], hvcc[3], hvcc[4], hvcc[5]]);
    let constraints = &hvcc[6..12];
    let level_idc = hvcc[12];

    let space = match profile_space {
        1 => "A",
        2 => "B",
        3 => "C",
        _ => "",
    };
    let mut out = format!(
        "{entry}.{space}{profile_idc}.{:x}.{}{level_idc}",
        compat.reverse_bits(),
        if tier_flag == 1 { 'H' } else { 'L' }
    );
    let used = constraints
        .iter()
        .rposition(|b| *b != 0)
        .map_or(0, |last| last + 1);
    for byte in &constraints[..used] {
        out.push_str(&format!(".{byte:X}"));
    }
    Ok(out)
}

// ─── Audio sample entries ───────────────────────────────────────────

/// Fields shared by every AudioSampleEntry.
struct AudioEntryHeader {
    channel_count: u16,
    sample_rate: u32,
}

fn parse_audio_entry_header<R: Read>(reader: &mut R) -> Result<AudioEntryHeader, DemuxError> {
    // reserved (6), data_ref_index (2), version (2), revision (2), vendor (4)
    let mut skip = [0u8; 16];
    reader.read_exact(&mut skip)?;
    let channel_count = reader.read_u16::<BigEndian>()?;
    let _sample_size = reader.read_u16::<BigEndian>()?;
    // compression_id (2), packet_size (2)
    let mut skip = [0u8; 4];
    reader.read_exact(&mut skip)?;
    let sample_rate = reader.read_u32::<BigEndian>()? >> 16;
    Ok(AudioEntryHeader {
        channel_count,
        sample_rate,
    })
}

/// Decoder-relevant contents of an esds box.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EsdsInfo {
    pub object_type_indication: u8,
    pub audio_object_type: u8,
    pub sample_rate: u32,
    pub channel_config: u8,
    /// Raw AudioSpecificConfig.
    pub specific_config: Vec<u8>,
}

fn parse_mp4a_entry<R: Read + Seek>(
    reader: &mut R,
    entry: &BoxHeader,
) -> Result<AudioDecoderConfig, DemuxError> {
    let entry_end = entry.definite_end("mp4a sample entry")?;
    let head = parse_audio_entry_header(reader)?;

    let mut esds = None;
    while reader.stream_position()? < entry_end {
        let Some(sub) = read_box_header(reader)? else {
            break;
        };
        match sub.box_type {
            ESDS => esds = Some(read_esds(reader, &sub)?),
            // QuickTime files may wrap esds inside a wave box.
            WAVE => {
                let wave_end = sub.end_offset().unwrap_or(entry_end);
                while reader.stream_position()? < wave_end {
                    let Some(child) = read_box_header(reader)? else {
                        break;
                    };
                    if child.box_type == ESDS {
                        esds = Some(read_esds(reader, &child)?);
                    } else {
                        skip_box(reader, &child)?;
                    }
                }
            }
            _ => skip_box(reader, &sub)?,
        }
    }

    let esds = esds.ok_or_else(|| invalid("esds", "missing from mp4a sample entry"))?;
    if esds.object_type_indication != 0x40 && esds.object_type_indication != 0x67 {
        return Err(DemuxError::UnsupportedCodec(format!(
            "mp4a.{:x}",
            esds.object_type_indication
        )));
    }

    let sample_rate = if esds.sample_rate > 0 {
        esds.sample_rate
    } else {
        head.sample_rate
    };
    let channels = if head.channel_count > 0 {
        head.channel_count
    } else {
        esds.channel_config as u16
    };
    let codec_string = format!("mp4a.40.{}", esds.audio_object_type);
    debug!(
        "mp4a sample entry: {} {}Hz {}ch",
        codec_string, sample_rate, channels
    );

    Ok(AudioDecoderConfig {
        codec: AudioCodec::Aac,
        codec_string,
        sample_rate,
        channels,
        description: Some(Bytes::from(esds.specific_config)),
    })
}

fn read_esds<R: Read + Seek>(reader: &mut R, header: &BoxHeader) -> Result<EsdsInfo, DemuxError> {
    let box_end = header.definite_end("esds")?;
    let _full = read_full_box(reader)?;
    let remaining = box_end.saturating_sub(reader.stream_position()?) as usize;
    let mut data = vec![0u8; remaining];
    reader.read_exact(&mut data)?;
    parse_es_descriptor(&data)
}

/// Walk ES_Descriptor (0x03) → DecoderConfigDescriptor (0x04) →
/// DecoderSpecificInfo (0x05) and decode the AudioSpecificConfig.
pub fn parse_es_descriptor(data: &[u8]) -> Result<EsdsInfo, DemuxError> {
    let mut pos = 0;
    expect_tag(data, &mut pos, 0x03)?;
    if pos + 3 > data.len() {
        return Err(invalid("esds", "truncated ES_Descriptor"));
    }
    let es_flags = data[pos + 2];
    pos += 3;
    // streamDependenceFlag, URL_Flag, OCRstreamFlag
    if es_flags & 0x80 != 0 {
        pos += 2;
    }
    if es_flags & 0x40 != 0 {
        let url_len = data.get(pos).copied().unwrap_or(0) as usize;
        pos += 1 + url_len;
    }
    if es_flags & 0x20 != 0 {
        pos += 2;
    }

    expect_tag(data, &mut pos, 0x04)?;
    if pos + 13 > data.len() {
        return Err(invalid("esds", "truncated DecoderConfigDescriptor"));
    }
    let object_type_indication = data[pos];
    // streamType (1), bufferSizeDB (3), maxBitrate (4), avgBitrate (4)
    pos += 13;

    let spec_len = expect_tag(data, &mut pos, 0x05)?;
    let specific_config = data
        .get(pos..pos + spec_len)
        .ok_or_else(|| invalid("esds", "truncated DecoderSpecificInfo"))?
        .to_vec();
    if specific_config.len() < 2 {
        return Err(invalid("esds", "AudioSpecificConfig too short"));
    }

    let audio_object_type = specific_config[0] >> 3;
    let freq_index = ((specific_config[0] & 0x07) << 1) | (specific_config[1] >> 7);
    let channel_config = (specific_config[1] >> 3) & 0x0f;
    // Index 15 means an explicit 24-bit rate; fall back to the sample entry.
    let sample_rate = AAC_SAMPLE_RATES
        .get(freq_index as usize)
        .copied()
        .unwrap_or(0);

    debug!(
        "esds: oti=0x{:02x}, aot={}, freq_idx={}, channels={}",
        object_type_indication, audio_object_type, freq_index, channel_config
    );

    Ok(EsdsInfo {
        object_type_indication,
        audio_object_type,
        sample_rate,
        channel_config,
        specific_config,
    })
}

/// Check the descriptor tag at `pos` and return its payload length.
fn expect_tag(data: &[u8], pos: &mut usize, tag: u8) -> Result<usize, DemuxError> {
    if data.get(*pos) != Some(&tag) {
        return Err(invalid(
            "esds",
            format!("expected descriptor tag 0x{tag:02x} at {}", *pos),
        ));
    }
    *pos += 1;
    Ok(read_descriptor_length(data, pos))
}

/// Variable-length descriptor size: 7 bits per byte, high bit continues.
fn read_descriptor_length(data: &[u8], pos: &mut usize) -> usize {
    let mut len = 0usize;
    for _ in 0..4 {
        let Some(&b) = data.get(*pos) else {
            break;
        };
        *pos += 1;
        len = (len << 7) | (b & 0x7f) as usize;
        if b & 0x80 == 0 {
            break;
        }
    }
    len
}

fn parse_opus_entry<R: Read + Seek>(
    reader: &mut R,
    entry: &BoxHeader,
) -> Result<AudioDecoderConfig, DemuxError> {
    let entry_end = entry.definite_end("Opus sample entry")?;
    let head = parse_audio_entry_header(reader)?;

    let mut channels = head.channel_count;
    let mut found = false;
    while reader.stream_position()? < entry_end {
        let Some(sub) = read_box_header(reader)? else {
            break;
        };
        if sub.box_type == DOPS {
            let version = reader.read_u8()?;
            if version != 0 {
                return Err(invalid("dOps", format!("unexpected version {version}")));
            }
            let output_channels = reader.read_u8()?;
            let pre_skip = reader.read_u16::<BigEndian>()?;
            let input_rate = reader.read_u32::<BigEndian>()?;
            debug!(
                "dOps: channels={}, pre_skip={}, input_rate={}",
                output_channels, pre_skip, input_rate
            );
            if output_channels > 0 {
                channels = output_channels as u16;
            }
            found = true;
        }
        skip_box(reader, &sub)?;
    }
    if !found {
        return Err(invalid("dOps", "missing from Opus sample entry"));
    }

    Ok(AudioDecoderConfig {
        codec: AudioCodec::Opus,
        codec_string: "opus".into(),
        // Opus always decodes at 48kHz regardless of the input rate.
        sample_rate: 48_000,
        channels,
        description: None,
    })
}
