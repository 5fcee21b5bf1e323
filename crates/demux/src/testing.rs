//! Synthetic MP4 builders for tests across the workspace.
//!
//! The payloads are not decodable video; they are length-prefixed NAL-shaped
//! bytes that the fake codecs in `mc_common::testing` accept.

use mc_common::testing::{aac_specific_config, FAKE_AVCC};
use mc_common::Micros;

/// Build a plain box from fourcc + payload.
pub fn make_box(fourcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 8);
    buf.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
    buf.extend_from_slice(fourcc);
    buf.extend_from_slice(payload);
    buf
}

/// Build a full box (version + flags prefix).
pub fn make_full_box(fourcc: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = (((version as u32) << 24) | flags).to_be_bytes().to_vec();
    body.extend_from_slice(payload);
    make_box(fourcc, &body)
}

pub const VIDEO_TRACK_ID: u32 = 1;
pub const AUDIO_TRACK_ID: u32 = 2;
const VIDEO_TIMESCALE: u32 = 90_000;
const AAC_FRAME: u32 = 1024;

/// Shape of a generated file. A track with zero frames is left out.
#[derive(Clone, Debug)]
pub struct Fixture {
    pub video_frames: usize,
    pub fps: u32,
    /// Frames per GoP; every `gop`-th frame is a sync sample.
    pub gop: usize,
    pub width: u16,
    pub height: u16,
    /// AAC frames of 1024 samples.
    pub audio_frames: usize,
    pub sample_rate: u32,
    pub channels: u16,
    /// Start keyframes with an SEI NAL ahead of the IDR slice.
    pub sei_prefix: bool,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            video_frames: 60,
            fps: 30,
            gop: 30,
            width: 64,
            height: 36,
            audio_frames: 94,
            sample_rate: 48_000,
            channels: 2,
            sei_prefix: false,
        }
    }
}

impl Fixture {
    /// Audio and video covering `secs` seconds at the default rates.
    pub fn seconds(secs: u32) -> Self {
        let base = Self::default();
        let audio = (secs as u64 * base.sample_rate as u64).div_ceil(AAC_FRAME as u64);
        Self {
            video_frames: (secs * base.fps) as usize,
            audio_frames: audio as usize,
            ..base
        }
    }

    pub fn audio_only(secs: u32) -> Self {
        Self {
            video_frames: 0,
            ..Self::seconds(secs)
        }
    }

    pub fn frame_duration(&self) -> Micros {
        1_000_000 / self.fps as Micros
    }

    pub fn video_duration(&self) -> Micros {
        self.video_frames as Micros * self.frame_duration()
    }

    pub fn is_sync(&self, index: usize) -> bool {
        index % self.gop.max(1) == 0
    }

    fn video_delta(&self) -> u32 {
        VIDEO_TIMESCALE / self.fps
    }

    pub fn video_payload(&self, index: usize) -> Vec<u8> {
        let mut out = Vec::new();
        if self.is_sync(index) && self.sei_prefix {
            out.extend_from_slice(&[0, 0, 0, 3, 0x06, 0x05, 0x80]);
        }
        let nal_type = if self.is_sync(index) { 0x65 } else { 0x41 };
        out.extend_from_slice(&[0, 0, 0, 5, nal_type]);
        out.extend_from_slice(&(index as u32).to_be_bytes());
        out
    }

    pub fn audio_payload(&self, index: usize) -> Vec<u8> {
        let mut out = vec![0x21, 0x10];
        out.extend_from_slice(&(index as u32).to_be_bytes());
        out
    }

    fn movie_duration_ms(&self) -> u32 {
        let video = self.video_frames as u64 * 1000 / self.fps as u64;
        let audio = self.audio_frames as u64 * AAC_FRAME as u64 * 1000 / self.sample_rate as u64;
        video.max(audio) as u32
    }
}

// ─── moov pieces ───────────────────────────────────────────────────

fn mvhd(duration_ms: u32, next_track_id: u32) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&[0; 8]);
    p.extend_from_slice(&1000u32.to_be_bytes());
    p.extend_from_slice(&duration_ms.to_be_bytes());
    p.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    p.extend_from_slice(&0x0100u16.to_be_bytes());
    p.extend_from_slice(&[0; 10]);
    p.extend_from_slice(&IDENTITY_MATRIX);
    p.extend_from_slice(&[0; 24]);
    p.extend_from_slice(&next_track_id.to_be_bytes());
    make_full_box(b"mvhd", 0, 0, &p)
}

const IDENTITY_MATRIX: [u8; 36] = [
    0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, //
    0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, //
    0, 0, 0, 0, 0, 0, 0, 0, 0x40, 0, 0, 0,
];

fn tkhd(track_id: u32, width: u16, height: u16) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&[0; 8]);
    p.extend_from_slice(&track_id.to_be_bytes());
    p.extend_from_slice(&[0; 8]);
    p.extend_from_slice(&[0; 16]);
    p.extend_from_slice(&IDENTITY_MATRIX);
    p.extend_from_slice(&((width as u32) << 16).to_be_bytes());
    p.extend_from_slice(&((height as u32) << 16).to_be_bytes());
    make_full_box(b"tkhd", 0, 3, &p)
}

fn mdhd(timescale: u32, duration: u32) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&[0; 8]);
    p.extend_from_slice(&timescale.to_be_bytes());
    p.extend_from_slice(&duration.to_be_bytes());
    p.extend_from_slice(&0x55c4u16.to_be_bytes());
    p.extend_from_slice(&[0; 2]);
    make_full_box(b"mdhd", 0, 0, &p)
}

fn hdlr(handler: &[u8; 4]) -> Vec<u8> {
    let mut p = vec![0; 4];
    p.extend_from_slice(handler);
    p.extend_from_slice(&[0; 13]);
    make_full_box(b"hdlr", 0, 0, &p)
}

fn avc1_entry(width: u16, height: u16) -> Vec<u8> {
    let mut p = vec![0; 6];
    p.extend_from_slice(&1u16.to_be_bytes());
    p.extend_from_slice(&[0; 16]);
    p.extend_from_slice(&width.to_be_bytes());
    p.extend_from_slice(&height.to_be_bytes());
    p.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    p.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    p.extend_from_slice(&[0; 4]);
    p.extend_from_slice(&1u16.to_be_bytes());
    p.extend_from_slice(&[0; 32]);
    p.extend_from_slice(&0x0018u16.to_be_bytes());
    p.extend_from_slice(&(-1i16).to_be_bytes());
    p.extend(make_box(b"avcC", FAKE_AVCC));
    make_box(b"avc1", &p)
}

/// esds box carrying an AudioSpecificConfig.
pub fn esds(asc: &[u8]) -> Vec<u8> {
    let mut dsi = vec![0x05, asc.len() as u8];
    dsi.extend_from_slice(asc);
    let mut dcd = vec![0x04, (13 + dsi.len()) as u8, 0x40, 0x15, 0, 0, 0];
    dcd.extend_from_slice(&[0; 8]);
    dcd.extend_from_slice(&dsi);
    let mut es = vec![0x03, (3 + dcd.len()) as u8, 0, 1, 0];
    es.extend_from_slice(&dcd);
    make_full_box(b"esds", 0, 0, &es)
}

fn mp4a_entry(sample_rate: u32, channels: u16) -> Vec<u8> {
    let mut p = vec![0; 6];
    p.extend_from_slice(&1u16.to_be_bytes());
    p.extend_from_slice(&[0; 8]);
    p.extend_from_slice(&channels.to_be_bytes());
    p.extend_from_slice(&16u16.to_be_bytes());
    p.extend_from_slice(&[0; 4]);
    p.extend_from_slice(&(sample_rate << 16).to_be_bytes());
    p.extend(esds(&aac_specific_config(sample_rate, channels)));
    make_box(b"mp4a", &p)
}

fn u32_table(fourcc: &[u8; 4], rows: &[&[u32]]) -> Vec<u8> {
    let mut p = (rows.len() as u32).to_be_bytes().to_vec();
    for row in rows {
        for v in *row {
            p.extend_from_slice(&v.to_be_bytes());
        }
    }
    make_full_box(fourcc, 0, 0, &p)
}

/// Sample table of one track. `None` sizes writes empty tables (fragmented).
struct TrackTables<'a> {
    entry: Vec<u8>,
    delta: u32,
    sizes: Option<&'a [u32]>,
    chunk_offset: u32,
    sync: Option<Vec<u32>>,
}

fn stbl(t: &TrackTables<'_>) -> Vec<u8> {
    let mut stsd = 1u32.to_be_bytes().to_vec();
    stsd.extend_from_slice(&t.entry);
    let mut body = make_full_box(b"stsd", 0, 0, &stsd);

    let sizes = t.sizes.unwrap_or(&[]);
    let n = sizes.len() as u32;
    if n > 0 {
        body.extend(u32_table(b"stts", &[&[n, t.delta]]));
        body.extend(u32_table(b"stsc", &[&[1, n, 1]]));
        let mut stsz = 0u32.to_be_bytes().to_vec();
        stsz.extend_from_slice(&n.to_be_bytes());
        for s in sizes {
            stsz.extend_from_slice(&s.to_be_bytes());
        }
        body.extend(make_full_box(b"stsz", 0, 0, &stsz));
        body.extend(u32_table(b"stco", &[&[t.chunk_offset]]));
        if let Some(sync) = &t.sync {
            let rows: Vec<[u32; 1]> = sync.iter().map(|s| [*s]).collect();
            let rows: Vec<&[u32]> = rows.iter().map(|r| &r[..]).collect();
            body.extend(u32_table(b"stss", &rows));
        }
    } else {
        body.extend(u32_table(b"stts", &[]));
        body.extend(u32_table(b"stsc", &[]));
        body.extend(make_full_box(b"stsz", 0, 0, &[0; 8]));
        body.extend(u32_table(b"stco", &[]));
    }
    make_box(b"stbl", &body)
}

fn trak(
    track_id: u32,
    handler: &[u8; 4],
    timescale: u32,
    duration: u32,
    size: (u16, u16),
    tables: &TrackTables<'_>,
) -> Vec<u8> {
    let minf = make_box(b"minf", &stbl(tables));
    let mut mdia = mdhd(timescale, duration);
    mdia.extend(hdlr(handler));
    mdia.extend(minf);
    let mut body = tkhd(track_id, size.0, size.1);
    body.extend(make_box(b"mdia", &mdia));
    make_box(b"trak", &body)
}

fn ftyp(major: &[u8; 4], compatible: &[&[u8; 4]]) -> Vec<u8> {
    let mut p = major.to_vec();
    p.extend_from_slice(&512u32.to_be_bytes());
    for c in compatible {
        p.extend_from_slice(*c);
    }
    make_box(b"ftyp", &p)
}

impl Fixture {
    fn video_sizes(&self) -> Vec<u32> {
        (0..self.video_frames)
            .map(|i| self.video_payload(i).len() as u32)
            .collect()
    }

    fn audio_sizes(&self) -> Vec<u32> {
        (0..self.audio_frames)
            .map(|i| self.audio_payload(i).len() as u32)
            .collect()
    }

    fn sync_numbers(&self) -> Vec<u32> {
        (0..self.video_frames)
            .filter(|i| self.is_sync(*i))
            .map(|i| i as u32 + 1)
            .collect()
    }

    fn moov(&self, offsets: (u32, u32), with_tables: bool, mvex: bool) -> Vec<u8> {
        let video_sizes = self.video_sizes();
        let audio_sizes = self.audio_sizes();
        let mut body = mvhd(self.movie_duration_ms(), 3);
        let mut trex = Vec::new();

        if self.video_frames > 0 {
            let tables = TrackTables {
                entry: avc1_entry(self.width, self.height),
                delta: self.video_delta(),
                sizes: with_tables.then_some(&video_sizes[..]),
                chunk_offset: offsets.0,
                sync: Some(self.sync_numbers()),
            };
            let duration = if with_tables {
                self.video_frames as u32 * self.video_delta()
            } else {
                0
            };
            body.extend(trak(
                VIDEO_TRACK_ID,
                b"vide",
                VIDEO_TIMESCALE,
                duration,
                (self.width, self.height),
                &tables,
            ));
            trex.push((VIDEO_TRACK_ID, self.video_delta()));
        }
        if self.audio_frames > 0 {
            let tables = TrackTables {
                entry: mp4a_entry(self.sample_rate, self.channels),
                delta: AAC_FRAME,
                sizes: with_tables.then_some(&audio_sizes[..]),
                chunk_offset: offsets.1,
                sync: None,
            };
            let duration = if with_tables {
                self.audio_frames as u32 * AAC_FRAME
            } else {
                0
            };
            body.extend(trak(
                AUDIO_TRACK_ID,
                b"soun",
                self.sample_rate,
                duration,
                (0, 0),
                &tables,
            ));
            trex.push((AUDIO_TRACK_ID, AAC_FRAME));
        }

        if mvex {
            let mut mvex_body = make_full_box(b"mehd", 0, 0, &self.movie_duration_ms().to_be_bytes());
            for (track_id, duration) in trex {
                let mut p = track_id.to_be_bytes().to_vec();
                p.extend_from_slice(&1u32.to_be_bytes());
                p.extend_from_slice(&duration.to_be_bytes());
                p.extend_from_slice(&0u32.to_be_bytes());
                p.extend_from_slice(&0u32.to_be_bytes());
                mvex_body.extend(make_full_box(b"trex", 0, 0, &p));
            }
            body.extend(make_box(b"mvex", &mvex_body));
        }
        make_box(b"moov", &body)
    }
}

/// A regular (non-fragmented) file: ftyp, moov, mdat.
pub fn progressive_mp4(fixture: &Fixture) -> Vec<u8> {
    let ftyp = ftyp(b"isom", &[b"isom", b"iso2", b"avc1", b"mp41"]);
    let moov_len = fixture.moov((0, 0), true, false).len();
    let video_start = (ftyp.len() + moov_len + 8) as u32;
    let video_bytes: u32 = fixture.video_sizes().iter().sum();
    let moov = fixture.moov((video_start, video_start + video_bytes), true, false);

    let mut mdat = Vec::new();
    for i in 0..fixture.video_frames {
        mdat.extend(fixture.video_payload(i));
    }
    for i in 0..fixture.audio_frames {
        mdat.extend(fixture.audio_payload(i));
    }

    let mut out = ftyp;
    out.extend(moov);
    out.extend(make_box(b"mdat", &mdat));
    out
}

const SYNC_FLAGS: u32 = 0x0200_0000;
const NON_SYNC_FLAGS: u32 = 0x0101_0000;

/// A fragmented file with `fragments` moof/mdat pairs.
pub fn fragmented_mp4(fixture: &Fixture, fragments: usize) -> Vec<u8> {
    let fragments = fragments.max(1);
    let mut out = ftyp(b"iso5", &[b"iso5", b"iso6", b"mp41"]);
    out.extend(fixture.moov((0, 0), false, true));

    let split = |total: usize, f: usize| {
        let per = total.div_ceil(fragments);
        (f * per).min(total)..((f + 1) * per).min(total)
    };

    for f in 0..fragments {
        let video = split(fixture.video_frames, f);
        let audio = split(fixture.audio_frames, f);

        let mut runs: Vec<(u32, u64, Vec<(Vec<u8>, u32)>)> = Vec::new();
        if fixture.video_frames > 0 {
            let samples = video
                .clone()
                .map(|i| {
                    let flags = if fixture.is_sync(i) { SYNC_FLAGS } else { NON_SYNC_FLAGS };
                    (fixture.video_payload(i), flags)
                })
                .collect();
            runs.push((
                VIDEO_TRACK_ID,
                video.start as u64 * fixture.video_delta() as u64,
                samples,
            ));
        }
        if fixture.audio_frames > 0 {
            let samples = audio.clone().map(|i| (fixture.audio_payload(i), 0)).collect();
            runs.push((AUDIO_TRACK_ID, audio.start as u64 * AAC_FRAME as u64, samples));
        }

        let moof = |data_start: u32| {
            let mut body = make_full_box(b"mfhd", 0, 0, &(f as u32 + 1).to_be_bytes());
            let mut data_offset = data_start;
            for (track_id, base_dts, samples) in &runs {
                let mut traf = make_full_box(b"tfhd", 0, 0x020000, &track_id.to_be_bytes());
                traf.extend(make_full_box(b"tfdt", 1, 0, &base_dts.to_be_bytes()));
                let mut trun = (samples.len() as u32).to_be_bytes().to_vec();
                trun.extend_from_slice(&(data_offset as i32).to_be_bytes());
                for (payload, flags) in samples {
                    trun.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                    trun.extend_from_slice(&flags.to_be_bytes());
                    data_offset += payload.len() as u32;
                }
                traf.extend(make_full_box(b"trun", 0, 0x000001 | 0x200 | 0x400, &trun));
                body.extend(make_box(b"traf", &traf));
            }
            make_box(b"moof", &body)
        };

        let moof_len = moof(0).len() as u32;
        out.extend(moof(moof_len + 8));
        let mdat: Vec<u8> = runs
            .iter()
            .flat_map(|(_, _, samples)| samples.iter().flat_map(|(p, _)| p.iter().copied()))
            .collect();
        out.extend(make_box(b"mdat", &mdat));
    }
    out
}

/// Demuxed fixture: movie header plus transformed sample tables.
#[derive(Clone, Debug)]
pub struct DemuxedFixture {
    pub movie: crate::MovieInfo,
    pub video: Vec<mc_common::Sample>,
    pub audio: Vec<mc_common::Sample>,
}

/// Run `bytes` through the stream demuxer and sample transform in one go.
pub fn demux_all(bytes: &[u8]) -> Result<DemuxedFixture, mc_common::DemuxError> {
    use crate::{DemuxEvent, SampleTransform, StreamDemuxer};
    use mc_common::TrackKind;
    use std::collections::HashMap;

    let mut demuxer = StreamDemuxer::new();
    let events = demuxer.push(bytes)?;
    demuxer.finish()?;
    let movie = demuxer.movie().cloned().ok_or(mc_common::DemuxError::Incomplete)?;

    let mut transforms: HashMap<u32, SampleTransform> = movie
        .tracks
        .iter()
        .map(|t| (t.track_id, SampleTransform::new(t)))
        .collect();
    let mut video = Vec::new();
    let mut audio = Vec::new();
    for event in events {
        if let DemuxEvent::Samples {
            track_id,
            kind,
            samples,
        } = event
        {
            let Some(transform) = transforms.get_mut(&track_id) else {
                continue;
            };
            let converted = transform.convert(&samples);
            match kind {
                TrackKind::Video => video.extend(converted),
                TrackKind::Audio => audio.extend(converted),
            }
        }
    }
    Ok(DemuxedFixture {
        movie,
        video,
        audio,
    })
}
