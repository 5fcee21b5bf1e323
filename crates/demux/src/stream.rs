//! Incremental box demuxer.
//!
//! Accepts the container as arbitrarily sized chunks. Structural boxes
//! (`ftyp`, `moov`, `moof`) are buffered until complete and then parsed;
//! everything else (`mdat`, `free`, ...) is skipped by counting bytes, so
//! payload data is never held in memory here. The bytes themselves go to a
//! byte store; samples refer to them by absolute offset.

use mc_common::{DemuxError, TrackKind};
use std::io::Cursor;
use tracing::{debug, info, warn};

use crate::mp4::boxes::{
    fourcc_to_string, parse_ftyp, peek_box_header, BoxHeader, FtypBox, FTYP, MOOF, MOOV,
};
use crate::mp4::fragment::FragmentState;
use crate::mp4::moov::{parse_moov, MovieInfo};
use crate::mp4::sample::SampleEntry;

/// Output of the demuxer, in stream order.
#[derive(Clone, Debug, PartialEq)]
pub enum DemuxEvent {
    /// The movie header is complete. Emitted once, before any samples.
    Ready(MovieInfo),
    /// A batch of samples for one track, in decode order.
    Samples {
        track_id: u32,
        kind: TrackKind,
        samples: Vec<SampleEntry>,
    },
}

/// Push-driven MP4 demuxer.
#[derive(Default)]
pub struct StreamDemuxer {
    /// Absolute stream offset of the next byte to be consumed.
    offset: u64,
    /// Start offset of the box being gathered in `pending`.
    box_start: u64,
    /// Bytes of the current structural box (or its header) received so far.
    pending: Vec<u8>,
    /// Header of the structural box being buffered.
    current: Option<BoxHeader>,
    /// Bytes of a skipped box still to come.
    skip_remaining: u64,
    /// A size-0 box runs to the end of the stream.
    skip_to_end: bool,
    ftyp: Option<FtypBox>,
    movie: Option<MovieInfo>,
    fragments: FragmentState,
}

impl StreamDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Movie metadata, once `Ready` has been emitted.
    pub fn movie(&self) -> Option<&MovieInfo> {
        self.movie.as_ref()
    }

    /// Feed the next chunk of the stream.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<DemuxEvent>, DemuxError> {
        let mut events = Vec::new();
        let mut input = chunk;

        loop {
            let complete = self
                .current
                .as_ref()
                .filter(|h| self.pending.len() as u64 == h.size)
                .cloned();
            if let Some(header) = complete {
                let bytes = std::mem::take(&mut self.pending);
                self.current = None;
                self.handle_box(&header, &bytes, &mut events)?;
                continue;
            }

            if input.is_empty() {
                break;
            }

            if self.skip_to_end {
                self.offset += input.len() as u64;
                break;
            }

            if self.skip_remaining > 0 {
                let n = self.skip_remaining.min(input.len() as u64) as usize;
                self.skip_remaining -= n as u64;
                self.consume(&mut input, n, false);
                continue;
            }

            match self.current.as_ref().map(|h| h.size as usize) {
                // Structural box: buffer until complete.
                Some(size) => {
                    let want = (size - self.pending.len()).min(input.len());
                    self.consume(&mut input, want, true);
                }
                None => self.gather_header(&mut input)?,
            }
        }

        Ok(events)
    }

    /// Signal the end of the stream.
    pub fn finish(&mut self) -> Result<(), DemuxError> {
        if self.movie.is_none() {
            return Err(DemuxError::Incomplete);
        }
        if let Some(header) = &self.current {
            warn!(
                "Stream ended inside '{}' box at offset {} ({} of {} bytes)",
                fourcc_to_string(header.box_type),
                header.offset,
                self.pending.len(),
                header.size
            );
        } else if self.skip_remaining > 0 {
            warn!(
                "Stream ended {} bytes short of the last box",
                self.skip_remaining
            );
        }
        info!("Demux finished after {} bytes", self.offset);
        Ok(())
    }

    /// Move `n` bytes off the front of `input`, optionally into `pending`.
    fn consume(&mut self, input: &mut &[u8], n: usize, keep: bool) {
        let (head, tail) = input.split_at(n);
        if keep {
            self.pending.extend_from_slice(head);
        }
        self.offset += n as u64;
        *input = tail;
    }

    /// Take just enough bytes to decode the next box header, then decide
    /// whether to buffer or skip the box.
    fn gather_header(&mut self, input: &mut &[u8]) -> Result<(), DemuxError> {
        if self.pending.is_empty() {
            self.box_start = self.offset;
        }
        // 8 bytes first; a largesize header needs 8 more.
        let target = if self.pending.len() < 8 { 8 } else { 16 };
        let n = (target - self.pending.len()).min(input.len());
        self.consume(input, n, true);

        let Some(header) = peek_box_header(&self.pending, self.box_start)? else {
            return Ok(());
        };

        let structural = matches!(header.box_type, FTYP | MOOV | MOOF);
        if structural {
            if header.size == 0 {
                return Err(DemuxError::InvalidStructure {
                    offset: header.offset,
                    reason: format!(
                        "'{}' box cannot extend to end of stream",
                        fourcc_to_string(header.box_type)
                    ),
                });
            }
            debug!(
                "Buffering '{}' box at offset {} ({} bytes)",
                fourcc_to_string(header.box_type),
                header.offset,
                header.size
            );
            self.current = Some(header);
            return Ok(());
        }

        if header.size == 0 {
            debug!(
                "'{}' box at offset {} runs to end of stream",
                fourcc_to_string(header.box_type),
                header.offset
            );
            self.skip_to_end = true;
        } else {
            self.skip_remaining = header.size - self.pending.len() as u64;
        }
        self.pending.clear();
        Ok(())
    }

    fn handle_box(
        &mut self,
        header: &BoxHeader,
        bytes: &[u8],
        events: &mut Vec<DemuxEvent>,
    ) -> Result<(), DemuxError> {
        // Parsers see the box at offset 0 of an in-memory cursor.
        let local = BoxHeader {
            offset: 0,
            ..header.clone()
        };
        let mut cursor = Cursor::new(bytes);
        cursor.set_position(local.header_size as u64);

        match header.box_type {
            FTYP => self.ftyp = Some(parse_ftyp(&mut cursor, &local)?),
            MOOV => {
                if self.movie.is_some() {
                    warn!("Ignoring second moov at offset {}", header.offset);
                    return Ok(());
                }
                self.handle_moov(&mut cursor, &local, events)?;
            }
            MOOF => {
                let Some(movie) = &self.movie else {
                    return Err(DemuxError::InvalidStructure {
                        offset: header.offset,
                        reason: "moof before moov".into(),
                    });
                };
                for fragment in self
                    .fragments
                    .parse_moof(&mut cursor, &local, header.offset)?
                {
                    let Some(track) = movie.track(fragment.track_id) else {
                        continue;
                    };
                    if fragment.samples.is_empty() {
                        continue;
                    }
                    events.push(DemuxEvent::Samples {
                        track_id: fragment.track_id,
                        kind: track.kind,
                        samples: fragment.samples,
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_moov(
        &mut self,
        cursor: &mut Cursor<&[u8]>,
        header: &BoxHeader,
        events: &mut Vec<DemuxEvent>,
    ) -> Result<(), DemuxError> {
        let moov = parse_moov(cursor, header)?;
        let (major_brand, compatible_brands) = match &self.ftyp {
            Some(ftyp) => (
                fourcc_to_string(ftyp.major_brand),
                ftyp.compatible_brands
                    .iter()
                    .map(|b| fourcc_to_string(*b))
                    .collect(),
            ),
            None => (String::new(), Vec::new()),
        };

        let movie = MovieInfo {
            major_brand,
            compatible_brands,
            timescale: moov.header.timescale,
            duration: moov.duration(),
            fragmented: moov.fragmented,
            tracks: moov.tracks.iter().map(|t| t.info.clone()).collect(),
        };

        match (movie.video().is_some(), movie.audio().is_some()) {
            (false, false) => warn!("Container has neither a video nor an audio track"),
            (true, false) => info!("Container has no audio track"),
            (false, true) => info!("Container has no video track"),
            (true, true) => {}
        }
        info!(
            brand = %movie.major_brand,
            tracks = movie.tracks.len(),
            fragmented = movie.fragmented,
            "Movie header ready"
        );

        self.fragments = FragmentState::new(&moov.trex);
        events.push(DemuxEvent::Ready(movie.clone()));
        for track in moov.tracks {
            if let Some(last) = track.samples.last() {
                self.fragments
                    .set_next_dts(track.info.track_id, last.dts + last.duration as u64);
            }
            if !track.samples.is_empty() {
                events.push(DemuxEvent::Samples {
                    track_id: track.info.track_id,
                    kind: track.info.kind,
                    samples: track.samples,
                });
            }
        }
        self.movie = Some(movie);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::make_box;
    use crate::testing::{fragmented_mp4, progressive_mp4, Fixture};

    fn push_in_chunks(bytes: &[u8], chunk: usize) -> Vec<DemuxEvent> {
        let mut demuxer = StreamDemuxer::new();
        let mut events = Vec::new();
        for piece in bytes.chunks(chunk) {
            events.extend(demuxer.push(piece).unwrap());
        }
        demuxer.finish().unwrap();
        assert_eq!(demuxer.position(), bytes.len() as u64);
        events
    }

    #[test]
    fn progressive_file_any_chunking() {
        let fixture = progressive_mp4(&Fixture::default());
        let whole = push_in_chunks(&fixture, fixture.len());
        for chunk in [1, 3, 7, 64, 1000] {
            assert_eq!(push_in_chunks(&fixture, chunk), whole, "chunk size {chunk}");
        }

        let DemuxEvent::Ready(movie) = &whole[0] else {
            panic!("first event must be Ready");
        };
        assert_eq!(movie.major_brand, "isom");
        assert_eq!(movie.duration_micros(), 2_005_000);
        assert_eq!(movie.video().unwrap().duration_micros(), 2_000_000);
        assert!(!movie.fragmented);
        assert_eq!(movie.video().unwrap().resolution.width, 64);
        assert_eq!(whole.len(), 3);
    }

    #[test]
    fn sample_offsets_point_into_mdat() {
        let fixture = progressive_mp4(&Fixture::default());
        let events = push_in_chunks(&fixture, 13);
        let video = events
            .iter()
            .find_map(|e| match e {
                DemuxEvent::Samples {
                    kind: TrackKind::Video,
                    samples,
                    ..
                } => Some(samples),
                _ => None,
            })
            .unwrap();
        assert_eq!(video.len(), 60);
        let first = &video[0];
        let payload = &fixture[first.offset as usize..(first.offset + first.size as u64) as usize];
        // AVC length prefix followed by an IDR NAL.
        assert_eq!(payload[4], 0x65);
        assert!(first.is_sync);
        assert!(!video[1].is_sync);
    }

    #[test]
    fn fragmented_file_emits_batch_per_fragment() {
        let fixture = fragmented_mp4(&Fixture::default(), 4);
        let events = push_in_chunks(&fixture, 100);
        let DemuxEvent::Ready(movie) = &events[0] else {
            panic!("first event must be Ready");
        };
        assert!(movie.fragmented);
        let batches: Vec<_> = events[1..]
            .iter()
            .filter_map(|e| match e {
                DemuxEvent::Samples { kind, samples, .. } => Some((*kind, samples.len())),
                _ => None,
            })
            .collect();
        assert_eq!(batches.len(), 8);
        let video_total: usize = batches
            .iter()
            .filter(|(k, _)| *k == TrackKind::Video)
            .map(|(_, n)| n)
            .sum();
        assert_eq!(video_total, 60);
    }

    #[test]
    fn moof_before_moov_is_an_error() {
        let mut demuxer = StreamDemuxer::new();
        let err = demuxer.push(&make_box(b"moof", &[])).unwrap_err();
        assert!(matches!(err, DemuxError::InvalidStructure { .. }));
    }

    #[test]
    fn truncated_stream_is_incomplete() {
        let fixture = progressive_mp4(&Fixture::default());
        let mut demuxer = StreamDemuxer::new();
        demuxer.push(&fixture[..20]).unwrap();
        assert!(matches!(demuxer.finish(), Err(DemuxError::Incomplete)));
    }

    #[test]
    fn trailing_box_to_end_is_skipped() {
        let mut fixture = progressive_mp4(&Fixture::default());
        fixture.extend_from_slice(&[0, 0, 0, 0, b'f', b'r', b'e', b'e', 1, 2, 3]);
        let events = push_in_chunks(&fixture, 5);
        assert!(matches!(events[0], DemuxEvent::Ready(_)));
    }

    #[test]
    fn audio_only_file_is_valid() {
        let fixture = progressive_mp4(&Fixture {
            video_frames: 0,
            ..Fixture::default()
        });
        let events = push_in_chunks(&fixture, 50);
        let DemuxEvent::Ready(movie) = &events[0] else {
            panic!("first event must be Ready");
        };
        assert!(movie.video().is_none());
        assert!(movie.audio().is_some());
    }
}
