//! Track/Sample Editor: non-destructive trim and split of sample tables.
//!
//! Edits never move bytes or drop entries from the middle of a table. Removed
//! samples are flagged `deleted`; presentation times of what follows are
//! shifted so the clip plays without a hole. `dts` keeps the source decode
//! order so the table stays sorted.
//!
//! A GoP whose leading sync sample would be deleted while later samples of
//! the same GoP survive keeps that sync sample as a zero-duration,
//! decode-only entry placed at the first surviving presentation time.

use std::ops::Range;

use mc_common::{EditError, Micros, Sample, TrackKind};
use tracing::debug;

/// Index ranges of the GoPs in `samples`. Samples before the first sync
/// sample form a leaderless range.
pub fn gop_ranges(samples: &[Sample]) -> Vec<Range<usize>> {
    let mut starts: Vec<usize> = samples
        .iter()
        .enumerate()
        .filter(|(i, s)| s.is_sync || *i == 0)
        .map(|(i, _)| i)
        .collect();
    starts.dedup();
    starts
        .iter()
        .enumerate()
        .map(|(n, &start)| start..starts.get(n + 1).copied().unwrap_or(samples.len()))
        .collect()
}

/// Index of the sync sample starting the GoP that presents `time`, or the
/// table length when nothing live ends after `time`.
pub fn covering_gop_start(samples: &[Sample], time: Micros) -> usize {
    let Some(target) = samples.iter().position(|s| !s.deleted && s.end() > time) else {
        return samples.len();
    };
    samples[..=target]
        .iter()
        .rposition(|s| s.is_sync)
        .unwrap_or(0)
}

/// Re-enable deleted GoP leaders whose GoP still has live samples.
fn protect_gop_leaders(samples: &mut [Sample]) {
    for gop in gop_ranges(samples) {
        let leader = gop.start;
        if !samples[leader].is_sync || !samples[leader].deleted {
            continue;
        }
        let first_live = samples[gop.start + 1..gop.end]
            .iter()
            .filter(|s| !s.deleted)
            .map(|s| s.cts)
            .min();
        if let Some(cts) = first_live {
            let s = &mut samples[leader];
            s.deleted = false;
            s.cts = cts;
            s.duration = 0;
        }
    }
}

/// Soft-delete every live sample presenting inside `[start, end)` and pull
/// later samples back by `end - start`. Cumulative over repeated calls.
pub fn delete_range(
    samples: &mut [Sample],
    kind: TrackKind,
    start: Micros,
    end: Micros,
) -> Result<(), EditError> {
    if samples.is_empty() {
        return Err(EditError::NotFound(kind));
    }
    if start < 0 || end <= start {
        return Err(EditError::InvalidRange { start, end });
    }
    let shift = end - start;
    let mut removed = 0usize;
    for s in samples.iter_mut().filter(|s| !s.deleted) {
        if s.intersects(start, end) {
            s.deleted = true;
            removed += 1;
        } else if s.cts >= end {
            s.cts -= shift;
        }
    }
    protect_gop_leaders(samples);
    debug!(
        kind = kind.as_str(),
        start, end, removed, "Deleted range"
    );
    Ok(())
}

/// Cut a table at `time` into a pre part (everything before `time`, plus the
/// rest of the last GoP as deleted entries) and a post part (from the GoP
/// covering `time`, rebased by `-time`).
pub fn split(
    samples: &[Sample],
    kind: TrackKind,
    time: Micros,
) -> Result<(Vec<Sample>, Vec<Sample>), EditError> {
    if samples.is_empty() {
        return Err(EditError::NotFound(kind));
    }

    let mut pre = samples.to_vec();
    for s in pre.iter_mut().filter(|s| !s.deleted) {
        if s.cts >= time {
            s.deleted = true;
        } else if s.end() > time {
            s.duration = time - s.cts;
        }
    }
    if let Some(last_live) = pre.iter().rposition(|s| !s.deleted) {
        let cut = pre[last_live + 1..]
            .iter()
            .position(|s| s.is_sync)
            .map_or(pre.len(), |i| last_live + 1 + i);
        pre.truncate(cut);
    }
    protect_gop_leaders(&mut pre);

    let from = covering_gop_start(samples, time);
    let mut post = samples[from..].to_vec();
    for s in &mut post {
        s.cts -= time;
        s.dts -= time;
        if s.cts < 0 {
            s.deleted = true;
        }
    }
    protect_gop_leaders(&mut post);

    debug!(
        kind = kind.as_str(),
        time,
        pre = pre.len(),
        post = post.len(),
        "Split track"
    );
    Ok((pre, post))
}

/// Stretch the first visible sample back to 0 when it starts within
/// `threshold` of the beginning. Returns whether a sample was changed.
pub fn fix_black_frame(samples: &mut [Sample], threshold: Micros) -> bool {
    let Some(first) = samples
        .iter_mut()
        .filter(|s| !s.deleted && s.duration > 0)
        .min_by_key(|s| s.cts)
    else {
        return false;
    };
    if first.cts > 0 && first.cts < threshold {
        debug!(gap = first.cts, "Extending first sample to cover leading gap");
        first.duration += first.cts;
        first.cts = 0;
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_common::track_duration;
    use proptest::prelude::*;

    const DUR: Micros = 1_000;

    /// Consecutive GoPs of the given sizes, one sample per millisecond.
    fn table(gops: &[usize]) -> Vec<Sample> {
        let mut out = Vec::new();
        for &size in gops {
            for i in 0..size {
                let t = out.len() as Micros * DUR;
                out.push(Sample {
                    dts: t,
                    cts: t,
                    duration: DUR,
                    offset: out.len() as u64 * 10,
                    size: 10,
                    is_sync: i == 0,
                    deleted: false,
                    payload_offset: None,
                });
            }
        }
        out
    }

    fn live(samples: &[Sample]) -> Vec<Micros> {
        samples
            .iter()
            .filter(|s| !s.deleted && s.duration > 0)
            .map(|s| s.cts)
            .collect()
    }

    /// Every live sample is preceded, inside its GoP, by a live sync sample.
    fn gop_safe(samples: &[Sample]) -> bool {
        gop_ranges(samples).into_iter().all(|gop| {
            let any_live = samples[gop.clone()].iter().any(|s| !s.deleted);
            !any_live || (samples[gop.start].is_sync && !samples[gop.start].deleted)
        })
    }

    #[test]
    fn gop_ranges_split_on_sync() {
        let samples = table(&[3, 2]);
        assert_eq!(gop_ranges(&samples), vec![0..3, 3..5]);
        assert!(gop_ranges(&[]).is_empty());
    }

    #[test]
    fn delete_marks_and_shifts() {
        let mut samples = table(&[4, 4]);
        delete_range(&mut samples, TrackKind::Video, 4_000, 6_000).unwrap();
        assert!(samples[4].is_sync && !samples[4].deleted);
        assert_eq!(samples[4].duration, 0);
        assert!(samples[5].deleted);
        assert_eq!(live(&samples), vec![0, 1_000, 2_000, 3_000, 4_000, 5_000]);
        // Byte ranges are untouched.
        assert_eq!(samples[5].offset, 50);
        assert_eq!(track_duration(&samples), 6_000);
    }

    #[test]
    fn whole_gop_goes_with_its_leader() {
        let mut samples = table(&[2, 2, 2]);
        delete_range(&mut samples, TrackKind::Video, 2_000, 4_000).unwrap();
        assert!(samples[2].deleted && samples[3].deleted);
        assert_eq!(live(&samples), vec![0, 1_000, 2_000, 3_000]);
    }

    #[test]
    fn delete_errors() {
        let mut empty: Vec<Sample> = Vec::new();
        assert_eq!(
            delete_range(&mut empty, TrackKind::Audio, 0, 1),
            Err(EditError::NotFound(TrackKind::Audio))
        );
        let mut samples = table(&[2]);
        assert_eq!(
            delete_range(&mut samples, TrackKind::Video, 5, 5),
            Err(EditError::InvalidRange { start: 5, end: 5 })
        );
        assert_eq!(samples, table(&[2]));
    }

    #[test]
    fn split_mid_gop() {
        let samples = table(&[4, 4]);
        let (pre, post) = split(&samples, TrackKind::Video, 5_500).unwrap();

        // Pre: 0..5.5ms, sample 5 trimmed, rest of GoP kept as deleted.
        assert_eq!(pre.len(), 8);
        assert_eq!(track_duration(&pre), 5_500);
        assert_eq!(pre[5].duration, 500);
        assert!(pre[6].deleted && pre[7].deleted);

        // Post starts at the GoP leader, rebased by -5.5ms.
        assert_eq!(post.len(), 4);
        assert!(post[0].is_sync && !post[0].deleted && post[0].duration == 0);
        assert!(post[1].deleted);
        assert_eq!(post[2].cts, 500);
        assert_eq!(track_duration(&post), 2_500);
    }

    #[test]
    fn split_on_gop_boundary() {
        let samples = table(&[4, 4]);
        let (pre, post) = split(&samples, TrackKind::Video, 4_000).unwrap();
        assert_eq!(pre.len(), 4);
        assert_eq!(post.len(), 4);
        assert_eq!(post[0].cts, 0);
        assert!(!post[0].deleted && post[0].duration == DUR);
    }

    #[test]
    fn black_frame_heuristic() {
        let mut samples = table(&[3]);
        for s in &mut samples {
            s.cts += 150_000;
        }
        assert!(fix_black_frame(&mut samples, 200_000));
        assert_eq!(samples[0].cts, 0);
        assert_eq!(samples[0].duration, 151_000);

        let mut late = table(&[3]);
        for s in &mut late {
            s.cts += 250_000;
        }
        assert!(!fix_black_frame(&mut late, 200_000));
        assert_eq!(late[0].cts, 250_000);
    }

    #[derive(Clone, Debug)]
    enum Edit {
        Delete(Micros, Micros),
        Split(Micros, bool),
    }

    fn edit_strategy() -> impl Strategy<Value = Edit> {
        prop_oneof![
            (0i64..40_000, 1i64..10_000).prop_map(|(a, len)| Edit::Delete(a, a + len)),
            (1i64..40_000, any::<bool>()).prop_map(|(t, keep_post)| Edit::Split(t, keep_post)),
        ]
    }

    proptest! {
        #[test]
        fn edits_keep_gops_decodable(
            gops in prop::collection::vec(1usize..8, 1..8),
            edits in prop::collection::vec(edit_strategy(), 1..6),
        ) {
            let mut samples = table(&gops);
            for edit in edits {
                match edit {
                    Edit::Delete(a, b) => {
                        delete_range(&mut samples, TrackKind::Video, a, b).unwrap();
                    }
                    Edit::Split(t, keep_post) => {
                        let (pre, post) = split(&samples, TrackKind::Video, t).unwrap();
                        prop_assert!(gop_safe(&pre));
                        prop_assert!(gop_safe(&post));
                        samples = if keep_post { post } else { pre };
                        if samples.is_empty() {
                            return Ok(());
                        }
                    }
                }
                prop_assert!(gop_safe(&samples));
                prop_assert!(samples.windows(2).all(|w| w[0].dts <= w[1].dts));
                prop_assert!(samples.iter().all(|s| s.duration >= 0));
            }
        }

        #[test]
        fn split_preserves_total_duration(
            gops in prop::collection::vec(1usize..8, 1..8),
            at in 0.01f64..0.99,
        ) {
            let samples = table(&gops);
            let total = track_duration(&samples);
            let time = ((total as f64 * at) as Micros).max(1);
            let (mut pre, mut post) = split(&samples, TrackKind::Video, time).unwrap();
            fix_black_frame(&mut pre, 200_000);
            fix_black_frame(&mut post, 200_000);
            let sum = track_duration(&pre) + track_duration(&post);
            prop_assert!((sum - total).abs() <= DUR, "{} vs {}", sum, total);
        }
    }
}
