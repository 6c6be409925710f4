//! Segment shaping: filter, pad, clamp, merge.
//!
//! The pipeline applies these in order: drop sub-minimum events, pad
//! with context, clamp to the media bounds, then merge neighbors.

use hype_models::Segment;

/// Remove segments shorter than `min_duration`.
pub fn filter_min_duration(segments: Vec<Segment>, min_duration: f64) -> Vec<Segment> {
    segments
        .into_iter()
        .filter(|s| s.duration() >= min_duration)
        .collect()
}

/// Extend each segment by `padding` seconds on both sides. Does not
/// clamp or merge; those run as separate passes.
pub fn pad_segments(segments: Vec<Segment>, padding: f64) -> Vec<Segment> {
    segments
        .into_iter()
        .map(|s| Segment {
            start: s.start - padding,
            end: s.end + padding,
            score: s.score,
        })
        .collect()
}

/// Clamp segment bounds to `[min_time, max_time]`, dropping segments
/// that collapse to zero or negative length.
pub fn clamp_segments(segments: Vec<Segment>, min_time: f64, max_time: f64) -> Vec<Segment> {
    segments
        .into_iter()
        .filter_map(|s| {
            let start = s.start.max(min_time);
            let end = s.end.min(max_time);
            (end > start).then_some(Segment {
                start,
                end,
                score: s.score,
            })
        })
        .collect()
}

/// Merge segments whose gap is at most `merge_gap` seconds, keeping the
/// max score of the merged pair. When a merge would push the combined
/// window past `max_duration`, the current window is finalized instead
/// and the next one starts fresh.
///
/// Input may be unsorted or overlapping; output is sorted by start.
pub fn merge_segments(
    segments: Vec<Segment>,
    merge_gap: f64,
    max_duration: Option<f64>,
) -> Vec<Segment> {
    if segments.is_empty() {
        return Vec::new();
    }

    let mut sorted = segments;
    sorted.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut merged = Vec::new();
    let mut iter = sorted.into_iter();
    let mut current = match iter.next() {
        Some(first) => first,
        None => return Vec::new(),
    };

    for next in iter {
        let gap = next.start - current.end;

        if gap <= merge_gap {
            let potential_end = current.end.max(next.end);
            let potential_duration = potential_end - current.start;

            let exceeds_cap = max_duration.is_some_and(|cap| potential_duration > cap);
            if exceeds_cap {
                merged.push(current);
                current = next;
            } else {
                current.end = potential_end;
                current.score = current.score.max(next.score);
            }
        } else {
            merged.push(current);
            current = next;
        }
    }

    merged.push(current);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, end: f64) -> Segment {
        Segment {
            start,
            end,
            score: 0.0,
        }
    }

    fn scored(start: f64, end: f64, score: f64) -> Segment {
        Segment { start, end, score }
    }

    #[test]
    fn filter_drops_short_events() {
        let out = filter_min_duration(vec![seg(0.0, 0.3), seg(1.0, 2.0)], 0.5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start, 1.0);
    }

    #[test]
    fn pad_extends_both_sides() {
        let out = pad_segments(vec![seg(10.0, 12.0)], 2.0);
        assert_eq!(out[0].start, 8.0);
        assert_eq!(out[0].end, 14.0);
    }

    #[test]
    fn clamp_bounds_and_drops_collapsed() {
        let out = clamp_segments(vec![seg(-1.0, 5.0), seg(58.0, 70.0), seg(65.0, 80.0)], 0.0, 60.0);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].start, 0.0);
        assert_eq!(out[0].end, 5.0);
        assert_eq!(out[1].start, 58.0);
        assert_eq!(out[1].end, 60.0);
        // (65, 80) collapses entirely past the media end.
    }

    #[test]
    fn merge_joins_within_gap() {
        let out = merge_segments(vec![seg(0.0, 5.0), seg(7.0, 10.0), seg(30.0, 35.0)], 3.0, None);
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].start, out[0].end), (0.0, 10.0));
        assert_eq!((out[1].start, out[1].end), (30.0, 35.0));
    }

    #[test]
    fn merge_handles_unsorted_and_overlapping_input() {
        let out = merge_segments(vec![seg(8.0, 12.0), seg(0.0, 9.0)], 1.0, None);
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].start, out[0].end), (0.0, 12.0));
    }

    #[test]
    fn merge_keeps_max_score() {
        let out = merge_segments(vec![scored(0.0, 5.0, 0.4), scored(6.0, 10.0, 0.9)], 2.0, None);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].score, 0.9);
    }

    #[test]
    fn merge_respects_max_duration() {
        // Merging would produce a 55 s window; the 30 s cap splits it.
        let out = merge_segments(
            vec![seg(0.0, 25.0), seg(28.0, 55.0)],
            5.0,
            Some(30.0),
        );
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].start, out[0].end), (0.0, 25.0));
        assert_eq!((out[1].start, out[1].end), (28.0, 55.0));
    }

    #[test]
    fn merge_empty_input() {
        assert!(merge_segments(Vec::new(), 5.0, None).is_empty());
    }
}
