//! Splitting a job's inclusive frame range into per-worker subranges.

/// One worker's contiguous slice of the job's frame range. Both ends are
/// inclusive, matching aerender's `-s`/`-e` arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subrange {
    pub index: usize,
    pub start: i64,
    pub end: i64,
}

impl Subrange {
    pub fn frame_count(&self) -> i64 {
        self.end - self.start + 1
    }
}

impl std::fmt::Display for Subrange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Split `[start, end]` into `min(n, frame count)` contiguous inclusive
/// subranges covering every frame exactly once. The first `total % n'`
/// subranges carry one extra frame so sizes differ by at most one.
pub fn split_ranges(start: i64, end: i64, n: usize) -> anyhow::Result<Vec<Subrange>> {
    if end < start {
        anyhow::bail!("invalid frame range: start={start} > end={end}");
    }

    let total = end - start + 1;
    let n_eff = std::cmp::min(n.max(1) as i64, total);
    let base = total / n_eff;
    let extra = total % n_eff;

    let mut subranges = Vec::with_capacity(n_eff as usize);
    let mut cursor = start;
    for index in 0..n_eff {
        let len = base + i64::from(index < extra);
        subranges.push(Subrange {
            index: index as usize,
            start: cursor,
            end: cursor + len - 1,
        });
        cursor += len;
    }

    Ok(subranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(start: i64, end: i64, n: usize, expected: &[(i64, i64)]) {
        let ranges = split_ranges(start, end, n).unwrap();
        let got: Vec<_> = ranges.iter().map(|r| (r.start, r.end)).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn partitions_exactly() {
        for (s, e, n) in [(0, 9, 2), (0, 9, 3), (5, 5, 1), (0, 99, 7), (-3, 4, 4)] {
            let ranges = split_ranges(s, e, n).unwrap();
            assert_eq!(ranges.len(), std::cmp::min(n as i64, e - s + 1) as usize);
            // no gaps, no overlaps, full coverage
            assert_eq!(ranges.first().unwrap().start, s);
            assert_eq!(ranges.last().unwrap().end, e);
            for pair in ranges.windows(2) {
                assert_eq!(pair[1].start, pair[0].end + 1);
            }
            for r in &ranges {
                assert!(r.start <= r.end);
            }
        }
    }

    #[test]
    fn first_subranges_take_remainder() {
        check(0, 9, 3, &[(0, 3), (4, 6), (7, 9)]);
        check(0, 10, 4, &[(0, 2), (3, 5), (6, 8), (9, 10)]);
    }

    #[test]
    fn even_split() {
        check(0, 9, 2, &[(0, 4), (5, 9)]);
    }

    #[test]
    fn clamps_to_frame_count() {
        check(0, 2, 10, &[(0, 0), (1, 1), (2, 2)]);
        check(7, 7, 4, &[(7, 7)]);
    }

    #[test]
    fn zero_workers_treated_as_one() {
        check(0, 5, 0, &[(0, 5)]);
    }

    #[test]
    fn rejects_reversed_range() {
        assert!(split_ranges(10, 9, 2).is_err());
    }
}
