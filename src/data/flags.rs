// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sample flags as sorted, disjoint index ranges.
//!
//! Flags only ever accumulate within a block: there is `include` but no
//! `exclude`. Over-flagging is always legal; losing a flag never is. That
//! asymmetry shows up in [`FlagRanges::marshall`], which merges ranges when
//! a packet can't carry all of them.

use std::ops::Range;

use crate::constants::MAX_FLAG_RANGES_PER_PACKET;

/// A set of flagged sample indices over a fixed domain `0..len`, stored as
/// sorted, non-overlapping, non-adjacent `(start, end)` ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagRanges {
    len: usize,
    ranges: Vec<(usize, usize)>,
}

impl FlagRanges {
    pub fn new(len: usize) -> FlagRanges {
        FlagRanges {
            len,
            ranges: Vec::new(),
        }
    }

    pub fn domain_len(&self) -> usize {
        self.len
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn flag_all(&mut self) {
        self.ranges.clear();
        if self.len > 0 {
            self.ranges.push((0, self.len));
        }
    }

    pub fn all_flagged(&self) -> bool {
        self.ranges == [(0, self.len)] && self.len > 0
    }

    /// Flag `range`, merging with existing ranges. Out-of-domain indices
    /// are clipped.
    pub fn include(&mut self, range: Range<usize>) {
        let start = range.start.min(self.len);
        let end = range.end.min(self.len);
        if start >= end {
            return;
        }

        // Find the insertion window: every existing range overlapping or
        // adjacent to [start, end) is merged into it.
        let first = self.ranges.partition_point(|&(_, e)| e < start);
        let last = self.ranges.partition_point(|&(s, _)| s <= end);
        let merged_start = if first < last {
            self.ranges[first].0.min(start)
        } else {
            start
        };
        let merged_end = if first < last {
            self.ranges[last - 1].1.max(end)
        } else {
            end
        };
        self.ranges
            .splice(first..last, std::iter::once((merged_start, merged_end)));
    }

    pub fn include_point(&mut self, index: usize) {
        self.include(index..index + 1);
    }

    /// Union with another flag set over the same domain.
    pub fn union_with(&mut self, other: &FlagRanges) {
        for &(s, e) in &other.ranges {
            self.include(s..e);
        }
    }

    pub fn is_flagged(&self, index: usize) -> bool {
        self.ranges
            .binary_search_by(|&(s, e)| {
                if index < s {
                    std::cmp::Ordering::Greater
                } else if index >= e {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    pub fn nr_flagged(&self) -> usize {
        self.ranges.iter().map(|&(s, e)| e - s).sum()
    }

    pub fn ranges(&self) -> &[(usize, usize)] {
        &self.ranges
    }

    /// The complement: the unflagged ranges, sorted.
    pub fn unflagged_ranges(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut cursor = 0;
        for &(s, e) in &self.ranges {
            if cursor < s {
                out.push((cursor, s));
            }
            cursor = e;
        }
        if cursor < self.len {
            out.push((cursor, self.len));
        }
        out
    }

    /// Rescale flags from the raw-sample domain to the channel-sample
    /// domain: raw sample `i` lands in channel sample `i / nr_channels`,
    /// and a filter output is dirty while any tap of its history window
    /// saw a flagged input.
    pub fn channelized(&self, nr_channels: usize, history: usize, out_len: usize) -> FlagRanges {
        let mut out = FlagRanges::new(out_len);
        for &(s, e) in &self.ranges {
            let first = (s / nr_channels).saturating_sub(history);
            let last = (e - 1) / nr_channels + 1;
            out.include(first..last.min(out_len));
        }
        out
    }

    /// Write the ranges into a packet's word prefix:
    /// `[count, s0, e0, s1, e1, ...]`. More ranges than the prefix holds
    /// collapse into one spanning range; that over-flags, which is fine.
    pub fn marshall(&self, words: &mut [f32]) {
        assert!(words.len() >= 1 + 2 * MAX_FLAG_RANGES_PER_PACKET);
        let mut ranges: Vec<(usize, usize)> = self.ranges.clone();
        if ranges.len() > MAX_FLAG_RANGES_PER_PACKET {
            let spill_start = ranges[MAX_FLAG_RANGES_PER_PACKET - 1].0;
            let spill_end = ranges.last().unwrap().1;
            ranges.truncate(MAX_FLAG_RANGES_PER_PACKET - 1);
            ranges.push((spill_start, spill_end));
        }
        words[0] = ranges.len() as f32;
        for (i, &(s, e)) in ranges.iter().enumerate() {
            words[1 + 2 * i] = s as f32;
            words[2 + 2 * i] = e as f32;
        }
    }

    /// The inverse of [`FlagRanges::marshall`].
    pub fn unmarshall(words: &[f32], len: usize) -> FlagRanges {
        let mut out = FlagRanges::new(len);
        let count = words[0] as usize;
        for i in 0..count {
            let s = words[1 + 2 * i] as usize;
            let e = words[2 + 2 * i] as usize;
            out.include(s..e);
        }
        out
    }

    /// Words needed for a marshalled prefix.
    pub const fn marshalled_words() -> usize {
        1 + 2 * MAX_FLAG_RANGES_PER_PACKET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_merges_overlaps() {
        let mut f = FlagRanges::new(100);
        f.include(10..20);
        f.include(30..40);
        assert_eq!(f.ranges(), &[(10, 20), (30, 40)]);

        // Overlapping the first, adjacent to the second.
        f.include(15..30);
        assert_eq!(f.ranges(), &[(10, 40)]);
        assert_eq!(f.nr_flagged(), 30);
    }

    #[test]
    fn include_is_monotonic() {
        let mut f = FlagRanges::new(50);
        let mut previous = 0;
        for r in [5..6, 40..45, 20..30, 0..50] {
            f.include(r);
            assert!(f.nr_flagged() >= previous);
            previous = f.nr_flagged();
        }
        assert!(f.all_flagged());
    }

    #[test]
    fn point_queries() {
        let mut f = FlagRanges::new(100);
        f.include(10..20);
        f.include(50..51);
        assert!(!f.is_flagged(9));
        assert!(f.is_flagged(10));
        assert!(f.is_flagged(19));
        assert!(!f.is_flagged(20));
        assert!(f.is_flagged(50));
        assert!(!f.is_flagged(51));
    }

    #[test]
    fn complement_covers_domain() {
        let mut f = FlagRanges::new(100);
        f.include(0..10);
        f.include(90..100);
        assert_eq!(f.unflagged_ranges(), vec![(10, 90)]);

        let flagged: usize = f.nr_flagged();
        let unflagged: usize = f.unflagged_ranges().iter().map(|&(s, e)| e - s).sum();
        assert_eq!(flagged + unflagged, 100);
    }

    #[test]
    fn clipping_to_domain() {
        let mut f = FlagRanges::new(10);
        f.include(5..25);
        assert_eq!(f.ranges(), &[(5, 10)]);
        f.include(30..40);
        assert_eq!(f.ranges(), &[(5, 10)]);
    }

    #[test]
    fn channelized_widens_by_history() {
        let f = {
            let mut f = FlagRanges::new(64);
            // Raw samples 16..20 with 4 channels: channel samples 4..5,
            // minus 3 of history.
            f.include(16..20);
            f
        };
        let c = f.channelized(4, 3, 16);
        assert_eq!(c.ranges(), &[(1, 5)]);
    }

    #[test]
    fn marshall_roundtrip() {
        let mut f = FlagRanges::new(1000);
        f.include(1..5);
        f.include(100..200);
        let mut words = vec![0.0; FlagRanges::marshalled_words()];
        f.marshall(&mut words);
        assert_eq!(FlagRanges::unmarshall(&words, 1000), f);
    }

    #[test]
    fn marshall_overflow_overflags() {
        let mut f = FlagRanges::new(1000);
        for i in 0..MAX_FLAG_RANGES_PER_PACKET + 10 {
            f.include(i * 10..i * 10 + 1);
        }
        let mut words = vec![0.0; FlagRanges::marshalled_words()];
        f.marshall(&mut words);
        let back = FlagRanges::unmarshall(&words, 1000);
        assert!(back.ranges().len() <= MAX_FLAG_RANGES_PER_PACKET);
        // Nothing that was flagged may come back unflagged.
        for i in 0..1000 {
            if f.is_flagged(i) {
                assert!(back.is_flagged(i));
            }
        }
    }
}
