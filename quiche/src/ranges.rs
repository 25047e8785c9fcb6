// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! A sorted, coalescing set of non-overlapping `u64` ranges.
//!
//! Used to track received packet numbers (for ACK generation) and acked
//! packet-number ranges (for loss detection), and the out-of-order byte
//! ranges a stream's receive side is holding per spec.md §4.4 and §9's
//! reassembly-buffer design note.

use std::collections::BTreeMap;
use std::ops::Range;

/// A set of `u64` ranges, stored as a map from a range's start to its
/// (exclusive) end, with adjacent and overlapping ranges merged on insert.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: BTreeMap<u64, u64>,

    /// Total number of ranges retained; once this exceeds `capacity` the
    /// oldest (smallest) range is dropped, bounding memory for adversarial
    /// peers that ack or send wildly disjoint ranges.
    capacity: usize,
}

impl RangeSet {
    pub fn new(capacity: usize) -> Self {
        RangeSet {
            ranges: BTreeMap::new(),
            capacity,
        }
    }

    /// Inserts `[start, end)`, merging with any overlapping or adjacent
    /// existing ranges.
    pub fn insert(&mut self, item: Range<u64>) {
        if item.start >= item.end {
            return;
        }

        let mut start = item.start;
        let mut end = item.end;

        // Merge with any range that starts at or before `end` and ends at
        // or after `start` (i.e. overlaps or touches).
        let overlapping: Vec<(u64, u64)> = self
            .ranges
            .range(..=end)
            .filter(|(&s, &e)| e >= start && s <= end)
            .map(|(&s, &e)| (s, e))
            .collect();

        for (s, e) in overlapping {
            start = start.min(s);
            end = end.max(e);
            self.ranges.remove(&s);
        }

        self.ranges.insert(start, end);

        while self.ranges.len() > self.capacity && self.capacity > 0 {
            if let Some(&k) = self.ranges.keys().next() {
                self.ranges.remove(&k);
            }
        }
    }

    pub fn remove_until(&mut self, largest: u64) {
        let cutoff = largest.saturating_add(1);
        self.ranges.retain(|_, &mut e| e > cutoff);

        if let Some((&s, &e)) = self.ranges.iter().next() {
            if s <= largest {
                self.ranges.remove(&s);
                if cutoff < e {
                    self.ranges.insert(cutoff, e);
                }
            }
        }
    }

    pub fn contains(&self, v: u64) -> bool {
        self.ranges
            .range(..=v)
            .next_back()
            .map(|(_, &e)| v < e)
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn largest(&self) -> Option<u64> {
        self.ranges.values().next_back().map(|&e| e - 1)
    }

    pub fn smallest(&self) -> Option<u64> {
        self.ranges.keys().next().copied()
    }

    /// Iterates ranges from largest to smallest, as QUIC's ACK frame
    /// encoding requires (RFC 9000 §19.3).
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Range<u64>> + '_ {
        self.ranges.iter().map(|(&s, &e)| s..e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_adjacent_and_overlapping() {
        let mut r = RangeSet::new(100);
        r.insert(1..3);
        r.insert(5..8);
        r.insert(3..5); // bridges the two
        assert_eq!(r.iter().collect::<Vec<_>>(), vec![1..8]);
    }

    #[test]
    fn contains_and_largest() {
        let mut r = RangeSet::new(100);
        r.insert(10..20);
        assert!(r.contains(15));
        assert!(!r.contains(20));
        assert_eq!(r.largest(), Some(19));
        assert_eq!(r.smallest(), Some(10));
    }

    #[test]
    fn remove_until_trims_from_below() {
        let mut r = RangeSet::new(100);
        r.insert(0..10);
        r.insert(20..30);
        r.remove_until(24);
        assert_eq!(r.iter().collect::<Vec<_>>(), vec![25..30]);
    }

    #[test]
    fn remove_until_max_empties_without_overflow() {
        let mut r = RangeSet::new(100);
        r.insert(0..10);
        r.insert(20..30);
        r.remove_until(u64::MAX);
        assert!(r.is_empty());
    }

    #[test]
    fn capacity_drops_oldest() {
        let mut r = RangeSet::new(2);
        r.insert(0..1);
        r.insert(10..11);
        r.insert(20..21);
        assert_eq!(r.len(), 2);
        assert_eq!(r.smallest(), Some(10));
    }
}
