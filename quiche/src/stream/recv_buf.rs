// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! The incoming side of a stream's ring buffer (spec.md §4.4): gap-
//! tolerant out-of-order reassembly bounded by a fragment-count budget,
//! so a peer that scatters STREAM frames across the offset space can't
//! force unbounded bookkeeping.

use std::collections::BTreeMap;

/// The maximum number of disjoint out-of-order fragments a single stream
/// will hold before rejecting further gaps (spec.md §9's bounded
/// reassembly-budget design note).
const MAX_FRAGMENTS: usize = 64;

#[derive(Debug, Default)]
pub struct RecvBuf {
    /// Out-of-order fragments, keyed by absolute start offset, each
    /// strictly beyond `off` and non-overlapping with one another.
    fragments: BTreeMap<u64, Vec<u8>>,

    /// Absolute offset of the next byte the application has not yet
    /// consumed; also the low-water mark below which incoming data is a
    /// duplicate.
    off: u64,

    /// Final stream size, once a FIN has been seen.
    fin_off: Option<u64>,
}

impl RecvBuf {
    pub fn new() -> Self {
        RecvBuf::default()
    }

    pub fn off(&self) -> u64 {
        self.off
    }

    pub fn fin_offset(&self) -> Option<u64> {
        self.fin_off
    }

    /// Whether the stream has delivered every byte up to and including
    /// the FIN.
    pub fn is_fin(&self) -> bool {
        self.fin_off == Some(self.off)
    }

    /// Accepts `data` starting at absolute offset `offset`; `fin` marks
    /// this as the stream's last chunk. Rejects a `fin` whose offset
    /// contradicts one already recorded (spec.md §4.4 final-size
    /// consistency), and rejects new gaps once the fragment budget is
    /// exhausted.
    pub fn write(&mut self, offset: u64, data: &[u8], fin: bool) -> crate::Result<()> {
        let end = offset + data.len() as u64;

        if let Some(fin_off) = self.fin_off {
            if (fin && end != fin_off) || end > fin_off {
                return Err(crate::Error::FinalSize);
            }
        }

        if fin {
            self.fin_off = Some(end);
        }

        if end <= self.off || data.is_empty() {
            return Ok(());
        }

        let (offset, data) = if offset < self.off {
            let skip = (self.off - offset) as usize;
            (self.off, &data[skip..])
        } else {
            (offset, data)
        };

        if offset > self.off && self.fragments.len() >= MAX_FRAGMENTS {
            return Err(crate::Error::FlowControl);
        }

        self.insert_fragment(offset, data);
        Ok(())
    }

    fn insert_fragment(&mut self, offset: u64, data: &[u8]) {
        let end = offset + data.len() as u64;

        // Drop any existing fragment this one fully subsumes, and trim
        // overlap with a fragment that starts before it.
        let overlapping: Vec<u64> = self
            .fragments
            .range(..end)
            .filter(|(&s, v)| s + v.len() as u64 > offset)
            .map(|(&s, _)| s)
            .collect();

        let mut merged = data.to_vec();
        let mut merged_start = offset;

        for s in overlapping {
            let existing = self.fragments.remove(&s).unwrap();
            let existing_end = s + existing.len() as u64;

            if s < merged_start {
                let prefix_len = (merged_start - s) as usize;
                let mut combined = existing[..prefix_len.min(existing.len())].to_vec();
                combined.extend_from_slice(&merged);
                merged = combined;
                merged_start = s;
            }

            if existing_end > merged_start + merged.len() as u64 {
                let tail_start = (merged_start + merged.len() as u64 - s) as usize;
                if tail_start < existing.len() {
                    merged.extend_from_slice(&existing[tail_start..]);
                }
            }
        }

        self.fragments.insert(merged_start, merged);
    }

    /// Copies the contiguous prefix starting at `off` into `out`,
    /// advancing `off` by however many bytes were copied, and returns
    /// `(len, fin)`.
    pub fn read(&mut self, out: &mut [u8]) -> (usize, bool) {
        let mut written = 0;

        while written < out.len() {
            let Some((&start, chunk)) = self.fragments.iter().next() else {
                break;
            };

            if start > self.off {
                break;
            }

            let skip = (self.off - start) as usize;
            let available = chunk.len() - skip;
            let take = available.min(out.len() - written);

            out[written..written + take].copy_from_slice(&chunk[skip..skip + take]);
            written += take;
            self.off += take as u64;

            if skip + take == chunk.len() {
                self.fragments.remove(&start);
            } else {
                let remaining = chunk[skip + take..].to_vec();
                self.fragments.remove(&start);
                self.fragments.insert(self.off, remaining);
            }
        }

        (written, self.is_fin())
    }

    /// Whether there's a contiguous byte or a pending FIN ready to
    /// deliver to the application right now.
    pub fn has_readable_data(&self) -> bool {
        self.fragments
            .keys()
            .next()
            .is_some_and(|&start| start == self.off)
            || self.is_fin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_contiguous_data_immediately() {
        let mut r = RecvBuf::new();
        r.write(0, b"hello", false).unwrap();
        let mut out = [0u8; 5];
        let (len, fin) = r.read(&mut out);
        assert_eq!(len, 5);
        assert!(!fin);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn out_of_order_chunk_withheld_until_gap_fills() {
        let mut r = RecvBuf::new();
        r.write(5, b"world", false).unwrap();
        let mut out = [0u8; 10];
        let (len, _) = r.read(&mut out);
        assert_eq!(len, 0);

        r.write(0, b"hello", false).unwrap();
        let (len, _) = r.read(&mut out);
        assert_eq!(len, 10);
        assert_eq!(&out, b"helloworld");
    }

    #[test]
    fn duplicate_below_off_is_ignored() {
        let mut r = RecvBuf::new();
        r.write(0, b"abc", false).unwrap();
        let mut out = [0u8; 3];
        r.read(&mut out);
        // Re-delivering the same bytes must be a silent no-op.
        r.write(0, b"abc", false).unwrap();
        assert!(!r.has_readable_data());
    }

    #[test]
    fn fin_is_reported_once_all_bytes_read() {
        let mut r = RecvBuf::new();
        r.write(0, b"hi", true).unwrap();
        let mut out = [0u8; 2];
        let (len, fin) = r.read(&mut out);
        assert_eq!(len, 2);
        assert!(fin);
    }

    #[test]
    fn conflicting_fin_offset_is_rejected() {
        let mut r = RecvBuf::new();
        r.write(0, b"hi", true).unwrap(); // fin at offset 2
        assert_eq!(r.write(2, b"!", false), Err(crate::Error::FinalSize));
    }

    #[test]
    fn overlapping_fragments_merge_without_duplication() {
        let mut r = RecvBuf::new();
        r.write(0, b"ab", false).unwrap();
        r.write(3, b"de", false).unwrap();
        r.write(1, b"bcd", false).unwrap(); // bridges the gap, overlaps both sides
        let mut out = [0u8; 5];
        let (len, _) = r.read(&mut out);
        assert_eq!(len, 5);
        assert_eq!(&out, b"abcde");
    }
}
