// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! The QPACK dynamic table (spec.md §4.10, RFC 9204 §3.2): an
//! insertion-ordered, byte-capacity-bounded table shared by a connection's
//! encoder and decoder, addressed by both absolute and relative indices.

use std::collections::VecDeque;

use crate::Error;
use crate::Result;

/// RFC 9204 §3.2.1: each entry's size is the length of its name and value
/// plus 32 bytes of accounting overhead.
const ENTRY_OVERHEAD: usize = 32;

struct Entry {
    name: Vec<u8>,
    value: Vec<u8>,
    /// How many field sections currently reference this entry. An entry
    /// with `refs > 0` cannot be evicted (RFC 9204 §2.1.1).
    refs: u64,
}

fn entry_size(name: &[u8], value: &[u8]) -> usize {
    name.len() + value.len() + ENTRY_OVERHEAD
}

/// The dynamic table. Entries are addressed by a 0-based *insertion
/// count* (the absolute index): the first entry ever inserted is 0, the
/// second is 1, and so on, regardless of how many have since been
/// evicted.
pub struct DynamicTable {
    entries: VecDeque<Entry>,
    /// Absolute index of `entries[0]`; advances as entries are evicted.
    base_index: u64,
    capacity: usize,
    size: usize,
}

impl DynamicTable {
    pub fn new(capacity: usize) -> DynamicTable {
        DynamicTable {
            entries: VecDeque::new(),
            base_index: 0,
            capacity,
            size: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// RFC 9204 §3.2.3: resizing to below the current size requires
    /// evicting unreferenced entries first; shrinking below what
    /// currently-referenced entries occupy is a protocol error.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        self.capacity = capacity;
        self.evict_to_fit()
    }

    /// Total number of entries ever inserted, i.e. the absolute index
    /// that the next inserted entry will receive.
    pub fn inserted_count(&self) -> u64 {
        self.base_index + self.entries.len() as u64
    }

    fn evict_to_fit(&mut self) -> Result<()> {
        while self.size > self.capacity {
            match self.entries.front() {
                Some(e) if e.refs == 0 => {
                    let e = self.entries.pop_front().unwrap();
                    self.size -= entry_size(&e.name, &e.value);
                    self.base_index += 1;
                }
                _ => return Err(Error::QpackDecompressionFailed),
            }
        }
        Ok(())
    }

    /// Inserts a new entry, evicting from the front as needed to make
    /// room. Returns the new entry's absolute index.
    pub fn insert(&mut self, name: &[u8], value: &[u8]) -> Result<u64> {
        let needed = entry_size(name, value);
        if needed > self.capacity {
            return Err(Error::QpackDecompressionFailed);
        }

        while self.size + needed > self.capacity {
            match self.entries.front() {
                Some(e) if e.refs == 0 => {
                    let e = self.entries.pop_front().unwrap();
                    self.size -= entry_size(&e.name, &e.value);
                    self.base_index += 1;
                }
                _ => return Err(Error::QpackDecompressionFailed),
            }
        }

        self.entries.push_back(Entry {
            name: name.to_vec(),
            value: value.to_vec(),
            refs: 0,
        });
        self.size += needed;

        Ok(self.base_index + self.entries.len() as u64 - 1)
    }

    fn slot(&self, absolute: u64) -> Option<usize> {
        if absolute < self.base_index {
            return None;
        }
        let idx = (absolute - self.base_index) as usize;
        if idx < self.entries.len() {
            Some(idx)
        } else {
            None
        }
    }

    pub fn get(&self, absolute: u64) -> Option<(&[u8], &[u8])> {
        self.slot(absolute)
            .map(|i| (self.entries[i].name.as_slice(), self.entries[i].value.as_slice()))
    }

    /// Reverse lookup among still-present entries, most-recently-inserted
    /// first (the entry most likely to be re-referenced).
    pub fn find(&self, name: &[u8], value: &[u8]) -> Option<(u64, bool)> {
        let mut name_only = None;

        for (i, e) in self.entries.iter().enumerate().rev() {
            if e.name == name {
                if e.value == value {
                    return Some((self.base_index + i as u64, true));
                }
                if name_only.is_none() {
                    name_only = Some(self.base_index + i as u64);
                }
            }
        }

        name_only.map(|idx| (idx, false))
    }

    pub fn add_ref(&mut self, absolute: u64) -> Result<()> {
        let i = self.slot(absolute).ok_or(Error::QpackDecompressionFailed)?;
        self.entries[i].refs += 1;
        Ok(())
    }

    pub fn drop_ref(&mut self, absolute: u64) {
        if let Some(i) = self.slot(absolute) {
            self.entries[i].refs = self.entries[i].refs.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_round_trips() {
        let mut t = DynamicTable::new(1024);
        let idx = t.insert(b"custom-key", b"custom-value").unwrap();
        assert_eq!(t.get(idx), Some((&b"custom-key"[..], &b"custom-value"[..])));
        assert_eq!(t.inserted_count(), 1);
    }

    #[test]
    fn eviction_drops_oldest_unreferenced_entry() {
        let size = entry_size(b"a", b"1");
        let mut t = DynamicTable::new(size * 2);
        let i0 = t.insert(b"a", b"1").unwrap();
        let _i1 = t.insert(b"b", b"2").unwrap();
        // A third insert must evict i0 to make room.
        let i2 = t.insert(b"c", b"3").unwrap();

        assert!(t.get(i0).is_none());
        assert!(t.get(i2).is_some());
    }

    #[test]
    fn referenced_entry_blocks_eviction() {
        let size = entry_size(b"a", b"1");
        let mut t = DynamicTable::new(size * 2);
        let i0 = t.insert(b"a", b"1").unwrap();
        t.add_ref(i0).unwrap();
        let _i1 = t.insert(b"b", b"2").unwrap();

        // i0 is still referenced, so inserting a third entry that would
        // require evicting it must fail instead of evicting it anyway.
        assert!(t.insert(b"c", b"3").is_err());

        t.drop_ref(i0);
        assert!(t.insert(b"c", b"3").is_ok());
    }

    #[test]
    fn insert_larger_than_capacity_rejected() {
        let mut t = DynamicTable::new(10);
        assert!(t.insert(b"way-too-long-a-name", b"value").is_err());
    }

    #[test]
    fn find_prefers_most_recent_exact_match() {
        let mut t = DynamicTable::new(4096);
        t.insert(b"x", b"1").unwrap();
        let i1 = t.insert(b"x", b"2").unwrap();

        assert_eq!(t.find(b"x", b"2"), Some((i1, true)));
    }
}
