// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! QPACK field-section encoding (spec.md §4.10, RFC 9204 §4.5).
//!
//! By default (`Config::qpack_max_table_capacity() == 0`, see spec.md §9's
//! Open Question resolution in `config.rs`) this encoder never references
//! the dynamic table, so every field section it produces has Required
//! Insert Count 0 and Base 0 and can be decoded the instant it arrives —
//! no encoder-stream delivery ordering to wait on. A non-zero-capacity
//! [`Encoder`] will additionally insert into its dynamic table and
//! reference those entries, for interop with decoders that don't need
//! acknowledgement of insertions (spec.md §9).

use super::dynamic_table::DynamicTable;
use super::huffman;
use super::static_table;
use crate::h3::NameValue;
use crate::Result;

/// The representation-type pattern bits for "Literal Field Line With
/// Literal Name" (RFC 9204 §4.5.6): `0 0 1 N H xxx`, 3 prefix bits of
/// name length.
pub const LITERAL: u8 = 0b0010_0000;

const INDEXED_STATIC: u8 = 0b1100_0000;
const LITERAL_NAME_REF_STATIC: u8 = 0b0101_0000;
const INDEXED_DYNAMIC: u8 = 0b1000_0000;
const LITERAL_NAME_REF_DYNAMIC: u8 = 0b0100_0000;

/// Writes `value` as an RFC 7541 §5.1 prefixed integer into the low
/// `prefix_bits` bits of a byte whose high bits are already set in
/// `first_byte` (the representation-type tag).
pub fn encode_int(
    value: u64,
    first_byte: u8,
    prefix_bits: usize,
    b: &mut octets::OctetsMut,
) -> Result<()> {
    let max_prefix = (1u64 << prefix_bits) - 1;

    if value < max_prefix {
        b.put_u8(first_byte | value as u8)?;
        return Ok(());
    }

    b.put_u8(first_byte | max_prefix as u8)?;

    let mut v = value - max_prefix;
    while v >= 128 {
        b.put_u8(((v % 128) as u8) | 0x80)?;
        v /= 128;
    }
    b.put_u8(v as u8)?;

    Ok(())
}

/// RFC 9204 §4.5.1.1: transforms an absolute Required Insert Count into
/// the wire form, which wraps around `2 * MaxEntries` so it never grows
/// with the connection's lifetime. `table_capacity` is the dynamic
/// table's capacity in bytes.
pub fn encode_required_insert_count(req_insert_count: u64, table_capacity: usize) -> u64 {
    if req_insert_count == 0 {
        return 0;
    }

    let max_entries = (table_capacity / 32) as u64;
    if max_entries == 0 {
        return 0;
    }

    (req_insert_count % (2 * max_entries)) + 1
}

/// Writes `value` as an RFC 7541 §5.2 string literal: an H-bit, a
/// prefixed length, and the bytes themselves (Huffman-encoded or raw).
/// When `HUFFMAN` is true, Huffman-encodes opportunistically — only if
/// doing so does not grow the string (spec.md §4.9).
pub fn encode_str<const HUFFMAN: bool>(
    value: &[u8],
    first_byte: u8,
    prefix_bits: usize,
    b: &mut octets::OctetsMut,
) -> Result<()> {
    if HUFFMAN {
        let hlen = huffman::encoded_len(value);
        if hlen < value.len() {
            let h_bit = 1u8 << prefix_bits;
            encode_int(hlen as u64, first_byte | h_bit, prefix_bits, b)?;
            huffman::encode(value, b)?;
            return Ok(());
        }
    }

    encode_int(value.len() as u64, first_byte, prefix_bits, b)?;
    b.put_bytes(value)?;
    Ok(())
}

pub struct Encoder {
    table: DynamicTable,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// An encoder that never uses a dynamic table.
    pub fn new() -> Encoder {
        Encoder {
            table: DynamicTable::new(0),
        }
    }

    pub fn with_capacity(capacity: usize) -> Encoder {
        Encoder {
            table: DynamicTable::new(capacity),
        }
    }

    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        self.table.set_capacity(capacity)
    }

    /// Encodes `headers` as a complete field section (prefix + field
    /// lines) into `out`, returning the number of bytes written.
    pub fn encode<H: NameValue>(&mut self, headers: &[H], out: &mut [u8]) -> Result<usize> {
        let mut b = octets::OctetsMut::with_slice(out);

        let mut max_ref: u64 = 0;

        // Reserve the prefix; patched below once every field line has
        // been encoded and the section's Required Insert Count is known.
        let prefix_len = {
            let mut scratch = [0u8; 16];
            let mut s = octets::OctetsMut::with_slice(&mut scratch);
            encode_int(0, 0, 8, &mut s)?;
            encode_int(0, 0, 7, &mut s)?;
            s.off()
        };
        b.put_bytes(&[0u8; 16][..prefix_len])?;

        for h in headers {
            self.encode_field(h.name(), h.value(), &mut b, &mut max_ref)?;
        }

        let total_len = b.off();

        let enc_insert_count = encode_required_insert_count(max_ref, self.table.capacity());

        let mut prefix = octets::OctetsMut::with_slice(&mut out[..prefix_len]);
        encode_int(enc_insert_count, 0, 8, &mut prefix)?;
        encode_int(0, 0, 7, &mut prefix)?; // Base == Required Insert Count, S=0

        Ok(total_len)
    }

    fn encode_field(
        &mut self,
        name: &[u8],
        value: &[u8],
        b: &mut octets::OctetsMut,
        max_ref: &mut u64,
    ) -> Result<()> {
        if let Some(m) = static_table::find(name, value) {
            return match m {
                static_table::Match::NameValue(idx) => {
                    encode_int(idx as u64, INDEXED_STATIC, 6, b)
                }
                static_table::Match::NameOnly(idx) => {
                    encode_int(idx as u64, LITERAL_NAME_REF_STATIC, 4, b)?;
                    encode_str::<true>(value, 0, 7, b)
                }
            };
        }

        if self.table.capacity() > 0 {
            if let Some((idx, exact)) = self.table.find(name, value) {
                self.table.add_ref(idx)?;
                *max_ref = (*max_ref).max(idx + 1);

                return if exact {
                    encode_int(idx, INDEXED_DYNAMIC, 6, b)
                } else {
                    encode_int(idx, LITERAL_NAME_REF_DYNAMIC, 4, b)?;
                    encode_str::<true>(value, 0, 7, b)
                };
            }

            // Opportunistically grow the dynamic table so later field
            // sections in the same connection can reference this name.
            let _ = self.table.insert(name, value);
        }

        encode_str::<true>(name, LITERAL, 3, b)?;
        encode_str::<true>(value, 0, 7, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h3::Header;

    #[test]
    fn encode_int_small_value_fits_prefix() {
        let mut buf = [0u8; 4];
        let mut b = octets::OctetsMut::with_slice(&mut buf);
        encode_int(10, 0b1100_0000, 6, &mut b).unwrap();
        assert_eq!(buf[0], 0b1100_1010);
    }

    #[test]
    fn encode_int_large_value_continues() {
        // RFC 7541 C.1.2: 1337 encoded with a 5-bit prefix is 0x1f 0x9a 0x0a.
        let mut buf = [0u8; 4];
        let mut b = octets::OctetsMut::with_slice(&mut buf);
        encode_int(1337, 0, 5, &mut b).unwrap();
        assert_eq!(&buf[..3], &[0x1f, 0x9a, 0x0a]);
    }

    #[test]
    fn static_table_exact_match_is_indexed() {
        let mut enc = Encoder::new();
        let headers = vec![Header::new(b":method", b"GET")];
        let mut out = [0u8; 64];
        let len = enc.encode(&headers, &mut out).unwrap();

        // prefix (2 bytes, both zero) + one indexed-static byte.
        assert_eq!(len, 3);
        assert_eq!(out[2] & 0b1100_0000, INDEXED_STATIC);
    }

    #[test]
    fn unknown_header_is_literal_with_literal_name() {
        let mut enc = Encoder::new();
        let headers = vec![Header::new(b"x-custom", b"value")];
        let mut out = [0u8; 64];
        let len = enc.encode(&headers, &mut out).unwrap();

        assert_eq!(out[2] & 0b1110_0000, LITERAL);
        assert!(len > 3);
    }

    #[test]
    fn zero_capacity_encoder_never_sets_required_insert_count() {
        let mut enc = Encoder::new();
        let headers = vec![Header::new(b"x-custom", b"value"), Header::new(b"x-custom", b"value")];
        let mut out = [0u8; 128];
        enc.encode(&headers, &mut out).unwrap();
        // Required Insert Count byte (prefix[0]) must stay 0: no dynamic
        // table means nothing was ever referenced.
        assert_eq!(out[0], 0);
    }
}
