// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! QPACK field compression (spec.md §4.9-4.11, RFC 9204): the static
//! table, the RFC 7541 Huffman code, and the dynamic table and its
//! encoder/decoder.

mod dynamic_table;
mod huffman;
mod static_table;

pub mod decoder;
pub mod encoder;

pub use decoder::DecodeOutcome;
pub use decoder::Decoder;
pub use encoder::encode_int;
pub use encoder::encode_str;
pub use encoder::Encoder;
pub use encoder::LITERAL;
