// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! The QPACK static table (spec.md §3 "QPACK static table", RFC 9204
//! Appendix A): an immutable, process-lifetime-constant 99-entry lookup,
//! shared read-only across every connection (spec.md §5 "Shared
//! resources").

/// One (name, value) pair of the static table.
pub type Entry = (&'static str, &'static str);

/// RFC 9204 Appendix A, transcribed verbatim, index 0..98.
pub static STATIC_TABLE: [Entry; 99] = [
    (":authority", ""),
    (":path", "/"),
    ("age", "0"),
    ("content-disposition", ""),
    ("content-length", "0"),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("referer", ""),
    ("set-cookie", ""),
    (":method", "CONNECT"),
    (":method", "DELETE"),
    (":method", "GET"),
    (":method", "HEAD"),
    (":method", "OPTIONS"),
    (":method", "POST"),
    (":method", "PUT"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "103"),
    (":status", "200"),
    (":status", "304"),
    (":status", "404"),
    (":status", "503"),
    ("accept", "*/*"),
    ("accept", "application/dns-message"),
    ("accept-encoding", "gzip, deflate, br"),
    ("accept-ranges", "bytes"),
    ("access-control-allow-headers", "cache-control"),
    ("access-control-allow-headers", "content-type"),
    ("access-control-allow-origin", "*"),
    ("cache-control", "max-age=0"),
    ("cache-control", "max-age=2592000"),
    ("cache-control", "max-age=604800"),
    ("cache-control", "no-cache"),
    ("cache-control", "no-store"),
    ("cache-control", "public, max-age=31536000"),
    ("content-encoding", "br"),
    ("content-encoding", "gzip"),
    ("content-type", "application/dns-message"),
    ("content-type", "application/javascript"),
    ("content-type", "application/json"),
    ("content-type", "application/x-www-form-urlencoded"),
    ("content-type", "image/gif"),
    ("content-type", "image/jpeg"),
    ("content-type", "image/png"),
    ("content-type", "text/css"),
    ("content-type", "text/html; charset=utf-8"),
    ("content-type", "text/plain"),
    ("content-type", "text/plain;charset=utf-8"),
    ("range", "bytes=0-"),
    ("strict-transport-security", "max-age=31536000"),
    (
        "strict-transport-security",
        "max-age=31536000; includesubdomains",
    ),
    (
        "strict-transport-security",
        "max-age=31536000; includesubdomains; preload",
    ),
    ("vary", "accept-encoding"),
    ("vary", "origin"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    (":status", "100"),
    (":status", "204"),
    (":status", "206"),
    (":status", "302"),
    (":status", "400"),
    (":status", "403"),
    (":status", "421"),
    (":status", "425"),
    (":status", "500"),
    ("accept-language", ""),
    ("access-control-allow-credentials", "FALSE"),
    ("access-control-allow-credentials", "TRUE"),
    ("access-control-allow-headers", "*"),
    ("access-control-allow-methods", "get"),
    ("access-control-allow-methods", "get, post, options"),
    ("access-control-allow-methods", "options"),
    ("access-control-expose-headers", "content-length"),
    ("access-control-request-headers", "content-type"),
    ("access-control-request-method", "get"),
    ("access-control-request-method", "post"),
    ("alt-svc", "clear"),
    ("authorization", ""),
    (
        "content-security-policy",
        "script-src 'none'; object-src 'none'; base-uri 'none'",
    ),
    ("early-data", "1"),
    ("expect-ct", ""),
    ("forwarded", ""),
    ("if-range", ""),
    ("origin", ""),
    ("purpose", "prefetch"),
    ("server", ""),
    ("timing-allow-origin", "*"),
    ("upgrade-insecure-requests", "1"),
    ("user-agent", ""),
    ("x-forwarded-for", ""),
    ("x-frame-options", "deny"),
    ("x-frame-options", "sameorigin"),
];

/// Forward lookup: the (name, value) pair at `index`, if in range.
pub fn get(index: usize) -> Option<Entry> {
    STATIC_TABLE.get(index).copied()
}

/// Reverse lookup: prefers an exact (name, value) match, falling back to
/// a name-only match. Linear scan — 99 entries, called once per encoded
/// header, not worth a hash index.
pub enum Match {
    NameValue(usize),
    NameOnly(usize),
}

pub fn find(name: &[u8], value: &[u8]) -> Option<Match> {
    let mut name_only = None;

    for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
        if n.as_bytes() == name {
            if v.as_bytes() == value {
                return Some(Match::NameValue(i));
            }
            if name_only.is_none() {
                name_only = Some(i);
            }
        }
    }

    name_only.map(Match::NameOnly)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_has_99_entries() {
        assert_eq!(STATIC_TABLE.len(), 99);
    }

    #[test]
    fn index_0_is_authority() {
        assert_eq!(get(0), Some((":authority", "")));
    }

    #[test]
    fn exact_match_preferred_over_name_only() {
        match find(b":method", b"GET") {
            Some(Match::NameValue(i)) => assert_eq!(get(i), Some((":method", "GET"))),
            _ => panic!("expected an exact match"),
        }
    }

    #[test]
    fn name_only_match_when_no_value_matches() {
        match find(b":method", b"TRACE") {
            Some(Match::NameOnly(i)) => assert_eq!(get(i).unwrap().0, ":method"),
            _ => panic!("expected a name-only match"),
        }
    }

    #[test]
    fn no_match_for_unknown_name() {
        assert!(find(b"x-not-in-table", b"").is_none());
    }
}
