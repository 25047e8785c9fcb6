// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! QUIC connection IDs (spec.md §3, "ConnectionID").

use smallvec::SmallVec;

/// The maximum length of a QUIC connection ID, per RFC 9000 §17.2.
pub const MAX_CONN_ID_LEN: usize = 20;

/// An opaque connection identifier of at most [`MAX_CONN_ID_LEN`] bytes.
///
/// Two IDs are equal iff byte-identical at identical lengths; there is no
/// implicit zero-padding or truncation.
#[derive(Clone, Eq)]
pub struct ConnectionId<'a> {
    inner: Inner<'a>,
}

#[derive(Clone)]
enum Inner<'a> {
    Borrowed(&'a [u8]),
    Owned(SmallVec<[u8; MAX_CONN_ID_LEN]>),
}

impl<'a> ConnectionId<'a> {
    /// Borrows `id` without copying. Panics if longer than
    /// [`MAX_CONN_ID_LEN`]; callers parsing off the wire should check the
    /// length themselves and return [`crate::Error::InvalidPacket`]
    /// instead of reaching this panic.
    pub fn from_ref(id: &'a [u8]) -> Self {
        assert!(id.len() <= MAX_CONN_ID_LEN);
        ConnectionId {
            inner: Inner::Borrowed(id),
        }
    }

    /// Takes ownership of `id`.
    pub fn from_vec(id: Vec<u8>) -> ConnectionId<'static> {
        assert!(id.len() <= MAX_CONN_ID_LEN);
        ConnectionId {
            inner: Inner::Owned(SmallVec::from_vec(id)),
        }
    }

    /// Returns an owned copy that outlives the borrow, if any.
    pub fn into_owned(self) -> ConnectionId<'static> {
        match self.inner {
            Inner::Borrowed(b) => ConnectionId {
                inner: Inner::Owned(SmallVec::from_slice(b)),
            },
            Inner::Owned(v) => ConnectionId {
                inner: Inner::Owned(v),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::ops::Deref for ConnectionId<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.inner {
            Inner::Borrowed(b) => b,
            Inner::Owned(v) => v.as_slice(),
        }
    }
}

impl AsRef<[u8]> for ConnectionId<'_> {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl PartialEq for ConnectionId<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref() == other.as_ref()
    }
}

impl std::hash::Hash for ConnectionId<'_> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_ref().hash(state)
    }
}

impl std::fmt::Debug for ConnectionId<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for b in self.as_ref() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_iff_same_bytes_same_length() {
        let a = ConnectionId::from_vec(vec![1, 2, 3]);
        let b = ConnectionId::from_ref(&[1, 2, 3]);
        let c = ConnectionId::from_vec(vec![1, 2, 3, 0]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    #[should_panic]
    fn oversized_id_panics_on_construction() {
        let _ = ConnectionId::from_vec(vec![0u8; MAX_CONN_ID_LEN + 1]);
    }
}
