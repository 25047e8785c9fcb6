// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! WebTransport sessions layered over an HTTP/3 connection (spec.md
//! §4.13, RFC 9297 / RFC 9221).
//!
//! A session is negotiated by an Extended CONNECT request
//! (`:method = CONNECT`, `:protocol = webtransport`) on a bidirectional
//! HTTP/3 request stream; once the response headers carry a 2xx status,
//! that stream *is* the session, and every other QUIC stream or datagram
//! tagged with the session's ID is WT payload rather than another HTTP/3
//! request.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;

use crate::Error;
use crate::Result;

/// RFC 9220 §4: the varint stream-type tag that marks a unidirectional
/// stream, or the first varint of a bidirectional stream, as carrying
/// WebTransport payload for the session named by the varint that
/// follows it.
pub const WEBTRANSPORT_STREAM_TYPE: u64 = 0x54;

/// Bound on queued-but-unsent datagrams per session: WT datagrams carry
/// no reliability or ordering guarantee (spec.md §5), so unbounded
/// buildup under backpressure would just waste memory on data the peer
/// may never need.
const MAX_QUEUED_DATAGRAMS: usize = 256;

pub struct Session {
    id: u64,
    streams: HashSet<u64>,
    datagrams_out: VecDeque<Vec<u8>>,
    closed: bool,
}

impl Session {
    fn new(id: u64) -> Session {
        Session {
            id,
            streams: HashSet::new(),
            datagrams_out: VecDeque::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Records `stream_id` as belonging to this session, whether it was
    /// opened locally via [`SessionManager::open_stream`] or discovered
    /// as peer-initiated via [`SessionManager::classify_stream`].
    pub fn adopt_stream(&mut self, stream_id: u64) {
        self.streams.insert(stream_id);
    }

    pub fn owns_stream(&self, stream_id: u64) -> bool {
        self.streams.contains(&stream_id)
    }

    pub fn forget_stream(&mut self, stream_id: u64) {
        self.streams.remove(&stream_id);
    }

    /// Enqueues a datagram for the next `generate_datagrams` drain.
    pub fn send_datagram(&mut self, bytes: Vec<u8>) -> Result<()> {
        if self.closed {
            return Err(Error::Done);
        }
        if self.datagrams_out.len() >= MAX_QUEUED_DATAGRAMS {
            self.datagrams_out.pop_front();
        }
        self.datagrams_out.push_back(bytes);
        Ok(())
    }

    /// Drains queued datagrams that fit within `mtu`, in FIFO order, for
    /// the connection to fold into DATAGRAM frames ahead of its own
    /// packet generation (spec.md §4.13).
    pub fn drain_datagrams(&mut self, mtu: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(item) = self.datagrams_out.front() {
            if item.len() > mtu {
                self.datagrams_out.pop_front();
                continue;
            }
            out.push(self.datagrams_out.pop_front().unwrap());
        }
        out
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Tracks every WT session live on one HTTP/3 connection, enforcing the
/// configured cap and dispatching peer-initiated streams to the right
/// session.
pub struct SessionManager {
    max_sessions: u64,
    sessions: HashMap<u64, Session>,
}

impl SessionManager {
    pub fn new(max_sessions: u64) -> SessionManager {
        SessionManager {
            max_sessions,
            sessions: HashMap::new(),
        }
    }

    pub fn can_open(&self) -> bool {
        (self.sessions.len() as u64) < self.max_sessions
    }

    /// Registers a new session keyed by the CONNECT request's stream ID,
    /// once its response has been accepted with a 2xx status. Rejects
    /// past the `max_sessions` cap (spec.md §4.13 supplement: the caller
    /// should answer the CONNECT with `:status = 429` instead).
    pub fn open(&mut self, session_id: u64) -> Result<()> {
        if !self.can_open() {
            return Err(Error::H3(super::WireErrorCode::RequestRejected as u64));
        }
        self.sessions.insert(session_id, Session::new(session_id));
        Ok(())
    }

    pub fn get_mut(&mut self, session_id: u64) -> Option<&mut Session> {
        self.sessions.get_mut(&session_id)
    }

    pub fn get(&self, session_id: u64) -> Option<&Session> {
        self.sessions.get(&session_id)
    }

    /// Closes a session, returning `(error_code, reason)` as the
    /// `session_closed` event payload (spec.md §4.13 supplement).
    pub fn close(&mut self, session_id: u64) -> Option<Session> {
        let mut session = self.sessions.remove(&session_id)?;
        session.closed = true;
        Some(session)
    }

    /// Finds whichever session owns `stream_id`, if any.
    pub fn session_for_stream(&self, stream_id: u64) -> Option<u64> {
        self.sessions
            .values()
            .find(|s| s.owns_stream(stream_id))
            .map(|s| s.id)
    }

    /// Classifies a peer-initiated stream from its leading bytes:
    /// unidirectional streams are tagged `WEBTRANSPORT_STREAM_TYPE` then
    /// a session-id varint; bidirectional streams (only ever
    /// peer-initiated as additional WT streams, never a second CONNECT)
    /// carry just the session-id varint as their first value. Returns
    /// the session ID and adopts the stream into it.
    pub fn classify_stream(&mut self, stream_id: u64, b: &mut octets::Octets) -> Result<u64> {
        let session_id = b.get_varint()?;
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(Error::H3(super::WireErrorCode::IdError as u64))?;
        session.adopt_stream(stream_id);
        Ok(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_respects_max_sessions_cap() {
        let mut mgr = SessionManager::new(1);
        mgr.open(4).unwrap();
        assert!(!mgr.can_open());
        assert!(mgr.open(8).is_err());
    }

    #[test]
    fn adopted_stream_is_owned_by_its_session() {
        let mut mgr = SessionManager::new(4);
        mgr.open(4).unwrap();
        mgr.get_mut(4).unwrap().adopt_stream(12);
        assert_eq!(mgr.session_for_stream(12), Some(4));
    }

    #[test]
    fn datagram_queue_drains_fifo_and_skips_oversized() {
        let mut session = Session::new(4);
        session.send_datagram(vec![1, 2, 3]).unwrap();
        session.send_datagram(vec![0; 2000]).unwrap();
        session.send_datagram(vec![4, 5]).unwrap();

        let drained = session.drain_datagrams(1200);
        assert_eq!(drained, vec![vec![1, 2, 3], vec![4, 5]]);
    }

    #[test]
    fn closed_session_rejects_further_datagrams() {
        let mut mgr = SessionManager::new(4);
        mgr.open(4).unwrap();
        let closed = mgr.close(4).unwrap();
        let mut closed = closed;
        assert!(closed.send_datagram(vec![1]).is_err());
    }

    #[test]
    fn classify_stream_requires_known_session() {
        let mut mgr = SessionManager::new(4);
        let mut buf = [0u8; 8];
        let mut w = octets::OctetsMut::with_slice(&mut buf);
        w.put_varint(99).unwrap();
        let len = w.off();

        let mut r = octets::Octets::with_slice(&buf[..len]);
        assert!(mgr.classify_stream(16, &mut r).is_err());
    }
}
