// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! Per-stream state (spec.md §4.4): independent send/recv half-close
//! tracking layered on top of [`send_buf::SendBuf`] and
//! [`recv_buf::RecvBuf`], plus the stream-ID classification rules RFC
//! 9000 §2.1 assigns by the two low bits.

pub mod recv_buf;
pub mod send_buf;

use recv_buf::RecvBuf;
use send_buf::SendBuf;

use crate::flowcontrol::RecvWindow;
use crate::flowcontrol::SendWindow;

/// Which endpoint initiated the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    Bidirectional,
    Unidirectional,
}

/// Classifies a stream ID per RFC 9000 §2.1's two type bits.
pub fn is_bidi(stream_id: u64) -> bool {
    stream_id & 0x2 == 0
}

pub fn is_local(stream_id: u64, is_server: bool) -> bool {
    let initiated_by_server = stream_id & 0x1 != 0;
    initiated_by_server == is_server
}

pub fn shape(stream_id: u64) -> Shape {
    if is_bidi(stream_id) {
        Shape::Bidirectional
    } else {
        Shape::Unidirectional
    }
}

/// The independent state of one half (send or receive) of a stream
/// (spec.md §4.4's IDLE → OPEN → {SEND_CLOSED,RECV_CLOSED} → CLOSED, plus
/// RESET, machine).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalfState {
    Open,
    Closed,
    Reset,
}

pub struct Stream {
    pub id: u64,

    pub send: SendBuf,
    pub send_state: HalfState,
    pub send_window: SendWindow,

    pub recv: RecvBuf,
    pub recv_state: HalfState,
    pub recv_window: RecvWindow,

    /// Set once STOP_SENDING has been received, so the send half knows
    /// to stop accepting new application writes even before the RESET it
    /// provokes is actually emitted.
    pub stop_sending_received: bool,
}

impl Stream {
    pub fn new(id: u64, initial_send_max: u64, initial_recv_max: u64, readable_only: bool) -> Self {
        let send_state = if readable_only {
            HalfState::Closed
        } else {
            HalfState::Open
        };

        Stream {
            id,
            send: SendBuf::new(1024),
            send_state,
            send_window: SendWindow::new(initial_send_max),
            recv: RecvBuf::new(),
            recv_state: HalfState::Open,
            recv_window: RecvWindow::new(initial_recv_max),
            stop_sending_received: false,
        }
    }

    /// Whether both halves have reached a terminal state and this
    /// stream's memory can be reclaimed.
    pub fn is_complete(&self) -> bool {
        self.send_state != HalfState::Open && self.recv_state != HalfState::Open
    }

    pub fn is_readable(&self) -> bool {
        self.recv_state == HalfState::Open && self.recv.has_readable_data()
    }

    pub fn is_writable(&self) -> bool {
        self.send_state == HalfState::Open
            && self.send_window.available() > 0
            && !self.stop_sending_received
    }

    /// Marks the send half closed after a RESET_STREAM we originated, or
    /// one the peer's STOP_SENDING provoked us into sending.
    pub fn reset_send(&mut self) {
        self.send_state = HalfState::Reset;
    }

    /// Marks the recv half closed after we sent STOP_SENDING or received
    /// a RESET_STREAM from the peer.
    pub fn reset_recv(&mut self) {
        self.recv_state = HalfState::Reset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_classification_matches_rfc9000() {
        // Client-initiated bidi: 0, 4, 8..
        assert!(is_bidi(0));
        assert!(is_local(0, false));
        assert!(!is_local(0, true));

        // Server-initiated uni: 3, 7, 11..
        assert!(!is_bidi(3));
        assert!(is_local(3, true));
        assert!(!is_local(3, false));
    }

    #[test]
    fn stream_completes_only_after_both_halves_close() {
        let mut s = Stream::new(0, 100, 100, false);
        assert!(!s.is_complete());
        s.reset_send();
        assert!(!s.is_complete());
        s.reset_recv();
        assert!(s.is_complete());
    }

    #[test]
    fn stop_sending_blocks_further_writes() {
        let mut s = Stream::new(0, 100, 100, false);
        assert!(s.is_writable());
        s.stop_sending_received = true;
        assert!(!s.is_writable());
    }

    #[test]
    fn uni_receive_only_stream_starts_send_closed() {
        let s = Stream::new(2, 0, 100, true);
        assert_eq!(s.send_state, HalfState::Closed);
        assert_eq!(s.recv_state, HalfState::Open);
    }
}
