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

//! A QUIC (RFC 9000), HTTP/3 (RFC 9114), QPACK (RFC 9204) and WebTransport
//! (RFC 9297) data-plane core.
//!
//! This crate implements the transformations a received UDP datagram
//! undergoes to become an application event, and the inverse path from
//! application output back to UDP datagrams. It does not perform the TLS
//! handshake, does not own a socket, and does not implement a server's
//! routing or configuration surface: those are the driver's job. The core
//! is driven through [`Connection::recv`] and [`Connection::send`], plus a
//! caller-supplied clock.
//!
//! ```no_run
//! # fn main() -> quiche::Result<()> {
//! let mut config = quiche::Config::new()?;
//! config.set_max_idle_timeout(30_000);
//!
//! let scid = quiche::ConnectionId::from_vec(vec![0xba; 16]);
//! let local = "127.0.0.1:4433".parse().unwrap();
//! let peer = "127.0.0.1:9000".parse().unwrap();
//! let mut conn = quiche::Connection::new(scid, local, peer, &config, true);
//!
//! let mut out = [0u8; 1350];
//! loop {
//!     let (len, _send_info) = match conn.send(&mut out) {
//!         Ok(v) => v,
//!         Err(quiche::Error::Done) => break,
//!         Err(e) => return Err(e),
//!     };
//!     let _ = &out[..len]; // hand `len` bytes at `_send_info.to` to the socket
//! }
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::time::Duration;
use std::time::Instant;

mod cid;
mod flowcontrol;
pub mod frame;
pub mod h3;
pub mod packet;
pub mod ranges;
mod recovery;
pub mod stream;

pub use cid::ConnectionId;
pub use cid::MAX_CONN_ID_LEN;

/// A specialized [`Result`](std::result::Result) whose error type is always
/// [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that the data plane can produce, per spec.md §7.
///
/// `Done` covers both "no more work to do right now" (the common, non-error
/// return of [`Connection::send`]) and the `InsufficientData` case of
/// spec.md's codec layers: both mean "come back later with more input or
/// more room", never "the peer misbehaved".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// There is nothing more to do: [`Connection::send`] has no more
    /// packets to emit, or a codec needs more bytes than are available.
    Done,

    /// A QUIC wire-format element (packet header, frame, varint) did not
    /// parse according to its RFC 9000 grammar.
    InvalidFrame,

    /// A packet header failed to parse: bad fixed bit, unsupported
    /// version, or an oversized connection ID.
    InvalidPacket,

    /// An operation was attempted against a stream in a state that
    /// forbids it (e.g. writing after local close).
    InvalidStreamState(u64),

    /// The peer, or the local application, violated a flow-control
    /// window.
    FlowControl,

    /// A stream received a final size inconsistent with bytes already
    /// delivered.
    FinalSize,

    /// The peer opened more concurrent streams than `max_concurrent_streams`
    /// allows.
    StreamLimit,

    /// The stream was stopped by the peer (STOP_SENDING).
    StreamStopped(u64),

    /// The stream was reset, locally or by the peer.
    StreamReset(u64),

    /// QPACK decompression failed: invalid encoding, invalid Huffman
    /// sequence, or an advertised limit was exceeded.
    QpackDecompressionFailed,

    /// A QPACK field section referenced dynamic-table state the decoder
    /// does not have yet; delivery must be deferred.
    QpackBlockedStreamsExceeded,

    /// No ack-eliciting packet was received within `idle_timeout`.
    IdleTimeout,

    /// The peer sent CONNECTION_CLOSE.
    PeerClosed(ConnectionError),

    /// An encoder's output buffer was too small to hold the result; retry
    /// with more room, not a protocol error.
    BufferTooShort,

    /// The external TLS/crypto collaborator rejected or failed to produce
    /// packet-protection keys for a packet.
    TlsFail,

    /// The congestion controller or loss detector observed an internal
    /// invariant violation (defensive; should not occur in practice).
    Congestion,

    /// An HTTP/3-layer protocol error, carrying the RFC 9114 wire error
    /// code that should accompany the H3 CONNECTION_CLOSE.
    H3(u64),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Done => write!(f, "done"),
            Error::InvalidFrame => write!(f, "invalid frame"),
            Error::InvalidPacket => write!(f, "invalid packet"),
            Error::InvalidStreamState(id) => write!(f, "invalid stream {id} state"),
            Error::FlowControl => write!(f, "flow control violation"),
            Error::FinalSize => write!(f, "inconsistent final size"),
            Error::StreamLimit => write!(f, "stream limit exceeded"),
            Error::StreamStopped(id) => write!(f, "stream {id} stopped"),
            Error::StreamReset(id) => write!(f, "stream {id} reset"),
            Error::QpackDecompressionFailed => write!(f, "QPACK decompression failed"),
            Error::QpackBlockedStreamsExceeded => write!(f, "QPACK blocked streams exceeded"),
            Error::IdleTimeout => write!(f, "idle timeout"),
            Error::PeerClosed(e) => write!(f, "peer closed: {e:?}"),
            Error::BufferTooShort => write!(f, "buffer too short"),
            Error::TlsFail => write!(f, "TLS failure"),
            Error::Congestion => write!(f, "congestion control invariant violated"),
            Error::H3(code) => write!(f, "HTTP/3 error {code:#x}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<octets::BufferTooShortError> for Error {
    fn from(_: octets::BufferTooShortError) -> Self {
        Error::BufferTooShort
    }
}

impl Error {
    /// The transport-level error code this error should be reported with
    /// on the wire, per RFC 9000 §20.1.
    pub fn to_wire(&self) -> u64 {
        match self {
            Error::InvalidFrame => 0x7, // FRAME_ENCODING_ERROR
            Error::InvalidPacket => 0x1, // INTERNAL_ERROR-adjacent parse failure
            Error::FlowControl => 0x3,  // FLOW_CONTROL_ERROR
            Error::FinalSize => 0x6,    // FINAL_SIZE_ERROR
            Error::StreamLimit => 0x4,  // STREAM_LIMIT_ERROR
            Error::StreamStopped(_) => 0x3,
            Error::QpackDecompressionFailed => 0x200, // QPACK_DECOMPRESSION_FAILED
            Error::TlsFail => 0x1,
            Error::H3(code) => *code,
            _ => 0x1, // INTERNAL_ERROR
        }
    }

    pub(crate) fn is_fatal(&self) -> bool {
        !matches!(self, Error::Done | Error::BufferTooShort)
    }
}

/// The reason a connection closed, as reported to the application and
/// (for locally-initiated closes) placed on the wire in a
/// CONNECTION_CLOSE frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionError {
    /// `true` for an application-level close (HTTP/3 or WebTransport),
    /// `false` for a transport-level one.
    pub is_app: bool,
    pub error_code: u64,
    pub reason: Vec<u8>,
}

/// Per-call-site timing and addressing passed into [`Connection::recv`].
#[derive(Clone, Copy, Debug)]
pub struct RecvInfo {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub now: Instant,
}

/// Addressing and pacing-derived timing returned from [`Connection::send`].
#[derive(Clone, Copy, Debug)]
pub struct SendInfo {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub at: Instant,
}

pub(crate) const MAX_ACK_RANGES: usize = 256;

mod config;
mod connection;

pub use config::Config;
pub use connection::Connection;
pub use connection::ConnectionEvents;
