// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! The action script vocabulary `sync_client::connect` executes in order:
//! open a stream, send a frame (well-formed or deliberately not), wait
//! for a condition, or close the connection.

pub mod h3 {
    use std::time::Duration;

    use quiche::h3::Header;
    use quiche::ConnectionError;

    /// What `Action::Wait` blocks on before the harness moves to the next
    /// action.
    #[derive(Clone, Debug)]
    pub enum WaitType {
        /// Block until the named stream event is observed.
        StreamEvent(StreamEvent),
        /// Block until `duration` has elapsed, regardless of traffic.
        Timeout(Duration),
    }

    /// The category of stream activity a [`WaitType::StreamEvent`] names.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum StreamEventType {
        /// A HEADERS frame was fully decoded on the stream.
        Headers,
        /// Any bytes became readable on the stream.
        Data,
        /// The stream reached FIN on the receive side.
        Finished,
        /// The stream was reset by the peer.
        Reset,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct StreamEvent {
        pub stream_id: u64,
        pub event_type: StreamEventType,
    }

    /// One step of an `h3i` script. Every variant maps directly onto a
    /// [`quiche::Connection`] or raw-frame operation; nothing here
    /// enforces RFC well-formedness; that is the point; a script is free
    /// to construct a [`quiche::h3::frame::Frame`] that does not match
    /// the `headers` it also carries, to exercise a peer's handling of
    /// the mismatch.
    #[derive(Clone, Debug)]
    pub enum Action {
        /// Registers a QUIC stream under an explicit ID without sending
        /// anything on it yet.
        OpenStream { stream_id: u64, bidi: bool },

        /// Encodes `headers` with this core's QPACK encoder into a
        /// HEADERS frame and sends it, unless `frame` is already
        /// populated, in which case `frame`'s bytes are sent verbatim
        /// and `headers` is kept only for the summary.
        SendHeadersFrame {
            stream_id: u64,
            fin_stream: bool,
            headers: Vec<Header>,
            frame: quiche::h3::frame::Frame,
            /// If true, `headers` are QPACK-encoded as literals with no
            /// static/dynamic table lookups, to probe a peer's handling
            /// of an uncompressed but valid field section.
            literal_headers: bool,
        },

        /// Sends an arbitrary HTTP/3 frame, already constructed by the
        /// caller, on `stream_id`.
        SendFrame {
            stream_id: u64,
            fin_stream: bool,
            frame: quiche::h3::frame::Frame,
        },

        /// Sends raw bytes on a stream, bypassing HTTP/3 framing
        /// entirely (e.g. to desynchronize a peer's frame parser).
        StreamBytes {
            stream_id: u64,
            fin_stream: bool,
            bytes: Vec<u8>,
        },

        /// Sends RESET_STREAM for `stream_id`.
        ResetStream { stream_id: u64, error_code: u64 },

        /// Blocks until `wait_type` is satisfied or the connection's
        /// idle timeout elapses, whichever comes first.
        Wait { wait_type: WaitType },

        /// Closes the connection and ends the script.
        ConnectionClose { error: ConnectionError },
    }
}
