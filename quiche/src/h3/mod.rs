// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! HTTP/3 (RFC 9114) on top of the QUIC core: the control stream and
//! SETTINGS exchange, per-request stream assembly, QPACK field
//! compression, and WebTransport session layering (spec.md §4.12/§4.13).

use std::collections::HashMap;

use crate::Error;
use crate::Result;

pub mod frame;
pub mod qpack;
pub mod webtransport;

use frame::Frame;

/// RFC 9114 §6.2: the unidirectional stream-type tag identifying a
/// control stream.
pub const CONTROL_STREAM_TYPE_ID: u64 = 0x00;
/// RFC 9114 §6.2.2: the QPACK encoder stream's stream-type tag (not
/// driven by this core beyond recognizing and ignoring it; see spec.md
/// §9's Open Question).
pub const QPACK_ENCODER_STREAM_TYPE_ID: u64 = 0x02;
pub const QPACK_DECODER_STREAM_TYPE_ID: u64 = 0x03;

/// RFC 9114 §8.1 application error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum WireErrorCode {
    NoError = 0x100,
    GeneralProtocolError = 0x101,
    InternalError = 0x102,
    StreamCreationError = 0x103,
    ClosedCriticalStream = 0x104,
    FrameUnexpected = 0x105,
    FrameError = 0x106,
    ExcessiveLoad = 0x107,
    IdError = 0x108,
    SettingsError = 0x109,
    MissingSettings = 0x10a,
    RequestRejected = 0x10b,
    RequestCancelled = 0x10c,
    RequestIncomplete = 0x10d,
    MessageError = 0x10e,
    ConnectError = 0x10f,
    VersionFallback = 0x110,
    QpackDecompressionFailed = 0x200,
    QpackEncoderStreamError = 0x201,
    QpackDecoderStreamError = 0x202,
}

/// One HTTP/3 header field. Pseudo-headers (`:method`, `:path`, ...) and
/// regular fields share this type; callers distinguish them by the `:`
/// prefix, as RFC 9114 §4.3 requires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    name: Vec<u8>,
    value: Vec<u8>,
}

impl Header {
    pub fn new(name: &[u8], value: &[u8]) -> Header {
        Header {
            name: name.to_vec(),
            value: value.to_vec(),
        }
    }
}

/// An accessor trait over (name, value) pairs, implemented by [`Header`]
/// and usable by the QPACK codec without depending on its concrete type.
pub trait NameValue {
    fn name(&self) -> &[u8];
    fn value(&self) -> &[u8];
}

impl NameValue for Header {
    fn name(&self) -> &[u8] {
        &self.name
    }

    fn value(&self) -> &[u8] {
        &self.value
    }
}

/// A fixed-size reusable buffer pool (spec.md §4.12: "16 KiB × 16 for
/// frame assembly; 8 KiB × 8 for header encoding"), acquired and
/// released across the hot path to avoid per-call allocation.
pub struct BufferPool {
    size: usize,
    max_count: usize,
    free: Vec<Vec<u8>>,
}

impl BufferPool {
    fn new(size: usize, count: usize) -> BufferPool {
        BufferPool {
            size,
            max_count: count,
            free: (0..count).map(|_| vec![0u8; size]).collect(),
        }
    }

    pub fn acquire(&mut self) -> Vec<u8> {
        self.free.pop().unwrap_or_else(|| vec![0u8; self.size])
    }

    pub fn release(&mut self, mut buf: Vec<u8>) {
        if self.free.len() < self.max_count {
            buf.clear();
            buf.resize(self.size, 0);
            self.free.push(buf);
        }
    }
}

/// Application-visible events produced by feeding received bytes into a
/// [`Connection`] (spec.md §6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A request's headers and body are fully assembled (HEADERS, zero
    /// or more DATA, then FIN).
    Request {
        stream_id: u64,
        headers: Vec<Header>,
        body: Vec<u8>,
    },

    GoAway {
        id: u64,
    },
}

struct RequestAssembly {
    headers: Option<Vec<Header>>,
    body: Vec<u8>,
    partial: Vec<u8>,
}

impl RequestAssembly {
    fn new() -> RequestAssembly {
        RequestAssembly {
            headers: None,
            body: Vec::new(),
            partial: Vec::new(),
        }
    }
}

/// The HTTP/3 layer of one QUIC connection: control-stream/SETTINGS
/// bookkeeping, QPACK codecs, per-request assembly, and graceful
/// shutdown via GOAWAY (spec.md §4.12 and its supplement).
pub struct Connection {
    is_server: bool,

    max_header_list_size: u64,
    qpack_max_table_capacity: u64,
    qpack_blocked_streams: u64,
    max_concurrent_streams: u64,

    local_settings_sent: bool,
    peer_settings_received: bool,
    peer_control_stream_seen: bool,

    open_request_streams: u64,
    requests: HashMap<u64, RequestAssembly>,

    goaway_sent: Option<u64>,
    goaway_received: Option<u64>,

    qpack_encoder: qpack::Encoder,
    qpack_decoder: qpack::Decoder,

    pub webtransport: Option<webtransport::SessionManager>,

    frame_pool: BufferPool,
    header_pool: BufferPool,
}

impl Connection {
    pub fn new(is_server: bool, config: &crate::Config) -> Connection {
        let qpack_max_table_capacity = config.qpack_max_table_capacity;
        let qpack_blocked_streams = config.qpack_blocked_streams;
        let max_header_list_size = config.h3_max_field_section_size.unwrap_or(16 * 1024);

        Connection {
            is_server,

            max_header_list_size,
            qpack_max_table_capacity,
            qpack_blocked_streams,
            max_concurrent_streams: config.h3_max_concurrent_streams,

            local_settings_sent: false,
            peer_settings_received: false,
            peer_control_stream_seen: false,

            open_request_streams: 0,
            requests: HashMap::new(),

            goaway_sent: None,
            goaway_received: None,

            qpack_encoder: qpack::Encoder::with_capacity(qpack_max_table_capacity as usize),
            qpack_decoder: qpack::Decoder::new(
                qpack_max_table_capacity as usize,
                qpack_blocked_streams,
                max_header_list_size,
            ),

            webtransport: if config.webtransport_enabled {
                Some(webtransport::SessionManager::new(
                    config.webtransport_max_sessions,
                ))
            } else {
                None
            },

            frame_pool: BufferPool::new(16 * 1024, 16),
            header_pool: BufferPool::new(8 * 1024, 8),
        }
    }

    /// Builds the bytes to write to a freshly-opened local unidirectional
    /// control stream: the stream-type tag followed by the mandatory
    /// first frame, SETTINGS.
    pub fn open_control_stream(&mut self) -> Result<Vec<u8>> {
        let mut buf = self.frame_pool.acquire();
        let len = {
            let mut w = octets::OctetsMut::with_slice(&mut buf);
            w.put_varint(CONTROL_STREAM_TYPE_ID)?;
            frame::settings_frame(
                self.max_header_list_size,
                self.qpack_max_table_capacity,
                self.qpack_blocked_streams,
            )
            .to_bytes(&mut w)?;
            w.off()
        };
        buf.truncate(len);
        self.local_settings_sent = true;
        Ok(buf)
    }

    /// Processes bytes received on the peer's control stream. The first
    /// frame must be SETTINGS (RFC 9114 §6.2.1); anything else is a
    /// `MissingSettings` connection error.
    pub fn recv_control_stream(&mut self, buf: &[u8]) -> Result<()> {
        let mut b = octets::Octets::with_slice(buf);

        while b.left() > 0 {
            let frame = match Frame::parse(&mut b) {
                Ok(f) => f,
                Err(Error::Done) => break,
                Err(e) => return Err(e),
            };

            if !self.peer_control_stream_seen {
                self.peer_control_stream_seen = true;
                if !matches!(frame, Frame::Settings { .. }) {
                    return Err(Error::H3(WireErrorCode::MissingSettings as u64));
                }
            }

            if let Frame::Settings { .. } = &frame {
                log::debug!("peer SETTINGS received");
                self.peer_settings_received = true;
            }

            if let Frame::GoAway { id } = frame {
                log::debug!("peer GOAWAY id={id}");
                self.goaway_received = Some(id);
            }
        }

        Ok(())
    }

    pub fn peer_settings_received(&self) -> bool {
        self.peer_settings_received
    }

    /// Enforces the per-connection concurrent-request-stream cap
    /// (spec.md §4.12 supplement). Call before accepting a newly-opened
    /// peer request stream.
    pub fn admit_request_stream(&mut self, stream_id: u64) -> Result<()> {
        if let Some(goaway_id) = self.goaway_sent {
            if stream_id >= goaway_id {
                return Err(Error::H3(WireErrorCode::RequestRejected as u64));
            }
        }

        if self.open_request_streams >= self.max_concurrent_streams {
            return Err(Error::StreamLimit);
        }

        self.open_request_streams += 1;
        self.requests.insert(stream_id, RequestAssembly::new());
        Ok(())
    }

    /// Feeds newly-received bytes for a request stream, returning a
    /// [`Event::Request`] once HEADERS and (if any) DATA are fully
    /// assembled and `fin` is observed.
    pub fn recv_request_data(
        &mut self,
        stream_id: u64,
        data: &[u8],
        fin: bool,
    ) -> Result<Option<Event>> {
        let assembly = self
            .requests
            .get_mut(&stream_id)
            .ok_or(Error::InvalidStreamState(stream_id))?;

        assembly.partial.extend_from_slice(data);

        loop {
            let mut b = octets::Octets::with_slice(&assembly.partial);
            let frame = match Frame::parse(&mut b) {
                Ok(f) => f,
                Err(Error::Done) => break,
                Err(e) => return Err(e),
            };
            let consumed = b.off();
            assembly.partial.drain(..consumed);

            match frame {
                Frame::Headers { header_block } => {
                    match self.qpack_decoder.decode(&header_block)? {
                        qpack::DecodeOutcome::Done(headers) => {
                            assembly.headers = Some(headers);
                        }
                        qpack::DecodeOutcome::Blocked => {
                            self.qpack_decoder.enter_blocked()?;
                            // Blocked field sections are out of scope for
                            // delivery reordering in this core (spec.md
                            // §9): surface as a protocol error instead of
                            // silently dropping the request.
                            return Err(Error::QpackBlockedStreamsExceeded);
                        }
                    }
                }
                Frame::Data { payload } => {
                    assembly.body.extend_from_slice(&payload);
                }
                _ => return Err(Error::H3(WireErrorCode::FrameUnexpected as u64)),
            }
        }

        if fin {
            let assembly = self.requests.remove(&stream_id).unwrap();
            self.open_request_streams = self.open_request_streams.saturating_sub(1);
            let headers = assembly
                .headers
                .ok_or(Error::H3(WireErrorCode::MessageError as u64))?;
            return Ok(Some(Event::Request {
                stream_id,
                headers,
                body: assembly.body,
            }));
        }

        Ok(None)
    }

    /// Encodes a response as HEADERS (QPACK-compressed) followed by DATA,
    /// ready to write to `stream_id` before closing it locally (spec.md
    /// §4.12: the `send_response` continuation).
    pub fn send_response<H: NameValue>(
        &mut self,
        headers: &[H],
        body: &[u8],
    ) -> Result<Vec<u8>> {
        let mut header_block = self.header_pool.acquire();
        let hlen = self.qpack_encoder.encode(headers, &mut header_block)?;
        header_block.truncate(hlen);

        let headers_frame = Frame::Headers {
            header_block: header_block.clone(),
        };
        self.header_pool.release(header_block);

        let data_frame = Frame::Data {
            payload: body.to_vec(),
        };

        // Each frame's type+length varints take at most 16 bytes; the
        // rest is exactly the payload sizes.
        let needed = hlen + body.len() + 32;
        let mut out = self.frame_pool.acquire();
        if out.len() < needed {
            out.resize(needed, 0);
        }

        let len = {
            let mut w = octets::OctetsMut::with_slice(&mut out);
            headers_frame.to_bytes(&mut w)?;
            data_frame.to_bytes(&mut w)?;
            w.off()
        };
        out.truncate(len);
        Ok(out)
    }

    /// Begins graceful shutdown: no new request streams with ID ≥ `id`
    /// will be admitted, but streams already in flight may complete
    /// (spec.md §4.12 supplement).
    pub fn send_goaway(&mut self, id: u64) -> Frame {
        self.goaway_sent = Some(id);
        Frame::GoAway { id }
    }

    pub fn goaway_received(&self) -> Option<u64> {
        self.goaway_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(max_concurrent_streams: u64) -> crate::Config {
        let mut cfg = crate::Config::new().unwrap();
        cfg.set_h3_max_concurrent_streams(max_concurrent_streams);
        cfg
    }

    #[test]
    fn control_stream_round_trip_marks_settings_received() {
        let cfg = config_with(10);
        let mut client = Connection::new(false, &cfg);
        let mut server = Connection::new(true, &cfg);

        let bytes = client.open_control_stream().unwrap();
        // Strip the stream-type tag the way a driver would after routing
        // by stream type, leaving just the frame bytes.
        let mut b = octets::Octets::with_slice(&bytes);
        let _ty = b.get_varint().unwrap();

        server.recv_control_stream(b.as_ref()).unwrap();
        assert!(server.peer_settings_received());
    }

    #[test]
    fn request_assembles_on_fin_and_round_trips_headers() {
        let cfg = config_with(10);
        let mut conn = Connection::new(true, &cfg);
        conn.admit_request_stream(4).unwrap();

        let mut encoder = qpack::Encoder::new();
        let headers = vec![Header::new(b":method", b"GET"), Header::new(b":path", b"/")];
        let mut hbuf = vec![0u8; 128];
        let hlen = encoder.encode(&headers, &mut hbuf).unwrap();

        let headers_frame = Frame::Headers {
            header_block: hbuf[..hlen].to_vec(),
        };
        let data_frame = Frame::Data {
            payload: b"body".to_vec(),
        };

        let mut wire = vec![0u8; 512];
        let len = {
            let mut w = octets::OctetsMut::with_slice(&mut wire);
            headers_frame.to_bytes(&mut w).unwrap();
            data_frame.to_bytes(&mut w).unwrap();
            w.off()
        };

        let event = conn.recv_request_data(4, &wire[..len], true).unwrap();
        match event {
            Some(Event::Request {
                stream_id,
                headers,
                body,
            }) => {
                assert_eq!(stream_id, 4);
                assert_eq!(headers[0].name(), b":method");
                assert_eq!(body, b"body");
            }
            _ => panic!("expected a Request event"),
        }
    }

    #[test]
    fn max_concurrent_streams_is_enforced() {
        let cfg = config_with(1);
        let mut conn = Connection::new(true, &cfg);
        conn.admit_request_stream(4).unwrap();
        assert!(matches!(
            conn.admit_request_stream(8),
            Err(Error::StreamLimit)
        ));
    }

    #[test]
    fn goaway_rejects_new_streams_at_or_above_the_id() {
        let cfg = config_with(10);
        let mut conn = Connection::new(true, &cfg);
        conn.send_goaway(8);
        assert!(conn.admit_request_stream(8).is_err());
        assert!(conn.admit_request_stream(4).is_ok());
    }
}
