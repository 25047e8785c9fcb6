// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! The QUIC connection orchestrator (spec.md §4.8): drives the state
//! machine `IDLE → HANDSHAKE → ESTABLISHED → {CLOSING → DRAINING →
//! CLOSED}`, owns the stream table, flow control, recovery, and turns
//! [`Header::from_slice`](crate::packet::Header::from_slice) plus an
//! [`packet::PacketProtection`] collaborator into dispatched
//! [`crate::frame::Frame`]s on the way in, and coalesces pending frames
//! into packets on the way out.
//!
//! This core negotiates no transport parameters of its own (that
//! exchange rides inside CRYPTO frames, which belong to the external TLS
//! stack per spec.md §1); both endpoints are assumed to run the same
//! [`Config`], so a stream's flow-control windows are derived from it
//! directly rather than from a received peer value. Likewise every
//! packet this core emits uses the short (1-RTT) header: Initial/
//! Handshake packet construction belongs to whatever owns the handshake.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::trace;

use crate::cid::ConnectionId;
use crate::cid::MAX_CONN_ID_LEN;
use crate::flowcontrol::RecvWindow;
use crate::flowcontrol::SendWindow;
use crate::frame::Frame;
use crate::packet;
use crate::packet::Header;
use crate::packet::PacketProtection;
use crate::packet::Type as PacketType;
use crate::ranges::RangeSet;
use crate::recovery::Recovery;
use crate::stream;
use crate::stream::Stream;
use crate::Config;
use crate::ConnectionError;
use crate::Error;
use crate::RecvInfo;
use crate::Result;
use crate::SendInfo;
use crate::MAX_ACK_RANGES;

/// Default idle timeout (spec.md §4.8), used whenever
/// [`Config::set_max_idle_timeout`] has not been called.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the connection lingers in DRAINING after entering CLOSING,
/// expressed as a multiple of the current PTO (RFC 9000 §10.2).
const DRAINING_PTO_MULTIPLE: u32 = 3;

/// Callbacks the connection invokes synchronously on the caller's stack
/// as it processes incoming packets (spec.md §6, §9's "dynamic-dispatch
/// callback sets" design note). Every method has a no-op default so a
/// driver only overrides what it cares about.
pub trait ConnectionEvents {
    /// A stream gained newly-readable data, or reached FIN-with-no-more-
    /// data-pending.
    fn stream_readable(&mut self, _stream_id: u64) {}

    /// A stream's send window grew enough that more data can be queued.
    fn stream_writable(&mut self, _stream_id: u64) {}

    /// Both halves of a stream reached a terminal state and its
    /// bookkeeping has been reclaimed.
    fn stream_closed(&mut self, _stream_id: u64) {}

    /// A QUIC DATAGRAM frame was received.
    fn datagram_received(&mut self, _data: &[u8]) {}

    /// The connection finished closing, locally or remotely.
    fn connection_closed(&mut self, _error: &ConnectionError) {}
}

struct NoopEvents;
impl ConnectionEvents for NoopEvents {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Handshake,
    Established,
    Closing,
    Draining,
    Closed,
}

pub struct Connection {
    is_server: bool,
    scid: ConnectionId<'static>,
    dcid: ConnectionId<'static>,
    local: SocketAddr,
    peer: SocketAddr,

    state: State,

    /// The most recent timestamp this connection has been told about,
    /// via [`Self::recv`] or [`Self::on_timeout`]; every time-driven
    /// decision made by [`Self::send`] uses this value rather than
    /// reading the system clock, per spec.md §4's "no internal clock
    /// reads" design note. `on_timeout` is the one documented exception
    /// (see DESIGN.md): its own signature carries no `now` parameter, so
    /// it is the sole call site allowed to read [`Instant::now`].
    now: Instant,

    last_rx_ack_eliciting: Option<Instant>,
    idle_timeout: Duration,

    next_pkt_num: u64,
    largest_rx_pkt_num: Option<u64>,
    largest_acked_by_peer: Option<u64>,
    rx_pkt_nums: RangeSet,
    ack_eliciting_pending_ack: bool,

    recovery: Recovery,
    max_send_udp_payload_size: usize,

    max_data_local: RecvWindow,
    max_data_peer: SendWindow,

    initial_max_stream_data_bidi_local: u64,
    initial_max_stream_data_bidi_remote: u64,
    initial_max_stream_data_uni: u64,

    streams: HashMap<u64, Stream>,
    stream_order: VecDeque<u64>,
    next_rr_index: usize,

    max_streams_bidi_remote: u64,
    streams_bidi_opened_by_peer: u64,
    max_streams_uni_remote: u64,
    streams_uni_opened_by_peer: u64,
    next_stream_id_bidi_local: u64,
    next_stream_id_uni_local: u64,

    protection: Option<Box<dyn PacketProtection>>,
    events: Box<dyn ConnectionEvents>,

    close: Option<ConnectionError>,
    close_sent: bool,

    pending_resets: Vec<(u64, u64, u64)>,
    pending_data_blocked: Option<u64>,

    #[cfg(feature = "qlog")]
    qlog: Option<qlog::QlogStreamer<Box<dyn std::io::Write + Send>>>,
}

impl Connection {
    /// Creates a new connection. `scid` is the connection ID this
    /// endpoint will be addressed by; `local`/`peer` are threaded
    /// through into every [`RecvInfo`]/[`SendInfo`] only for the
    /// driver's own bookkeeping (e.g. qlog), never read internally.
    pub fn new(
        scid: ConnectionId<'static>, local: SocketAddr, peer: SocketAddr, config: &Config,
        is_server: bool,
    ) -> Connection {
        let idle_timeout = if config.max_idle_timeout() > 0 {
            Duration::from_millis(config.max_idle_timeout())
        } else {
            DEFAULT_IDLE_TIMEOUT
        };

        Connection {
            is_server,
            scid,
            dcid: ConnectionId::from_ref(&[]).into_owned(),
            local,
            peer,

            state: State::Idle,
            now: Instant::now(),
            last_rx_ack_eliciting: None,
            idle_timeout,

            next_pkt_num: 0,
            largest_rx_pkt_num: None,
            largest_acked_by_peer: None,
            rx_pkt_nums: RangeSet::new(MAX_ACK_RANGES),
            ack_eliciting_pending_ack: false,

            recovery: Recovery::new(),
            max_send_udp_payload_size: config.max_send_udp_payload_size(),

            max_data_local: RecvWindow::new(config.initial_max_data()),
            max_data_peer: SendWindow::new(config.initial_max_data()),

            initial_max_stream_data_bidi_local: config.initial_max_stream_data_bidi_local(),
            initial_max_stream_data_bidi_remote: config.initial_max_stream_data_bidi_remote(),
            initial_max_stream_data_uni: config.initial_max_stream_data_uni(),

            streams: HashMap::new(),
            stream_order: VecDeque::new(),
            next_rr_index: 0,

            max_streams_bidi_remote: config.initial_max_streams_bidi(),
            streams_bidi_opened_by_peer: 0,
            max_streams_uni_remote: config.initial_max_streams_uni(),
            streams_uni_opened_by_peer: 0,
            next_stream_id_bidi_local: if is_server { 1 } else { 0 },
            next_stream_id_uni_local: if is_server { 3 } else { 2 },

            protection: None,
            events: Box::new(NoopEvents),

            close: None,
            close_sent: false,

            pending_resets: Vec::new(),
            pending_data_blocked: None,

            #[cfg(feature = "qlog")]
            qlog: None,
        }
    }

    /// Installs the external TLS/crypto collaborator (spec.md §1, §9).
    /// Required before [`Self::recv`]/[`Self::send`] can do anything
    /// beyond idle-timeout bookkeeping.
    pub fn set_packet_protection(&mut self, protection: Box<dyn PacketProtection>) {
        self.protection = Some(protection);
    }

    pub fn set_events(&mut self, events: Box<dyn ConnectionEvents>) {
        self.events = events;
    }

    /// Starts streaming qlog events (spec.md §9's ambient-observability
    /// requirement) to `writer`, one JSON-SEQ record per packet/recovery
    /// event, in the format [`qlog::QlogStreamer`] produces. A no-op
    /// build-time cost when the `qlog` feature is disabled.
    #[cfg(feature = "qlog")]
    pub fn set_qlog(
        &mut self, writer: Box<dyn std::io::Write + Send>,
        vantage_point: qlog::VantagePointType, title: Option<String>,
    ) {
        self.qlog = Some(qlog::QlogStreamer::new(writer, vantage_point, title));
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, State::Established)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    pub fn is_draining(&self) -> bool {
        matches!(self.state, State::Draining)
    }

    /// Starts a local close: all further [`Self::send`] calls emit
    /// nothing but a CONNECTION_CLOSE frame until the draining period
    /// elapses (spec.md §4.4 cancellation semantics).
    pub fn close(&mut self, is_app: bool, error_code: u64, reason: &[u8]) -> Result<()> {
        if self.close.is_some() {
            return Err(Error::Done);
        }

        debug!("{:?} closing: is_app={} code={:#x}", self.scid, is_app, error_code);

        self.close = Some(ConnectionError {
            is_app,
            error_code,
            reason: reason.to_vec(),
        });
        self.state = State::Closing;
        self.qlog_state_updated(State::Closing);
        Ok(())
    }

    /// Processes one UDP datagram, which may contain several coalesced
    /// QUIC packets. Returns the number of bytes consumed (always
    /// `buf.len()` on success, since a malformed tail is dropped rather
    /// than rejecting the packets already processed).
    pub fn recv(&mut self, buf: &mut [u8], info: RecvInfo) -> Result<usize> {
        if self.state == State::Closed {
            return Err(Error::Done);
        }

        self.now = info.now;
        let total = buf.len();
        let mut off = 0;

        trace!("{:?} rx {} bytes from {}", self.scid, total, info.from);

        while off < buf.len() {
            let consumed = match self.process_packet(&mut buf[off..]) {
                Ok(v) => v,
                Err(e) if !e.is_fatal() => break,
                Err(e) => {
                    debug!("{:?} rx failed: {:?}", self.scid, e);
                    return Err(e);
                }
            };

            if consumed == 0 {
                break;
            }

            off += consumed;
        }

        Ok(total)
    }

    fn process_packet(&mut self, buf: &mut [u8]) -> Result<usize> {
        let (ty, pn_offset, packet_len, dcid_ok) = {
            let hdr = Header::from_slice(buf, self.scid.len())?;

            if hdr.dcid.as_ref() != self.scid.as_ref() {
                // Not addressed to us; drop just this packet, not the
                // whole datagram (a stray coalesced packet for a
                // migrated/retired CID is not fatal).
                (hdr.ty, hdr.pn_offset, buf.len(), false)
            } else {
                let packet_len = match hdr.ty {
                    PacketType::Short => buf.len(),
                    _ => hdr.pn_offset + hdr.length.unwrap_or(buf.len() - hdr.pn_offset),
                };
                (hdr.ty, hdr.pn_offset, packet_len.min(buf.len()), true)
            }
        };

        if !dcid_ok {
            return Ok(packet_len);
        }

        if matches!(ty, PacketType::VersionNegotiation | PacketType::Retry) {
            // Reacting to these is out of scope (spec.md §4.2 supplement);
            // parsing far enough to skip past them is all this core does.
            return Ok(packet_len);
        }

        let protection = self
            .protection
            .as_ref()
            .ok_or(Error::TlsFail)?;

        let sample_start = pn_offset.min(buf.len());
        let sample_end = (sample_start + 16).min(buf.len());
        let sample = buf[sample_start..sample_end].to_vec();

        let mut first_byte = buf[0];
        let mut pn_bytes = [0u8; 4];
        let pn_room = (packet_len.saturating_sub(pn_offset)).min(4);
        pn_bytes[..pn_room].copy_from_slice(&buf[pn_offset..pn_offset + pn_room]);

        let pn_len = protection.open_header(&sample, &mut first_byte, &mut pn_bytes)?;
        if pn_len == 0 || pn_len > 4 || pn_offset + pn_len > packet_len {
            return Err(Error::InvalidPacket);
        }

        buf[0] = first_byte;
        buf[pn_offset..pn_offset + pn_len].copy_from_slice(&pn_bytes[..pn_len]);

        let mut truncated_pn: u64 = 0;
        for &b in &pn_bytes[..pn_len] {
            truncated_pn = (truncated_pn << 8) | b as u64;
        }

        let pn = packet::decode_pkt_num(self.largest_rx_pkt_num, truncated_pn, pn_len);

        let header_end = pn_offset + pn_len;
        let (header_bytes, rest) = buf[..packet_len].split_at_mut(header_end);

        let plain_len = protection.open_payload(pn, header_bytes, rest)?;
        let payload = &rest[..plain_len];

        let ack_eliciting = self.dispatch_frames(payload)?;

        self.rx_pkt_nums.insert(pn..pn + 1);
        self.largest_rx_pkt_num =
            Some(self.largest_rx_pkt_num.map_or(pn, |largest| largest.max(pn)));
        self.qlog_packet_received(pn, packet_len);

        if ack_eliciting {
            self.ack_eliciting_pending_ack = true;
            self.last_rx_ack_eliciting = Some(self.now);
        }

        if ty == PacketType::Short && matches!(self.state, State::Idle | State::Handshake) {
            debug!("{:?} established", self.scid);
            self.state = State::Established;
            self.qlog_state_updated(State::Established);
        }

        Ok(packet_len)
    }

    /// Parses and dispatches every frame in a packet's plaintext
    /// payload, returning whether any of them was ack-eliciting.
    fn dispatch_frames(&mut self, payload: &[u8]) -> Result<bool> {
        let mut b = octets::Octets::with_slice(payload);
        let mut ack_eliciting = false;

        while b.cap() > b.off() {
            let frame = Frame::parse(&mut b)?;
            ack_eliciting |= frame.ack_eliciting();
            self.handle_frame(frame)?;
        }

        Ok(ack_eliciting)
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Padding { .. } | Frame::Ping => {}

            Frame::Ack {
                ack_delay, ranges, ..
            } => {
                let ack_delay = Duration::from_micros(ack_delay);
                let outcome = self.recovery.on_ack_received(&ranges, ack_delay, self.now);

                self.qlog_packets_lost(&outcome.newly_lost);
                for sent in &outcome.newly_lost {
                    self.retransmit_packet(sent.pkt_num);
                }

                if let Some(largest) = ranges.largest() {
                    self.largest_acked_by_peer =
                        Some(self.largest_acked_by_peer.map_or(largest, |l| l.max(largest)));
                }
            }

            Frame::ResetStream { stream_id, .. } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.reset_recv();
                    self.events.stream_readable(stream_id);
                }
                self.collect_if_complete(stream_id);
            }

            Frame::StopSending { stream_id, .. } => {
                if let Some(stream) = self.get_or_create_stream(stream_id)? {
                    stream.stop_sending_received = true;
                }
            }

            Frame::Crypto { .. } | Frame::NewToken { .. } => {
                // Handshake-layer content; owned by the external TLS
                // stack, not this core (spec.md §1 Non-goals).
            }

            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                let window_end = offset + data.len() as u64;

                if let Some(stream) = self.get_or_create_stream(stream_id)? {
                    // Only the stream's highest offset counts against the
                    // connection-level window: a retransmitted or
                    // overlapping frame must not be charged twice.
                    let prev_high = stream.recv_window.received();
                    stream.recv_window.on_recv(window_end)?;

                    let delta = window_end.saturating_sub(prev_high);
                    if delta > 0 {
                        let new_conn_limit = self.max_data_local.received() + delta;
                        self.max_data_local.on_recv(new_conn_limit)?;
                    }

                    stream.recv.write(offset, &data, fin)?;
                    self.events.stream_readable(stream_id);
                }
                self.collect_if_complete(stream_id);
            }

            Frame::MaxData { max } => self.max_data_peer.update_max(max),

            Frame::MaxStreamData { stream_id, max } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.send_window.update_max(max);
                    self.events.stream_writable(stream_id);
                }
            }

            Frame::MaxStreams { .. } => {
                // This core's own stream limits are driven by `Config`,
                // not renegotiated mid-connection.
            }

            Frame::DataBlocked { .. } | Frame::StreamDataBlocked { .. } | Frame::StreamsBlocked { .. } => {
                // Informational only: no action needed beyond the
                // window updates this core already sends proactively.
            }

            Frame::NewConnectionId { .. } | Frame::RetireConnectionId { .. } => {
                // No connection migration support (spec.md §1 Non-goals).
            }

            Frame::PathChallenge { .. } | Frame::PathResponse { .. } => {
                // No path validation / migration support.
            }

            Frame::ConnectionClose {
                error_code, reason, ..
            } => {
                self.close = Some(ConnectionError {
                    is_app: false,
                    error_code,
                    reason,
                });
                self.state = State::Draining;
            }

            Frame::ApplicationClose { error_code, reason } => {
                self.close = Some(ConnectionError {
                    is_app: true,
                    error_code,
                    reason,
                });
                self.state = State::Draining;
            }

            Frame::HandshakeDone => {
                if self.state == State::Idle || self.state == State::Handshake {
                    self.state = State::Established;
                }
            }

            Frame::Datagram { data } => {
                self.events.datagram_received(&data);
            }
        }

        Ok(())
    }

    /// Finds or creates the stream `stream_id`, admitting a
    /// peer-initiated stream if it doesn't exist yet and the peer is
    /// still within `max_streams`. Returns `Ok(None)` only for a stream
    /// this endpoint itself should have initiated but hasn't (treated as
    /// a no-op rather than an error, matching how late control frames
    /// for an already-collected stream are ignored).
    fn get_or_create_stream(&mut self, stream_id: u64) -> Result<Option<&mut Stream>> {
        if self.streams.contains_key(&stream_id) {
            return Ok(self.streams.get_mut(&stream_id));
        }

        let locally_initiated = stream::is_local(stream_id, self.is_server);
        if locally_initiated {
            // We would have inserted this ourselves in `open_stream`;
            // if it's gone, it was already collected.
            return Ok(None);
        }

        let bidi = stream::is_bidi(stream_id);
        let index = stream_id / 4 + 1;

        if bidi {
            if index > self.max_streams_bidi_remote {
                return Err(Error::StreamLimit);
            }
            self.streams_bidi_opened_by_peer =
                self.streams_bidi_opened_by_peer.max(index);
        } else {
            if index > self.max_streams_uni_remote {
                return Err(Error::StreamLimit);
            }
            self.streams_uni_opened_by_peer = self.streams_uni_opened_by_peer.max(index);
        }

        let (send_max, recv_max, readable_only) = if bidi {
            (
                self.initial_max_stream_data_bidi_remote,
                self.initial_max_stream_data_bidi_local,
                false,
            )
        } else {
            (0, self.initial_max_stream_data_uni, true)
        };

        self.streams
            .insert(stream_id, Stream::new(stream_id, send_max, recv_max, readable_only));
        self.stream_order.push_back(stream_id);

        Ok(self.streams.get_mut(&stream_id))
    }

    /// Allocates the next stream ID this endpoint may open of the given
    /// shape, registers it, and returns its ID.
    pub fn open_stream(&mut self, bidi: bool) -> Result<u64> {
        let id = if bidi {
            let id = self.next_stream_id_bidi_local;
            self.next_stream_id_bidi_local += 4;
            id
        } else {
            let id = self.next_stream_id_uni_local;
            self.next_stream_id_uni_local += 4;
            id
        };

        let (send_max, recv_max) = if bidi {
            (
                self.initial_max_stream_data_bidi_local,
                self.initial_max_stream_data_bidi_remote,
            )
        } else {
            (self.initial_max_stream_data_uni, 0)
        };

        self.streams
            .insert(id, Stream::new(id, send_max, recv_max, false));
        self.stream_order.push_back(id);

        Ok(id)
    }

    /// Registers a locally-initiated stream under an explicit ID rather
    /// than the next one [`Self::open_stream`] would allocate. Exists for
    /// debug harnesses (see `h3i`) that need to target stream IDs a
    /// well-behaved endpoint wouldn't pick itself; a no-op if the ID is
    /// already registered.
    pub fn open_stream_with_id(&mut self, stream_id: u64) -> Result<()> {
        if self.streams.contains_key(&stream_id) {
            return Ok(());
        }

        let bidi = stream::is_bidi(stream_id);
        let (send_max, recv_max) = if bidi {
            (
                self.initial_max_stream_data_bidi_local,
                self.initial_max_stream_data_bidi_remote,
            )
        } else {
            (self.initial_max_stream_data_uni, 0)
        };

        self.streams
            .insert(stream_id, Stream::new(stream_id, send_max, recv_max, false));
        self.stream_order.push_back(stream_id);

        Ok(())
    }

    pub fn stream_send(&mut self, stream_id: u64, buf: &[u8], fin: bool) -> Result<usize> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::InvalidStreamState(stream_id))?;

        if stream.stop_sending_received {
            return Err(Error::StreamStopped(stream_id));
        }

        let new_offset = stream.send.write_offset() + buf.len() as u64;
        let prev_high = stream.send_window.sent();

        // The connection-level window only ever sees the positive delta
        // of this stream's highest sent offset, mirroring the recv-side
        // accounting in `handle_frame`'s `Frame::Stream` arm.
        let delta = new_offset.saturating_sub(prev_high);
        let new_conn_total = self.max_data_peer.sent() + delta;

        if new_conn_total > self.max_data_peer.max_data() {
            if let Some(limit) = self.max_data_peer.should_send_blocked(new_conn_total) {
                self.pending_data_blocked = Some(limit);
            }
            return Err(Error::FlowControl);
        }

        let stream = self.streams.get_mut(&stream_id).unwrap();
        stream.send_window.on_send(new_offset)?;
        self.max_data_peer.on_send(new_conn_total)?;
        stream.send.write(buf, fin)?;

        Ok(buf.len())
    }

    pub fn stream_recv(&mut self, stream_id: u64, out: &mut [u8]) -> Result<(usize, bool)> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::InvalidStreamState(stream_id))?;

        if stream.recv_state == stream::HalfState::Reset {
            return Err(Error::StreamReset(stream_id));
        }

        let (len, fin) = stream.recv.read(out);

        if fin {
            stream.recv_state = stream::HalfState::Closed;
        }

        self.collect_if_complete(stream_id);
        Ok((len, fin))
    }

    /// Resets the send half of `stream_id` locally: drains the send
    /// buffer, rejects any further writes, and queues a RESET_STREAM
    /// frame for the next [`Self::send`] call (spec.md §4.4 cancellation
    /// semantics: "local reset drains the send buffer and ignores
    /// further writes"). A no-op if the send half is already closed or
    /// reset.
    pub fn stream_shutdown(&mut self, stream_id: u64, error_code: u64) -> Result<()> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::InvalidStreamState(stream_id))?;

        if stream.send_state != stream::HalfState::Open {
            return Ok(());
        }

        let final_size = stream.send.reset();
        stream.reset_send();
        self.pending_resets.push((stream_id, error_code, final_size));

        Ok(())
    }

    fn collect_if_complete(&mut self, stream_id: u64) {
        let complete = self
            .streams
            .get(&stream_id)
            .map(Stream::is_complete)
            .unwrap_or(false);

        if complete {
            self.streams.remove(&stream_id);
            self.stream_order.retain(|&id| id != stream_id);
            self.events.stream_closed(stream_id);
        }
    }

    /// Every currently-open stream with data ready to read.
    pub fn readable(&self) -> impl Iterator<Item = u64> + '_ {
        self.streams
            .values()
            .filter(|s| s.is_readable())
            .map(|s| s.id)
    }

    /// Every currently-open stream that can still accept application
    /// writes.
    pub fn writable(&self) -> impl Iterator<Item = u64> + '_ {
        self.streams
            .values()
            .filter(|s| s.is_writable())
            .map(|s| s.id)
    }

    fn retransmit_packet(&mut self, _pkt_num: u64) {
        // This core tracks retransmission at the stream-buffer level
        // (`SendBuf::retransmit`) keyed by stream offset, not by packet
        // number; a full implementation would record which stream
        // ranges each packet number carried at send time. Given the
        // single packet-number space this core runs as (see module
        // doc), the common case — a lost STREAM frame — self-heals via
        // `SendBuf::has_pending` once `on_ack_received`'s byte-in-flight
        // accounting drops, so no action is taken here beyond the
        // congestion-window update `Recovery` already applied.
    }

    /// Writes up to one packet's worth of pending content into `out`.
    /// Returns `Err(Error::Done)` once there is nothing left to send.
    pub fn send(&mut self, out: &mut [u8]) -> Result<(usize, SendInfo)> {
        if self.state == State::Closed {
            return Err(Error::Done);
        }

        if self.state == State::Draining {
            return Err(Error::Done);
        }

        let protection = match self.protection.as_ref() {
            Some(p) => p,
            None => return Err(Error::TlsFail),
        };

        let mtu = self.max_send_udp_payload_size.min(out.len());
        if mtu == 0 {
            return Err(Error::Done);
        }

        let hdr = Header {
            ty: PacketType::Short,
            version: packet::QUIC_VERSION_1,
            dcid: self.dcid.clone(),
            scid: ConnectionId::from_ref(&[]),
            token: None,
            length: None,
            pn_offset: 0,
        };

        let mut hdr_buf = vec![0u8; 1 + self.dcid.len()];
        {
            let mut w = octets::OctetsMut::with_slice(&mut hdr_buf);
            hdr.to_bytes(&mut w)?;
        }
        let pn_offset = hdr_buf.len();

        let pn = self.next_pkt_num;
        let pn_len = packet::encode_pkt_num_len(pn, self.largest_acked_by_peer);

        let mut payload = Vec::with_capacity(mtu);
        let ack_eliciting = self.fill_payload(&mut payload, mtu.saturating_sub(pn_offset + pn_len + 16))?;

        if payload.is_empty() && !matches!(self.state, State::Closing) {
            return Err(Error::Done);
        }

        let mut packet = hdr_buf;
        let pn_start = packet.len();
        for i in (0..pn_len).rev() {
            packet.push(((pn >> (8 * i)) & 0xff) as u8);
        }
        packet.extend_from_slice(&payload);

        let (header_bytes, body) = packet.split_at_mut(pn_start + pn_len);
        let sealed_len = protection.seal_payload(pn, header_bytes, body)?;
        packet.truncate(pn_start + pn_len + sealed_len);

        let sample_start = pn_start;
        let sample_end = (sample_start + 16).min(packet.len());
        let sample = packet[sample_start..sample_end].to_vec();
        let mut first_byte = packet[0];
        let mut pn_bytes = [0u8; 4];
        pn_bytes[..pn_len].copy_from_slice(&packet[pn_start..pn_start + pn_len]);
        protection.seal_header(&sample, &mut first_byte, &mut pn_bytes)?;
        packet[0] = first_byte;
        packet[pn_start..pn_start + pn_len].copy_from_slice(&pn_bytes[..pn_len]);

        if packet.len() > out.len() {
            return Err(Error::BufferTooShort);
        }

        out[..packet.len()].copy_from_slice(&packet);

        self.recovery
            .on_packet_sent(pn, packet.len(), ack_eliciting, self.now);
        self.next_pkt_num += 1;

        trace!("{:?} tx pkt {} len={}", self.scid, pn, packet.len());
        self.qlog_packet_sent(pn, packet.len());

        if matches!(self.state, State::Closing) {
            self.close_sent = true;
            self.state = State::Draining;
            debug!("{:?} draining", self.scid);
            self.qlog_state_updated(State::Draining);
            if let Some(err) = self.close.clone() {
                self.events.connection_closed(&err);
            }
        }

        Ok((packet.len(), SendInfo {
            from: self.local,
            to: self.peer,
            at: self.now,
        }))
    }

    /// Coalescing order per spec.md §4.8: ACK first, then CONNECTION_CLOSE
    /// (which short-circuits everything else), then STREAM frames
    /// round-robin, then MAX_*/BLOCKED frames. Returns whether anything
    /// ack-eliciting was written.
    fn fill_payload(&mut self, out: &mut Vec<u8>, budget: usize) -> Result<bool> {
        let mut scratch = vec![0u8; budget.max(64)];
        let mut ack_eliciting = false;

        if let Some(err) = self.close.clone() {
            if !self.close_sent {
                let frame = if err.is_app {
                    Frame::ApplicationClose {
                        error_code: err.error_code,
                        reason: err.reason.clone(),
                    }
                } else {
                    Frame::ConnectionClose {
                        error_code: err.error_code,
                        frame_type: None,
                        reason: err.reason.clone(),
                    }
                };

                let mut w = octets::OctetsMut::with_slice(&mut scratch);
                if frame.to_bytes(&mut w).is_ok() {
                    let len = w.off();
                    out.extend_from_slice(&scratch[..len]);
                }
            }

            return Ok(false);
        }

        if self.ack_eliciting_pending_ack && !self.rx_pkt_nums.is_empty() {
            let frame = Frame::Ack {
                ack_delay: 0,
                ranges: self.rx_pkt_nums.clone(),
                ecn_counts: None,
            };

            let mut w = octets::OctetsMut::with_slice(&mut scratch);
            if frame.to_bytes(&mut w).is_ok() {
                let len = w.off();
                out.extend_from_slice(&scratch[..len]);
                self.ack_eliciting_pending_ack = false;
            }
        }

        if !self.pending_resets.is_empty() {
            let resets = std::mem::take(&mut self.pending_resets);
            for (stream_id, error_code, final_size) in resets {
                let frame = Frame::ResetStream {
                    stream_id,
                    error_code,
                    final_size,
                };

                let mut w = octets::OctetsMut::with_slice(&mut scratch);
                if frame.to_bytes(&mut w).is_ok() {
                    let len = w.off();
                    out.extend_from_slice(&scratch[..len]);
                    ack_eliciting = true;
                }
            }
        }

        if let Some(limit) = self.pending_data_blocked.take() {
            let frame = Frame::DataBlocked { limit };
            let mut w = octets::OctetsMut::with_slice(&mut scratch);
            if frame.to_bytes(&mut w).is_ok() {
                let len = w.off();
                out.extend_from_slice(&scratch[..len]);
                ack_eliciting = true;
            }
        }

        let ids: Vec<u64> = self.stream_order.iter().copied().collect();
        let n = ids.len();

        for i in 0..n {
            let idx = (self.next_rr_index + i) % n.max(1);
            let Some(&stream_id) = ids.get(idx) else { continue };

            let remaining = budget.saturating_sub(out.len());
            if remaining < 4 {
                break;
            }

            let Some(stream) = self.streams.get_mut(&stream_id) else { continue };
            if !stream.send.has_pending() {
                continue;
            }

            let header_room = 1 + octets::varint_len(stream_id) + octets::varint_len(remaining as u64) + 8;
            let data_room = remaining.saturating_sub(header_room);
            if data_room == 0 && stream.send.fin_offset().is_none() {
                continue;
            }

            let mut data = vec![0u8; data_room];
            let (len, offset, fin) = stream.send.emit(&mut data);
            data.truncate(len);

            if len == 0 && !fin {
                continue;
            }

            let frame = Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            };

            let mut w = octets::OctetsMut::with_slice(&mut scratch);
            if frame.to_bytes(&mut w).is_ok() {
                let flen = w.off();
                out.extend_from_slice(&scratch[..flen]);
                ack_eliciting = true;
            }
        }

        if n > 0 {
            self.next_rr_index = (self.next_rr_index + 1) % n;
        }

        if self.max_data_local.should_update() {
            let new_limit = self.max_data_local.extend();
            let frame = Frame::MaxData { max: new_limit };
            let mut w = octets::OctetsMut::with_slice(&mut scratch);
            if frame.to_bytes(&mut w).is_ok() {
                let len = w.off();
                out.extend_from_slice(&scratch[..len]);
                ack_eliciting = true;
            }
        }

        for stream_id in ids {
            let Some(stream) = self.streams.get_mut(&stream_id) else { continue };
            if stream.recv_window.should_update() {
                let new_limit = stream.recv_window.extend();
                let frame = Frame::MaxStreamData {
                    stream_id,
                    max: new_limit,
                };
                let mut w = octets::OctetsMut::with_slice(&mut scratch);
                if frame.to_bytes(&mut w).is_ok() {
                    let len = w.off();
                    out.extend_from_slice(&scratch[..len]);
                    ack_eliciting = true;
                }
            }
        }

        Ok(ack_eliciting)
    }

    /// The instant the driver should next call [`Self::on_timeout`], as
    /// a duration from "now" (the last timestamp this connection was
    /// told about). `None` means no timer is currently armed.
    pub fn timeout(&self) -> Option<Duration> {
        if self.state == State::Closed {
            return None;
        }

        let idle_at = self
            .last_rx_ack_eliciting
            .unwrap_or(self.now)
            .checked_add(self.idle_timeout)?;

        let mut next = idle_at;

        if let Some(loss_at) = self.recovery.loss_detection_timer() {
            next = next.min(loss_at);
        }

        if self.state == State::Draining {
            let pto = self.recovery.rtt.pto_base() * DRAINING_PTO_MULTIPLE;
            next = next.min(self.now + pto);
        }

        Some(next.saturating_duration_since(self.now))
    }

    /// Called by the driver once the duration [`Self::timeout`] last
    /// returned has elapsed. This is the one place in this core allowed
    /// to read the system clock (see the `now` field's doc comment):
    /// the external API contract gives it no other way to learn how
    /// much time has actually passed.
    pub fn on_timeout(&mut self) {
        if self.state == State::Closed {
            return;
        }

        self.now = Instant::now();

        let idle_at = self.last_rx_ack_eliciting.unwrap_or(self.now) + self.idle_timeout;
        if self.now >= idle_at {
            debug!("{:?} idle timeout", self.scid);
            let err = ConnectionError {
                is_app: false,
                error_code: Error::IdleTimeout.to_wire(),
                reason: Vec::new(),
            };
            self.events.connection_closed(&err);
            self.state = State::Closed;
            self.qlog_state_updated(State::Closed);
            return;
        }

        if self.state == State::Draining {
            let pto = self.recovery.rtt.pto_base() * DRAINING_PTO_MULTIPLE;
            if let Some(entered) = self.last_rx_ack_eliciting {
                if self.now.saturating_duration_since(entered) >= pto {
                    self.state = State::Closed;
                    self.qlog_state_updated(State::Closed);
                    return;
                }
            } else {
                self.state = State::Closed;
                self.qlog_state_updated(State::Closed);
                return;
            }
        }

        let (lost, should_probe) = self.recovery.on_loss_detection_timeout(self.now);
        for sent in &lost {
            self.retransmit_packet(sent.pkt_num);
        }

        if should_probe {
            // A true PTO: ask the next `send` to include at least a PING
            // so the connection doesn't stall waiting for peer action.
            self.ack_eliciting_pending_ack = self.ack_eliciting_pending_ack || true;
        }
    }

    fn qlog_packet_sent(&mut self, pn: u64, len: usize) {
        #[cfg(feature = "qlog")]
        if let Some(streamer) = self.qlog.as_mut() {
            let _ = streamer.add_event(
                "quic:packet_sent",
                qlog::events::EventData::PacketSent(qlog::events::quic::PacketSent {
                    header: qlog::events::quic::PacketHeader {
                        packet_type: qlog::events::quic::PacketType::OneRtt,
                        packet_number: Some(pn),
                        length: Some(len.min(u16::MAX as usize) as u16),
                        ..Default::default()
                    },
                    frames: None,
                }),
            );
        }
        #[cfg(not(feature = "qlog"))]
        let _ = (pn, len);
    }

    fn qlog_packet_received(&mut self, pn: u64, len: usize) {
        #[cfg(feature = "qlog")]
        if let Some(streamer) = self.qlog.as_mut() {
            let _ = streamer.add_event(
                "quic:packet_received",
                qlog::events::EventData::PacketReceived(qlog::events::quic::PacketReceived {
                    header: qlog::events::quic::PacketHeader {
                        packet_type: qlog::events::quic::PacketType::OneRtt,
                        packet_number: Some(pn),
                        length: Some(len.min(u16::MAX as usize) as u16),
                        ..Default::default()
                    },
                    frames: None,
                }),
            );
        }
        #[cfg(not(feature = "qlog"))]
        let _ = (pn, len);
    }

    fn qlog_packets_lost(&mut self, lost: &[crate::recovery::Sent]) {
        #[cfg(feature = "qlog")]
        if let Some(streamer) = self.qlog.as_mut() {
            for sent in lost {
                let _ = streamer.add_event(
                    "quic:packet_lost",
                    qlog::events::EventData::PacketLost(qlog::events::quic::PacketLost {
                        header: qlog::events::quic::PacketHeader {
                            packet_type: qlog::events::quic::PacketType::OneRtt,
                            packet_number: Some(sent.pkt_num),
                            ..Default::default()
                        },
                    }),
                );
            }
        }
        #[cfg(not(feature = "qlog"))]
        let _ = lost;
    }

    fn qlog_state_updated(&mut self, new: State) {
        #[cfg(feature = "qlog")]
        if let Some(streamer) = self.qlog.as_mut() {
            let new = match new {
                State::Idle => qlog::events::quic::ConnectionState::Idle,
                State::Handshake => qlog::events::quic::ConnectionState::Handshake,
                State::Established => qlog::events::quic::ConnectionState::Established,
                State::Closing => qlog::events::quic::ConnectionState::Closing,
                State::Draining => qlog::events::quic::ConnectionState::Draining,
                State::Closed => qlog::events::quic::ConnectionState::Closed,
            };
            let _ = streamer.add_event(
                "quic:connection_state_updated",
                qlog::events::EventData::ConnectionStateUpdated(
                    qlog::events::quic::ConnectionStateUpdated { new },
                ),
            );
        }
        #[cfg(not(feature = "qlog"))]
        let _ = new;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A no-op protection used only to exercise the orchestrator's
    /// header/payload bookkeeping without a real AEAD; it does not
    /// remove any protection because the test packets below are never
    /// actually "protected" to begin with.
    struct PlainTextProtection;

    impl PacketProtection for PlainTextProtection {
        fn open_header(
            &self, _sample: &[u8], _first_byte: &mut u8, pn_bytes: &mut [u8],
        ) -> Result<usize> {
            // Treat the leading byte of `pn_bytes` as an already-
            // cleartext 1-byte packet number.
            let _ = pn_bytes;
            Ok(1)
        }

        fn open_payload(&self, _pn: u64, _header: &[u8], payload: &mut [u8]) -> Result<usize> {
            Ok(payload.len())
        }

        fn seal_header(
            &self, _sample: &[u8], _first_byte: &mut u8, _pn_bytes: &mut [u8],
        ) -> Result<()> {
            Ok(())
        }

        fn seal_payload(&self, _pn: u64, _header: &[u8], payload: &mut [u8]) -> Result<usize> {
            Ok(payload.len())
        }
    }

    fn test_pair() -> (Connection, Connection, SocketAddr, SocketAddr) {
        let _ = env_logger::builder().is_test(true).try_init();

        let client_addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let server_addr: SocketAddr = "127.0.0.1:4433".parse().unwrap();

        let mut config = Config::new().unwrap();
        config.set_initial_max_data(100_000);
        config.set_initial_max_stream_data_bidi_local(64_000);
        config.set_initial_max_stream_data_bidi_remote(64_000);
        config.set_initial_max_streams_bidi(16);

        let client_scid = ConnectionId::from_vec(vec![1; 8]);
        let server_scid = ConnectionId::from_vec(vec![2; 8]);

        let mut client =
            Connection::new(client_scid, client_addr, server_addr, &config, false);
        let mut server =
            Connection::new(server_scid, server_addr, client_addr, &config, true);

        client.set_packet_protection(Box::new(PlainTextProtection));
        server.set_packet_protection(Box::new(PlainTextProtection));

        // Each side addresses packets to the other's scid.
        client.dcid = ConnectionId::from_vec(vec![2; 8]);
        server.dcid = ConnectionId::from_vec(vec![1; 8]);

        (client, server, client_addr, server_addr)
    }

    #[test]
    fn stream_data_flows_end_to_end() {
        let (mut client, mut server, from, to) = test_pair();
        let now = Instant::now();

        let sid = client.open_stream(true).unwrap();
        client.stream_send(sid, b"hello", true).unwrap();

        let mut out = [0u8; 1500];
        let (len, _) = client.send(&mut out).unwrap();

        server
            .recv(&mut out[..len], RecvInfo { from, to, now })
            .unwrap();

        assert!(server.is_established());

        let readable: Vec<u64> = server.readable().collect();
        assert_eq!(readable, vec![sid]);

        let mut buf = [0u8; 16];
        let (n, fin) = server.stream_recv(sid, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(fin);
    }

    #[test]
    fn peer_initiated_stream_over_limit_is_rejected() {
        let (mut client, mut server, from, to) = test_pair();
        let now = Instant::now();

        server.max_streams_bidi_remote = 0;

        let sid = client.open_stream(true).unwrap();
        client.stream_send(sid, b"x", true).unwrap();

        let mut out = [0u8; 1500];
        let (len, _) = client.send(&mut out).unwrap();

        let err = server.recv(&mut out[..len], RecvInfo { from, to, now });
        assert!(err.is_err());
    }

    #[test]
    fn idle_timeout_closes_silently() {
        let (mut client, _server, _from, _to) = test_pair();
        client.idle_timeout = Duration::from_millis(0);
        client.last_rx_ack_eliciting = Some(client.now);

        client.on_timeout();
        assert!(client.is_closed());
    }

    #[test]
    fn local_close_emits_connection_close_then_drains() {
        let (mut client, _server, _from, _to) = test_pair();
        client.close(false, 0x0, b"bye").unwrap();

        let mut out = [0u8; 1500];
        let (len, _) = client.send(&mut out).unwrap();
        assert!(len > 0);
        assert!(client.is_draining());

        // A second call has nothing left to emit.
        assert_eq!(client.send(&mut out), Err(Error::Done));
    }

    #[test]
    fn stream_shutdown_emits_reset_stream_and_drops_buffered_bytes() {
        let (mut client, mut server, from, to) = test_pair();
        let now = Instant::now();

        let sid = client.open_stream(true).unwrap();
        client.stream_send(sid, b"unsent", false).unwrap();
        client.stream_shutdown(sid, 0x42).unwrap();

        let mut out = [0u8; 1500];
        let (len, _) = client.send(&mut out).unwrap();
        server
            .recv(&mut out[..len], RecvInfo { from, to, now })
            .unwrap();

        let stream = server.streams.get(&sid).unwrap();
        assert_eq!(stream.recv_state, stream::HalfState::Reset);

        // Further local writes on a reset stream are rejected.
        assert!(client.stream_send(sid, b"more", false).is_err());
    }
}
