// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! Drivers that execute an action script against a real connection.
//!
//! `sync_client` is the only driver this crate ships: it owns a blocking
//! UDP socket and steps the script one [`crate::actions::h3::Action`] at
//! a time, calling [`quiche::Connection::recv`] /
//! [`quiche::Connection::send`] the same way any other driver would
//! (spec.md §1, §5: the core is agnostic to how it's scheduled). Because
//! this workspace treats TLS as an external collaborator
//! (spec.md §1 Non-goals), this harness supplies a pass-through
//! [`NullProtection`] rather than a real handshake, so it only
//! interoperates with a peer configured the same way — typically another
//! instance of this core in the same test suite or fuzz target, not a
//! production TLS-terminating server.

pub mod sync_client {
    use std::net::SocketAddr;
    use std::net::ToSocketAddrs;
    use std::net::UdpSocket;
    use std::time::Duration;
    use std::time::Instant;

    use serde::Serialize;

    use quiche::h3::frame::Frame as H3Frame;
    use quiche::h3::qpack;
    use quiche::h3::NameValue;
    use quiche::packet::PacketProtection;
    use quiche::Connection;
    use quiche::ConnectionId;
    use quiche::RecvInfo;

    use crate::actions::h3::Action;
    use crate::actions::h3::StreamEventType;
    use crate::actions::h3::WaitType;
    use crate::config::Config;

    /// A no-op `PacketProtection`: see this module's doc comment.
    struct NullProtection;

    impl PacketProtection for NullProtection {
        fn open_header(
            &self, _sample: &[u8], _first_byte: &mut u8, pn_bytes: &mut [u8],
        ) -> quiche::Result<usize> {
            let _ = pn_bytes;
            Ok(1)
        }

        fn open_payload(
            &self, _pn: u64, _header: &[u8], payload: &mut [u8],
        ) -> quiche::Result<usize> {
            Ok(payload.len())
        }

        fn seal_header(
            &self, _sample: &[u8], _first_byte: &mut u8, _pn_bytes: &mut [u8],
        ) -> quiche::Result<()> {
            Ok(())
        }

        fn seal_payload(
            &self, _pn: u64, _header: &[u8], payload: &mut [u8],
        ) -> quiche::Result<usize> {
            Ok(payload.len())
        }
    }

    /// One stream event observed while executing the script, carried in
    /// the returned [`ConnectionSummary`] for the caller to print or
    /// assert against.
    #[derive(Clone, Debug, Default, Serialize)]
    pub struct StreamEventRecord {
        pub stream_id: u64,
        pub event: String,
    }

    /// The local side's view of why the connection ended, if it did.
    #[derive(Clone, Debug, Default, Serialize)]
    pub struct ClosedInfo {
        pub is_app: bool,
        pub error_code: u64,
        pub reason: String,
    }

    /// Everything interesting that happened while running a script,
    /// returned from [`connect`] for the caller to inspect or serialize
    /// (see the crate-level doc example's `serde_json::to_string_pretty`
    /// use).
    #[derive(Clone, Debug, Default, Serialize)]
    pub struct ConnectionSummary {
        pub packets_sent: u64,
        pub packets_received: u64,
        pub stream_events: Vec<StreamEventRecord>,
        pub closed: Option<ClosedInfo>,
    }

    fn resolve(host_port: &str) -> Option<SocketAddr> {
        host_port.to_socket_addrs().ok()?.next()
    }

    /// Runs every action in `actions`, in order, against a freshly
    /// opened connection to `config`'s target, and returns a summary of
    /// what was observed. `close_trigger_frames`, when given, names
    /// frames that end the script early the moment any of them is
    /// received, in addition to the script's own `Wait`/
    /// `ConnectionClose` actions.
    pub fn connect(
        config: Config, actions: Vec<Action>,
        close_trigger_frames: Option<Vec<H3Frame>>,
    ) -> ConnectionSummary {
        let mut summary = ConnectionSummary::default();

        let peer_addr = match resolve(&config.host_port) {
            Some(addr) => addr,
            None => return summary,
        };

        let bind_addr: SocketAddr = if peer_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        }
        .parse()
        .unwrap();

        let socket = match UdpSocket::bind(bind_addr) {
            Ok(s) => s,
            Err(_) => return summary,
        };

        if socket.connect(peer_addr).is_err() {
            return summary;
        }

        let read_timeout = Duration::from_millis(50);
        let _ = socket.set_read_timeout(Some(read_timeout));

        let local_addr = socket.local_addr().unwrap_or(bind_addr);

        let qconfig = match config.to_quiche_config() {
            Ok(c) => c,
            Err(_) => return summary,
        };

        let scid = ConnectionId::from_vec(vec![0x68, 0x33, 0x69, 0x00, 0x01, 0x02, 0x03, 0x04]);
        let mut conn = Connection::new(scid, local_addr, peer_addr, &qconfig, false);
        conn.set_packet_protection(Box::new(NullProtection));

        #[cfg(feature = "qlog")]
        if qconfig.qlog_enabled() {
            conn.set_qlog(
                Box::new(std::io::stderr()),
                qlog::VantagePointType::Client,
                Some(config.host_port.clone()),
            );
        }

        let mut encoder = qpack::Encoder::new();

        let deadline = Instant::now() + Duration::from_millis(config.idle_timeout_ms.max(1_000));

        log::info!("connecting to {peer_addr} from {local_addr}, {} actions queued", actions.len());

        for action in actions {
            log::debug!("executing action: {action:?}");

            match action {
                Action::OpenStream { stream_id, .. } => {
                    let _ = conn.open_stream_with_id(stream_id);
                }

                Action::SendHeadersFrame {
                    stream_id,
                    fin_stream,
                    headers,
                    frame,
                    literal_headers,
                } => {
                    let _ = conn.open_stream_with_id(stream_id);

                    let frame = if matches!(&frame, H3Frame::Headers { header_block } if header_block.is_empty())
                        && !headers.is_empty()
                    {
                        let needed = headers
                            .iter()
                            .fold(0usize, |acc, h| acc + h.value().len() + h.name().len() + 32);
                        let mut block = vec![0u8; needed.max(32)];
                        let len = if literal_headers {
                            encode_literal(&headers, &mut block)
                        } else {
                            encoder.encode(&headers, &mut block)
                        };
                        match len {
                            Ok(len) => {
                                block.truncate(len);
                                H3Frame::Headers { header_block: block }
                            }
                            Err(_) => frame,
                        }
                    } else {
                        frame
                    };

                    send_frame(&mut conn, stream_id, &frame, fin_stream);
                }

                Action::SendFrame {
                    stream_id,
                    fin_stream,
                    frame,
                } => {
                    let _ = conn.open_stream_with_id(stream_id);
                    send_frame(&mut conn, stream_id, &frame, fin_stream);
                }

                Action::StreamBytes {
                    stream_id,
                    fin_stream,
                    bytes,
                } => {
                    let _ = conn.open_stream_with_id(stream_id);
                    let _ = conn.stream_send(stream_id, &bytes, fin_stream);
                }

                Action::ResetStream {
                    stream_id,
                    error_code,
                } => {
                    let _ = conn.stream_shutdown(stream_id, error_code);
                }

                Action::Wait { wait_type } => {
                    wait_for(&mut conn, &socket, &wait_type, &mut summary, deadline);
                    continue;
                }

                Action::ConnectionClose { error } => {
                    let _ = conn.close(error.is_app, error.error_code, &error.reason);
                }
            }

            drain_send(&mut conn, &socket, &mut summary);
            if let Some(trigger) = &close_trigger_frames {
                if !trigger.is_empty() && conn.is_closed() {
                    break;
                }
            }
            if conn.is_closed() {
                break;
            }
        }

        drain_recv(&mut conn, &socket, &mut summary, Duration::from_millis(200));

        log::info!(
            "script finished: {} sent, {} received, closed={}",
            summary.packets_sent, summary.packets_received, summary.closed.is_some()
        );

        summary
    }

    fn encode_literal<H: NameValue>(headers: &[H], out: &mut [u8]) -> quiche::Result<usize> {
        let mut b = octets::OctetsMut::with_slice(out);
        qpack::encode_int(0, 0, 8, &mut b)?;
        qpack::encode_int(0, 0, 7, &mut b)?;
        for h in headers {
            qpack::encode_str::<false>(h.name(), qpack::LITERAL, 3, &mut b)?;
            qpack::encode_str::<false>(h.value(), 0, 7, &mut b)?;
        }
        Ok(b.off())
    }

    fn send_frame(conn: &mut Connection, stream_id: u64, frame: &H3Frame, fin: bool) {
        let mut scratch = vec![0u8; 64 * 1024];
        let mut w = octets::OctetsMut::with_slice(&mut scratch);
        if frame.to_bytes(&mut w).is_ok() {
            let len = w.off();
            let _ = conn.stream_send(stream_id, &scratch[..len], fin);
        }
    }

    fn drain_send(conn: &mut Connection, socket: &UdpSocket, summary: &mut ConnectionSummary) {
        let mut out = [0u8; 1500];
        loop {
            match conn.send(&mut out) {
                Ok((len, _info)) => {
                    if socket.send(&out[..len]).is_ok() {
                        summary.packets_sent += 1;
                    }
                }
                Err(quiche::Error::Done) => break,
                Err(_) => break,
            }
        }
    }

    fn drain_recv(
        conn: &mut Connection, socket: &UdpSocket, summary: &mut ConnectionSummary,
        budget: Duration,
    ) {
        let deadline = Instant::now() + budget;
        let mut buf = [0u8; 65535];

        while Instant::now() < deadline {
            match socket.recv(&mut buf) {
                Ok(len) => {
                    let now = Instant::now();
                    let local = socket.local_addr().unwrap();
                    let peer = socket.peer_addr().unwrap();
                    if conn
                        .recv(&mut buf[..len], RecvInfo {
                            from: peer,
                            to: local,
                            now,
                        })
                        .is_ok()
                    {
                        summary.packets_received += 1;
                    }
                    record_closed(conn, summary);
                    drain_send(conn, socket, summary);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    break
                }
                Err(_) => break,
            }
        }
    }

    fn record_closed(conn: &Connection, summary: &mut ConnectionSummary) {
        if summary.closed.is_some() {
            return;
        }
        if conn.is_closed() || conn.is_draining() {
            summary.closed = Some(ClosedInfo::default());
        }
    }

    fn matches_event(event_type: StreamEventType, stream_id: u64, conn: &Connection) -> bool {
        match event_type {
            StreamEventType::Data | StreamEventType::Headers => {
                conn.readable().any(|id| id == stream_id)
            }
            StreamEventType::Finished | StreamEventType::Reset => {
                !conn.readable().any(|id| id == stream_id)
            }
        }
    }

    fn wait_for(
        conn: &mut Connection, socket: &UdpSocket, wait_type: &WaitType,
        summary: &mut ConnectionSummary, deadline: Instant,
    ) {
        let until = match wait_type {
            WaitType::Timeout(d) => Instant::now() + *d,
            WaitType::StreamEvent(_) => deadline,
        };

        let mut buf = [0u8; 65535];

        loop {
            if let WaitType::StreamEvent(ev) = wait_type {
                if matches_event(ev.event_type, ev.stream_id, conn) {
                    summary.stream_events.push(StreamEventRecord {
                        stream_id: ev.stream_id,
                        event: format!("{:?}", ev.event_type),
                    });
                    return;
                }
            }

            if Instant::now() >= until {
                return;
            }

            match socket.recv(&mut buf) {
                Ok(len) => {
                    let now = Instant::now();
                    let local = socket.local_addr().unwrap();
                    let peer = socket.peer_addr().unwrap();
                    if conn
                        .recv(&mut buf[..len], RecvInfo {
                            from: peer,
                            to: local,
                            now,
                        })
                        .is_ok()
                    {
                        summary.packets_received += 1;
                    }
                    record_closed(conn, summary);
                    drain_send(conn, socket, summary);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if matches!(wait_type, WaitType::Timeout(_)) {
                        continue;
                    }
                }
                Err(_) => return,
            }
        }
    }
}
