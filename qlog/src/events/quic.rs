//! The subset of the qlog QUIC event schema this workspace emits: packets
//! sent/received/lost, recovery metric snapshots, and the two lifecycle
//! events (`connection_state_updated`, `connection_closed`).

use serde::Serialize;
use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketType {
    Initial,
    Handshake,
    #[serde(rename = "0RTT")]
    ZeroRtt,
    #[default]
    OneRtt,
    Retry,
    VersionNegotiation,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dcid: Option<String>,
}

/// A QUIC or HTTP/3 frame, logged only with the fields useful for
/// debugging, not a bit-exact re-encoding of the wire frame.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "frame_type", rename_all = "snake_case")]
pub enum QuicFrame {
    Padding,
    Ping,
    Ack {
        acked_ranges: Vec<(u64, u64)>,
    },
    ResetStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: u64,
        error_code: u64,
    },
    Crypto {
        offset: u64,
        length: u64,
    },
    Stream {
        stream_id: u64,
        offset: u64,
        length: u64,
        fin: bool,
    },
    MaxData {
        maximum: u64,
    },
    MaxStreamData {
        stream_id: u64,
        maximum: u64,
    },
    DataBlocked {
        limit: u64,
    },
    StreamDataBlocked {
        stream_id: u64,
        limit: u64,
    },
    ConnectionClose {
        error_code: u64,
        reason: String,
    },
    Datagram {
        length: u64,
    },
    HandshakeDone,
    Unknown {
        frame_type_value: u64,
    },
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct PacketSent {
    pub header: PacketHeader,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<SmallVec<[QuicFrame; 1]>>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct PacketReceived {
    pub header: PacketHeader,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<SmallVec<[QuicFrame; 1]>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PacketLost {
    pub header: PacketHeader,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsUpdated {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_rtt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smoothed_rtt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_rtt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_variance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub congestion_window: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssthresh: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_in_flight: Option<u64>,
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Handshake,
    Established,
    Closing,
    Draining,
    Closed,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConnectionStateUpdated {
    pub new: ConnectionState,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConnectionClosed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub trigger: &'static str,
}
