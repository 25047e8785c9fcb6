//! Event payloads. `quic` covers the QUIC event space this workspace emits;
//! an HTTP/3-specific space is folded into it rather than split out, since
//! this crate only needs the subset quiche actually produces.

pub mod quic;

use serde::Serialize;

/// The tagged union of every event `data` payload this crate knows how to
/// produce. One variant per qlog event name `quiche` emits.
#[derive(Serialize)]
#[serde(untagged)]
pub enum EventData {
    PacketSent(quic::PacketSent),
    PacketReceived(quic::PacketReceived),
    PacketLost(quic::PacketLost),
    MetricsUpdated(quic::MetricsUpdated),
    ConnectionStateUpdated(quic::ConnectionStateUpdated),
    ConnectionClosed(quic::ConnectionClosed),
}
