// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! Connection configuration (spec.md §6): per-endpoint defaults and the
//! setter methods a driver uses to override them before calling
//! [`crate::Connection::new`].

/// Tunables shared by every connection created from this `Config`.
///
/// Mirrors the construction style of TLS-library configs in the wider
/// ecosystem: build one `Config`, tune it with `set_*` calls, and share
/// it (cheaply cloned) across every connection an endpoint opens.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) max_idle_timeout: u64,
    pub(crate) max_udp_payload_size: u64,
    pub(crate) initial_max_data: u64,
    pub(crate) initial_max_stream_data_bidi_local: u64,
    pub(crate) initial_max_stream_data_bidi_remote: u64,
    pub(crate) initial_max_stream_data_uni: u64,
    pub(crate) initial_max_streams_bidi: u64,
    pub(crate) initial_max_streams_uni: u64,
    pub(crate) ack_delay_exponent: u64,
    pub(crate) max_ack_delay: u64,
    pub(crate) active_connection_id_limit: u64,
    pub(crate) disable_active_migration: bool,

    pub(crate) enable_pacing: bool,
    pub(crate) max_send_udp_payload_size: usize,

    pub(crate) qpack_max_table_capacity: u64,
    pub(crate) qpack_blocked_streams: u64,

    pub(crate) h3_max_field_section_size: Option<u64>,
    pub(crate) h3_max_concurrent_streams: u64,

    pub(crate) webtransport_enabled: bool,
    pub(crate) webtransport_max_sessions: u64,

    pub(crate) qlog_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_idle_timeout: 0,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            active_connection_id_limit: 2,
            disable_active_migration: false,

            enable_pacing: true,
            max_send_udp_payload_size: 1200,

            // Defaults to 0: this core does not depend on dynamic-table
            // state to decode a field section unless a driver opts in,
            // resolving the static-vs-dynamic-table ambiguity in favor of
            // never blocking a stream on encoder-stream delivery order by
            // default (spec.md §9, Open Question).
            qpack_max_table_capacity: 0,
            qpack_blocked_streams: 0,

            h3_max_field_section_size: None,
            h3_max_concurrent_streams: 100,

            webtransport_enabled: false,
            webtransport_max_sessions: 0,

            qlog_enabled: false,
        }
    }
}

impl Config {
    pub fn new() -> crate::Result<Config> {
        Ok(Config::default())
    }

    pub fn max_idle_timeout(&self) -> u64 {
        self.max_idle_timeout
    }

    pub fn set_max_idle_timeout(&mut self, v: u64) {
        self.max_idle_timeout = v;
    }

    pub fn set_max_recv_udp_payload_size(&mut self, v: usize) {
        self.max_udp_payload_size = v as u64;
    }

    pub fn max_send_udp_payload_size(&self) -> usize {
        self.max_send_udp_payload_size
    }

    pub fn set_max_send_udp_payload_size(&mut self, v: usize) {
        self.max_send_udp_payload_size = v;
    }

    pub fn initial_max_data(&self) -> u64 {
        self.initial_max_data
    }

    pub fn set_initial_max_data(&mut self, v: u64) {
        self.initial_max_data = v;
    }

    pub fn initial_max_stream_data_bidi_local(&self) -> u64 {
        self.initial_max_stream_data_bidi_local
    }

    pub fn set_initial_max_stream_data_bidi_local(&mut self, v: u64) {
        self.initial_max_stream_data_bidi_local = v;
    }

    pub fn initial_max_stream_data_bidi_remote(&self) -> u64 {
        self.initial_max_stream_data_bidi_remote
    }

    pub fn set_initial_max_stream_data_bidi_remote(&mut self, v: u64) {
        self.initial_max_stream_data_bidi_remote = v;
    }

    pub fn initial_max_stream_data_uni(&self) -> u64 {
        self.initial_max_stream_data_uni
    }

    pub fn set_initial_max_stream_data_uni(&mut self, v: u64) {
        self.initial_max_stream_data_uni = v;
    }

    pub fn initial_max_streams_bidi(&self) -> u64 {
        self.initial_max_streams_bidi
    }

    pub fn set_initial_max_streams_bidi(&mut self, v: u64) {
        self.initial_max_streams_bidi = v;
    }

    pub fn initial_max_streams_uni(&self) -> u64 {
        self.initial_max_streams_uni
    }

    pub fn set_initial_max_streams_uni(&mut self, v: u64) {
        self.initial_max_streams_uni = v;
    }

    pub fn set_ack_delay_exponent(&mut self, v: u64) {
        self.ack_delay_exponent = v;
    }

    pub fn set_max_ack_delay(&mut self, v: u64) {
        self.max_ack_delay = v;
    }

    pub fn set_active_connection_id_limit(&mut self, v: u64) {
        self.active_connection_id_limit = v;
    }

    pub fn set_disable_active_migration(&mut self, v: bool) {
        self.disable_active_migration = v;
    }

    pub fn enable_pacing(&mut self, v: bool) {
        self.enable_pacing = v;
    }

    pub fn set_qpack_max_table_capacity(&mut self, v: u64) {
        self.qpack_max_table_capacity = v;
    }

    pub fn set_qpack_blocked_streams(&mut self, v: u64) {
        self.qpack_blocked_streams = v;
    }

    pub fn set_h3_max_field_section_size(&mut self, v: u64) {
        self.h3_max_field_section_size = Some(v);
    }

    pub fn set_h3_max_concurrent_streams(&mut self, v: u64) {
        self.h3_max_concurrent_streams = v;
    }

    pub fn enable_webtransport(&mut self, v: bool) {
        self.webtransport_enabled = v;
    }

    pub fn set_webtransport_max_sessions(&mut self, v: u64) {
        self.webtransport_max_sessions = v;
    }

    /// Records whether this endpoint wants qlog output. `Connection` itself
    /// never reads this: it owns no file path or writer at construction
    /// time, so a driver that wants qlog still has to call
    /// [`crate::Connection::set_qlog`] with its own `Write` after
    /// `Connection::new`. This flag exists so that driver, which may build
    /// its `Config` in one place and construct connections in another, has
    /// somewhere to carry that decision in between.
    pub fn enable_qlog(&mut self, v: bool) {
        self.qlog_enabled = v;
    }

    /// Whether [`Self::enable_qlog`] was called with `true`, for a driver
    /// to consult when deciding whether to call `Connection::set_qlog`.
    pub fn qlog_enabled(&self) -> bool {
        self.qlog_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_forbid_dynamic_table_dependence() {
        let cfg = Config::new().unwrap();
        assert_eq!(cfg.qpack_max_table_capacity, 0);
        assert_eq!(cfg.qpack_blocked_streams, 0);
    }

    #[test]
    fn setters_round_trip() {
        let mut cfg = Config::new().unwrap();
        cfg.set_max_idle_timeout(30_000);
        cfg.set_initial_max_data(1_000_000);
        cfg.enable_webtransport(true);
        cfg.set_webtransport_max_sessions(4);

        assert_eq!(cfg.max_idle_timeout, 30_000);
        assert_eq!(cfg.initial_max_data, 1_000_000);
        assert!(cfg.webtransport_enabled);
        assert_eq!(cfg.webtransport_max_sessions, 4);
    }
}
