// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! Connection configuration for a scripted [`crate::client`] run: the
//! handful of knobs an action script needs (peer address, idle timeout,
//! QPACK limits) layered over [`quiche::Config`]'s defaults.

/// Target and timing for one `h3i` run, built with the same chained-setter
/// style as [`quiche::Config`] itself.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) host_port: String,
    pub(crate) idle_timeout_ms: u64,
    pub(crate) max_field_section_size: Option<u64>,
    pub(crate) qpack_max_table_capacity: u64,
    pub(crate) max_concurrent_streams: u64,
    pub(crate) qlog_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host_port: String::new(),
            idle_timeout_ms: 5_000,
            max_field_section_size: None,
            qpack_max_table_capacity: 0,
            max_concurrent_streams: 100,
            qlog_enabled: false,
        }
    }
}

impl Config {
    /// Starts a default-valued `Config`; call the `with_*` setters and
    /// finish with [`Self::build`].
    pub fn new() -> Config {
        Config::default()
    }

    pub fn with_host_port(mut self, host_port: String) -> Self {
        self.host_port = host_port;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout_ms: u64) -> Self {
        self.idle_timeout_ms = idle_timeout_ms;
        self
    }

    pub fn with_max_field_section_size(mut self, v: u64) -> Self {
        self.max_field_section_size = Some(v);
        self
    }

    pub fn with_qpack_max_table_capacity(mut self, v: u64) -> Self {
        self.qpack_max_table_capacity = v;
        self
    }

    pub fn with_max_concurrent_streams(mut self, v: u64) -> Self {
        self.max_concurrent_streams = v;
        self
    }

    /// Requests that [`crate::client::sync_client::connect`] stream qlog
    /// events for this run to stderr (see [`quiche::Config::enable_qlog`]).
    /// A no-op when the `qlog` feature isn't compiled in.
    pub fn with_qlog(mut self, v: bool) -> Self {
        self.qlog_enabled = v;
        self
    }

    /// Validates the script's target is at least well-formed and freezes
    /// the builder. `sync_client::connect` still does the actual DNS
    /// resolution: a hostname that doesn't resolve is a connect-time
    /// failure, not a build-time one.
    pub fn build(self) -> Result<Config, String> {
        if self.host_port.is_empty() {
            return Err("host_port must be set".to_string());
        }

        Ok(self)
    }

    /// Builds the [`quiche::Config`] this run's connection is constructed
    /// from.
    pub(crate) fn to_quiche_config(&self) -> quiche::Result<quiche::Config> {
        let mut cfg = quiche::Config::new()?;
        cfg.set_max_idle_timeout(self.idle_timeout_ms);
        cfg.set_initial_max_data(10_000_000);
        cfg.set_initial_max_stream_data_bidi_local(1_000_000);
        cfg.set_initial_max_stream_data_bidi_remote(1_000_000);
        cfg.set_initial_max_stream_data_uni(1_000_000);
        cfg.set_initial_max_streams_bidi(100);
        cfg.set_initial_max_streams_uni(100);
        cfg.set_qpack_max_table_capacity(self.qpack_max_table_capacity);
        cfg.set_h3_max_concurrent_streams(self.max_concurrent_streams);
        cfg.enable_qlog(self.qlog_enabled);

        if let Some(size) = self.max_field_section_size {
            cfg.set_h3_max_field_section_size(size);
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_host_port() {
        assert!(Config::new().build().is_err());
        assert!(Config::new()
            .with_host_port("example.com:443".to_string())
            .build()
            .is_ok());
    }
}
