// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! A token-bucket pacer (spec.md §4.6): maintain a bucket at rate
//! `cwnd / smoothed_rtt`, capped at 100ms of tokens, consulted before each
//! packet emission.

use std::time::Duration;
use std::time::Instant;

use crate::recovery::rtt::RttStats;

const MAX_BURST: Duration = Duration::from_millis(100);

/// Tracks how many bytes may be released right now, and when the next
/// byte becomes available if the bucket is empty.
#[derive(Clone, Debug)]
pub struct Pacer {
    enabled: bool,
    available_bytes: f64,
    last_update: Option<Instant>,
}

impl Pacer {
    pub fn new(enabled: bool) -> Self {
        Pacer {
            enabled,
            available_bytes: 0.0,
            last_update: None,
        }
    }

    /// The current pacing rate, in bytes/second, given the congestion
    /// window and smoothed RTT.
    fn rate(&self, congestion_window: usize, rtt_stats: &RttStats) -> f64 {
        let srtt = rtt_stats.smoothed_rtt.as_secs_f64().max(0.001);
        congestion_window as f64 / srtt
    }

    /// Refills the bucket for elapsed time since the last call, capping it
    /// at 100ms worth of tokens at the current rate.
    fn refill(&mut self, now: Instant, congestion_window: usize, rtt_stats: &RttStats) {
        let rate = self.rate(congestion_window, rtt_stats);
        let cap = rate * MAX_BURST.as_secs_f64();

        if let Some(last) = self.last_update {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            self.available_bytes = (self.available_bytes + rate * elapsed).min(cap);
        } else {
            self.available_bytes = cap;
        }

        self.last_update = Some(now);
    }

    /// Returns `true` if `size` bytes may be sent right now without
    /// exceeding the pacing rate, refilling the bucket for elapsed time
    /// first. The caller still owes a separate congestion-window check;
    /// this only throttles the *rate* of emission within that window.
    pub fn can_send(
        &mut self, now: Instant, size: usize, congestion_window: usize, rtt_stats: &RttStats,
    ) -> bool {
        if !self.enabled {
            return true;
        }

        self.refill(now, congestion_window, rtt_stats);
        self.available_bytes >= size as f64
    }

    /// Consumes `size` bytes' worth of tokens after a packet of that size
    /// has actually been sent.
    pub fn on_packet_sent(
        &mut self, now: Instant, size: usize, congestion_window: usize, rtt_stats: &RttStats,
    ) {
        if !self.enabled {
            return;
        }

        self.refill(now, congestion_window, rtt_stats);
        self.available_bytes = (self.available_bytes - size as f64).max(0.0);
    }

    /// How long until `size` more bytes are available to send, or `None`
    /// if they already are.
    pub fn next_send_time(
        &mut self, now: Instant, size: usize, congestion_window: usize, rtt_stats: &RttStats,
    ) -> Option<Instant> {
        if !self.enabled {
            return None;
        }

        self.refill(now, congestion_window, rtt_stats);
        if self.available_bytes >= size as f64 {
            return None;
        }

        let deficit = size as f64 - self.available_bytes;
        let rate = self.rate(congestion_window, rtt_stats);
        let wait = Duration::from_secs_f64((deficit / rate).max(0.0));
        Some(now + wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtt_of(ms: u64) -> RttStats {
        let mut r = RttStats::new();
        r.update(Duration::from_millis(ms), Duration::ZERO);
        r
    }

    #[test]
    fn disabled_pacer_never_throttles() {
        let mut p = Pacer::new(false);
        let rtt = rtt_of(100);
        assert!(p.can_send(Instant::now(), 1_000_000, 1200, &rtt));
    }

    #[test]
    fn bucket_starts_full_up_to_100ms_cap() {
        let mut p = Pacer::new(true);
        let rtt = rtt_of(100);
        let now = Instant::now();
        // rate = 12000 bytes / 0.1s = 120_000 B/s; 100ms cap = 12000 bytes.
        assert!(p.can_send(now, 12_000, 12_000, &rtt));
        assert!(!p.can_send(now, 12_001, 12_000, &rtt));
    }

    #[test]
    fn consumes_tokens_and_refills_over_time() {
        let mut p = Pacer::new(true);
        let rtt = rtt_of(100);
        let now = Instant::now();
        p.on_packet_sent(now, 12_000, 12_000, &rtt);
        assert!(!p.can_send(now, 1, 12_000, &rtt));

        let later = now + Duration::from_millis(10);
        assert!(p.can_send(later, 1, 12_000, &rtt));
    }

    #[test]
    fn next_send_time_is_none_when_tokens_available() {
        let mut p = Pacer::new(true);
        let rtt = rtt_of(100);
        let now = Instant::now();
        assert_eq!(p.next_send_time(now, 100, 12_000, &rtt), None);
    }
}
