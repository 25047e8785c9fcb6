// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! Loss detection and recovery orchestration (spec.md §4.7), driving the
//! congestion controller (§4.6), RTT estimator (§3), and pacer (§4.6)
//! together from one `on_packet_sent` / `on_ack_received` /
//! `detect_lost_packets` surface.
//!
//! One [`Recovery`] instance covers the packet-number space this core
//! actually ships data traffic on. The Initial/Handshake spaces exist only
//! to get a TLS handshake across (out of scope per spec.md §1); this core
//! tracks their packet numbers for packet-number-space bookkeeping in
//! [`crate::connection`] without a separate congestion/loss instance per
//! space.

pub mod congestion;
pub mod pacer;
pub mod rtt;

use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

use crate::ranges::RangeSet;

pub use congestion::Congestion;
pub use congestion::MAX_DATAGRAM_SIZE;
pub use pacer::Pacer;
pub use rtt::RttStats;

/// The packet-threshold for the loss-detection algorithm (spec.md §4.7):
/// a still-in-flight packet is lost once a packet numbered at least this
/// much higher has been acknowledged.
const PACKET_THRESHOLD: u64 = 3;

/// A sent-packet record, retained until acknowledged or declared lost
/// (spec.md §3 "Sent-packet record").
#[derive(Clone, Debug)]
pub struct Sent {
    pub pkt_num: u64,
    pub size: usize,
    pub time_sent: Instant,
    pub ack_eliciting: bool,
    pub in_flight: bool,
}

/// The result of processing one ACK frame: which packets it newly
/// acknowledged, and which packets loss detection subsequently declared
/// lost.
#[derive(Debug, Default)]
pub struct AckOutcome {
    pub newly_acked: Vec<Sent>,
    pub newly_lost: Vec<Sent>,
    pub rtt_updated: bool,
}

pub struct Recovery {
    sent_packets: VecDeque<Sent>,
    largest_acked: Option<u64>,
    pub rtt: RttStats,
    pub congestion: Congestion,
    pub pacer: Pacer,
    loss_time: Option<Instant>,
    time_of_last_sent_ack_eliciting: Option<Instant>,
}

impl Default for Recovery {
    fn default() -> Self {
        Recovery {
            sent_packets: VecDeque::new(),
            largest_acked: None,
            rtt: RttStats::new(),
            congestion: Congestion::new(),
            pacer: Pacer::new(true),
            loss_time: None,
            time_of_last_sent_ack_eliciting: None,
        }
    }
}

impl Recovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.congestion.bytes_in_flight()
    }

    pub fn congestion_window(&self) -> usize {
        self.congestion.congestion_window()
    }

    /// Whether the pacer + congestion window together currently admit
    /// sending `size` more bytes.
    pub fn can_send(&mut self, now: Instant, size: usize) -> bool {
        self.congestion.can_send(size)
            && self
                .pacer
                .can_send(now, size, self.congestion.congestion_window(), &self.rtt)
    }

    pub fn on_packet_sent(&mut self, pkt_num: u64, size: usize, ack_eliciting: bool, now: Instant) {
        if ack_eliciting {
            self.congestion.on_packet_sent(size);
            self.pacer
                .on_packet_sent(now, size, self.congestion.congestion_window(), &self.rtt);
            self.time_of_last_sent_ack_eliciting = Some(now);
        }

        self.sent_packets.push_back(Sent {
            pkt_num,
            size,
            time_sent: now,
            ack_eliciting,
            in_flight: ack_eliciting,
        });
    }

    /// Processes one ACK frame's ranges (largest-to-smallest per spec.md
    /// §4.3), then runs loss detection, per spec.md §4.7.
    pub fn on_ack_received(
        &mut self, ranges: &RangeSet, ack_delay: Duration, now: Instant,
    ) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        let largest_in_frame = ranges.largest();

        let mut acked_bytes = 0usize;
        let mut largest_newly_acked: Option<(u64, Instant)> = None;

        self.sent_packets.retain(|p| {
            if ranges.contains(p.pkt_num) {
                if p.in_flight {
                    acked_bytes += p.size;
                }

                if largest_newly_acked.map(|(pn, _)| p.pkt_num > pn).unwrap_or(true) {
                    largest_newly_acked = Some((p.pkt_num, p.time_sent));
                }

                outcome.newly_acked.push(p.clone());
                false
            } else {
                true
            }
        });

        if let Some(largest) = largest_in_frame {
            let is_new_largest = self.largest_acked.map(|la| largest > la).unwrap_or(true);
            self.largest_acked = Some(self.largest_acked.map_or(largest, |la| la.max(largest)));

            if is_new_largest {
                if let Some((_, sent_time)) = largest_newly_acked {
                    let raw_rtt = now.saturating_duration_since(sent_time);
                    self.rtt.update(raw_rtt, ack_delay);
                    outcome.rtt_updated = true;
                }
            }
        }

        if let Some((_, sent_time)) = largest_newly_acked {
            self.congestion.on_packets_acked(acked_bytes, sent_time);
        }

        outcome.newly_lost = self.detect_lost_packets(now);
        outcome
    }

    /// Scans in-flight packets for the packet- and time-threshold loss
    /// conditions (spec.md §4.7), removes them, and signals one
    /// congestion event if any were lost. Sets the loss timer for packets
    /// that are close to, but not yet past, the time threshold.
    pub fn detect_lost_packets(&mut self, now: Instant) -> Vec<Sent> {
        let largest_acked = match self.largest_acked {
            Some(v) => v,
            None => return Vec::new(),
        };

        let loss_delay = self.rtt.loss_time_threshold();
        let mut lost = Vec::new();
        let mut next_loss_time: Option<Instant> = None;

        self.sent_packets.retain(|p| {
            if !p.in_flight || p.pkt_num > largest_acked {
                return true;
            }

            let packet_threshold_hit = largest_acked >= p.pkt_num + PACKET_THRESHOLD;
            let time_threshold_at = p.time_sent + loss_delay;
            let time_threshold_hit = now >= time_threshold_at;

            if packet_threshold_hit || time_threshold_hit {
                lost.push(p.clone());
                false
            } else {
                next_loss_time = Some(
                    next_loss_time.map_or(time_threshold_at, |t| t.min(time_threshold_at)),
                );
                true
            }
        });

        self.loss_time = next_loss_time;

        if !lost.is_empty() {
            let lost_bytes: usize = lost.iter().filter(|p| p.in_flight).map(|p| p.size).sum();
            log::debug!(
                "{} packets lost ({} bytes): {:?}",
                lost.len(),
                lost_bytes,
                lost.iter().map(|p| p.pkt_num).collect::<Vec<_>>()
            );
            self.congestion.on_packets_lost(lost_bytes, now);
        }

        lost
    }

    /// The instant the loss-detection timer should next fire, i.e. the
    /// earlier of the loss timer set by [`Self::detect_lost_packets`] and
    /// a probe-timeout derived from the last ack-eliciting send.
    pub fn loss_detection_timer(&self) -> Option<Instant> {
        if let Some(t) = self.loss_time {
            return Some(t);
        }

        self.time_of_last_sent_ack_eliciting
            .map(|t| t + self.rtt.pto_base())
    }

    /// Called when the loss-detection timer fires; re-runs loss detection
    /// and, if nothing was newly lost (a true PTO, not a loss timer that
    /// raced the timeout), returns `true` to tell the caller to probe.
    pub fn on_loss_detection_timeout(&mut self, now: Instant) -> (Vec<Sent>, bool) {
        let lost = self.detect_lost_packets(now);
        let should_probe = lost.is_empty();
        (lost, should_probe)
    }

    /// Persistent congestion: an extended silence across a validated
    /// period collapses the window back to the minimum (spec.md §4.6).
    /// `period` is the caller's configured persistent-congestion duration
    /// (conventionally a small multiple of the PTO).
    pub fn detect_persistent_congestion(&mut self, now: Instant, period: Duration) {
        let threshold = self.time_of_last_sent_ack_eliciting;
        if let Some(last) = threshold {
            if now.saturating_duration_since(last) >= period && self.sent_packets.is_empty() {
                self.congestion.on_persistent_congestion();
            }
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.sent_packets.iter().filter(|p| p.in_flight).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_threshold_loss_scenario() {
        // spec.md §8 scenario 3: send 10..14 (1200 bytes each), ack 14 only.
        let mut r = Recovery::new();
        let t0 = Instant::now();

        for pn in 10..=14u64 {
            r.on_packet_sent(pn, 1200, true, t0);
        }
        assert_eq!(r.bytes_in_flight(), 1200 * 5);

        let mut ranges = RangeSet::new(16);
        ranges.insert(14..15);

        let outcome = r.on_ack_received(&ranges, Duration::ZERO, t0 + Duration::from_millis(1));

        // 10 and 11 are lost (14 >= pn+3); 12 and 13 are not yet.
        let lost_pns: Vec<u64> = outcome.newly_lost.iter().map(|p| p.pkt_num).collect();
        assert_eq!(lost_pns, vec![10, 11]);
        assert_eq!(r.bytes_in_flight(), 1200 * 2 /* 12,13 */);
    }

    #[test]
    fn largest_acked_is_non_decreasing_and_acked_once() {
        let mut r = Recovery::new();
        let t0 = Instant::now();
        for pn in 0..5u64 {
            r.on_packet_sent(pn, 100, true, t0);
        }

        let mut first = RangeSet::new(8);
        first.insert(0..3);
        r.on_ack_received(&first, Duration::ZERO, t0);
        assert_eq!(r.largest_acked, Some(2));

        let mut second = RangeSet::new(8);
        second.insert(0..5); // re-acks 0..3, which must be ignored (already removed)
        let outcome = r.on_ack_received(&second, Duration::ZERO, t0);
        let newly: Vec<u64> = outcome.newly_acked.iter().map(|p| p.pkt_num).collect();
        assert_eq!(newly, vec![3, 4]);
        assert_eq!(r.largest_acked, Some(4));
    }

    #[test]
    fn rtt_updates_only_from_largest_newly_acked() {
        let mut r = Recovery::new();
        let t0 = Instant::now();
        r.on_packet_sent(0, 100, true, t0);
        r.on_packet_sent(1, 100, true, t0 + Duration::from_millis(5));

        let mut ranges = RangeSet::new(8);
        ranges.insert(0..2);
        let outcome = r.on_ack_received(&ranges, Duration::ZERO, t0 + Duration::from_millis(50));
        assert!(outcome.rtt_updated);
        // latest_rtt reflects packet 1 (the largest acked), not packet 0.
        assert_eq!(r.rtt.latest_rtt, Duration::from_millis(45));
    }

    #[test]
    fn bytes_in_flight_never_exceeds_unacked_sent_sum() {
        let mut r = Recovery::new();
        let t0 = Instant::now();
        r.on_packet_sent(0, 500, true, t0);
        r.on_packet_sent(1, 500, true, t0);
        assert_eq!(r.bytes_in_flight(), 1000);
        let mut ranges = RangeSet::new(8);
        ranges.insert(0..1);
        r.on_ack_received(&ranges, Duration::ZERO, t0);
        assert_eq!(r.bytes_in_flight(), 500);
    }
}
