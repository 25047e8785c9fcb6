// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! NewReno congestion control (spec.md §4.6, RFC 9002 §7.3).

use std::time::Instant;

/// The maximum datagram size this core assumes when sizing the minimum
/// congestion window, per spec.md §6's `initial_mtu` default.
pub const MAX_DATAGRAM_SIZE: usize = 1200;

const MINIMUM_WINDOW: usize = 2 * MAX_DATAGRAM_SIZE;
const INITIAL_WINDOW: usize = 10 * MAX_DATAGRAM_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    SlowStart,
    CongestionAvoidance,
    Recovery,
}

/// `congestion_window`, `ssthresh`, `bytes_in_flight`,
/// `recovery_start_time`, plus the NewReno state machine driving them.
#[derive(Clone, Debug)]
pub struct Congestion {
    state: State,
    congestion_window: usize,
    ssthresh: usize,
    bytes_in_flight: usize,
    recovery_start_time: Option<Instant>,
    mss: usize,
}

impl Default for Congestion {
    fn default() -> Self {
        Congestion {
            state: State::SlowStart,
            congestion_window: INITIAL_WINDOW,
            ssthresh: usize::MAX,
            bytes_in_flight: 0,
            recovery_start_time: None,
            mss: MAX_DATAGRAM_SIZE,
        }
    }
}

impl Congestion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn congestion_window(&self) -> usize {
        self.congestion_window
    }

    pub fn ssthresh(&self) -> usize {
        self.ssthresh
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    pub fn in_recovery(&self, sent_time: Instant) -> bool {
        match self.recovery_start_time {
            Some(t) => sent_time <= t,
            None => false,
        }
    }

    /// Whether `bytes_in_flight + extra` still fits under the window —
    /// the gate spec.md §8's flow-control-safety invariant describes as
    /// "emissions the pacer admits".
    pub fn can_send(&self, extra: usize) -> bool {
        self.bytes_in_flight + extra <= self.congestion_window
    }

    pub fn on_packet_sent(&mut self, size: usize) {
        self.bytes_in_flight += size;
    }

    /// Called once per ACK frame processed, after loss detection has run,
    /// with the total bytes newly acknowledged and the send time of the
    /// packet that was actually lost (if any) used to decide whether this
    /// event is within an ongoing recovery period.
    pub fn on_packets_acked(&mut self, acked_bytes: usize, largest_newly_acked_sent: Instant) {
        if acked_bytes == 0 {
            return;
        }

        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(acked_bytes);

        if self.in_recovery(largest_newly_acked_sent) {
            // RFC 9002 §7.3.2: no window growth while still in recovery.
            return;
        }

        match self.state {
            State::SlowStart => {
                self.congestion_window += acked_bytes;
                if self.congestion_window >= self.ssthresh {
                    self.state = State::CongestionAvoidance;
                }
            }
            State::CongestionAvoidance => {
                self.congestion_window += self.mss * acked_bytes / self.congestion_window;
            }
            State::Recovery => {
                self.state = State::CongestionAvoidance;
            }
        }
    }

    pub fn on_packets_lost(&mut self, lost_bytes: usize, now: Instant) {
        if lost_bytes == 0 {
            return;
        }

        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(lost_bytes);

        if self.in_recovery(now) {
            return;
        }

        self.congestion_event(now);
    }

    fn congestion_event(&mut self, now: Instant) {
        self.ssthresh = (self.congestion_window / 2).max(MINIMUM_WINDOW);
        self.congestion_window = self.ssthresh;
        self.recovery_start_time = Some(now);
        self.state = State::Recovery;

        log::debug!(
            "congestion event: cwnd={} ssthresh={}",
            self.congestion_window, self.ssthresh
        );
    }

    /// Persistent congestion (spec.md §4.6): collapse to the minimum
    /// window and resume slow start; `ssthresh` is left untouched.
    pub fn on_persistent_congestion(&mut self) {
        self.congestion_window = MINIMUM_WINDOW;
        self.state = State::SlowStart;
        self.recovery_start_time = None;

        log::debug!("persistent congestion: cwnd reset to {}", MINIMUM_WINDOW);
    }

    pub fn update_mss(&mut self, mss: usize) {
        self.mss = mss;
    }

    #[cfg(test)]
    pub fn force_state_for_test(&mut self, window: usize, ssthresh: usize, state_avoidance: bool) {
        self.congestion_window = window;
        self.ssthresh = ssthresh;
        self.state = if state_avoidance {
            State::CongestionAvoidance
        } else {
            State::SlowStart
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_start_grows_by_acked_bytes() {
        let mut cc = Congestion::new();
        let before = cc.congestion_window();
        let t = Instant::now();
        cc.on_packet_sent(1000);
        cc.on_packets_acked(1000, t);
        assert_eq!(cc.congestion_window(), before + 1000);
    }

    #[test]
    fn congestion_event_halves_window_and_sets_ssthresh() {
        let mut cc = Congestion::new();
        cc.force_state_for_test(20_000, usize::MAX, true);
        cc.on_packet_sent(1200);
        let now = Instant::now();
        cc.on_packets_lost(1200, now);
        assert_eq!(cc.ssthresh(), (20_000usize / 2).max(MINIMUM_WINDOW));
        assert_eq!(cc.congestion_window(), cc.ssthresh());
    }

    #[test]
    fn no_further_reduction_while_in_recovery() {
        let mut cc = Congestion::new();
        cc.force_state_for_test(20_000, usize::MAX, true);
        let t0 = Instant::now();
        cc.on_packet_sent(2400);
        cc.on_packets_lost(1200, t0);
        let after_first = cc.congestion_window();

        // A second loss from a packet sent before recovery_start_time must
        // not shrink the window again.
        cc.on_packets_lost(1200, t0);
        assert_eq!(cc.congestion_window(), after_first);
    }

    #[test]
    fn persistent_congestion_resets_to_minimum_and_slow_start() {
        let mut cc = Congestion::new();
        cc.force_state_for_test(50_000, 10_000, true);
        cc.on_persistent_congestion();
        assert_eq!(cc.congestion_window(), MINIMUM_WINDOW);
        // ssthresh must be left unchanged per spec.md §4.6.
        assert_eq!(cc.ssthresh(), 10_000);
    }

    #[test]
    fn bytes_in_flight_never_exceeds_sum_of_unacked_sent() {
        let mut cc = Congestion::new();
        cc.on_packet_sent(1000);
        cc.on_packet_sent(1000);
        assert_eq!(cc.bytes_in_flight(), 2000);
        cc.on_packets_acked(1000, Instant::now());
        assert_eq!(cc.bytes_in_flight(), 1000);
    }

    #[test]
    fn congestion_avoidance_growth_is_sub_linear() {
        let mut cc = Congestion::new();
        cc.force_state_for_test(100_000, 1, true); // already past ssthresh
        cc.on_packet_sent(1200);
        cc.on_packets_acked(1200, Instant::now());
        // +MSS * acked / cwnd, much smaller than the slow-start +acked growth.
        assert!(cc.congestion_window() < 100_000 + 1200);
        assert!(cc.congestion_window() > 100_000);
    }
}
