// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! RTT estimation (spec.md §3 "RTT estimator", RFC 9002 §5).

use std::time::Duration;

const INITIAL_RTT: Duration = Duration::from_millis(333);

/// `latest_rtt` / `smoothed_rtt` (EWMA α=1/8) / `rttvar` (EWMA β=1/4) /
/// `min_rtt`, updated only from newly-acknowledged largest-acked samples.
#[derive(Clone, Copy, Debug)]
pub struct RttStats {
    pub latest_rtt: Duration,
    pub smoothed_rtt: Duration,
    pub rttvar: Duration,
    pub min_rtt: Duration,
    first_sample_taken: bool,
}

impl Default for RttStats {
    fn default() -> Self {
        RttStats {
            latest_rtt: Duration::ZERO,
            smoothed_rtt: INITIAL_RTT,
            rttvar: INITIAL_RTT / 2,
            min_rtt: Duration::ZERO,
            first_sample_taken: false,
        }
    }
}

impl RttStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in one RTT sample from an ACK that newly acknowledged the
    /// largest packet number seen so far, per spec.md §4.7: the peer's
    /// reported ack delay is subtracted from the raw sample, clamped so
    /// the result never drops below `min_rtt`.
    pub fn update(&mut self, raw_rtt: Duration, ack_delay: Duration) {
        if self.min_rtt.is_zero() || raw_rtt < self.min_rtt {
            self.min_rtt = raw_rtt;
        }

        let adjusted = if raw_rtt.saturating_sub(self.min_rtt) > ack_delay {
            raw_rtt - ack_delay
        } else {
            raw_rtt
        };

        self.latest_rtt = raw_rtt;

        if !self.first_sample_taken {
            self.smoothed_rtt = adjusted;
            self.rttvar = adjusted / 2;
            self.first_sample_taken = true;
            return;
        }

        let rttvar_sample = abs_diff(self.smoothed_rtt, adjusted);
        self.rttvar = (self.rttvar * 3 + rttvar_sample) / 4;
        self.smoothed_rtt = (self.smoothed_rtt * 7 + adjusted) / 8;
    }

    /// The probe-timeout base interval (RFC 9002 §6.2.1):
    /// `smoothed_rtt + max(4*rttvar, 1ms)`.
    pub fn pto_base(&self) -> Duration {
        self.smoothed_rtt + (self.rttvar * 4).max(Duration::from_millis(1))
    }

    /// The loss-detection time threshold (spec.md §4.7):
    /// `max(9/8 * smoothed_rtt, 1ms)`.
    pub fn loss_time_threshold(&self) -> Duration {
        (self.smoothed_rtt * 9 / 8).max(Duration::from_millis(1))
    }
}

fn abs_diff(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_smoothed_and_rttvar() {
        let mut rtt = RttStats::new();
        rtt.update(Duration::from_millis(100), Duration::from_millis(0));
        assert_eq!(rtt.smoothed_rtt, Duration::from_millis(100));
        assert_eq!(rtt.rttvar, Duration::from_millis(50));
        assert_eq!(rtt.min_rtt, Duration::from_millis(100));
    }

    #[test]
    fn ack_delay_is_subtracted_but_not_below_min_rtt() {
        let mut rtt = RttStats::new();
        rtt.update(Duration::from_millis(100), Duration::from_millis(0));
        // ack_delay larger than (raw - min_rtt) must not push adjusted below min_rtt.
        rtt.update(Duration::from_millis(100), Duration::from_millis(50));
        assert!(rtt.smoothed_rtt >= Duration::from_millis(50));
    }

    #[test]
    fn ewma_moves_toward_new_samples() {
        let mut rtt = RttStats::new();
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        rtt.update(Duration::from_millis(200), Duration::ZERO);
        assert!(rtt.smoothed_rtt > Duration::from_millis(100));
        assert!(rtt.smoothed_rtt < Duration::from_millis(200));
    }
}
