// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved. See LICENSE at the repository root.

//! Connection- and stream-level flow control (spec.md §4.5): send/recv
//! windows, and the update logic that decides when a MAX_DATA,
//! MAX_STREAM_DATA, DATA_BLOCKED or STREAM_DATA_BLOCKED frame is owed.

/// One direction's flow-control accounting, shared in shape between the
/// connection-wide window and each stream's window (spec.md §4.5).
#[derive(Clone, Debug)]
pub struct RecvWindow {
    /// Total bytes the peer is currently allowed to send us.
    max_data: u64,

    /// The window size granted each time we extend `max_data`; also the
    /// yardstick for the half-consumed update trigger below.
    max_window: u64,

    /// Bytes actually received so far.
    received: u64,
}

impl RecvWindow {
    pub fn new(initial_max: u64) -> Self {
        RecvWindow {
            max_data: initial_max,
            max_window: initial_max,
            received: 0,
        }
    }

    pub fn max_data(&self) -> u64 {
        self.max_data
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Accounts for `len` newly received bytes ending at `new_limit`
    /// (the offset one past the last byte of this delivery). Returns
    /// `Err` if the peer exceeded the advertised window.
    pub fn on_recv(&mut self, new_limit: u64) -> crate::Result<()> {
        if new_limit > self.max_data {
            return Err(crate::Error::FlowControl);
        }

        self.received = self.received.max(new_limit);
        Ok(())
    }

    /// Whether a new MAX_DATA/MAX_STREAM_DATA frame should be sent: the
    /// remaining window has shrunk below half of `max_window` (spec.md
    /// §4.5's "update on half-window consumption" rule). When true, the
    /// caller should extend `max_data` by `max_window` and send it.
    pub fn should_update(&self) -> bool {
        self.max_data - self.received < self.max_window / 2
    }

    /// Extends the window by `max_window` and returns the new limit to
    /// advertise on the wire.
    pub fn extend(&mut self) -> u64 {
        self.max_data += self.max_window;
        self.max_data
    }
}

/// The send side's flow-control accounting: how much we're still allowed
/// to send, and whether we're blocked on the peer's window.
#[derive(Clone, Debug, Default)]
pub struct SendWindow {
    max_data: u64,
    sent: u64,
    blocked_at: Option<u64>,
}

impl SendWindow {
    pub fn new(initial_max: u64) -> Self {
        SendWindow {
            max_data: initial_max,
            sent: 0,
            blocked_at: None,
        }
    }

    pub fn max_data(&self) -> u64 {
        self.max_data
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn available(&self) -> u64 {
        self.max_data.saturating_sub(self.sent)
    }

    /// Accounts for `len` bytes about to be sent, ending at `new_offset`.
    /// Returns `Err(FlowControl)` if that would exceed the window; the
    /// caller should instead emit a *_BLOCKED frame and wait.
    pub fn on_send(&mut self, new_offset: u64) -> crate::Result<()> {
        if new_offset > self.max_data {
            return Err(crate::Error::FlowControl);
        }

        self.sent = self.sent.max(new_offset);
        Ok(())
    }

    /// Raises the window after a MAX_DATA/MAX_STREAM_DATA frame arrives
    /// from the peer (monotonic: a stale, smaller update is ignored).
    pub fn update_max(&mut self, new_max: u64) {
        if new_max > self.max_data {
            self.max_data = new_max;
            self.blocked_at = None;
        }
    }

    /// Whether a *_BLOCKED frame is owed: we have data to send beyond the
    /// current window, and haven't already reported blocking at this
    /// exact limit.
    pub fn should_send_blocked(&mut self, wants_to_send: u64) -> Option<u64> {
        if wants_to_send <= self.max_data {
            return None;
        }

        if self.blocked_at == Some(self.max_data) {
            return None;
        }

        self.blocked_at = Some(self.max_data);
        Some(self.max_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_window_rejects_over_limit() {
        let mut w = RecvWindow::new(100);
        assert!(w.on_recv(100).is_ok());
        assert_eq!(w.on_recv(101), Err(crate::Error::FlowControl));
    }

    #[test]
    fn recv_window_extends_after_half_consumed() {
        let mut w = RecvWindow::new(100);
        w.on_recv(40).unwrap();
        assert!(!w.should_update());

        w.on_recv(60).unwrap();
        assert!(w.should_update());

        let new_limit = w.extend();
        assert_eq!(new_limit, 200);
        assert!(w.on_recv(150).is_ok());
        assert!(!w.should_update());
    }

    #[test]
    fn send_window_blocks_once_per_limit() {
        let mut w = SendWindow::new(100);
        assert_eq!(w.should_send_blocked(150), Some(100));
        // Same limit again: already reported, no duplicate BLOCKED frame.
        assert_eq!(w.should_send_blocked(150), None);

        w.update_max(200);
        assert_eq!(w.should_send_blocked(250), Some(200));
    }

    #[test]
    fn send_window_rejects_over_limit_send() {
        let mut w = SendWindow::new(10);
        assert!(w.on_send(10).is_ok());
        assert_eq!(w.on_send(11), Err(crate::Error::FlowControl));
    }

    #[test]
    fn stale_max_update_is_ignored() {
        let mut w = SendWindow::new(100);
        w.update_max(50);
        assert_eq!(w.max_data(), 100);
        w.update_max(150);
        assert_eq!(w.max_data(), 150);
    }
}
