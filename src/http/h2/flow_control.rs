//! HTTP/2 flow control
//!
//! This module implements flow control as defined in RFC 9113 Section 5.2.
//!
//! A [`FlowControlWindow`] is the sender's view of how much it may still
//! send. A [`RecvWindow`] is the receiver's view: it shrinks as DATA
//! arrives, and credit is only handed back (via WINDOW_UPDATE) once the
//! application has consumed the bytes, so a slow reader pushes back on the
//! peer instead of growing a buffer.

use super::error::{Error, Result};
use super::settings::MAX_WINDOW_SIZE;
use super::DEFAULT_INITIAL_WINDOW_SIZE;

/// Flow control window
///
/// Signed: a SETTINGS_INITIAL_WINDOW_SIZE decrease can push an active
/// stream's window below zero (RFC 9113 Section 6.9.2).
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    initial_size: u32,
    current_size: i64,
}

impl FlowControlWindow {
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: initial_size as i64,
        }
    }

    pub fn size(&self) -> i64 {
        self.current_size
    }

    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Bytes that may be sent right now
    pub fn available(&self) -> usize {
        self.current_size.max(0) as usize
    }

    pub fn has_capacity(&self) -> bool {
        self.current_size > 0
    }

    /// Take up to `amount` bytes of capacity, returning how much was taken
    pub fn consume(&mut self, amount: usize) -> usize {
        let taken = amount.min(self.available());
        self.current_size -= taken as i64;
        taken
    }

    /// Apply a WINDOW_UPDATE increment
    ///
    /// Growing past 2^31-1 is a FLOW_CONTROL_ERROR; the caller decides
    /// whether that is connection or stream scoped.
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        let new_size = self.current_size + increment as i64;
        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "window size {} exceeds 2^31-1",
                new_size
            )));
        }
        self.current_size = new_size;
        Ok(self.current_size)
    }

    /// Remove capacity without a size check
    pub fn decrease(&mut self, amount: usize) {
        self.current_size -= amount as i64;
    }

    /// Apply a new SETTINGS_INITIAL_WINDOW_SIZE by its difference
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let delta = new_initial_size as i64 - self.initial_size as i64;
        let new_current = self.current_size + delta;
        if new_current > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "window size {} exceeds 2^31-1 after settings change",
                new_current
            )));
        }
        self.initial_size = new_initial_size;
        self.current_size = new_current;
        Ok(())
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive side of a flow-control window
///
/// `window + buffered + released == target` at all times, where `buffered`
/// is data received but not yet consumed by the application.
#[derive(Debug, Clone)]
pub struct RecvWindow {
    window: FlowControlWindow,
    target: u32,
    released: u32,
}

impl RecvWindow {
    /// A window that starts at `initial` (what the peer assumes) and is
    /// topped up towards `target`
    pub fn new(initial: u32, target: u32) -> Self {
        RecvWindow {
            window: FlowControlWindow::with_initial_size(initial),
            target,
            released: 0,
        }
    }

    pub fn size(&self) -> i64 {
        self.window.size()
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// Account for an inbound DATA frame, padding included
    ///
    /// The peer is never allowed to exceed the window, so an oversized
    /// frame is rejected rather than clamped.
    pub fn receive(&mut self, amount: u32) -> Result<()> {
        if amount as i64 > self.window.size() {
            return Err(Error::FlowControl(format!(
                "received {} bytes with only {} bytes of window",
                amount,
                self.window.size()
            )));
        }
        self.window.decrease(amount as usize);
        Ok(())
    }

    /// Record consumed bytes; returns an increment to announce once enough
    /// credit has accumulated
    pub fn release(&mut self, amount: u32) -> Option<u32> {
        self.released = self.released.saturating_add(amount);
        self.pending_update()
    }

    /// Increment due because the window is below half of its target
    pub fn pending_update(&mut self) -> Option<u32> {
        let missing = self.target as i64 - self.window.size();
        if self.window.size() >= self.target as i64 / 2 || missing <= 0 {
            return None;
        }
        let increment = (self.released as i64).min(missing) as u32;
        if increment == 0 {
            return None;
        }
        self.released -= increment;
        // the window stays at or below target, so this cannot overflow
        self.window.current_size += increment as i64;
        Some(increment)
    }

    /// Raise the window straight to its target, returning the increment
    /// to announce (used once after the handshake for the connection window)
    pub fn open_to_target(&mut self) -> Option<u32> {
        let missing = self.target as i64 - self.window.size();
        if missing <= 0 {
            return None;
        }
        self.window.current_size += missing;
        Some(missing as u32)
    }
}

/// Send and receive windows of one stream or of the whole connection
#[derive(Debug, Clone)]
pub struct FlowControl {
    pub send: FlowControlWindow,
    pub recv: RecvWindow,
}

impl FlowControl {
    pub fn new(send_initial: u32, recv_initial: u32, recv_target: u32) -> Self {
        FlowControl {
            send: FlowControlWindow::with_initial_size(send_initial),
            recv: RecvWindow::new(recv_initial, recv_target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_control_window() {
        let mut window = FlowControlWindow::new();
        assert_eq!(window.size(), 65535);
        assert!(window.has_capacity());

        assert_eq!(window.consume(1000), 1000);
        assert_eq!(window.size(), 64535);

        assert_eq!(window.increase(1000).unwrap(), 65535);
    }

    #[test]
    fn test_partial_consume() {
        let mut window = FlowControlWindow::with_initial_size(100);
        assert_eq!(window.consume(150), 100);
        assert_eq!(window.size(), 0);
        assert_eq!(window.consume(10), 0);
        assert!(!window.has_capacity());
    }

    #[test]
    fn test_increase_overflow() {
        let mut window = FlowControlWindow::with_initial_size(MAX_WINDOW_SIZE);
        assert!(matches!(window.increase(1), Err(Error::FlowControl(_))));
        assert_eq!(window.size(), MAX_WINDOW_SIZE as i64);
    }

    #[test]
    fn test_window_accounting() {
        // remaining = initial - sent + increments, whatever the interleaving
        let mut window = FlowControlWindow::with_initial_size(1000);
        let mut sent = 0usize;
        let mut increments = 0i64;
        for (send, update) in [(300, 0), (900, 200), (50, 0), (1000, 1000)] {
            sent += window.consume(send);
            if update > 0 {
                window.increase(update).unwrap();
                increments += update as i64;
            }
            assert_eq!(window.size(), 1000 - sent as i64 + increments);
            assert!(window.size() >= 0);
        }
    }

    #[test]
    fn test_settings_shrink_goes_negative_by_at_most_the_shrink() {
        let mut window = FlowControlWindow::with_initial_size(65535);
        window.consume(60000);
        window.update_initial_size(1000).unwrap();
        assert_eq!(window.size(), 5535 - 64535);
        assert_eq!(window.available(), 0);

        window.update_initial_size(65535).unwrap();
        assert_eq!(window.size(), 5535);
    }

    #[test]
    fn test_recv_window_rejects_overrun() {
        let mut recv = RecvWindow::new(100, 100);
        recv.receive(60).unwrap();
        assert!(matches!(recv.receive(41), Err(Error::FlowControl(_))));
        recv.receive(40).unwrap();
        assert_eq!(recv.size(), 0);
    }

    #[test]
    fn test_recv_window_credit_follows_consumption() {
        let mut recv = RecvWindow::new(1000, 1000);
        recv.receive(800).unwrap();
        // nothing consumed yet, so no credit even though the window is low
        assert_eq!(recv.pending_update(), None);

        assert_eq!(recv.release(300), Some(300));
        assert_eq!(recv.size(), 500);
        // back at half, further releases accumulate
        assert_eq!(recv.release(100), None);
        recv.receive(200).unwrap();
        assert_eq!(recv.release(100), Some(200));
        assert_eq!(recv.size(), 500);
    }

    #[test]
    fn test_recv_window_grows_to_larger_target() {
        let mut recv = RecvWindow::new(65535, 1 << 20);
        assert_eq!(recv.size(), 65535);
        recv.receive(1).unwrap();
        assert_eq!(recv.release(1), Some(1));
        assert_eq!(recv.size(), 65535);

        assert_eq!(recv.open_to_target(), Some((1 << 20) - 65535));
        assert_eq!(recv.size(), 1 << 20);
        assert_eq!(recv.open_to_target(), None);
    }
}
