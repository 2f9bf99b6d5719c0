//! Source Port Rotation
//!
//! A dialer bound to a fixed local port can find that port stuck in a
//! lingering-close state left by a previous run. On each local bind failure
//! the counter is decremented and the port moves up by one; once the budget is
//! spent the original port is restored and the budget refilled.

use tracing::info;

/// Bounded countdown of alternate source-port attempts
#[derive(Debug, Clone)]
pub struct RetryCounter {
    original_port: u16,
    current_port: u16,
    max_retries: u32,
    remaining: u32,
}

/// What the rotation did after a local bind failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    /// Moved to the next port up
    Advanced(u16),
    /// Budget exhausted; back on the configured port
    Reverted(u16),
}

impl RetryCounter {
    /// Create a counter starting on `original_port` with `max_retries` alternates
    pub fn new(original_port: u16, max_retries: u32) -> Self {
        let max_retries = max_retries.max(1);
        Self {
            original_port,
            current_port: original_port,
            max_retries,
            remaining: max_retries,
        }
    }

    /// Port the next attempt should bind to
    pub fn current_port(&self) -> u16 {
        self.current_port
    }

    pub fn original_port(&self) -> u16 {
        self.original_port
    }

    /// Alternate attempts left before reverting
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Record one local bind failure and pick the port for the next attempt
    pub fn on_bind_failure(&mut self) -> Rotation {
        self.remaining = self.remaining.saturating_sub(1);

        // Port 0 means the OS picks; rotating it makes no sense.
        if self.remaining > 0 && self.original_port != 0 {
            if let Some(next) = self.current_port.checked_add(1) {
                self.current_port = next;
                return Rotation::Advanced(next);
            }
        }

        self.revert();
        Rotation::Reverted(self.current_port)
    }

    /// Go back to the configured port and refill the budget
    pub fn revert(&mut self) {
        if self.current_port != self.original_port {
            info!(
                "Reverting source port {} -> {}",
                self.current_port, self.original_port
            );
        }
        self.current_port = self.original_port;
        self.remaining = self.max_retries;
    }
}
