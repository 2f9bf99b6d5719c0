//! Service Lifecycle States

use std::fmt;

/// Lifecycle of a listener service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    /// Trying to bind the listening socket
    Starting,
    /// Bound and accepting peers
    Running,
    /// Bind failed on contention, waiting before the next attempt
    Retrying,
    /// Flushing peers and releasing the socket
    Stopping,
    /// Terminal; the loop task has finished
    Stopped,
}

impl ServiceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Stopped)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Starting => "STARTING",
            ServiceState::Running => "RUNNING",
            ServiceState::Retrying => "RETRYING",
            ServiceState::Stopping => "STOPPING",
            ServiceState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a dialer service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialerState {
    /// No live connection; waiting for the next attempt
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// Holding a live connection
    Connected,
    /// Terminal; cancellation was observed and the loop exited
    Canceled,
    /// Terminal; the loop hit an unclassified error and returned it
    Failed,
}

impl DialerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DialerState::Canceled | DialerState::Failed)
    }
}

impl fmt::Display for DialerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DialerState::Disconnected => "DISCONNECTED",
            DialerState::Connecting => "CONNECTING",
            DialerState::Connected => "CONNECTED",
            DialerState::Canceled => "CANCELED",
            DialerState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}
