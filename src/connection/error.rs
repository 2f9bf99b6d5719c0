//! Failure Classification
//!
//! Every I/O failure seen by a service loop is sorted into one of three
//! classes. Transient failures are retried forever, local resource failures
//! drive the bind backoff / source-port rotation, and everything else is fatal.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// How a service loop should react to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Refused, timed out, reset: retry after the normal delay
    Transient,
    /// Address or port unusable on this host
    LocalResource,
    /// Anything else: log, clean up and surface to the caller
    Fatal,
}

impl FailureClass {
    /// Label used for metrics and log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::LocalResource => "local_resource",
            FailureClass::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an I/O error by its kind
pub fn classify(error: &io::Error) -> FailureClass {
    match error.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::Interrupted => FailureClass::Transient,
        io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable => FailureClass::LocalResource,
        _ => FailureClass::Fatal,
    }
}

/// Errors produced by a single outbound connection attempt
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The remote host name could not be resolved (or resolved to nothing)
    #[error("failed to resolve {endpoint}: {source}")]
    Resolve {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    /// The local source address could not be bound
    #[error("failed to bind local source {local}: {source}")]
    Bind {
        local: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// The connect call itself failed
    #[error("failed to connect to {remote}: {source}")]
    Connect {
        remote: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// No answer within the configured connect timeout
    #[error("connection to {remote} timed out after {timeout:?}")]
    Timeout { remote: SocketAddr, timeout: Duration },
}

impl ConnectError {
    /// Failure class driving the dialer's retry policy
    pub fn class(&self) -> FailureClass {
        match self {
            ConnectError::Resolve { .. } | ConnectError::Timeout { .. } => FailureClass::Transient,
            ConnectError::Bind { source, .. } | ConnectError::Connect { source, .. } => {
                classify(source)
            }
        }
    }
}

/// Errors produced by the peer registry
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A live session already holds this `ip:port` key
    #[error("peer {0} is already registered")]
    AlreadyRegistered(String),
}
