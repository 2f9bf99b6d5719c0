//! tcplink Library
//!
//! Resilient TCP endpoint services: a listener that keeps a registry of
//! connected peers and a dialer that keeps reconnecting to one remote,
//! both stopped through a shared cancellation hierarchy.

pub mod config;
pub mod connection;
pub mod context;
pub mod metrics;
pub mod netutil;
pub mod shutdown;

pub use config::Config;
pub use connection::{
    ConnectionHandler, ConnectionSession, DialerService, DialerState, ListenerService,
    ServiceState,
};
pub use context::ServiceContext;
pub use metrics::Metrics;
pub use shutdown::{CancellationController, ShutdownReport};

/// Common error type for tcplink
pub type Result<T> = anyhow::Result<T>;
