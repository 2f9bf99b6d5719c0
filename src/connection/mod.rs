//! Connection Management Module
//!
//! Listener and dialer services, the sessions they own and the registry that
//! tracks inbound peers.

pub mod dialer;
pub mod error;
pub mod handler;
pub mod listener;
pub mod registry;
pub mod retry;
pub mod session;
pub mod state;

pub use dialer::DialerService;
pub use error::{classify, ConnectError, FailureClass, RegistryError};
pub use handler::{ConnectionHandler, EchoHandler, LoggingHandler};
pub use listener::ListenerService;
pub use registry::PeerRegistry;
pub use retry::{RetryCounter, Rotation};
pub use session::{peer_key, CloseReason, ConnectionSession, Transport};
pub use state::{DialerState, ServiceState};

/// Scratch buffer size for each socket read unless configured otherwise
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
