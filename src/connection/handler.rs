//! Connection Handlers
//!
//! Services know nothing about what travels over their connections. Callers
//! inject a [`ConnectionHandler`] at construction; it is told when a session
//! opens, when bytes arrive and when the session closes.

use bytes::BytesMut;
use tracing::{debug, info};

use super::session::{CloseReason, ConnectionSession};

/// Callbacks invoked by listener and dialer services for each session.
///
/// `on_data` receives the session's accumulation buffer with the new bytes
/// already appended. Whatever the handler leaves in it is kept for the next
/// call, so partial frames can wait for the rest of their bytes.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_connect(&self, _session: &ConnectionSession) {}

    fn on_data(&self, session: &ConnectionSession, buffer: &mut BytesMut);

    fn on_close(&self, _session: &ConnectionSession, _reason: &CloseReason) {}
}

/// Logs arrivals and discards the payload
#[derive(Debug, Clone)]
pub struct LoggingHandler {
    name: String,
}

impl LoggingHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ConnectionHandler for LoggingHandler {
    fn on_connect(&self, session: &ConnectionSession) {
        info!("{}: session open with {}", self.name, session.key());
    }

    fn on_data(&self, session: &ConnectionSession, buffer: &mut BytesMut) {
        debug!(
            "{}: data received from {} ({} bytes)",
            self.name,
            session.key(),
            buffer.len()
        );
        buffer.clear();
    }

    fn on_close(&self, session: &ConnectionSession, reason: &CloseReason) {
        info!("{}: session with {} {}", self.name, session.key(), reason);
    }
}

/// Writes every received byte straight back to the peer
#[derive(Debug, Clone, Default)]
pub struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn on_data(&self, session: &ConnectionSession, buffer: &mut BytesMut) {
        let data = buffer.split().freeze();
        session.send(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::session::Transport;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_logging_handler_drains_buffer() {
        let (transport, _driver) = Transport::channel(CancellationToken::new());
        let session = ConnectionSession::new(
            "127.0.0.1:5000".parse().unwrap(),
            "127.0.0.1:9000".parse().unwrap(),
            transport,
        );
        let mut buffer = BytesMut::from(&b"ping"[..]);
        LoggingHandler::new("test").on_data(&session, &mut buffer);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_echo_handler_consumes_buffer() {
        let (transport, _driver) = Transport::channel(CancellationToken::new());
        let session = ConnectionSession::new(
            "127.0.0.1:5000".parse().unwrap(),
            "127.0.0.1:9000".parse().unwrap(),
            transport,
        );
        let mut buffer = BytesMut::from(&b"ping"[..]);
        EchoHandler.on_data(&session, &mut buffer);
        assert!(buffer.is_empty());
    }
}
