//! Dialer Service
//!
//! Keeps one outbound connection to a fixed remote endpoint alive. Refused
//! and timed out attempts are retried after a fixed delay, local bind failures
//! walk the source port upward (see [`RetryCounter`]), and anything else ends
//! the loop with an error. Cancellation is the only clean way out.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use bytes::Bytes;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::{ConnectError, FailureClass};
use super::handler::ConnectionHandler;
use super::retry::{RetryCounter, Rotation};
use super::session::{self, ConnectionSession, Transport};
use super::state::DialerState;
use super::DEFAULT_READ_BUFFER_SIZE;
use crate::config::DialerConfig;
use crate::context::ServiceContext;
use crate::Result;

/// Maintains one outbound connection with retry
pub struct DialerService {
    shared: Arc<Shared>,
    read_buffer_size: usize,
}

struct Shared {
    name: String,
    config: DialerConfig,
    handler: Arc<dyn ConnectionHandler>,
    context: ServiceContext,
    state: watch::Sender<DialerState>,
    session: Mutex<Option<Arc<ConnectionSession>>>,
    attempts: AtomicU64,
    source_port: AtomicU16,
    started: AtomicBool,
    entered: AtomicBool,
}

/// How the hold on a live connection ended
enum HoldOutcome {
    Dropped,
    Canceled,
}

impl DialerService {
    pub fn new(
        config: DialerConfig,
        handler: Arc<dyn ConnectionHandler>,
        context: ServiceContext,
    ) -> Self {
        let (state, _) = watch::channel(DialerState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                name: config.display_name(),
                source_port: AtomicU16::new(config.local_port),
                config,
                handler,
                context: context.child(),
                state,
                session: Mutex::new(None),
                attempts: AtomicU64::new(0),
                started: AtomicBool::new(false),
                entered: AtomicBool::new(false),
            }),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Schedule the connect/retry loop on the runtime and return at once
    pub fn start(&self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// The connect/retry loop as a future, for callers that spawn it themselves.
    ///
    /// If [`stop`](Self::stop) runs before the future is first polled, the
    /// future resolves to `Ok(())` without connecting.
    pub fn run(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let shared = Arc::clone(&self.shared);
        let read_buffer_size = self.read_buffer_size;
        let first_start = !shared.started.swap(true, Ordering::SeqCst);

        async move {
            if !first_start {
                return Err(anyhow!("{}: dialer was already started", shared.name));
            }
            shared.entered.store(true, Ordering::SeqCst);
            if shared.context.cancel_token().is_cancelled() {
                shared.set_state(DialerState::Canceled);
                return Ok(());
            }
            shared.connect_loop(read_buffer_size).await
        }
    }

    /// Cancel the loop and wait for it to reach a terminal state
    pub async fn stop(&self) {
        info!("{}: stop requested", self.shared.name);
        self.shared.context.cancel_token().cancel();

        if !self.shared.started.swap(true, Ordering::SeqCst) {
            self.shared.set_state(DialerState::Canceled);
            return;
        }

        // A loop future that was built but never polled will not report back
        if !self.shared.entered.load(Ordering::SeqCst) {
            self.shared.set_state(DialerState::Canceled);
            return;
        }

        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }

    pub fn state(&self) -> DialerState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DialerState> {
        self.shared.state.subscribe()
    }

    /// Connection attempts made so far
    pub fn attempts(&self) -> u64 {
        self.shared.attempts.load(Ordering::Relaxed)
    }

    /// Local source port used by the latest attempt
    pub fn source_port(&self) -> u16 {
        self.shared.source_port.load(Ordering::Relaxed)
    }

    /// Current live session, if connected
    pub fn session(&self) -> Option<Arc<ConnectionSession>> {
        self.shared.current_session().as_ref().cloned()
    }

    /// Queue bytes for the remote end; false when not connected
    pub fn send(&self, data: impl Into<Bytes>) -> bool {
        match self.session() {
            Some(session) => session.send(data),
            None => false,
        }
    }

    /// Drop the current connection; the loop reconnects after the retry delay
    pub fn disconnect(&self) {
        if let Some(session) = self.session() {
            info!("{}: closing connection to {}", self.shared.name, session.key());
            session.close();
        }
    }
}

impl Shared {
    fn current_session(&self) -> std::sync::MutexGuard<'_, Option<Arc<ConnectionSession>>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: DialerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("{}: {} -> {}", self.name, previous, state);
        }
    }

    async fn connect_loop(self: Arc<Self>, read_buffer_size: usize) -> Result<()> {
        let cancel = self.context.cancel_token().clone();
        let metrics = Arc::clone(self.context.metrics());
        let remote = self.config.remote();
        let mut ports = RetryCounter::new(
            self.config.local_port,
            self.config.max_source_port_retries,
        );

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            // Start a connection attempt from the current source port
            let source_port = ports.current_port();
            self.source_port.store(source_port, Ordering::Relaxed);
            self.set_state(DialerState::Connecting);
            info!(
                "{}: connecting to {} from {}:{}...",
                self.name,
                remote,
                self.config.local_address.as_deref().unwrap_or("*"),
                source_port
            );
            self.attempts.fetch_add(1, Ordering::Relaxed);
            metrics.record_dial_attempt();

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                connected = self.connect(source_port) => connected,
            };

            match attempt {
                // Connected: stay here until the transport drops
                Ok(stream) => {
                    if let HoldOutcome::Canceled = self.hold(stream, read_buffer_size).await {
                        break Ok(());
                    }
                }
                Err(e) => {
                    // Classify the failure to pick the retry policy
                    let class = e.class();
                    metrics.record_dial_failure(class);
                    self.set_state(DialerState::Disconnected);

                    match class {
                        FailureClass::Transient => {
                            info!("{}: {}", self.name, e);
                        }
                        FailureClass::LocalResource => {
                            warn!(
                                "{}: {} (possibly wrong source IP or source port)",
                                self.name, e
                            );
                            match ports.on_bind_failure() {
                                Rotation::Advanced(port) => {
                                    info!(
                                        "{}: incrementing source port, will retry from port {}",
                                        self.name, port
                                    );
                                    continue;
                                }
                                Rotation::Reverted(port) => {
                                    info!(
                                        "{}: reverting back to original source port {}",
                                        self.name, port
                                    );
                                }
                            }
                        }
                        FailureClass::Fatal => {
                            error!("{}: unknown error, giving up: {}", self.name, e);
                            break Err(anyhow::Error::new(e)
                                .context(format!("{}: unrecoverable connect failure", self.name)));
                        }
                    }
                }
            }

            // Wait before the next attempt, unless canceled
            info!("{}: retry in {:?}", self.name, self.config.retry_delay);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(self.config.retry_delay) => {}
            }
        };

        // Report the terminal state
        match &result {
            Ok(()) => {
                info!("{}: connection canceled, stopping", self.name);
                self.set_state(DialerState::Canceled);
            }
            Err(_) => self.set_state(DialerState::Failed),
        }
        result
    }

    /// Resolve the remote endpoint and try each address in turn
    async fn connect(&self, source_port: u16) -> std::result::Result<TcpStream, ConnectError> {
        let endpoint = self.config.remote();
        let resolved = lookup_host((self.config.remote_address.as_str(), self.config.remote_port))
            .await
            .map_err(|source| ConnectError::Resolve {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let mut last_error = None;
        for remote in resolved {
            match self.connect_to(remote, source_port).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("{}: attempt on {} failed: {}", self.name, remote, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ConnectError::Resolve {
            endpoint: endpoint.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
        }))
    }

    async fn connect_to(
        &self,
        remote: SocketAddr,
        source_port: u16,
    ) -> std::result::Result<TcpStream, ConnectError> {
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|source| ConnectError::Connect { remote, source })?;

        if self.config.local_address.is_some() || source_port != 0 {
            let ip = self.local_ip(remote)?;
            let local = SocketAddr::new(ip, source_port);
            socket
                .bind(local)
                .map_err(|source| ConnectError::Bind { local, source })?;
        }

        let connecting = socket.connect(remote);
        match self.config.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, connecting).await {
                Ok(connected) => {
                    connected.map_err(|source| ConnectError::Connect { remote, source })
                }
                Err(_) => Err(ConnectError::Timeout {
                    remote,
                    timeout: limit,
                }),
            },
            None => connecting
                .await
                .map_err(|source| ConnectError::Connect { remote, source }),
        }
    }

    /// Local source IP: configured, or unspecified in the remote's family
    fn local_ip(&self, remote: SocketAddr) -> std::result::Result<IpAddr, ConnectError> {
        match self.config.local_address.as_deref() {
            Some(text) => text.parse::<IpAddr>().map_err(|e| ConnectError::Bind {
                local: SocketAddr::new(unspecified_for(remote), self.config.local_port),
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid local address '{}': {}", text, e),
                ),
            }),
            None => Ok(unspecified_for(remote)),
        }
    }

    /// Stay on a live connection until it drops or the service is canceled
    async fn hold(self: &Arc<Self>, stream: TcpStream, read_buffer_size: usize) -> HoldOutcome {
        let cancel = self.context.cancel_token();
        let metrics = Arc::clone(self.context.metrics());

        let (remote, local) = match (stream.peer_addr(), stream.local_addr()) {
            (Ok(remote), Ok(local)) => (remote, local),
            (Err(e), _) | (_, Err(e)) => {
                warn!("{}: connection lost right after connect: {}", self.name, e);
                self.set_state(DialerState::Disconnected);
                return HoldOutcome::Dropped;
            }
        };

        // Publish the session before the handler sees it
        let (transport, driver) = Transport::channel(cancel.child_token());
        let session = Arc::new(ConnectionSession::new(remote, local, transport));
        *self.current_session() = Some(Arc::clone(&session));

        self.set_state(DialerState::Connected);
        info!(
            "{}: connected to {} from {}, entering reception loop",
            self.name, remote, local
        );
        metrics.session_opened();
        self.handler.on_connect(&session);

        // Pump bytes until the peer leaves or we are canceled
        let reason = session::drive(
            stream,
            Arc::clone(&session),
            driver,
            Arc::clone(&self.handler),
            Arc::clone(&metrics),
            read_buffer_size,
        )
        .await;

        // Tear down the session
        *self.current_session() = None;
        metrics.session_closed();
        self.handler.on_close(&session, &reason);

        if cancel.is_cancelled() {
            info!("{}: task canceled, transport closed", self.name);
            HoldOutcome::Canceled
        } else {
            info!("{}: connection to {} lost ({})", self.name, remote, reason);
            self.set_state(DialerState::Disconnected);
            HoldOutcome::Dropped
        }
    }
}

fn unspecified_for(remote: SocketAddr) -> IpAddr {
    if remote.is_ipv4() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    }
}
