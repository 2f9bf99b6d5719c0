//! Listener Service
//!
//! Owns one listening socket and every session accepted on it. Bind conflicts
//! are retried with a fixed delay; cancellation runs the same stop sequence as
//! an explicit [`ListenerService::stop`] before the loop task returns.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::error::{classify, FailureClass};
use super::handler::ConnectionHandler;
use super::registry::PeerRegistry;
use super::session::{self, ConnectionSession, Transport};
use super::state::ServiceState;
use super::DEFAULT_READ_BUFFER_SIZE;
use crate::config::ListenerConfig;
use crate::context::ServiceContext;
use crate::Result;

/// Accepts any number of peers on one bound socket.
///
/// A service runs once: after it has stopped it cannot be started again.
/// Before `start` it reports [`ServiceState::Stopped`].
pub struct ListenerService {
    shared: Arc<Shared>,
    read_buffer_size: usize,
}

struct Shared {
    name: String,
    config: ListenerConfig,
    handler: Arc<dyn ConnectionHandler>,
    context: ServiceContext,
    registry: Mutex<PeerRegistry>,
    state: watch::Sender<ServiceState>,
    local_addr: Mutex<Option<SocketAddr>>,
    started: AtomicBool,
    entered: AtomicBool,
}

impl ListenerService {
    /// Create a listener; `context` is narrowed to a child so `stop` only affects this service
    pub fn new(
        config: ListenerConfig,
        handler: Arc<dyn ConnectionHandler>,
        context: ServiceContext,
    ) -> Self {
        let (state, _) = watch::channel(ServiceState::Stopped);
        Self {
            shared: Arc::new(Shared {
                name: config.display_name(),
                config,
                handler,
                context: context.child(),
                registry: Mutex::new(PeerRegistry::new()),
                state,
                local_addr: Mutex::new(None),
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

    /// Schedule the accept loop on the runtime and return at once
    pub fn start(&self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.serve())
    }

    /// The accept loop as a future, for callers that spawn it themselves.
    ///
    /// If [`stop`](Self::stop) runs before the future is first polled, the
    /// future resolves to `Ok(())` without binding.
    pub fn serve(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let shared = Arc::clone(&self.shared);
        let read_buffer_size = self.read_buffer_size;
        let first_start = !shared.started.swap(true, Ordering::SeqCst);
        if first_start {
            shared.set_state(ServiceState::Starting);
        }

        async move {
            if !first_start {
                return Err(anyhow!("{}: listener was already started", shared.name));
            }
            shared.entered.store(true, Ordering::SeqCst);
            if shared.context.cancel_token().is_cancelled() {
                shared.set_state(ServiceState::Stopped);
                return Ok(());
            }
            shared.run(read_buffer_size).await
        }
    }

    /// Cancel the loop and wait until the socket and all sessions are released
    pub async fn stop(&self) {
        info!("{}: stop requested", self.shared.name);
        self.shared.context.cancel_token().cancel();

        if !self.shared.started.swap(true, Ordering::SeqCst) {
            self.shared.set_state(ServiceState::Stopped);
            return;
        }

        // A loop future that was built but never polled will not report back
        if !self.shared.entered.load(Ordering::SeqCst) {
            self.shared.set_state(ServiceState::Stopped);
            return;
        }

        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }

    pub fn state(&self) -> ServiceState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.shared.state.subscribe()
    }

    /// Address actually bound (useful when configured with port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .shared
            .local_addr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_member(&self, ip: IpAddr, port: u16) -> Option<Arc<ConnectionSession>> {
        self.shared.registry().is_member(ip, port)
    }

    pub fn peer_count(&self) -> usize {
        self.shared.registry().len()
    }

    pub fn sessions(&self) -> Vec<Arc<ConnectionSession>> {
        self.shared.registry().sessions()
    }

    pub fn describe_peers(&self) -> String {
        self.shared.registry().describe()
    }

    /// Close every connected peer without stopping the listener
    pub fn disconnect_all(&self) {
        self.shared.registry().disconnect_all();
    }
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, PeerRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ServiceState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("{}: {} -> {}", self.name, previous, state);
        }
    }

    async fn run(self: Arc<Self>, read_buffer_size: usize) -> Result<()> {
        // Bind the listening socket, waiting out contention
        let listener = match self.bind_with_retry().await {
            Ok(Some(listener)) => listener,
            Ok(None) => {
                info!("{}: canceled before the server was started", self.name);
                self.set_state(ServiceState::Stopped);
                return Ok(());
            }
            Err(e) => {
                self.set_state(ServiceState::Stopped);
                return Err(e);
            }
        };

        let bound = listener.local_addr().ok();
        *self
            .local_addr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = bound;
        info!(
            "{}: TCP server started on {}",
            self.name,
            bound.map_or_else(|| self.config.endpoint().to_string(), |a| a.to_string())
        );
        self.set_state(ServiceState::Running);

        // Serve until canceled or a fatal accept error
        let mut sessions = JoinSet::new();
        let result = self
            .accept_connections(&listener, &mut sessions, read_buffer_size)
            .await;

        // Stop sequence: flush peers, close the socket, await sessions
        info!("{}: stopping TCP server...", self.name);
        self.set_state(ServiceState::Stopping);
        self.release(listener, sessions).await;
        self.set_state(ServiceState::Stopped);
        info!("{}: TCP server stopped", self.name);

        result
    }

    /// Bind the socket, waiting out address contention. `None` means canceled.
    async fn bind_with_retry(&self) -> Result<Option<TcpListener>> {
        let cancel = self.context.cancel_token();
        let endpoint = self.config.endpoint();

        loop {
            self.set_state(ServiceState::Starting);
            info!("{}: starting TCP server at {}", self.name, endpoint);

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                bound = TcpListener::bind((self.config.bind_address.as_str(), self.config.bind_port)) => bound,
            };

            match attempt {
                Ok(listener) => return Ok(Some(listener)),
                Err(e) if classify(&e) == FailureClass::LocalResource => {
                    warn!(
                        "{}: unable to start server on {} ({}); port may be already in use",
                        self.name, endpoint, e
                    );
                    self.context.metrics().record_bind_retry();
                    self.set_state(ServiceState::Retrying);
                    info!(
                        "{}: retrying in {:?}...",
                        self.name, self.config.bind_retry_delay
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(self.config.bind_retry_delay) => {}
                    }
                }
                Err(e) => {
                    error!(
                        "{}: unhandled error when starting TCP server on {}: {}",
                        self.name, endpoint, e
                    );
                    return Err(anyhow::Error::new(e)
                        .context(format!("{}: failed to bind {}", self.name, endpoint)));
                }
            }
        }
    }

    /// Main connection acceptance loop
    async fn accept_connections(
        self: &Arc<Self>,
        listener: &TcpListener,
        sessions: &mut JoinSet<()>,
        read_buffer_size: usize,
    ) -> Result<()> {
        let cancel = self.context.cancel_token().clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("{}: server canceled", self.name);
                    return Ok(());
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("{}: session task panicked: {}", self.name, e);
                        }
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => self.admit(stream, remote, sessions, read_buffer_size),
                    Err(e) => match classify(&e) {
                        FailureClass::Transient => {
                            warn!("{}: error accepting connection: {}", self.name, e);
                        }
                        class => {
                            error!("{}: unhandled {} error when serving: {}", self.name, class, e);
                            return Err(anyhow::Error::new(e)
                                .context(format!("{}: accept failed", self.name)));
                        }
                    },
                }
            }
        }
    }

    /// Register an inbound connection and spawn the task that drives it
    fn admit(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        sessions: &mut JoinSet<()>,
        read_buffer_size: usize,
    ) {
        info!("{}: incoming connection from {}", self.name, remote);

        let local = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("{}: dropping {}: no local address: {}", self.name, remote, e);
                return;
            }
        };

        let (transport, driver) = Transport::channel(self.context.cancel_token().child_token());
        let session = {
            let mut registry = self.registry();
            if let Some(existing) = registry.is_member(remote.ip(), remote.port()) {
                // Keep the registered session; the new stream is dropped (closed) here.
                error!(
                    "{}: incoming connection from an already connected client {} (session {}); rejected",
                    self.name,
                    existing.key(),
                    existing.id()
                );
                return;
            }
            match registry.add(remote, local, transport) {
                Ok(session) => {
                    debug!("{}: {}", self.name, registry);
                    session
                }
                Err(e) => {
                    error!("{}: {}", self.name, e);
                    return;
                }
            }
        };

        info!("{}: connection accepted from {}", self.name, session.key());
        let metrics = Arc::clone(self.context.metrics());
        metrics.record_accept();
        metrics.session_opened();
        self.handler.on_connect(&session);

        let shared = Arc::clone(self);
        sessions.spawn(async move {
            let reason = session::drive(
                stream,
                Arc::clone(&session),
                driver,
                Arc::clone(&shared.handler),
                Arc::clone(&metrics),
                read_buffer_size,
            )
            .await;

            shared.registry().remove_session(&session);
            metrics.session_closed();
            info!(
                "{}: client {} disconnected ({})",
                shared.name,
                session.key(),
                reason
            );
            shared.handler.on_close(&session, &reason);
        });
    }

    /// Flush peers, close the socket and wait for every session task to finish
    async fn release(&self, listener: TcpListener, mut sessions: JoinSet<()>) {
        info!(
            "{}: closing transport for all connected clients...",
            self.name
        );
        self.registry().disconnect_all();

        // Close the listening socket
        info!("{}: closing listening socket...", self.name);
        drop(listener);

        // Wait for session tasks to report closure
        let drain = async {
            while let Some(joined) = sessions.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("{}: session task panicked: {}", self.name, e);
                    }
                }
            }
        };

        if tokio::time::timeout(self.config.drain_timeout, drain)
            .await
            .is_err()
        {
            warn!(
                "{}: {} sessions still open after {:?}, aborting them",
                self.name,
                sessions.len(),
                self.config.drain_timeout
            );
            // Abort stragglers and drop their entries
            sessions.shutdown().await;

            let leftover = self.registry().clear();
            for _ in 0..leftover {
                self.context.metrics().session_closed();
            }
        }
    }
}
