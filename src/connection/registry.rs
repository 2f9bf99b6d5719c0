//! Peer Registry
//!
//! Index of the sessions currently open on one listener, keyed by the
//! remote `ip:port`. An entry exists exactly while its transport is open.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::info;

use super::error::RegistryError;
use super::session::{peer_key, ConnectionSession, Transport};

struct Entry {
    seq: u64,
    session: Arc<ConnectionSession>,
}

/// Tracks currently connected peers of a listener
#[derive(Default)]
pub struct PeerRegistry {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the session registered for `ip:port`
    pub fn is_member(&self, ip: IpAddr, port: u16) -> Option<Arc<ConnectionSession>> {
        self.entries
            .get(&peer_key(&SocketAddr::new(ip, port)))
            .map(|entry| Arc::clone(&entry.session))
    }

    /// Build a session for `remote` and register it.
    ///
    /// A key that is already present is never overwritten.
    pub fn add(
        &mut self,
        remote: SocketAddr,
        local: SocketAddr,
        transport: Transport,
    ) -> Result<Arc<ConnectionSession>, RegistryError> {
        let key = peer_key(&remote);
        if self.entries.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered(key));
        }

        let session = Arc::new(ConnectionSession::new(remote, local, transport));
        self.next_seq += 1;
        self.entries.insert(
            key,
            Entry {
                seq: self.next_seq,
                session: Arc::clone(&session),
            },
        );
        Ok(session)
    }

    /// Remove the entry for `ip:port`; no-op when absent
    pub fn remove(&mut self, ip: IpAddr, port: u16) -> Option<Arc<ConnectionSession>> {
        self.entries
            .remove(&peer_key(&SocketAddr::new(ip, port)))
            .map(|entry| entry.session)
    }

    /// Remove `session` only if it is the one registered under its key
    pub fn remove_session(&mut self, session: &Arc<ConnectionSession>) -> bool {
        let key = session.key();
        match self.entries.get(&key) {
            Some(entry) if Arc::ptr_eq(&entry.session, session) => {
                self.entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Ask every registered transport to close.
    ///
    /// Entries are not removed here; each one leaves through its session's
    /// normal close path.
    pub fn disconnect_all(&self) {
        info!("Disconnecting all connected clients:");
        if self.entries.is_empty() {
            info!("  <No client connected>");
            return;
        }
        for session in self.ordered() {
            info!("  {}", session);
            session.close();
        }
    }

    /// Drop every entry without waiting for close callbacks; returns how many were left
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered sessions in insertion order
    pub fn sessions(&self) -> Vec<Arc<ConnectionSession>> {
        self.ordered().into_iter().cloned().collect()
    }

    fn ordered(&self) -> Vec<&Arc<ConnectionSession>> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| &entry.session).collect()
    }

    /// Render the current entries for diagnostics
    pub fn describe(&self) -> String {
        let mut out = String::from("Currently connected clients:\n");
        if self.entries.is_empty() {
            out.push_str("  <Empty>\n");
        } else {
            for session in self.ordered() {
                out.push_str(&format!("  {}\n", session));
            }
        }
        out
    }
}

impl fmt::Display for PeerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}
