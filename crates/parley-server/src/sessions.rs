//! Session registry: identity -> live push-channel connections.
//!
//! The registry is the only shared mutable in-memory structure in the
//! server. It supports multiple simultaneous connections per identity
//! (several devices or tabs) and is safe against concurrent
//! registration and unregistration from any number of connection
//! handler tasks. The presence manager drives every registry mutation
//! so the presence side effect happens in the same logical step.

use std::collections::HashMap;

use tokio::sync::{RwLock, mpsc};
use tracing::trace;
use uuid::Uuid;

use parley_core::{Error, IdentityId, now_ms};

use crate::events::ServerEvent;

/// Opaque id for one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One live session: the outbound event channel of a connection.
/// Ephemeral, never persisted; destroyed on disconnect or logout.
struct Session {
    tx: mpsc::UnboundedSender<ServerEvent>,
    #[allow(dead_code)]
    joined_at: u64,
}

impl Session {
    /// Queue an event on this session's connection. Fails with
    /// `StaleSession` if the connection has gone away in the meantime.
    fn push(&self, event: ServerEvent) -> parley_core::Result<()> {
        self.tx.send(event).map_err(|_| Error::StaleSession)
    }
}

#[derive(Default)]
struct Inner {
    by_identity: HashMap<IdentityId, HashMap<ConnectionId, Session>>,
    by_connection: HashMap<ConnectionId, IdentityId>,
}

/// Identity -> open connections, guarded by one async RwLock.
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Register a connection for an identity. Idempotent per
    /// connection. Returns true when this is the identity's first
    /// active connection, i.e. the identity just came online.
    pub async fn register(
        &self,
        identity_id: IdentityId,
        connection_id: ConnectionId,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) -> bool {
        let mut inner = self.inner.write().await;
        if inner.by_connection.contains_key(&connection_id) {
            return false;
        }
        let sessions = inner.by_identity.entry(identity_id.clone()).or_default();
        let came_online = sessions.is_empty();
        sessions.insert(
            connection_id,
            Session {
                tx,
                joined_at: now_ms(),
            },
        );
        inner.by_connection.insert(connection_id, identity_id);
        came_online
    }

    /// Remove a connection. Returns the identity it belonged to and
    /// whether that was its last connection (the offline signal).
    /// Unknown connections return `None`.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<(IdentityId, bool)> {
        let mut inner = self.inner.write().await;
        let identity_id = inner.by_connection.remove(&connection_id)?;
        let went_offline = match inner.by_identity.get_mut(&identity_id) {
            Some(sessions) => {
                sessions.remove(&connection_id);
                if sessions.is_empty() {
                    inner.by_identity.remove(&identity_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        };
        Some((identity_id, went_offline))
    }

    /// Remove every connection for an identity (logout). Dropping the
    /// outbound senders ends each connection's send loop, which closes
    /// the socket. Returns true if any session existed.
    pub async fn unregister_identity(&self, identity_id: &IdentityId) -> bool {
        let mut inner = self.inner.write().await;
        match inner.by_identity.remove(identity_id) {
            Some(sessions) => {
                for connection_id in sessions.keys() {
                    inner.by_connection.remove(connection_id);
                }
                true
            }
            None => false,
        }
    }

    /// Whether the identity has at least one active connection.
    pub async fn is_online(&self, identity_id: &IdentityId) -> bool {
        self.inner
            .read()
            .await
            .by_identity
            .get(identity_id)
            .is_some_and(|s| !s.is_empty())
    }

    /// The identity's open connections.
    pub async fn connections_for(&self, identity_id: &IdentityId) -> Vec<ConnectionId> {
        self.inner
            .read()
            .await
            .by_identity
            .get(identity_id)
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Push an event to every session of one identity. Stale sessions
    /// are dropped silently; the persisted record is authoritative.
    pub async fn send_to(&self, identity_id: &IdentityId, event: &ServerEvent) {
        let inner = self.inner.read().await;
        if let Some(sessions) = inner.by_identity.get(identity_id) {
            for (connection_id, session) in sessions {
                if let Err(err) = session.push(event.clone()) {
                    trace!(%connection_id, "dropping push: {err}");
                }
            }
        }
    }

    /// Push an event to every session of every connected identity.
    pub async fn broadcast(&self, event: &ServerEvent) {
        let inner = self.inner.read().await;
        for sessions in inner.by_identity.values() {
            for (connection_id, session) in sessions {
                if let Err(err) = session.push(event.clone()) {
                    trace!(%connection_id, "dropping push: {err}");
                }
            }
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
