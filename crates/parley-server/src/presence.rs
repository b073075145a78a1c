//! Presence manager: derives online/offline state and broadcasts it.
//!
//! Two signal families feed it. Hard signals come from the session
//! registry (first connection opened, last connection closed, logout)
//! and keep the persisted `online` flag in lockstep with connection
//! reality. Soft signals (`away`/`back`) come straight from the client
//! and are applied without checking registry liveness; a client that
//! says "away" and then silently drops stays stale until its own close
//! event fires and re-persists offline with a fresh timestamp.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use parley_core::{Error, IdentityId, Result, now_ms};

use crate::events::ServerEvent;
use crate::sessions::{ConnectionId, SessionRegistry};
use crate::storage::Store;

pub struct PresenceManager {
    registry: Arc<SessionRegistry>,
    store: Arc<Store>,
}

impl PresenceManager {
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<Store>) -> Self {
        Self { registry, store }
    }

    /// A connection finished its join handshake. Registers it and, on
    /// the identity's first connection, persists and broadcasts the
    /// online transition. Registration and the presence side effect
    /// happen in the same logical step.
    pub async fn connection_opened(
        &self,
        identity_id: IdentityId,
        connection_id: ConnectionId,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<()> {
        let came_online = self
            .registry
            .register(identity_id.clone(), connection_id, tx)
            .await;
        if !came_online {
            debug!(%identity_id, %connection_id, "additional connection, presence unchanged");
            return Ok(());
        }
        match self.store.set_online(&identity_id).map_err(Error::store) {
            Ok(true) => {}
            failed => {
                // Roll the registration back so a failed open leaves
                // no phantom session behind.
                self.registry.unregister(connection_id).await;
                return match failed {
                    Ok(_) => Err(Error::not_found(format!("identity {identity_id}"))),
                    Err(err) => Err(err),
                };
            }
        }
        info!(%identity_id, "online");
        self.announce(&identity_id).await
    }

    /// A connection went away. Unregisters it and, when it was the
    /// identity's last one, persists and broadcasts offline. Returns
    /// the identity the connection belonged to, if it was still
    /// registered (logout may have raced it away already).
    pub async fn connection_closed(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<IdentityId>> {
        let Some((identity_id, went_offline)) = self.registry.unregister(connection_id).await
        else {
            return Ok(None);
        };
        if went_offline {
            self.go_offline(&identity_id, now_ms()).await?;
        } else {
            debug!(%identity_id, %connection_id, "connection closed, others remain");
        }
        Ok(Some(identity_id))
    }

    /// Soft offline signal. The connection stays open and registered.
    pub async fn away(&self, identity_id: &IdentityId, last_seen: Option<u64>) -> Result<()> {
        self.go_offline(identity_id, last_seen.unwrap_or_else(now_ms))
            .await
    }

    /// Soft online signal, undoing an earlier `away`.
    pub async fn back(&self, identity_id: &IdentityId) -> Result<()> {
        if !self.store.set_online(identity_id).map_err(Error::store)? {
            return Err(Error::not_found(format!("identity {identity_id}")));
        }
        info!(%identity_id, "back");
        self.announce(identity_id).await
    }

    /// Explicit logout: drop every session (which force-disconnects
    /// the sockets), then persist and broadcast offline once. The
    /// per-connection close events that follow find nothing left to
    /// unregister and stay silent.
    pub async fn logout(&self, identity_id: &IdentityId) -> Result<()> {
        self.registry.unregister_identity(identity_id).await;
        info!(%identity_id, "logout");
        self.go_offline(identity_id, now_ms()).await
    }

    async fn go_offline(&self, identity_id: &IdentityId, last_seen: u64) -> Result<()> {
        if !self
            .store
            .set_offline(identity_id, last_seen)
            .map_err(Error::store)?
        {
            return Err(Error::not_found(format!("identity {identity_id}")));
        }
        info!(%identity_id, "offline");
        self.announce(identity_id).await
    }

    /// Broadcast the identity's persisted presence to every connected
    /// session, not just conversation participants.
    async fn announce(&self, identity_id: &IdentityId) -> Result<()> {
        let identity = self
            .store
            .find_identity(identity_id)
            .map_err(Error::store)?
            .ok_or_else(|| Error::not_found(format!("identity {identity_id}")))?;
        self.registry
            .broadcast(&ServerEvent::PresenceChanged {
                identity_id: identity.id,
                online: identity.online,
                last_seen: identity.last_seen,
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        presence: PresenceManager,
        store: Arc<Store>,
        registry: Arc<SessionRegistry>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Arc::new(SessionRegistry::new());
        let presence = PresenceManager::new(registry.clone(), store.clone());
        Fixture {
            presence,
            store,
            registry,
        }
    }

    fn channel() -> (
        mpsc::UnboundedSender<ServerEvent>,
        mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    fn expect_presence(event: ServerEvent) -> (IdentityId, bool, Option<u64>) {
        match event {
            ServerEvent::PresenceChanged {
                identity_id,
                online,
                last_seen,
            } => (identity_id, online, last_seen),
            other => panic!("expected presence-changed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_connection_broadcasts_online_to_everyone() {
        let f = fixture();
        let alice = f.store.create_identity("alice").unwrap().unwrap();
        let bob = f.store.create_identity("bob").unwrap().unwrap();

        // Bob is already connected and watching.
        let (bob_tx, mut bob_rx) = channel();
        f.presence
            .connection_opened(bob.id.clone(), ConnectionId::new(), bob_tx)
            .await
            .unwrap();
        bob_rx.try_recv().unwrap(); // bob's own online event

        let (alice_tx, mut alice_rx) = channel();
        f.presence
            .connection_opened(alice.id.clone(), ConnectionId::new(), alice_tx)
            .await
            .unwrap();

        let (id, online, _) = expect_presence(bob_rx.try_recv().unwrap());
        assert_eq!(id, alice.id);
        assert!(online);
        // The new identity hears its own transition too.
        let (id, online, _) = expect_presence(alice_rx.try_recv().unwrap());
        assert_eq!(id, alice.id);
        assert!(online);

        assert!(f.store.find_identity(&alice.id).unwrap().unwrap().online);
    }

    #[tokio::test]
    async fn only_last_connection_close_broadcasts_offline() {
        let f = fixture();
        let alice = f.store.create_identity("alice").unwrap().unwrap();
        let bob = f.store.create_identity("bob").unwrap().unwrap();

        let (bob_tx, mut bob_rx) = channel();
        f.presence
            .connection_opened(bob.id.clone(), ConnectionId::new(), bob_tx)
            .await
            .unwrap();

        let (c1, c2) = (ConnectionId::new(), ConnectionId::new());
        f.presence
            .connection_opened(alice.id.clone(), c1, channel().0)
            .await
            .unwrap();
        f.presence
            .connection_opened(alice.id.clone(), c2, channel().0)
            .await
            .unwrap();
        // Drain bob's queue before the part under test.
        while bob_rx.try_recv().is_ok() {}

        f.presence.connection_closed(c1).await.unwrap();
        assert!(bob_rx.try_recv().is_err(), "non-last close must be silent");
        assert!(f.store.find_identity(&alice.id).unwrap().unwrap().online);

        f.presence.connection_closed(c2).await.unwrap();
        let (id, online, last_seen) = expect_presence(bob_rx.try_recv().unwrap());
        assert_eq!(id, alice.id);
        assert!(!online);
        assert!(last_seen.is_some());
        // Exactly one offline event.
        assert!(bob_rx.try_recv().is_err());

        let stored = f.store.find_identity(&alice.id).unwrap().unwrap();
        assert!(!stored.online);
        assert_eq!(stored.last_seen, last_seen);
    }

    #[tokio::test]
    async fn away_and_back_are_soft_signals() {
        let f = fixture();
        let alice = f.store.create_identity("alice").unwrap().unwrap();

        let (tx, mut rx) = channel();
        let conn = ConnectionId::new();
        f.presence
            .connection_opened(alice.id.clone(), conn, tx)
            .await
            .unwrap();
        rx.try_recv().unwrap();

        // Away with a client-supplied timestamp: persisted verbatim,
        // connection still registered.
        f.presence.away(&alice.id, Some(5000)).await.unwrap();
        let (_, online, last_seen) = expect_presence(rx.try_recv().unwrap());
        assert!(!online);
        assert_eq!(last_seen, Some(5000));
        assert!(f.registry.is_online(&alice.id).await);
        assert!(!f.store.find_identity(&alice.id).unwrap().unwrap().online);

        f.presence.back(&alice.id).await.unwrap();
        let (_, online, _) = expect_presence(rx.try_recv().unwrap());
        assert!(online);
        assert!(f.store.find_identity(&alice.id).unwrap().unwrap().online);
    }

    #[tokio::test]
    async fn logout_disconnects_and_goes_offline_once() {
        let f = fixture();
        let alice = f.store.create_identity("alice").unwrap().unwrap();
        let bob = f.store.create_identity("bob").unwrap().unwrap();

        let (bob_tx, mut bob_rx) = channel();
        f.presence
            .connection_opened(bob.id.clone(), ConnectionId::new(), bob_tx)
            .await
            .unwrap();

        let (tx, mut alice_rx) = channel();
        let conn = ConnectionId::new();
        f.presence
            .connection_opened(alice.id.clone(), conn, tx)
            .await
            .unwrap();
        while bob_rx.try_recv().is_ok() {}

        f.presence.logout(&alice.id).await.unwrap();
        // Alice's channel is closed: force-disconnect.
        assert!(alice_rx.recv().await.is_none());
        let (id, online, _) = expect_presence(bob_rx.try_recv().unwrap());
        assert_eq!(id, alice.id);
        assert!(!online);
        assert!(bob_rx.try_recv().is_err());

        // The socket's own close event arrives later and finds nothing.
        assert_eq!(f.presence.connection_closed(conn).await.unwrap(), None);
        assert!(bob_rx.try_recv().is_err(), "no second offline event");
    }

    #[tokio::test]
    async fn unknown_identity_is_rejected() {
        let f = fixture();
        let ghost = IdentityId::from("ghost");
        let err = f
            .presence
            .connection_opened(ghost.clone(), ConnectionId::new(), channel().0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(!f.registry.is_online(&ghost).await, "rollback expected");
    }
}
