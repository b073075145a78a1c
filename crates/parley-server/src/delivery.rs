//! Delivery pipeline: message submission and the reconnect backlog scan.
//!
//! Persist first, then push. The persisted flags are authoritative; the
//! live fan-out is best-effort and a closed session is never an error.

use std::sync::Arc;

use tracing::{debug, warn};

use parley_core::{DeliveryStatus, Error, IdentityId, Message, MessageId, Result, now_ms};

use crate::events::{MessageView, ServerEvent};
use crate::sessions::SessionRegistry;
use crate::storage::Store;

pub struct DeliveryPipeline {
    registry: Arc<SessionRegistry>,
    store: Arc<Store>,
}

impl DeliveryPipeline {
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<Store>) -> Self {
        Self { registry, store }
    }

    /// Accept a message intent, persist it, and fan it out.
    ///
    /// The initial delivered flag is decided by recipient presence at
    /// submission time: a message to an online receiver is born
    /// delivered. Both participants land in each other's
    /// recent-contacts set (a no-op when already present), both get the
    /// resolved message pushed to every active session, and an online
    /// receiver earns the sender an immediate delivery confirmation.
    pub async fn submit(
        &self,
        sender_username: &str,
        receiver_username: &str,
        content: String,
    ) -> Result<Message> {
        let sender = self
            .store
            .find_identity_by_username(sender_username)
            .map_err(Error::store)?
            .ok_or_else(|| Error::not_found(format!("identity '{sender_username}'")))?;
        let receiver = self
            .store
            .find_identity_by_username(receiver_username)
            .map_err(Error::store)?
            .ok_or_else(|| Error::not_found(format!("identity '{receiver_username}'")))?;
        if sender.id == receiver.id {
            return Err(Error::InvalidRecipient);
        }

        let receiver_online = self.registry.is_online(&receiver.id).await;
        let now = now_ms();
        let message = Message::new(
            sender.id.clone(),
            receiver.id.clone(),
            content,
            now,
            receiver_online,
        );
        self.store.insert_message(&message).map_err(Error::store)?;
        self.store
            .add_recent_contact(&sender.id, &receiver.id, now)
            .map_err(Error::store)?;
        self.store
            .add_recent_contact(&receiver.id, &sender.id, now)
            .map_err(Error::store)?;
        debug!(id = %message.id, %sender.username, %receiver.username, delivered = receiver_online, "message persisted");

        // Best-effort fan-out from here on.
        let view = MessageView::resolve(&message, &sender, &receiver);
        let received = ServerEvent::MessageReceived {
            message: view.clone(),
        };
        self.registry.send_to(&sender.id, &received).await;
        self.registry.send_to(&receiver.id, &received).await;

        self.registry
            .send_to(
                &sender.id,
                &ServerEvent::RecentContactUpdated {
                    contact: receiver.username.clone(),
                    last_message: message.content.clone(),
                },
            )
            .await;
        self.registry
            .send_to(
                &receiver.id,
                &ServerEvent::RecentContactUpdated {
                    contact: sender.username.clone(),
                    last_message: message.content.clone(),
                },
            )
            .await;

        if receiver_online {
            self.registry
                .send_to(
                    &sender.id,
                    &ServerEvent::MessageStatusChanged {
                        message_id: message.id.clone(),
                        status: DeliveryStatus::Delivered,
                        message: view,
                    },
                )
                .await;
        }
        Ok(message)
    }

    /// Reconnect path: promote every message that was waiting for this
    /// receiver and confirm each one to its sender, exactly once.
    ///
    /// The conditional promotion decides the winner when two scans (or
    /// a scan and a read receipt) race; only the winner notifies, so a
    /// sender never hears about the same delivery twice.
    pub async fn flush_undelivered(&self, receiver_id: &IdentityId) -> Result<Vec<MessageId>> {
        let receiver = self
            .store
            .find_identity(receiver_id)
            .map_err(Error::store)?
            .ok_or_else(|| Error::not_found(format!("identity {receiver_id}")))?;
        let pending = self
            .store
            .undelivered_for(receiver_id)
            .map_err(Error::store)?;

        let mut promoted = Vec::new();
        for message in pending {
            if !self
                .store
                .promote_delivered(&message.id, now_ms())
                .map_err(Error::store)?
            {
                continue; // someone else won this one
            }
            // Re-read for the winner's authoritative timestamps.
            let Some(updated) = self.store.find_message(&message.id).map_err(Error::store)?
            else {
                continue;
            };
            let Some(sender) = self
                .store
                .find_identity(&updated.sender_id)
                .map_err(Error::store)?
            else {
                warn!(id = %updated.id, "delivered message with unresolvable sender");
                continue;
            };
            let view = MessageView::resolve(&updated, &sender, &receiver);
            self.registry
                .send_to(
                    &sender.id,
                    &ServerEvent::MessageStatusChanged {
                        message_id: updated.id.clone(),
                        status: DeliveryStatus::Delivered,
                        message: view,
                    },
                )
                .await;
            promoted.push(updated.id);
        }
        if !promoted.is_empty() {
            debug!(%receiver.username, count = promoted.len(), "backlog promoted to delivered");
        }
        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::ConnectionId;
    use parley_core::Identity;
    use tokio::sync::mpsc;

    struct Fixture {
        delivery: DeliveryPipeline,
        store: Arc<Store>,
        registry: Arc<SessionRegistry>,
    }

    fn fixture() -> (Fixture, Identity, Identity) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Arc::new(SessionRegistry::new());
        let delivery = DeliveryPipeline::new(registry.clone(), store.clone());
        let alice = store.create_identity("alice").unwrap().unwrap();
        let bob = store.create_identity("bob").unwrap().unwrap();
        (
            Fixture {
                delivery,
                store,
                registry,
            },
            alice,
            bob,
        )
    }

    async fn connect(f: &Fixture, id: &IdentityId) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        f.registry.register(id.clone(), ConnectionId::new(), tx).await;
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn self_addressed_messages_are_rejected_before_persistence() {
        let (f, alice, _) = fixture();
        let err = f
            .delivery
            .submit("alice", "alice", "hi me".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRecipient));
        assert!(f.store.conversation_between(&alice.id, &alice.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_participants_are_not_found() {
        let (f, _, _) = fixture();
        assert!(matches!(
            f.delivery.submit("alice", "ghost", "hi".into()).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            f.delivery.submit("ghost", "alice", "hi".into()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn offline_receiver_gets_an_undelivered_record() {
        let (f, alice, bob) = fixture();
        let mut alice_rx = connect(&f, &alice.id).await;

        let message = f.delivery.submit("alice", "bob", "hi".into()).await.unwrap();
        assert!(!message.delivered);
        assert_eq!(message.delivered_at, None);

        let events = drain(&mut alice_rx);
        // Sender sees her own copy and the contact refresh, but no
        // delivery confirmation while bob is offline.
        assert!(events.iter().any(|e| matches!(e, ServerEvent::MessageReceived { .. })));
        assert!(events.iter().any(|e| matches!(e, ServerEvent::RecentContactUpdated { .. })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, ServerEvent::MessageStatusChanged { .. })));

        // Both recent-contact sets got the counterparty exactly once.
        assert_eq!(f.store.recent_contact_ids(&alice.id).unwrap(), vec![bob.id.clone()]);
        assert_eq!(f.store.recent_contact_ids(&bob.id).unwrap(), vec![alice.id.clone()]);
    }

    #[tokio::test]
    async fn online_receiver_gets_message_and_sender_gets_confirmation() {
        let (f, alice, bob) = fixture();
        let mut alice_rx = connect(&f, &alice.id).await;
        let mut bob_rx = connect(&f, &bob.id).await;

        let message = f.delivery.submit("alice", "bob", "hi".into()).await.unwrap();
        assert!(message.delivered);
        assert!(message.delivered_at.is_some());

        let bob_events = drain(&mut bob_rx);
        assert!(bob_events
            .iter()
            .any(|e| matches!(e, ServerEvent::MessageReceived { .. })));

        let alice_events = drain(&mut alice_rx);
        let confirmations: Vec<_> = alice_events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    ServerEvent::MessageStatusChanged {
                        status: DeliveryStatus::Delivered,
                        ..
                    }
                )
            })
            .collect();
        assert_eq!(confirmations.len(), 1);
    }

    #[tokio::test]
    async fn recent_contacts_survive_concurrent_first_contact() {
        let (f, alice, bob) = fixture();
        // Both directions at once; set semantics must absorb the race.
        let (a, b) = tokio::join!(
            f.delivery.submit("alice", "bob", "ping".into()),
            f.delivery.submit("bob", "alice", "pong".into()),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(f.store.recent_contact_ids(&alice.id).unwrap(), vec![bob.id.clone()]);
        assert_eq!(f.store.recent_contact_ids(&bob.id).unwrap(), vec![alice.id.clone()]);
    }

    #[tokio::test]
    async fn backlog_scan_promotes_exactly_once_and_notifies_sender() {
        let (f, alice, bob) = fixture();
        let mut alice_rx = connect(&f, &alice.id).await;
        f.delivery.submit("alice", "bob", "one".into()).await.unwrap();
        f.delivery.submit("alice", "bob", "two".into()).await.unwrap();
        drain(&mut alice_rx);

        let promoted = f.delivery.flush_undelivered(&bob.id).await.unwrap();
        assert_eq!(promoted.len(), 2);

        let confirmations = drain(&mut alice_rx);
        assert_eq!(confirmations.len(), 2);
        for ev in &confirmations {
            match ev {
                ServerEvent::MessageStatusChanged { status, message, .. } => {
                    assert_eq!(*status, DeliveryStatus::Delivered);
                    assert!(message.delivered);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }

        // A second scan finds nothing: no duplicate notifications for
        // already-delivered messages.
        let promoted = f.delivery.flush_undelivered(&bob.id).await.unwrap();
        assert!(promoted.is_empty());
        assert!(drain(&mut alice_rx).is_empty());
    }
}
