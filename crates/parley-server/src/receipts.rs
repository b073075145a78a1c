//! Receipt tracker: promotes messages to read and notifies senders.
//!
//! Invoked from both channels (the REST mark-read call and the
//! push-channel mark-seen / conversation-opened signals), possibly
//! concurrently for the same pair. The conditional promotion in the
//! store is the concurrency guard: each message has exactly one winning
//! writer, and only the winner notifies the sender.

use std::sync::Arc;

use tracing::debug;

use parley_core::{DeliveryStatus, Error, IdentityId, MessageId, Result, now_ms};

use crate::events::{MessageView, ServerEvent};
use crate::sessions::SessionRegistry;
use crate::storage::Store;

pub struct ReceiptTracker {
    registry: Arc<SessionRegistry>,
    store: Arc<Store>,
}

impl ReceiptTracker {
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<Store>) -> Self {
        Self { registry, store }
    }

    /// The viewer has seen their conversation with the counterparty:
    /// promote every unread message from the counterparty to read and
    /// push one status update per promotion to the counterparty's
    /// sessions. Returns the ids this call actually promoted.
    pub async fn mark_seen(
        &self,
        viewer_id: &IdentityId,
        counterparty_id: &IdentityId,
    ) -> Result<Vec<MessageId>> {
        let viewer = self
            .store
            .find_identity(viewer_id)
            .map_err(Error::store)?
            .ok_or_else(|| Error::not_found(format!("identity {viewer_id}")))?;
        let counterparty = self
            .store
            .find_identity(counterparty_id)
            .map_err(Error::store)?
            .ok_or_else(|| Error::not_found(format!("identity {counterparty_id}")))?;

        let unread = self
            .store
            .unread_between(&counterparty.id, &viewer.id)
            .map_err(Error::store)?;

        let mut promoted = Vec::new();
        for message in unread {
            if !self
                .store
                .promote_read(&message.id, now_ms())
                .map_err(Error::store)?
            {
                continue; // a concurrent call won this message
            }
            let Some(updated) = self.store.find_message(&message.id).map_err(Error::store)?
            else {
                continue;
            };
            let view = MessageView::resolve(&updated, &counterparty, &viewer);
            self.registry
                .send_to(
                    &counterparty.id,
                    &ServerEvent::MessageStatusChanged {
                        message_id: updated.id.clone(),
                        status: DeliveryStatus::Read,
                        message: view,
                    },
                )
                .await;
            promoted.push(updated.id);
        }
        if !promoted.is_empty() {
            debug!(
                viewer = %viewer.username,
                counterparty = %counterparty.username,
                count = promoted.len(),
                "messages promoted to read"
            );
        }
        Ok(promoted)
    }
}
