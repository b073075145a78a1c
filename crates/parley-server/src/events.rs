//! Wire events for the push channel (JSON framing, `type`-tagged).
//!
//! Client events arrive over the WebSocket and funnel into the same
//! write paths the REST surface uses. Server events are fanned out to
//! live sessions; the persisted record stays authoritative, the push is
//! best-effort.

use serde::{Deserialize, Serialize};

use parley_core::{DeliveryStatus, Identity, IdentityId, Message, MessageId};

/// Events a client may send over the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Register this connection for an identity. Must be the first
    /// event on a connection; later joins on the same connection are
    /// no-ops.
    #[serde(rename = "join")]
    Join { identity_id: IdentityId },

    /// Soft presence-offline signal (e.g. a backgrounded tab). The
    /// connection stays open.
    #[serde(rename = "away")]
    Away {
        identity_id: IdentityId,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        last_seen: Option<u64>,
    },

    /// Soft presence-online signal, undoing an earlier `away`.
    #[serde(rename = "back")]
    Back { identity_id: IdentityId },

    /// Unregister every session for the identity and force-disconnect.
    #[serde(rename = "logout")]
    Logout { identity_id: IdentityId },

    /// Submit a message to the delivery pipeline. Usernames, not ids,
    /// to match the request/response surface.
    #[serde(rename = "send-message")]
    SendMessage {
        sender: String,
        receiver: String,
        content: String,
    },

    /// The viewer has seen the conversation with the counterparty.
    #[serde(rename = "mark-seen")]
    MarkSeen {
        viewer_id: IdentityId,
        counterparty_id: IdentityId,
    },

    /// Same receipt path, emitted when the viewer opens a conversation.
    #[serde(rename = "conversation-opened")]
    ConversationOpened {
        viewer_id: IdentityId,
        counterparty_id: IdentityId,
    },
}

/// Events the server pushes to connected sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// An identity's presence changed. Broadcast to every connected
    /// session; presence is globally visible.
    #[serde(rename = "presence-changed")]
    PresenceChanged {
        identity_id: IdentityId,
        online: bool,
        last_seen: Option<u64>,
    },

    /// A newly created message, pushed to both participants.
    #[serde(rename = "message-received")]
    MessageReceived { message: MessageView },

    /// A message's delivered/read flag moved forward. Pushed to the
    /// original sender's sessions.
    #[serde(rename = "message-status-changed")]
    MessageStatusChanged {
        message_id: MessageId,
        status: DeliveryStatus,
        message: MessageView,
    },

    /// The recipient list entry for a counterparty should refresh.
    #[serde(rename = "recent-contact-updated")]
    RecentContactUpdated {
        contact: String,
        last_message: String,
    },
}

/// A message with both participant usernames resolved, ready for the
/// wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub id: MessageId,
    pub sender_id: IdentityId,
    pub sender: String,
    pub receiver_id: IdentityId,
    pub receiver: String,
    pub content: String,
    pub created_at: u64,
    pub delivered: bool,
    pub delivered_at: Option<u64>,
    pub read: bool,
    pub read_at: Option<u64>,
}

impl MessageView {
    /// Join a message record with its two resolved identities.
    pub fn resolve(message: &Message, sender: &Identity, receiver: &Identity) -> Self {
        Self {
            id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            sender: sender.username.clone(),
            receiver_id: message.receiver_id.clone(),
            receiver: receiver.username.clone(),
            content: message.content.clone(),
            created_at: message.created_at,
            delivered: message.delivered,
            delivered_at: message.delivered_at,
            read: message.read,
            read_at: message.read_at,
        }
    }
}
