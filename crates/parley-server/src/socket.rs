//! Push-channel connection handling.
//!
//! One handler task per WebSocket connection. The first event must be a
//! `join`; after that, two pump tasks run until either side ends: one
//! forwards queued server events out, one dispatches inbound client
//! events into the write paths. Handlers run to completion per event
//! and never block other connections.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use parley_core::IdentityId;

use crate::AppState;
use crate::events::{ClientEvent, ServerEvent};
use crate::sessions::ConnectionId;

/// Handle a single WebSocket connection.
pub async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Wait for the join event first.
    let mut joined: Option<(IdentityId, ConnectionId, mpsc::UnboundedReceiver<ServerEvent>)> =
        None;
    while let Some(Ok(frame)) = ws_rx.next().await {
        match frame {
            Message::Text(text) => {
                let Ok(ClientEvent::Join { identity_id }) =
                    serde_json::from_str::<ClientEvent>(&text)
                else {
                    continue; // everything else is meaningless before join
                };
                match state.store.find_identity(&identity_id) {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        warn!(%identity_id, "join for unknown identity");
                        continue; // let the client retry
                    }
                    Err(err) => {
                        error!("identity lookup failed: {err}");
                        return;
                    }
                }

                let connection_id = ConnectionId::new();
                let (tx, rx) = mpsc::unbounded_channel();
                if let Err(err) = state
                    .presence
                    .connection_opened(identity_id.clone(), connection_id, tx)
                    .await
                {
                    error!(%identity_id, "session open failed: {err}");
                    return;
                }
                // Reconnect path: promote everything that was waiting
                // for this identity and confirm each one to its sender.
                if let Err(err) = state.delivery.flush_undelivered(&identity_id).await {
                    error!(%identity_id, "backlog scan failed: {err}");
                }
                joined = Some((identity_id, connection_id, rx));
                break;
            }
            Message::Close(_) => return,
            _ => {}
        }
    }
    let Some((identity_id, connection_id, mut rx)) = joined else {
        return; // connection closed before joining
    };
    info!(%identity_id, %connection_id, "session opened");

    // Forward queued server events to this client. The loop ends when
    // the registry drops our sender (logout) or the socket goes away.
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    error!("event serialization failed: {err}");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Dispatch inbound client events into the write paths.
    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = ws_rx.next().await {
            match frame {
                Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => dispatch(&recv_state, event).await,
                    Err(err) => warn!("unparseable client event: {err}"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Clean up: drop the session. Closing the identity's last
    // connection is what flips presence offline. After a logout the
    // session is already gone and this stays silent.
    match state.presence.connection_closed(connection_id).await {
        Ok(_) => info!(%identity_id, %connection_id, "session closed"),
        Err(err) => error!(%identity_id, "disconnect handling failed: {err}"),
    }
}

/// Run one client event to completion. Failures are logged and never
/// tear down the connection; the persisted state stays authoritative.
async fn dispatch(state: &AppState, event: ClientEvent) {
    match event {
        ClientEvent::Join { .. } => {
            // Already joined on this connection; a repeat is a no-op.
        }
        ClientEvent::Away {
            identity_id,
            last_seen,
        } => {
            if let Err(err) = state.presence.away(&identity_id, last_seen).await {
                warn!(%identity_id, "away signal failed: {err}");
            }
        }
        ClientEvent::Back { identity_id } => {
            if let Err(err) = state.presence.back(&identity_id).await {
                warn!(%identity_id, "back signal failed: {err}");
            }
        }
        ClientEvent::Logout { identity_id } => {
            if let Err(err) = state.presence.logout(&identity_id).await {
                warn!(%identity_id, "logout failed: {err}");
            }
        }
        ClientEvent::SendMessage {
            sender,
            receiver,
            content,
        } => {
            if let Err(err) = state.delivery.submit(&sender, &receiver, content).await {
                warn!(%sender, %receiver, "send-message rejected: {err}");
            }
        }
        ClientEvent::MarkSeen {
            viewer_id,
            counterparty_id,
        }
        | ClientEvent::ConversationOpened {
            viewer_id,
            counterparty_id,
        } => {
            if let Err(err) = state.receipts.mark_seen(&viewer_id, &counterparty_id).await {
                warn!(%viewer_id, "mark-seen failed: {err}");
            }
        }
    }
}
