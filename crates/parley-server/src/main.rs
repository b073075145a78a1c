//! Parley server.
//!
//! Presence and delivery synchronization for one-to-one chat: a
//! WebSocket push channel and a REST surface over a SQLite store, in
//! one process that owns the full connection registry.

mod api;
mod auth;
mod config;
mod delivery;
mod events;
mod presence;
mod receipts;
mod roster;
mod sessions;
mod socket;
mod storage;

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    extract::ws::WebSocketUpgrade,
    response::IntoResponse,
    routing::{get, post, put},
};
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use auth::{IdentityVerifier, TokenDirectory};
use config::Config;
use delivery::DeliveryPipeline;
use presence::PresenceManager;
use receipts::ReceiptTracker;
use roster::Roster;
use sessions::SessionRegistry;
use storage::Store;

/// Shared handles for every route and connection handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub registry: Arc<SessionRegistry>,
    pub presence: Arc<PresenceManager>,
    pub delivery: Arc<DeliveryPipeline>,
    pub receipts: Arc<ReceiptTracker>,
    pub roster: Arc<Roster>,
    pub verifier: Arc<dyn IdentityVerifier>,
}

impl AppState {
    pub fn new(store: Store, verifier: Arc<dyn IdentityVerifier>) -> Self {
        let store = Arc::new(store);
        let registry = Arc::new(SessionRegistry::new());
        Self {
            presence: Arc::new(PresenceManager::new(registry.clone(), store.clone())),
            delivery: Arc::new(DeliveryPipeline::new(registry.clone(), store.clone())),
            receipts: Arc::new(ReceiptTracker::new(registry.clone(), store.clone())),
            roster: Arc::new(Roster::new(store.clone())),
            store,
            registry,
            verifier,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/identities", post(api::register_identity))
        .route("/api/messages", post(api::send_message))
        .route("/api/messages/chats/{username}", get(api::recent_chats))
        .route(
            "/api/messages/unread-counts/{username}",
            get(api::unread_counts),
        )
        .route(
            "/api/messages/mark-read/{counterparty_id}/{viewer_id}",
            put(api::mark_read),
        )
        .route("/api/messages/{user1}/{user2}", get(api::conversation))
        .route("/api/users/status/{username}", get(api::online_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    let store = Store::open(&config.db_path).unwrap();
    let directory = TokenDirectory::with_tokens(&config.tokens);
    let state = AppState::new(store, Arc::new(directory));
    let app = app(state);

    tracing::info!("Parley listening on {}", config.addr);
    tracing::info!("WebSocket: ws://{}/ws", config.addr);
    tracing::info!("REST API:  http://{}/api/", config.addr);

    let listener = tokio::net::TcpListener::bind(&config.addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| socket::handle_connection(socket, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use parley_core::Identity;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start() -> (AppState, String, Identity, Identity) {
        let store = Store::open_in_memory().unwrap();
        let alice = store.create_identity("alice").unwrap().unwrap();
        let bob = store.create_identity("bob").unwrap().unwrap();
        let state = AppState::new(store, Arc::new(TokenDirectory::new()));
        let router = app(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (state, format!("ws://{addr}/ws"), alice, bob)
    }

    async fn connect_and_join(url: &str, identity: &Identity) -> Client {
        let (mut ws, _) = connect_async(url).await.unwrap();
        let join = json!({ "type": "join", "identity_id": identity.id.as_str() }).to_string();
        ws.send(tungstenite::Message::text(join)).await.unwrap();
        ws
    }

    async fn send_event(ws: &mut Client, event: Value) {
        ws.send(tungstenite::Message::text(event.to_string()))
            .await
            .unwrap();
    }

    /// Read events until one with the wanted tag arrives.
    async fn wait_for(ws: &mut Client, wanted: &str) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for event")
                .expect("connection closed")
                .unwrap();
            if let tungstenite::Message::Text(text) = frame {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["type"] == wanted {
                    return value;
                }
            }
        }
    }

    /// Read events until a presence change for the given identity and
    /// flag arrives. Proves the server processed that identity's
    /// transition before the test moves on.
    async fn wait_for_presence(ws: &mut Client, identity: &Identity, online: bool) -> Value {
        loop {
            let value = wait_for(ws, "presence-changed").await;
            if value["identity_id"] == identity.id.as_str() && value["online"] == online {
                return value;
            }
        }
    }

    #[tokio::test]
    async fn offline_send_reconnect_and_read_flow() {
        let (state, url, alice, bob) = start().await;

        // Alice comes online and hears her own presence broadcast.
        let mut alice_ws = connect_and_join(&url, &alice).await;
        wait_for_presence(&mut alice_ws, &alice, true).await;

        // She messages bob while he is offline.
        send_event(
            &mut alice_ws,
            json!({
                "type": "send-message",
                "sender": "alice",
                "receiver": "bob",
                "content": "hi",
            }),
        )
        .await;
        let received = wait_for(&mut alice_ws, "message-received").await;
        assert_eq!(received["message"]["content"], "hi");
        assert_eq!(received["message"]["delivered"], false);

        // Persisted as undelivered; bob's unread count groups under alice.
        let counts = state.roster.unread_counts(&bob.id).unwrap();
        assert_eq!(counts.get("alice"), Some(&1));

        // Bob reconnects: the backlog scan promotes the message and
        // alice gets exactly one delivery confirmation.
        let mut bob_ws = connect_and_join(&url, &bob).await;
        let status = wait_for(&mut alice_ws, "message-status-changed").await;
        assert_eq!(status["status"], "delivered");
        assert_eq!(status["message"]["delivered"], true);

        // Bob opens the conversation: read receipts flow back.
        send_event(
            &mut bob_ws,
            json!({
                "type": "conversation-opened",
                "viewer_id": bob.id.as_str(),
                "counterparty_id": alice.id.as_str(),
            }),
        )
        .await;
        let status = wait_for(&mut alice_ws, "message-status-changed").await;
        assert_eq!(status["status"], "read");
        assert_eq!(status["message"]["read"], true);
        assert_eq!(status["message"]["delivered"], true);

        // Unread drained, record in its terminal state.
        let counts = state.roster.unread_counts(&bob.id).unwrap();
        assert!(counts.is_empty());
        let message_id = status["message_id"].as_str().unwrap();
        let stored = state.store.find_message(&message_id.into()).unwrap().unwrap();
        assert!(stored.read && stored.delivered);
        assert!(stored.flags_consistent());

        // Bob drops his only connection: everyone still connected gets
        // one offline broadcast for him.
        drop(bob_ws);
        let presence = wait_for_presence(&mut alice_ws, &bob, false).await;
        assert!(presence["last_seen"].is_u64());
    }

    #[tokio::test]
    async fn live_delivery_between_two_connected_clients() {
        let (_state, url, alice, bob) = start().await;
        let mut alice_ws = connect_and_join(&url, &alice).await;
        let mut bob_ws = connect_and_join(&url, &bob).await;
        // Bob must be registered before the send for the delivered
        // flag to matter; his broadcast reaching alice proves it.
        wait_for_presence(&mut alice_ws, &bob, true).await;

        send_event(
            &mut alice_ws,
            json!({
                "type": "send-message",
                "sender": "alice",
                "receiver": "bob",
                "content": "live one",
            }),
        )
        .await;

        // Bob receives it live, born delivered.
        let received = wait_for(&mut bob_ws, "message-received").await;
        assert_eq!(received["message"]["content"], "live one");
        assert_eq!(received["message"]["delivered"], true);

        // Alice gets the immediate delivery confirmation and the
        // contact-list refresh.
        let status = wait_for(&mut alice_ws, "message-status-changed").await;
        assert_eq!(status["status"], "delivered");
        let contact = wait_for(&mut bob_ws, "recent-contact-updated").await;
        assert_eq!(contact["contact"], "alice");
        assert_eq!(contact["last_message"], "live one");
    }

    #[tokio::test]
    async fn logout_force_disconnects_every_session() {
        let (_state, url, alice, bob) = start().await;
        let mut watcher = connect_and_join(&url, &bob).await;
        wait_for_presence(&mut watcher, &bob, true).await;

        let mut first = connect_and_join(&url, &alice).await;
        let mut second = connect_and_join(&url, &alice).await;
        wait_for_presence(&mut watcher, &alice, true).await;

        send_event(
            &mut second,
            json!({ "type": "logout", "identity_id": alice.id.as_str() }),
        )
        .await;

        // The watcher sees alice go offline once.
        wait_for_presence(&mut watcher, &alice, false).await;

        // Both of alice's sockets get closed by the server.
        for ws in [&mut first, &mut second] {
            let closed = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    match ws.next().await {
                        None | Some(Ok(tungstenite::Message::Close(_))) => break,
                        Some(Err(_)) => break,
                        Some(Ok(_)) => continue,
                    }
                }
            })
            .await;
            assert!(closed.is_ok(), "socket should close after logout");
        }
    }
}
