//! HTTP API: the request/response channel.
//!
//! History loads, recent-contact and unread lookups, the manual
//! mark-read call, message submission, and the online-status probe.
//! Every route except identity provisioning requires the
//! verified-identity precondition (bearer token resolved by the
//! identity collaborator seam).

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::error;

use parley_core::{ConversationKey, Error, Identity, IdentityId, MessageId};

use crate::AppState;
use crate::auth::Verified;
use crate::events::MessageView;
use crate::storage::ContactSummary;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Error-taxonomy to status-code mapping for the REST surface.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidRecipient => StatusCode::BAD_REQUEST,
            Error::TransientStoreFailure(_) | Error::StaleSession => {
                error!("request failed: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Request body for POST /api/identities.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
}

/// Request body for POST /api/messages.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub sender: String,
    pub receiver: String,
    pub content: String,
}

/// Response for GET /api/messages/chats/{username}.
#[derive(Debug, Serialize)]
pub struct ChatsResponse {
    pub chats: Vec<ContactSummary>,
}

/// Response for PUT /api/messages/mark-read/{counterparty}/{viewer}.
#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub promoted: Vec<MessageId>,
}

/// Response for GET /api/users/status/{username}.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub online: bool,
    pub last_seen: Option<u64>,
}

/// POST /api/identities - provision an identity record.
///
/// This is the seam the registration flow of the identity collaborator
/// calls once its own credential work succeeded.
pub async fn register_identity(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Response, ApiError> {
    match state
        .store
        .create_identity(&req.username)
        .map_err(Error::store)?
    {
        Some(identity) => Ok((StatusCode::CREATED, Json(identity)).into_response()),
        None => Ok((
            StatusCode::CONFLICT,
            Json(ErrorBody {
                error: format!("username '{}' is taken", req.username),
            }),
        )
            .into_response()),
    }
}

/// GET /api/messages/{user1}/{user2} - conversation history, ascending.
pub async fn conversation(
    State(state): State<AppState>,
    Verified(_): Verified,
    Path((user1, user2)): Path<(String, String)>,
) -> Result<Json<Vec<MessageView>>, ApiError> {
    let a = resolve_username(&state, &user1)?;
    let b = resolve_username(&state, &user2)?;
    // Normalize the pair; {a, b} and {b, a} are the same conversation.
    let key = ConversationKey::new(a.id.clone(), b.id.clone());
    let (first, second) = key.parties();
    let messages = state
        .store
        .conversation_between(first, second)
        .map_err(Error::store)?;
    let views = messages
        .iter()
        .map(|m| {
            if m.sender_id == a.id {
                MessageView::resolve(m, &a, &b)
            } else {
                MessageView::resolve(m, &b, &a)
            }
        })
        .collect();
    Ok(Json(views))
}

/// GET /api/messages/chats/{username} - recent contacts, most recent
/// message first.
pub async fn recent_chats(
    State(state): State<AppState>,
    Verified(_): Verified,
    Path(username): Path<String>,
) -> Result<Json<ChatsResponse>, ApiError> {
    let identity = resolve_username(&state, &username)?;
    let chats = state.roster.contacts_for(&identity.id)?;
    Ok(Json(ChatsResponse { chats }))
}

/// GET /api/messages/unread-counts/{username} - unread per counterparty.
pub async fn unread_counts(
    State(state): State<AppState>,
    Verified(_): Verified,
    Path(username): Path<String>,
) -> Result<Json<HashMap<String, i64>>, ApiError> {
    let identity = resolve_username(&state, &username)?;
    Ok(Json(state.roster.unread_counts(&identity.id)?))
}

/// PUT /api/messages/mark-read/{counterparty_id}/{viewer_id} - promote
/// everything the counterparty sent the viewer to read.
pub async fn mark_read(
    State(state): State<AppState>,
    Verified(_): Verified,
    Path((counterparty_id, viewer_id)): Path<(String, String)>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let viewer = IdentityId::from(viewer_id.as_str());
    let counterparty = IdentityId::from(counterparty_id.as_str());
    let promoted = state.receipts.mark_seen(&viewer, &counterparty).await?;
    Ok(Json(MarkReadResponse { promoted }))
}

/// POST /api/messages - submit a message over the request/response
/// channel.
pub async fn send_message(
    State(state): State<AppState>,
    Verified(_): Verified,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<MessageView>, ApiError> {
    let message = state
        .delivery
        .submit(&req.sender, &req.receiver, req.content)
        .await?;
    let sender = resolve_username(&state, &req.sender)?;
    let receiver = resolve_username(&state, &req.receiver)?;
    Ok(Json(MessageView::resolve(&message, &sender, &receiver)))
}

/// GET /api/users/status/{username} - online flag and last-seen.
pub async fn online_status(
    State(state): State<AppState>,
    Verified(_): Verified,
    Path(username): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let identity = resolve_username(&state, &username)?;
    Ok(Json(StatusResponse {
        online: identity.online,
        last_seen: identity.last_seen,
    }))
}

fn resolve_username(state: &AppState, username: &str) -> Result<Identity, ApiError> {
    Ok(state
        .store
        .find_identity_by_username(username)
        .map_err(Error::store)?
        .ok_or_else(|| Error::not_found(format!("identity '{username}'")))?)
}
