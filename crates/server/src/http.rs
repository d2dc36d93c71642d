use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use shared::{
    domain::{MessageId, UserId},
    error::{ApiError, AuthError, ErrorCode},
    protocol::ChatPayload,
};

use crate::AppState;

/// Error rendered at the HTTP edge. Every failure, from a bad credential
/// to a store fault, comes back as `{"message": ...}` with the status
/// derived from the error's code.
pub struct HttpError(ApiError);

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match self.0.code {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Validation => StatusCode::BAD_REQUEST,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "message": self.0.message }))).into_response()
    }
}

impl From<ApiError> for HttpError {
    fn from(value: ApiError) -> Self {
        Self(value)
    }
}

impl From<AuthError> for HttpError {
    fn from(value: AuthError) -> Self {
        Self(value.into())
    }
}

pub fn internal(error: anyhow::Error) -> HttpError {
    HttpError(ApiError::new(ErrorCode::Internal, error.to_string()))
}

/// Identity behind a bearer token, checked by the same verifier that
/// gates socket connections.
fn bearer_identity(state: &AppState, headers: &HeaderMap) -> Result<UserId, HttpError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    Ok(state.verifier.verify(token)?)
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub receiver: UserId,
    pub msg: String,
}

/// `POST /v1/messages` — persist one message from the bearer identity.
/// Plain storage write; connected devices are not notified from here.
pub async fn create_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<ChatPayload>, HttpError> {
    let sender = bearer_identity(&state, &headers)?;

    if request.msg.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "msg must not be empty").into());
    }

    let stored = state
        .relay
        .store
        .insert_chat(&sender, &request.receiver, &request.msg, Utc::now())
        .await
        .map_err(internal)?;

    Ok(Json(relay::chat_payload(stored)))
}

/// `GET /v1/conversations/:peer` — full history between the bearer
/// identity and `peer`, both directions, oldest first.
pub async fn list_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(peer): Path<String>,
) -> Result<Json<Vec<ChatPayload>>, HttpError> {
    let identity = bearer_identity(&state, &headers)?;

    let chats = state
        .relay
        .store
        .list_between(&identity, &UserId(peer))
        .await
        .map_err(internal)?;

    Ok(Json(chats.into_iter().map(relay::chat_payload).collect()))
}

/// `DELETE /v1/messages/:chat_id` — remove one message by id. Unlike the
/// socket path this does not push a refreshed conversation anywhere, and
/// an unknown id is a 404 rather than a silent no-op.
pub async fn delete_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<i64>,
) -> Result<StatusCode, HttpError> {
    bearer_identity(&state, &headers)?;

    let removed = state
        .relay
        .store
        .delete_chat(MessageId(chat_id))
        .await
        .map_err(internal)?;

    if removed == 0 {
        return Err(ApiError::new(ErrorCode::NotFound, "message not found").into());
    }

    Ok(StatusCode::NO_CONTENT)
}

pub async fn not_found() -> HttpError {
    ApiError::new(ErrorCode::NotFound, "not found").into()
}
