use crate::common::error::RealtimeError;
use crate::common::models::{CallType, ConversationKey, LiveMessage, SignalPayload};
use crate::server::auth;
use crate::server::calls::{CallRegistry, CallSession};
use crate::server::config::ServerConfig;
use crate::server::conversations::{ConversationStore, ConversationSummary, MessageRecord};
use crate::server::database::Database;
use crate::server::pipeline::MessagePipeline;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post, put};
use axum::{Json, Router};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub store: ConversationStore,
    pub pipeline: Arc<MessagePipeline>,
    pub calls: CallRegistry,
    pub config: ServerConfig,
    pub upstream: reqwest::Client,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/messages/private", post(send_private_message))
        .route("/messages/conversations", get(list_conversations))
        .route("/messages/:key", get(conversation_history).delete(clear_conversation))
        .route("/messages/:key/read", put(mark_conversation_read))
        .route("/video-calls/initiate", post(initiate_call))
        .route("/video-calls/:id", get(call_session))
        .route("/video-calls/:id/accept", put(accept_call))
        .route("/video-calls/:id/reject", put(reject_call))
        .route("/video-calls/:id/end", put(end_call))
        .route("/video-calls/:id/signal", post(signal_call))
        .route("/api/*path", any(proxy_to_backend))
        .with_state(state)
}

/// HTTP status each error maps to. Kept as a plain function so the mapping
/// is testable without standing up a router.
fn status_for(err: &RealtimeError) -> StatusCode {
    match err {
        RealtimeError::AuthenticationFailure(_) => StatusCode::UNAUTHORIZED,
        RealtimeError::InvalidTransition { .. } => StatusCode::CONFLICT,
        RealtimeError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        RealtimeError::TransientStoreFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
        RealtimeError::DeliveryDrop(_) => StatusCode::GONE,
        RealtimeError::ProxyUpstreamError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        RealtimeError::MessageTooLong { .. } => StatusCode::BAD_REQUEST,
    }
}

/// JSON body for an error response. A failure to reach the backend carries
/// the transport detail in its own field; upstream HTTP errors never take
/// this path, they pass through the proxy untouched.
fn error_body(err: &RealtimeError) -> serde_json::Value {
    match err {
        RealtimeError::ProxyUpstreamError(details) => {
            json!({ "error": "backend request failed", "details": details })
        }
        other => json!({ "error": other.to_string() }),
    }
}

impl IntoResponse for RealtimeError {
    fn into_response(self) -> Response {
        (status_for(&self), Json(error_body(&self))).into_response()
    }
}

/// Resolve the caller from a `Authorization: Bearer <token>` header.
async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<String, RealtimeError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| {
            RealtimeError::AuthenticationFailure("missing bearer token".to_string())
        })?;
    auth::validate_token(&state.db, token).await
}

#[derive(Debug, Deserialize)]
struct SendPrivateRequest {
    receiver_id: String,
    content: String,
}

async fn send_private_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SendPrivateRequest>,
) -> Result<Json<LiveMessage>, RealtimeError> {
    let user_id = require_user(&state, &headers).await?;
    let key = ConversationKey::direct(&user_id, &req.receiver_id);
    let sender_name = auth::display_name(&state.db, &user_id).await;
    let participants = vec![user_id.clone(), req.receiver_id.clone()];
    let msg = state
        .pipeline
        .send(&key, &user_id, &sender_name, &req.content, &participants)
        .await?;
    Ok(Json(msg))
}

async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationSummary>>, RealtimeError> {
    let user_id = require_user(&state, &headers).await?;
    Ok(Json(state.store.list_conversations(&user_id).await?))
}

async fn conversation_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<Json<Vec<MessageRecord>>, RealtimeError> {
    let user_id = require_user(&state, &headers).await?;
    Ok(Json(state.store.messages_for(&key, &user_id).await?))
}

async fn mark_conversation_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, RealtimeError> {
    let user_id = require_user(&state, &headers).await?;
    state.store.mark_read(&key, &user_id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn clear_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, RealtimeError> {
    let user_id = require_user(&state, &headers).await?;
    state.store.clear_for_user(&key, &user_id).await?;
    info!("[HTTP] {} cleared conversation {}", user_id, key);
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
struct InitiateCallRequest {
    receiver_id: String,
    call_type: CallType,
    booking_id: Option<String>,
    squad_id: Option<String>,
}

async fn initiate_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<InitiateCallRequest>,
) -> Result<Json<CallSession>, RealtimeError> {
    let user_id = require_user(&state, &headers).await?;
    let session = state
        .calls
        .initiate(&user_id, &req.receiver_id, req.call_type, req.booking_id, req.squad_id)
        .await?;
    Ok(Json(session))
}

async fn call_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<CallSession>, RealtimeError> {
    require_user(&state, &headers).await?;
    state
        .calls
        .get(&id)
        .await
        .map(Json)
        .ok_or(RealtimeError::SessionNotFound(id))
}

async fn accept_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<CallSession>, RealtimeError> {
    let user_id = require_user(&state, &headers).await?;
    Ok(Json(state.calls.accept(&id, &user_id).await?))
}

async fn reject_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<CallSession>, RealtimeError> {
    let user_id = require_user(&state, &headers).await?;
    Ok(Json(state.calls.reject(&id, &user_id).await?))
}

async fn end_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, RealtimeError> {
    let user_id = require_user(&state, &headers).await?;
    Ok(match state.calls.end(&id, &user_id).await? {
        Some(session) => Json(session).into_response(),
        // Already swept; hanging up again still reads as success.
        None => Json(json!({ "id": id, "status": "ended" })).into_response(),
    })
}

/// Relay over HTTP for clients without an open socket. A drop on a dead
/// session reports `delivered: false` with 200; signaling is best-effort
/// and the caller has nothing to retry.
async fn signal_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(signal): Json<SignalPayload>,
) -> Result<Json<serde_json::Value>, RealtimeError> {
    let user_id = require_user(&state, &headers).await?;
    match state.calls.relay_signal(&id, &user_id, signal).await {
        Ok(()) => Ok(Json(json!({ "delivered": true }))),
        Err(RealtimeError::DeliveryDrop(reason)) => {
            info!("[HTTP] {}", reason);
            Ok(Json(json!({ "delivered": false, "reason": reason })))
        }
        Err(e) => Err(e),
    }
}

/// Pass-through to the main backend for everything that is not real-time:
/// method, body, authorization and content type travel unchanged. A
/// transport failure toward the backend is our error; an upstream error
/// status is the upstream's answer and is forwarded as-is.
async fn proxy_to_backend(
    State(state): State<AppState>,
    method: Method,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RealtimeError> {
    let url = format!("{}/api/{}", state.config.backend_base_url.trim_end_matches('/'), path);
    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| RealtimeError::ProxyUpstreamError(e.to_string()))?;

    let mut request = state.upstream.request(method, &url);
    for name in ["authorization", "content-type"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            request = request.header(name, value);
        }
    }
    if !body.is_empty() {
        request = request.body(body.to_vec());
    }

    let upstream = request.send().await.map_err(|e| {
        error!("[HTTP] Backend proxy to {} failed: {}", url, e);
        RealtimeError::ProxyUpstreamError(e.to_string())
    })?;

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let bytes = upstream.bytes().await.map_err(|e| {
        warn!("[HTTP] Backend response body from {} unreadable: {}", url, e);
        RealtimeError::ProxyUpstreamError(e.to_string())
    })?;

    Ok((status, [(axum::http::header::CONTENT_TYPE, content_type)], bytes).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_follow_the_taxonomy() {
        assert_eq!(
            status_for(&RealtimeError::AuthenticationFailure("bad token".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&RealtimeError::InvalidTransition {
                session_id: "s1".into(),
                expected: "ringing",
                actual: "ended".into(),
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&RealtimeError::SessionNotFound("s1".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&RealtimeError::MessageTooLong { max: 2048 }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&RealtimeError::TransientStoreFailure(anyhow::anyhow!("db gone"))),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn proxy_transport_failures_are_500_with_details() {
        let err = RealtimeError::ProxyUpstreamError("connection refused".into());
        assert_eq!(status_for(&err), StatusCode::INTERNAL_SERVER_ERROR);

        let body = error_body(&err);
        assert_eq!(body["details"], "connection refused");
        assert!(body["error"].is_string());

        // Other errors keep the single-field shape.
        let body = error_body(&RealtimeError::SessionNotFound("s1".into()));
        assert!(body.get("details").is_none());
    }
}
