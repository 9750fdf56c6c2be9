//! Inbound HTTP surface.
//!
//! - `POST /api/chat` relays a chat request upstream and streams the reply
//!   back as `data: {"content":"..."}` lines (or one JSON object when
//!   `stream` is false).
//! - `POST /api/chat/{stream_id}/stop` stops a relayed stream.
//! - `/api/histories` is conversation CRUD over the configured store.
//! - `GET /health`.

use crate::decoder::decode_stream;
use crate::error::ChatError;
use crate::models::{ChatHistory, Message, Role, WireMessage};
use crate::state::{AppState, StreamRegistration};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use uuid::Uuid;

pub const STREAM_ID_HEADER: &str = "x-stream-id";

pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/chat/{stream_id}/stop", post(stop_chat))
        .route("/api/histories", get(list_histories).post(create_history))
        .route(
            "/api/histories/{id}",
            get(get_history).put(update_history).delete(delete_history),
        )
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "model": state.config.model,
        "chat_enabled": state.transport().is_ok(),
    }))
}

#[derive(Deserialize, Debug)]
struct ChatRequest {
    messages: Vec<WireMessage>,
    #[serde(default = "default_stream")]
    stream: bool,
}

fn default_stream() -> bool {
    true
}

#[derive(Serialize, Debug)]
struct ChatReply {
    role: Role,
    content: String,
}

/// `POST /api/chat`
///
/// The body is parsed by hand so malformed input gets the same
/// `{ "error": ... }` shape as every other failure.
async fn chat(State(state): State<AppState>, body: Bytes) -> Result<Response, ChatError> {
    let transport = state.transport()?;

    let request: ChatRequest = serde_json::from_slice(&body)
        .map_err(|e| ChatError::InvalidInput(format!("Invalid messages format: {}", e)))?;
    if request.messages.is_empty() {
        return Err(ChatError::InvalidInput("Invalid messages format: empty list".to_string()));
    }
    log::info!(
        "Received chat request: {} messages, stream={}",
        request.messages.len(),
        request.stream
    );

    let (stream_id, token) = state.register_stream();
    let registration = StreamRegistration {
        id: stream_id,
        streams: state.active_streams.clone(),
    };

    if !request.stream {
        let content = transport.complete(&request.messages, &token).await?;
        drop(registration);
        return Ok(Json(ChatReply {
            role: Role::Assistant,
            content,
        })
        .into_response());
    }

    // Upstream errors before the first byte still map to a proper status.
    let body = transport.open_stream(&request.messages, &token).await?;
    let mut deltas = decode_stream(body);

    let events = async_stream::stream! {
        // Dropped with the stream: on completion, stop, or client disconnect.
        let _registration = registration;
        while let Some(delta) = deltas.next().await {
            match delta {
                Ok(content) => {
                    let data = json!({ "content": content }).to_string();
                    yield Ok::<Event, Infallible>(Event::default().data(data));
                }
                Err(ChatError::Cancelled) => {
                    log::info!("Relay for stream {} stopped.", stream_id);
                    break;
                }
                Err(e) => {
                    log::error!("Relay for stream {} failed: {}", stream_id, e);
                    let data = json!({ "error": e.to_string() }).to_string();
                    yield Ok(Event::default().data(data));
                    break;
                }
            }
        }
    };

    Ok((
        [(HeaderName::from_static(STREAM_ID_HEADER), stream_id.to_string())],
        Sse::new(events),
    )
        .into_response())
}

/// `POST /api/chat/{stream_id}/stop`
async fn stop_chat(
    State(state): State<AppState>,
    Path(stream_id): Path<Uuid>,
) -> Result<StatusCode, ChatError> {
    log::warn!("Stop requested for stream {}", stream_id);
    if state.stop_stream(&stream_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ChatError::NotFound(format!("stream {}", stream_id)))
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    user_id: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CreateHistory {
    user_id: String,
    messages: Vec<Message>,
}

#[derive(Deserialize, Debug)]
struct UpdateHistory {
    messages: Vec<Message>,
    title: Option<String>,
}

async fn list_histories(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ChatHistory>>, ChatError> {
    Ok(Json(state.store.list(&query.user_id).await?))
}

async fn create_history(
    State(state): State<AppState>,
    Json(body): Json<CreateHistory>,
) -> Result<(StatusCode, Json<serde_json::Value>), ChatError> {
    let id = state.store.create(&body.user_id, &body.messages).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChatHistory>, ChatError> {
    state
        .store
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ChatError::NotFound(format!("conversation {}", id)))
}

async fn update_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateHistory>,
) -> Result<StatusCode, ChatError> {
    let title = body.title.as_deref().map(str::trim).filter(|t| !t.is_empty());
    state.store.update(&id, &body.messages, title).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ChatError> {
    state.store.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
