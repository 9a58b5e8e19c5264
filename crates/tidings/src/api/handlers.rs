//! HTTP request handlers.

use axum::{
    Json,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::rejection::WebSocketUpgradeRejection,
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use super::{socket, sse};
use crate::chat::PromptRequest;
use crate::store::{Conversation, Message};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub default: String,
    pub models: Vec<String>,
}

/// List the model names conversations can be bound to.
pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let models = state.chat.models();
    Json(ModelsResponse {
        default: models.default_name().to_string(),
        models: models.names().into_iter().map(str::to_string).collect(),
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[instrument(skip(state, request), fields(user_id = %request.user_id))]
pub async fn create_conversation(
    State(state): State<AppState>,
    Json(request): Json<CreateConversationRequest>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    if request.user_id.trim().is_empty() {
        return Err(ApiError::bad_request("user_id is required"));
    }

    let conversation = state
        .chat
        .create_conversation(
            request.name.as_deref(),
            request.model.as_deref(),
            &request.user_id,
        )
        .await?;

    info!(conversation_id = %conversation.id, model = %conversation.model, "Created conversation");
    Ok((StatusCode::CREATED, Json(conversation)))
}

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

#[instrument(skip(state))]
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<ConversationResponse>> {
    let conversation = state.store.get_conversation(&conversation_id).await?;
    let messages = state.store.list_messages(&conversation_id).await?;
    Ok(Json(ConversationResponse {
        conversation,
        messages,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PromptBody {
    pub user_id: String,
    pub prompt: String,
    #[serde(default)]
    pub context: Option<i64>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub otr: bool,
}

#[derive(Debug, Serialize)]
pub struct PromptResponse {
    /// Reply is empty when streaming; follow the stream endpoint for it.
    pub message: Message,
}

#[instrument(skip(state, body), fields(stream = body.stream, otr = body.otr))]
pub async fn prompt(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(body): Json<PromptBody>,
) -> ApiResult<Json<PromptResponse>> {
    if body.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt is required"));
    }

    let message = state
        .chat
        .prompt(PromptRequest {
            conversation_id,
            user_id: body.user_id,
            prompt: body.prompt,
            context: body.context,
            stream: body.stream,
            otr: body.otr,
        })
        .await?;

    Ok(Json(PromptResponse { message }))
}

/// Live envelopes for a conversation.
///
/// Upgrades to a WebSocket when the handshake headers are present and falls
/// back to server-sent events otherwise.
#[instrument(skip(state, ws, headers))]
pub async fn stream(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> ApiResult<Response> {
    let conversation = state.store.get_conversation(&conversation_id).await?;
    let sub = state.broker.subscribe(&conversation.id).await?;

    let Ok(ws) = ws else {
        info!("Streaming conversation over SSE");
        return Ok(sse::serve(state.broker.clone(), sub, &state.shutdown).into_response());
    };

    info!("Streaming conversation over WebSocket");
    let settings = state.socket;
    let broker = state.broker.clone();
    let shutdown = state.shutdown.clone();

    // Any offered subprotocol is accepted; validating it is up to an auth layer.
    let offered = offered_protocols(&headers);

    Ok(ws
        .protocols(offered)
        .max_message_size(settings.max_message_size)
        .on_upgrade(move |socket| socket::serve(socket, broker, sub, settings, shutdown)))
}

fn offered_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}
