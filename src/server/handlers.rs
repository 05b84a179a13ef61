//! Route handlers.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::agent_loop::{TurnRequest, TurnResult};
use crate::capability::CapabilitySnapshot;

use super::{ApiError, AppState};

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub server_name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct OptionalServerRequest {
    #[serde(default)]
    pub server_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServerFilter {
    #[serde(default)]
    pub server_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ArgumentsRequest {
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Deserialize)]
pub struct ReadResourceRequest {
    pub resource_uri: String,
}

#[derive(Debug, Deserialize)]
pub struct PromptRequest {
    pub prompt: String,
    #[serde(default)]
    pub server_contexts: Option<Vec<String>>,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub servers: usize,
    pub connected: usize,
}

/// Parse an optional JSON body; an empty body yields the default.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|error| ApiError::BadRequest(format!("invalid request body: {error}")))
}

async fn snapshot(state: &AppState, filter: &ServerFilter) -> Result<CapabilitySnapshot, ApiError> {
    Ok(state.hub.snapshot(filter.server_name.as_deref()).await?)
}

/// GET /servers
pub async fn list_servers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "servers": state.hub.server_ids() }))
}

/// GET /connected_servers
pub async fn connected_servers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "servers": state.hub.connected_servers().await }))
}

/// GET /status
pub async fn server_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "servers": state.hub.statuses().await }))
}

/// POST /connect
pub async fn connect(
    State(state): State<AppState>,
    Json(request): Json<ConnectRequest>,
) -> ApiResult<Value> {
    state.hub.connect(&request.server_name).await?;
    Ok(Json(json!({ "status": "connected", "server": request.server_name })))
}

/// POST /disconnect
pub async fn disconnect(State(state): State<AppState>, body: Bytes) -> ApiResult<Value> {
    let request: OptionalServerRequest = optional_body(&body)?;
    let closed = state.hub.disconnect(request.server_name.as_deref()).await;
    Ok(Json(match request.server_name {
        Some(server) => json!({ "status": "disconnected", "server": server }),
        None => json!({ "status": "disconnected", "servers": closed }),
    }))
}

/// POST /refresh
pub async fn refresh(State(state): State<AppState>, body: Bytes) -> ApiResult<Value> {
    let request: OptionalServerRequest = optional_body(&body)?;
    let reports = state.hub.refresh(request.server_name.as_deref()).await?;
    Ok(Json(json!({ "refreshed": reports })))
}

/// GET /tools
pub async fn list_tools(
    State(state): State<AppState>,
    Query(filter): Query<ServerFilter>,
) -> ApiResult<Value> {
    let snapshot = snapshot(&state, &filter).await?;
    Ok(Json(json!({ "tools": snapshot.tools, "stale": snapshot.stale })))
}

/// POST /tools/{server}/{tool}/call
pub async fn call_tool(
    State(state): State<AppState>,
    Path((server, tool)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Value> {
    let request: ArgumentsRequest = optional_body(&body)?;
    let result = state.hub.call_tool(&server, &tool, request.arguments).await?;
    Ok(Json(json!({ "tool": tool, "server": server, "result": result })))
}

/// GET /prompts
pub async fn list_prompts(
    State(state): State<AppState>,
    Query(filter): Query<ServerFilter>,
) -> ApiResult<Value> {
    let snapshot = snapshot(&state, &filter).await?;
    Ok(Json(json!({ "prompts": snapshot.prompts })))
}

/// POST /prompts/{server}/{prompt}/execute
pub async fn execute_prompt(
    State(state): State<AppState>,
    Path((server, prompt)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Value> {
    let request: ArgumentsRequest = optional_body(&body)?;
    let template = state.hub.get_prompt(&server, &prompt, request.arguments).await?;
    Ok(Json(json!({ "prompt": prompt, "template": template })))
}

/// GET /resources
pub async fn list_resources(
    State(state): State<AppState>,
    Query(filter): Query<ServerFilter>,
) -> ApiResult<Value> {
    let snapshot = snapshot(&state, &filter).await?;
    Ok(Json(json!({ "resources": snapshot.resources })))
}

/// POST /resource/{server}/read
pub async fn read_resource(
    State(state): State<AppState>,
    Path(server): Path<String>,
    Json(request): Json<ReadResourceRequest>,
) -> ApiResult<Value> {
    let contents = state.hub.read_resource(&server, &request.resource_uri).await?;
    let mime_type = contents.iter().find_map(|content| content.mime_type.clone());
    let text = contents
        .iter()
        .map(|content| content.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    Ok(Json(json!({
        "uri": request.resource_uri,
        "mimeType": mime_type,
        "text": text,
    })))
}

/// POST /prompt
pub async fn send_prompt(
    State(state): State<AppState>,
    Json(request): Json<PromptRequest>,
) -> ApiResult<TurnResult> {
    let mut turn = TurnRequest::new(request.prompt);
    if let Some(id) = request.conversation_id {
        turn = turn.in_conversation(id);
    }
    // An empty list means every connected server.
    if let Some(servers) = request.server_contexts.filter(|servers| !servers.is_empty()) {
        turn = turn.with_servers(servers);
    }
    Ok(Json(state.hub.send_prompt(turn).await?))
}

/// DELETE /conversations/{id}
pub async fn end_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let conversation_id = Uuid::parse_str(&id)
        .map_err(|error| ApiError::BadRequest(format!("invalid conversation id '{id}': {error}")))?;
    state.hub.end_conversation(conversation_id)?;
    Ok(Json(json!({ "status": "ended", "conversation_id": conversation_id })))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        servers: state.hub.server_ids().len(),
        connected: state.hub.connected_servers().await.len(),
    })
}
