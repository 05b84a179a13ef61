//! HTTP control surface over an [`McpHub`].

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::hub::McpHub;

pub use error::ApiError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<McpHub>,
}

impl AppState {
    pub fn new(hub: Arc<McpHub>) -> Self {
        Self { hub }
    }
}

/// Create the control-surface router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Servers
        .route("/servers", get(handlers::list_servers))
        .route("/connected_servers", get(handlers::connected_servers))
        .route("/status", get(handlers::server_status))
        .route("/connect", post(handlers::connect))
        .route("/disconnect", post(handlers::disconnect))
        .route("/refresh", post(handlers::refresh))
        // Catalog and routing
        .route("/tools", get(handlers::list_tools))
        .route("/tools/{server}/{tool}/call", post(handlers::call_tool))
        .route("/prompts", get(handlers::list_prompts))
        .route("/prompts/{server}/{prompt}/execute", post(handlers::execute_prompt))
        .route("/resources", get(handlers::list_resources))
        .route("/resource/{server}/read", post(handlers::read_resource))
        // Conversation
        .route("/prompt", post(handlers::send_prompt))
        .route("/conversations/{id}", delete(handlers::end_conversation))
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
