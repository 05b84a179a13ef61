//! Routes tool calls, resource reads and prompt renders to their server.

pub mod validation;

pub use validation::validate_arguments;

use std::sync::Arc;
use std::time::{Duration, Instant};

use rmcp::model::JsonObject;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{live_session_of, ConnectionManager, LiveSession};
use crate::error::{HubError, NotFoundKind, Result};
use crate::mcp::{PromptMessage, ResourceContent, SessionError, ToolOutcome};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Validates and forwards single requests to the owning server.
///
/// Nothing is cached: every call is a fresh round trip.
pub struct ToolDispatcher {
    connections: Arc<ConnectionManager>,
    call_timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(connections: Arc<ConnectionManager>, call_timeout: Duration) -> Self {
        Self {
            connections,
            call_timeout,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Invoke `tool` on `server` with `arguments`.
    ///
    /// The server's own `is_error` results come back as `Ok`.
    pub async fn invoke(&self, server: &str, tool: &str, arguments: Value) -> Result<ToolOutcome> {
        self.invoke_cancellable(server, tool, arguments, &CancellationToken::new())
            .await
    }

    /// Like [`invoke`](Self::invoke), additionally aborted when `cancel` fires.
    pub async fn invoke_cancellable(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        let (live, schema) = {
            let slot = self
                .connections
                .slot(server)
                .ok_or_else(|| HubError::server_not_found(server))?;
            let state = slot.state.lock().await;
            let live = live_session_of(server, &state)?;
            let schema = state
                .catalog
                .as_ref()
                .and_then(|catalog| catalog.tool(tool))
                .map(|entry| entry.input_schema.clone())
                .ok_or_else(|| HubError::not_found(NotFoundKind::Tool, server, tool))?;
            (live, schema)
        };

        let arguments = into_arguments(tool, arguments)?;
        let as_value = Value::Object(arguments.clone().unwrap_or_default());
        validate_arguments(&as_value, &schema).map_err(|message| HubError::SchemaValidation {
            tool: tool.to_string(),
            message,
        })?;

        debug!(server, tool, "dispatching tool call");
        let started = Instant::now();
        let result = self
            .bounded(&live, cancel, live.session.call_tool(tool, arguments))
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let timed_out = matches!(result, Err(SessionError::Timeout(_)));
        let cancelled = matches!(result, Err(SessionError::Cancelled(_)));
        if !cancelled {
            self.connections
                .record_call_outcome(server, live.epoch, timed_out)
                .await;
        }

        match result {
            Ok(outcome) => {
                debug!(server, tool, elapsed_ms, is_error = outcome.is_error, "tool call finished");
                Ok(outcome)
            }
            Err(error) => {
                warn!(server, tool, elapsed_ms, error = %error, "tool call failed");
                Err(HubError::ToolExecution {
                    server: server.to_string(),
                    tool: tool.to_string(),
                    kind: error.failure_kind(),
                    message: error.to_string(),
                })
            }
        }
    }

    /// Read one resource. The URI need not appear in the cached catalog.
    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<Vec<ResourceContent>> {
        let live = self.connections.live_session(server).await?;
        debug!(server, uri, "reading resource");
        self.bounded(&live, &CancellationToken::new(), live.session.read_resource(uri))
            .await
            .map_err(|error| request_error(server, "read_resource", error))
    }

    /// Render a prompt template the server lists in its catalog.
    pub async fn get_prompt(
        &self,
        server: &str,
        name: &str,
        arguments: Value,
    ) -> Result<Vec<PromptMessage>> {
        let (live, required) = {
            let slot = self
                .connections
                .slot(server)
                .ok_or_else(|| HubError::server_not_found(server))?;
            let state = slot.state.lock().await;
            let live = live_session_of(server, &state)?;
            let prompt = state
                .catalog
                .as_ref()
                .and_then(|catalog| catalog.prompt(name))
                .ok_or_else(|| HubError::not_found(NotFoundKind::Prompt, server, name))?;
            let required: Vec<String> =
                prompt.required_arguments().map(str::to_string).collect();
            (live, required)
        };

        let arguments = into_arguments(name, arguments)?;
        if let Some(missing) = required
            .iter()
            .find(|arg| !arguments.as_ref().is_some_and(|map| map.contains_key(*arg)))
        {
            return Err(HubError::SchemaValidation {
                tool: name.to_string(),
                message: format!("missing required argument '{missing}'"),
            });
        }

        debug!(server, prompt = name, "rendering prompt");
        self.bounded(&live, &CancellationToken::new(), live.session.get_prompt(name, arguments))
            .await
            .map_err(|error| request_error(server, "get_prompt", error))
    }

    /// Run one request bounded by the call timeout, the session's lifetime
    /// and the caller's token, whichever ends first.
    async fn bounded<T>(
        &self,
        live: &LiveSession,
        cancel: &CancellationToken,
        request: impl std::future::Future<Output = std::result::Result<T, SessionError>>,
    ) -> std::result::Result<T, SessionError> {
        tokio::select! {
            _ = live.cancel.cancelled() => {
                Err(SessionError::Cancelled(Some("server disconnected".into())))
            }
            _ = cancel.cancelled() => Err(SessionError::Cancelled(None)),
            result = tokio::time::timeout(self.call_timeout, request) => {
                result.unwrap_or(Err(SessionError::Timeout(self.call_timeout)))
            }
        }
    }
}

/// Arguments go to the server as a JSON object, or absent when `null`.
fn into_arguments(target: &str, arguments: Value) -> Result<Option<JsonObject>> {
    match arguments {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        other => Err(HubError::SchemaValidation {
            tool: target.to_string(),
            message: format!(
                "arguments must be an object, got {}",
                validation::json_type_name(&other)
            ),
        }),
    }
}

fn request_error(server: &str, operation: &str, error: SessionError) -> HubError {
    warn!(server, operation, error = %error, "server request failed");
    HubError::ServerRequest {
        server: server.to_string(),
        operation: operation.to_string(),
        kind: error.failure_kind(),
        message: error.to_string(),
    }
}
