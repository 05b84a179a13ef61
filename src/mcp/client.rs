//! Live sessions with MCP servers.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use rmcp::{
    model::{
        CallToolRequestParams, CallToolResult, Content, GetPromptRequestParams, JsonObject,
        ReadResourceRequestParams, ResourceContents,
    },
    service::{DynService, Peer, RoleClient, RunningService, ServiceError},
};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::FailureKind;

use super::schema::{
    McpPrompt, McpResource, McpTool, PromptMessage, ResourceContent, ToolOutcome,
};

pub type DynClientService = Box<dyn DynService<RoleClient>>;
pub type McpRunningService = RunningService<RoleClient, DynClientService>;

/// Failure of a single request on an established session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("MCP error {code}: {message}")]
    Protocol { code: i32, message: String },

    #[error("malformed MCP response: {0}")]
    Malformed(String),

    #[error("MCP transport error: {0}")]
    Transport(String),

    #[error("MCP session closed")]
    Closed,

    #[error("MCP request cancelled{}", .0.as_deref().map(|r| format!(" ({r})")).unwrap_or_default())]
    Cancelled(Option<String>),

    #[error("MCP request timed out after {0:?}")]
    Timeout(Duration),
}

impl SessionError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Protocol { .. } | Self::Malformed(_) => FailureKind::Server,
            Self::Transport(_) | Self::Closed => FailureKind::Transport,
            Self::Cancelled(_) => FailureKind::Cancelled,
            Self::Timeout(timeout) => FailureKind::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            },
        }
    }
}

/// Request/response operations on one server session.
///
/// Methods take `&self` so a session can be shared while a call is in
/// flight and closed concurrently from another task.
#[async_trait]
pub trait McpSession: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpTool>, SessionError>;
    async fn list_prompts(&self) -> Result<Vec<McpPrompt>, SessionError>;
    async fn list_resources(&self) -> Result<Vec<McpResource>, SessionError>;
    async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContent>, SessionError>;
    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<Vec<PromptMessage>, SessionError>;
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<ToolOutcome, SessionError>;
    /// Release the session. Calling it twice is a no-op.
    async fn close(&self);
}

/// Session backed by an rmcp running service.
pub struct RmcpSession {
    peer: Peer<RoleClient>,
    service: Mutex<Option<McpRunningService>>,
}

impl RmcpSession {
    pub fn new(service: McpRunningService) -> Self {
        Self {
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
        }
    }
}

#[async_trait]
impl McpSession for RmcpSession {
    async fn list_tools(&self) -> Result<Vec<McpTool>, SessionError> {
        let tools = match self.peer.list_all_tools().await {
            Ok(tools) => tools,
            Err(ServiceError::UnexpectedResponse) => {
                self.peer
                    .list_tools(None)
                    .await
                    .map_err(map_service_error)?
                    .tools
            }
            Err(error) => return Err(map_service_error(error)),
        };
        Ok(tools.into_iter().map(map_mcp_tool).collect())
    }

    async fn list_prompts(&self) -> Result<Vec<McpPrompt>, SessionError> {
        let prompts = self
            .peer
            .list_all_prompts()
            .await
            .map_err(map_service_error)?;
        prompts.iter().map(reshape).collect()
    }

    async fn list_resources(&self) -> Result<Vec<McpResource>, SessionError> {
        let resources = self
            .peer
            .list_all_resources()
            .await
            .map_err(map_service_error)?;
        resources.iter().map(reshape).collect()
    }

    async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContent>, SessionError> {
        let params: ReadResourceRequestParams =
            serde_json::from_value(serde_json::json!({ "uri": uri }))
                .map_err(|e| SessionError::Malformed(e.to_string()))?;
        let result = self
            .peer
            .read_resource(params)
            .await
            .map_err(map_service_error)?;
        Ok(result
            .contents
            .into_iter()
            .map(map_resource_contents)
            .collect())
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<Vec<PromptMessage>, SessionError> {
        let mut params = serde_json::json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = serde_json::Value::Object(arguments);
        }
        let params: GetPromptRequestParams = serde_json::from_value(params)
            .map_err(|e| SessionError::Malformed(e.to_string()))?;
        let result = self
            .peer
            .get_prompt(params)
            .await
            .map_err(map_service_error)?;
        let value =
            serde_json::to_value(&result).map_err(|e| SessionError::Malformed(e.to_string()))?;
        Ok(map_prompt_messages(&value))
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<ToolOutcome, SessionError> {
        let result = self
            .peer
            .call_tool(CallToolRequestParams {
                meta: None,
                name: name.to_owned().into(),
                arguments,
                task: None,
            })
            .await
            .map_err(map_service_error)?;
        Ok(map_call_result(result))
    }

    async fn close(&self) {
        let service = self.service.lock().await.take();
        if let Some(service) = service {
            if let Err(error) = service.cancel().await {
                warn!(error = %error, "MCP session task ended abnormally during close");
            } else {
                debug!("MCP session closed");
            }
        }
    }
}

fn map_mcp_tool(tool: rmcp::model::Tool) -> McpTool {
    McpTool {
        name: tool.name.to_string(),
        description: tool.description.map(|d| d.to_string()),
        input_schema: serde_json::Value::Object((*tool.input_schema).clone()),
    }
}

/// Convert an rmcp model value into the hub's own shape through JSON.
fn reshape<T: Serialize, U: DeserializeOwned>(item: &T) -> Result<U, SessionError> {
    serde_json::to_value(item)
        .and_then(serde_json::from_value)
        .map_err(|e| SessionError::Malformed(e.to_string()))
}

fn map_resource_contents(contents: ResourceContents) -> ResourceContent {
    match contents {
        ResourceContents::TextResourceContents {
            uri,
            mime_type,
            text,
            ..
        } => ResourceContent {
            uri,
            mime_type,
            text,
        },
        ResourceContents::BlobResourceContents {
            uri,
            mime_type,
            blob,
            ..
        } => ResourceContent {
            uri,
            mime_type,
            text: describe_blob(&blob),
        },
    }
}

/// Binary resources are summarized rather than inlined.
pub(crate) fn describe_blob(blob: &str) -> String {
    let len = base64::engine::general_purpose::STANDARD
        .decode(blob.trim())
        .map(|bytes| bytes.len())
        .unwrap_or(blob.len() * 3 / 4);
    format!("Binary content, {len} bytes")
}

fn map_prompt_messages(result: &serde_json::Value) -> Vec<PromptMessage> {
    let Some(messages) = result.get("messages").and_then(|m| m.as_array()) else {
        return Vec::new();
    };
    messages
        .iter()
        .map(|message| {
            let role = message
                .get("role")
                .and_then(|r| r.as_str())
                .unwrap_or("user")
                .to_string();
            let content = message.get("content").cloned().unwrap_or_default();
            let text = content
                .get("text")
                .and_then(|t| t.as_str())
                .or_else(|| {
                    content
                        .get("resource")
                        .and_then(|r| r.get("text"))
                        .and_then(|t| t.as_str())
                })
                .map(str::to_string)
                .unwrap_or_else(|| {
                    let kind = content
                        .get("type")
                        .and_then(|t| t.as_str())
                        .unwrap_or("unknown");
                    format!("[{kind} content]")
                });
            PromptMessage { role, text }
        })
        .collect()
}

fn extract_text_content(content: &[Content]) -> Option<String> {
    let mut lines = Vec::new();
    for item in content {
        if let Some(text) = item.as_text() {
            lines.push(text.text.clone());
            continue;
        }
        if let Some(resource) = item.as_resource() {
            if let ResourceContents::TextResourceContents { text, .. } = &resource.resource {
                lines.push(text.clone());
            }
        }
    }

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn map_call_result(result: CallToolResult) -> ToolOutcome {
    let text = extract_text_content(&result.content);
    let content = result
        .content
        .iter()
        .filter_map(|item| serde_json::to_value(item).ok())
        .collect();

    ToolOutcome {
        content,
        text,
        structured: result.structured_content,
        is_error: result.is_error.unwrap_or(false),
    }
}

pub(crate) fn map_service_error(error: ServiceError) -> SessionError {
    match error {
        ServiceError::McpError(error) => SessionError::Protocol {
            code: error.code.0,
            message: error.message.to_string(),
        },
        ServiceError::TransportSend(error) => SessionError::Transport(format!("send failed: {error}")),
        ServiceError::TransportClosed => SessionError::Closed,
        ServiceError::UnexpectedResponse => SessionError::Malformed("unexpected response".into()),
        ServiceError::Cancelled { reason } => SessionError::Cancelled(reason),
        ServiceError::Timeout { timeout } => SessionError::Timeout(timeout),
        other => SessionError::Transport(other.to_string()),
    }
}
