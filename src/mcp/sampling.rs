//! Client handler that answers `sampling/createMessage` with the hub's model.

use std::sync::Arc;

use rmcp::model::{
    ClientCapabilities, ClientInfo, CreateMessageRequestParams, CreateMessageResult, ErrorData,
};
use rmcp::service::{RequestContext, RoleClient};
use rmcp::ClientHandler;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::provider::{ModelProvider, ModelReply, ProviderRequest};
use crate::types::{FinishReason, ModelMessage};

const DEFAULT_SAMPLING_MAX_TOKENS: u32 = 1024;

/// Handler installed on every rmcp session.
///
/// Servers may ask the client to sample a completion. With a model
/// configured the request is run through it without tools; otherwise it is
/// refused and the `sampling` capability is not advertised.
#[derive(Clone)]
pub struct SamplingClient {
    info: ClientInfo,
    model: Option<Arc<dyn ModelProvider>>,
}

impl SamplingClient {
    pub fn new(mut info: ClientInfo, model: Option<Arc<dyn ModelProvider>>) -> Self {
        if model.is_some() {
            info.capabilities = ClientCapabilities::builder().enable_sampling().build();
        }
        Self { info, model }
    }

    pub fn supports_sampling(&self) -> bool {
        self.model.is_some()
    }

    /// Run a `sampling/createMessage` request given as its JSON params and
    /// return the JSON result.
    pub(crate) async fn sample(&self, params: &Value) -> Result<Value, ErrorData> {
        let Some(model) = &self.model else {
            return Err(ErrorData::invalid_request(
                "sampling is not available: no model configured",
                None,
            ));
        };
        let request = sampling_request(params)?;
        debug!(
            messages = request.messages.len(),
            max_tokens = request.max_tokens,
            "serving sampling request"
        );

        let response = model.generate_text(&request).await.map_err(|error| {
            warn!(error = %error, "sampling request failed");
            ErrorData::internal_error(format!("sampling failed: {error}"), None)
        })?;
        let stop_reason = match response.finish_reason {
            Some(FinishReason::Length) => "maxTokens",
            _ => "endTurn",
        };
        let text = match response.into_reply() {
            ModelReply::FinalText(text) => text,
            ModelReply::ToolRequests { text, .. } => text,
        };
        Ok(json!({
            "model": model.model_id(),
            "stopReason": stop_reason,
            "role": "assistant",
            "content": { "type": "text", "text": text },
        }))
    }
}

impl ClientHandler for SamplingClient {
    async fn create_message(
        &self,
        params: CreateMessageRequestParams,
        _context: RequestContext<RoleClient>,
    ) -> Result<CreateMessageResult, ErrorData> {
        let params = serde_json::to_value(&params)
            .map_err(|error| ErrorData::invalid_params(error.to_string(), None))?;
        let result = self.sample(&params).await?;
        serde_json::from_value(result)
            .map_err(|error| ErrorData::internal_error(error.to_string(), None))
    }

    fn get_info(&self) -> ClientInfo {
        self.info.clone()
    }
}

fn sampling_request(params: &Value) -> Result<ProviderRequest, ErrorData> {
    let entries = params
        .get("messages")
        .and_then(Value::as_array)
        .filter(|messages| !messages.is_empty())
        .ok_or_else(|| ErrorData::invalid_params("sampling request has no messages", None))?;

    let mut messages = Vec::with_capacity(entries.len() + 1);
    if let Some(system) = params
        .get("systemPrompt")
        .and_then(Value::as_str)
        .filter(|system| !system.is_empty())
    {
        messages.push(ModelMessage::system(system));
    }
    for entry in entries {
        let text = sampling_text(entry.get("content").unwrap_or(&Value::Null));
        match entry.get("role").and_then(Value::as_str) {
            Some("assistant") => messages.push(ModelMessage::assistant(text)),
            _ => messages.push(ModelMessage::user(text)),
        }
    }

    let max_tokens = params
        .get("maxTokens")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_SAMPLING_MAX_TOKENS);

    Ok(ProviderRequest {
        messages,
        tools: Vec::new(),
        max_tokens,
    })
}

/// Text of one sampling message; content is a single part or a list.
fn sampling_text(content: &Value) -> String {
    let part_text = |part: &Value| match part.get("type").and_then(Value::as_str) {
        Some("text") => part
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Some(kind) => format!("[{kind} content]"),
        None => String::new(),
    };
    match content {
        Value::Array(parts) => parts
            .iter()
            .map(part_text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::String(text) => text.clone(),
        other => part_text(other),
    }
}
