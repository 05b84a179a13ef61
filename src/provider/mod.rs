//! Model provider trait and the Anthropic implementation.

pub mod anthropic;
pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::types::{AgentToolCall, FinishReason, ModelMessage, Usage};

/// A request sent to a model provider.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

/// Tool definition sent to the provider API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Response from a provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub text: String,
    pub usage: Usage,
    pub tool_calls: Vec<AgentToolCall>,
    pub finish_reason: Option<FinishReason>,
}

/// What the model asked for in one round.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    FinalText(String),
    ToolRequests {
        text: String,
        calls: Vec<AgentToolCall>,
    },
}

impl ProviderResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finish_reason: Some(FinishReason::Stop),
            ..Self::default()
        }
    }

    pub fn tool_calls(calls: Vec<AgentToolCall>) -> Self {
        Self {
            tool_calls: calls,
            finish_reason: Some(FinishReason::ToolCalls),
            ..Self::default()
        }
    }

    pub fn into_reply(self) -> ModelReply {
        if self.tool_calls.is_empty() {
            ModelReply::FinalText(self.text)
        } else {
            ModelReply::ToolRequests {
                text: self.text,
                calls: self.tool_calls,
            }
        }
    }
}

/// Core trait implemented by model providers.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name (e.g., "anthropic").
    fn provider_name(&self) -> &str;
    /// The model ID this provider instance serves.
    fn model_id(&self) -> &str;

    async fn generate_text(&self, request: &ProviderRequest) -> Result<ProviderResponse>;
}

/// Stand-in used when no API key is configured. Every turn fails with the
/// authentication error while MCP operations keep working.
#[derive(Debug, Clone)]
pub struct UnconfiguredProvider {
    model: String,
    reason: String,
}

impl UnconfiguredProvider {
    pub fn new(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ModelProvider for UnconfiguredProvider {
    fn provider_name(&self) -> &str {
        "unconfigured"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate_text(&self, _request: &ProviderRequest) -> Result<ProviderResponse> {
        Err(HubError::Authentication(self.reason.clone()))
    }
}

/// Create the configured provider.
pub fn create_provider(config: &HubConfig) -> Result<Arc<dyn ModelProvider>> {
    let api_key = config
        .anthropic_api_key
        .clone()
        .ok_or_else(|| HubError::Authentication("Missing ANTHROPIC_API_KEY".into()))?;
    let provider = anthropic::AnthropicProvider::new(
        config.settings.model.clone(),
        api_key,
        config.anthropic_base_url.clone(),
        config.settings.model_timeout(),
    )?;
    Ok(Arc::new(provider))
}
