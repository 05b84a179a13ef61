//! Anthropic Messages API provider.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{HubError, Result};
use crate::types::*;

use super::http::{anthropic_headers, build_client, status_to_error};
use super::{ModelProvider, ProviderRequest, ProviderResponse};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        model: String,
        api_key: String,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            base_url: base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model,
            api_key,
            client: build_client(timeout)?,
        })
    }

    fn build_request_body(&self, request: &ProviderRequest) -> Value {
        let mut system_parts = Vec::new();
        let mut messages: Vec<Value> = Vec::new();
        // Results answering one assistant turn must share a single user message.
        let mut pending_results: Vec<Value> = Vec::new();

        for msg in &request.messages {
            if msg.role != Role::Tool && !pending_results.is_empty() {
                messages.push(json!({
                    "role": "user",
                    "content": std::mem::take(&mut pending_results),
                }));
            }
            match msg.role {
                Role::System => system_parts.push(msg.text()),
                Role::User => messages.push(json!({
                    "role": "user",
                    "content": msg.text(),
                })),
                Role::Assistant => {
                    let content: Vec<Value> = msg
                        .content
                        .iter()
                        .filter_map(|part| match part {
                            ContentPart::Text { text } if !text.is_empty() => {
                                Some(json!({"type": "text", "text": text}))
                            }
                            ContentPart::ToolCall(tc) => Some(json!({
                                "type": "tool_use",
                                "id": tc.id,
                                "name": tc.name,
                                "input": tc.arguments,
                            })),
                            _ => None,
                        })
                        .collect();
                    if !content.is_empty() {
                        messages.push(json!({"role": "assistant", "content": content}));
                    }
                }
                Role::Tool => {
                    pending_results.extend(msg.content.iter().filter_map(|part| match part {
                        ContentPart::ToolResult(tr) => Some(json!({
                            "type": "tool_result",
                            "tool_use_id": tr.tool_call_id,
                            "content": tool_result_text(&tr.result),
                            "is_error": tr.is_error,
                        })),
                        _ => None,
                    }));
                }
            }
        }
        if !pending_results.is_empty() {
            messages.push(json!({"role": "user", "content": pending_results}));
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
        });
        if let Some(obj) = body.as_object_mut() {
            if !system_parts.is_empty() {
                obj.insert("system".into(), system_parts.join("\n").into());
            }
            if !request.tools.is_empty() {
                let tool_defs: Vec<Value> = request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect();
                obj.insert("tools".into(), tool_defs.into());
            }
        }
        body
    }
}

fn tool_result_text(result: &Value) -> String {
    match result {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate_text(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let body = self.build_request_body(request);
        let url = format!("{}/messages", self.base_url);

        debug!(
            model = %self.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Anthropic generate_text"
        );

        let resp = self
            .client
            .post(&url)
            .headers(anthropic_headers(&self.api_key, API_VERSION))
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            let headers = resp.headers().clone();
            let body_text = resp.text().await.unwrap_or_default();
            return Err(status_to_error(status, &headers, &body_text));
        }

        let data: AnthropicResponse = resp
            .json()
            .await
            .map_err(|e| HubError::Model(format!("unreadable Anthropic response: {e}")))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in data.content {
            match block.r#type.as_str() {
                "text" => {
                    if let Some(t) = block.text {
                        text.push_str(&t);
                    }
                }
                "tool_use" => match (block.id, block.name) {
                    (Some(id), Some(name)) => tool_calls.push(AgentToolCall {
                        id,
                        name,
                        arguments: block.input.unwrap_or_else(|| json!({})),
                    }),
                    _ => return Err(HubError::Model("tool_use block without id or name".into())),
                },
                _ => {}
            }
        }

        let finish_reason = match data.stop_reason.as_deref() {
            Some("end_turn") | Some("stop_sequence") => Some(FinishReason::Stop),
            Some("max_tokens") => Some(FinishReason::Length),
            Some("tool_use") => Some(FinishReason::ToolCalls),
            _ => None,
        };
        if text.is_empty() && tool_calls.is_empty() && finish_reason.is_none() {
            return Err(HubError::Model("model returned no content".into()));
        }

        Ok(ProviderResponse {
            text,
            usage: Usage {
                input_tokens: data.usage.input_tokens,
                output_tokens: data.usage.output_tokens,
                total_tokens: data.usage.input_tokens + data.usage.output_tokens,
            },
            tool_calls,
            finish_reason,
        })
    }
}

// Internal Anthropic response types

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Deserialize, Default)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}
