//! Shared fakes built on the public traits.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use mcp_hub::config::HubConfig;
use mcp_hub::error::{HubError, Result};
use mcp_hub::mcp::{
    Connector, McpPrompt, McpResource, McpSession, McpTool, PromptMessage, ResourceContent,
    SessionError, ToolOutcome,
};
use mcp_hub::provider::{ModelProvider, ProviderRequest, ProviderResponse};
use mcp_hub::registry::ServerSpec;
use mcp_hub::types::AgentToolCall;

#[derive(Default)]
struct FakeState {
    tools: Vec<McpTool>,
    prompts: Vec<McpPrompt>,
    resources: Vec<McpResource>,
    results: HashMap<String, ToolOutcome>,
    calls: Vec<(String, Option<Map<String, Value>>)>,
    call_delay: Option<Duration>,
    tools_error: Option<String>,
}

/// In-memory MCP server session. Clones share state.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<FakeState>>,
    closed: Arc<AtomicBool>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tool(self, name: &str, schema: Value) -> Self {
        self.state
            .lock()
            .unwrap()
            .tools
            .push(McpTool::new(name, format!("{name} tool"), schema));
        self
    }

    pub fn prompt(self, prompt: McpPrompt) -> Self {
        self.state.lock().unwrap().prompts.push(prompt);
        self
    }

    pub fn resource(self, uri: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .resources
            .push(McpResource::new(uri));
        self
    }

    pub fn result(self, tool: &str, outcome: ToolOutcome) -> Self {
        self.state
            .lock()
            .unwrap()
            .results
            .insert(tool.to_string(), outcome);
        self
    }

    pub fn slow_calls(self, delay: Duration) -> Self {
        self.state.lock().unwrap().call_delay = Some(delay);
        self
    }

    pub fn break_tool_listing(&self, message: &str) {
        self.state.lock().unwrap().tools_error = Some(message.to_string());
    }

    pub fn fix_tool_listing(&self) {
        self.state.lock().unwrap().tools_error = None;
    }

    pub fn replace_tools(&self, tools: Vec<McpTool>) {
        self.state.lock().unwrap().tools = tools;
    }

    pub fn calls(&self) -> Vec<(String, Option<Map<String, Value>>)> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl McpSession for FakeServer {
    async fn list_tools(&self) -> std::result::Result<Vec<McpTool>, SessionError> {
        let state = self.state.lock().unwrap();
        match &state.tools_error {
            Some(message) => Err(SessionError::Transport(message.clone())),
            None => Ok(state.tools.clone()),
        }
    }

    async fn list_prompts(&self) -> std::result::Result<Vec<McpPrompt>, SessionError> {
        Ok(self.state.lock().unwrap().prompts.clone())
    }

    async fn list_resources(&self) -> std::result::Result<Vec<McpResource>, SessionError> {
        Ok(self.state.lock().unwrap().resources.clone())
    }

    async fn read_resource(
        &self,
        uri: &str,
    ) -> std::result::Result<Vec<ResourceContent>, SessionError> {
        Ok(vec![ResourceContent {
            uri: uri.to_string(),
            mime_type: Some("text/markdown".into()),
            text: format!("# {uri}"),
        }])
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> std::result::Result<Vec<PromptMessage>, SessionError> {
        let topic = arguments
            .as_ref()
            .and_then(|args| args.get("topic"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(vec![PromptMessage {
            role: "user".into(),
            text: format!("{name}: {topic}"),
        }])
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> std::result::Result<ToolOutcome, SessionError> {
        let (delay, scripted) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push((name.to_string(), arguments.clone()));
            (state.call_delay, state.results.get(name).cloned())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(scripted.unwrap_or_else(|| ToolOutcome::structured(json!({ "echo": arguments }))))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector handing out [`FakeServer`]s by server id.
#[derive(Clone, Default)]
pub struct FakeConnector {
    servers: Arc<Mutex<HashMap<String, FakeServer>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, id: &str, server: FakeServer) -> Self {
        self.servers
            .lock()
            .unwrap()
            .insert(id.to_string(), server);
        self
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, spec: &ServerSpec) -> Result<Arc<dyn McpSession>> {
        let server = self.servers.lock().unwrap().get(&spec.id).cloned();
        match server {
            Some(server) => Ok(Arc::new(server)),
            None => Err(HubError::connection(&spec.id, "connection refused")),
        }
    }
}

/// A mock model that replays queued responses, then answers "Mock response".
#[derive(Default)]
pub struct MockModel {
    responses: Mutex<VecDeque<Result<ProviderResponse>>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl MockModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a text response.
    pub fn queue_text(&self, text: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(ProviderResponse::text(text)));
    }

    /// Queue a tool call response.
    pub fn queue_tool_call(&self, id: &str, name: &str, arguments: Value) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(ProviderResponse::tool_calls(vec![AgentToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            }])));
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for MockModel {
    fn provider_name(&self) -> &str {
        "mock"
    }

    fn model_id(&self) -> &str {
        "mock-model"
    }

    async fn generate_text(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ProviderResponse::text("Mock response")))
    }
}

pub fn search_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "q": { "type": "string" } },
        "required": ["q"]
    })
}

/// Config registering `ids` as streamable HTTP servers.
pub fn config_for(ids: &[&str]) -> HubConfig {
    HubConfig {
        servers: ids
            .iter()
            .map(|id| ServerSpec::http(*id, format!("http://{id}.test/mcp")))
            .collect(),
        ..HubConfig::default()
    }
}
