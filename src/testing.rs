//! Scripted collaborators for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{JsonObject, ServerJsonRpcMessage};
use rmcp::service::{RoleClient, RxJsonRpcMessage, TxJsonRpcMessage};
use rmcp::transport::Transport as RmcpTransport;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::error::{CapabilitySection, HubError, Result};
use crate::mcp::{
    Connector, McpPrompt, McpResource, McpSession, McpTool, PromptMessage, ResourceContent,
    SessionError, ToolOutcome,
};
use crate::provider::{ModelProvider, ProviderRequest, ProviderResponse};
use crate::registry::ServerSpec;
use crate::types::AgentToolCall;

#[derive(Default)]
struct MockSessionInner {
    tools: Mutex<Vec<McpTool>>,
    prompts: Mutex<Vec<McpPrompt>>,
    resources: Mutex<Vec<McpResource>>,
    failing: Mutex<HashSet<CapabilitySection>>,
    call_results: Mutex<HashMap<String, ToolOutcome>>,
    call_log: Mutex<Vec<(String, Option<JsonObject>)>>,
    call_delay: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

/// In-memory MCP session. Clones share state.
#[derive(Clone, Default)]
pub(crate) struct MockSession {
    inner: Arc<MockSessionInner>,
}

impl MockSession {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_tool(self, tool: McpTool) -> Self {
        self.inner.tools.lock().expect("tools lock").push(tool);
        self
    }

    pub(crate) fn with_prompt(self, prompt: McpPrompt) -> Self {
        self.inner.prompts.lock().expect("prompts lock").push(prompt);
        self
    }

    pub(crate) fn with_resource(self, resource: McpResource) -> Self {
        self.inner
            .resources
            .lock()
            .expect("resources lock")
            .push(resource);
        self
    }

    pub(crate) fn with_call_result(self, tool: &str, outcome: ToolOutcome) -> Self {
        self.inner
            .call_results
            .lock()
            .expect("call results lock")
            .insert(tool.to_string(), outcome);
        self
    }

    pub(crate) fn with_call_delay(self, delay: Duration) -> Self {
        *self.inner.call_delay.lock().expect("delay lock") = Some(delay);
        self
    }

    pub(crate) fn set_tools(&self, tools: Vec<McpTool>) {
        *self.inner.tools.lock().expect("tools lock") = tools;
    }

    pub(crate) fn fail_section(&self, section: CapabilitySection) {
        self.inner.failing.lock().expect("failing lock").insert(section);
    }

    pub(crate) fn heal_section(&self, section: CapabilitySection) {
        self.inner.failing.lock().expect("failing lock").remove(&section);
    }

    pub(crate) fn calls(&self) -> Vec<(String, Option<JsonObject>)> {
        self.inner.call_log.lock().expect("call log lock").clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn check_section(&self, section: CapabilitySection) -> std::result::Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if self.inner.failing.lock().expect("failing lock").contains(&section) {
            return Err(SessionError::Transport(format!("scripted {section} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl McpSession for MockSession {
    async fn list_tools(&self) -> std::result::Result<Vec<McpTool>, SessionError> {
        self.check_section(CapabilitySection::Tools)?;
        Ok(self.inner.tools.lock().expect("tools lock").clone())
    }

    async fn list_prompts(&self) -> std::result::Result<Vec<McpPrompt>, SessionError> {
        self.check_section(CapabilitySection::Prompts)?;
        Ok(self.inner.prompts.lock().expect("prompts lock").clone())
    }

    async fn list_resources(&self) -> std::result::Result<Vec<McpResource>, SessionError> {
        self.check_section(CapabilitySection::Resources)?;
        Ok(self.inner.resources.lock().expect("resources lock").clone())
    }

    async fn read_resource(
        &self,
        uri: &str,
    ) -> std::result::Result<Vec<ResourceContent>, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        Ok(vec![ResourceContent {
            uri: uri.to_string(),
            mime_type: Some("text/plain".into()),
            text: format!("contents of {uri}"),
        }])
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> std::result::Result<Vec<PromptMessage>, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let args = serde_json::Value::Object(arguments.unwrap_or_default());
        Ok(vec![PromptMessage {
            role: "user".into(),
            text: format!("{name} {args}"),
        }])
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> std::result::Result<ToolOutcome, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.inner
            .call_log
            .lock()
            .expect("call log lock")
            .push((name.to_string(), arguments.clone()));
        let delay = *self.inner.call_delay.lock().expect("delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .inner
            .call_results
            .lock()
            .expect("call results lock")
            .get(name)
            .cloned();
        Ok(scripted.unwrap_or_else(|| {
            ToolOutcome::structured(serde_json::json!({
                "tool": name,
                "arguments": arguments,
            }))
        }))
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out scripted sessions by server id.
#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    servers: Arc<Mutex<HashMap<String, std::result::Result<MockSession, String>>>>,
    attempts: Arc<AtomicUsize>,
    delay: Option<Duration>,
    panic_next: Arc<AtomicBool>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_server(self, id: &str, session: MockSession) -> Self {
        self.set_server(id, session);
        self
    }

    pub(crate) fn with_failure(self, id: &str, message: &str) -> Self {
        self.servers
            .lock()
            .expect("servers lock")
            .insert(id.to_string(), Err(message.to_string()));
        self
    }

    pub(crate) fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn set_server(&self, id: &str, session: MockSession) {
        self.servers
            .lock()
            .expect("servers lock")
            .insert(id.to_string(), Ok(session));
    }

    pub(crate) fn panic_on_next_connect(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub(crate) fn attempts(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.attempts)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, spec: &ServerSpec) -> Result<Arc<dyn McpSession>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("scripted handshake panic");
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .servers
            .lock()
            .expect("servers lock")
            .get(&spec.id)
            .cloned();
        match scripted {
            Some(Ok(session)) => Ok(Arc::new(session)),
            Some(Err(message)) => Err(HubError::connection(&spec.id, message)),
            None => Err(HubError::connection(&spec.id, "no scripted server")),
        }
    }
}

/// Model that replays queued responses and records every request.
#[derive(Default)]
pub(crate) struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<ProviderResponse>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    pub(crate) fn new(responses: Vec<Result<ProviderResponse>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_id(&self) -> &str {
        "scripted-model"
    }

    async fn generate_text(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .unwrap_or_else(|| Ok(ProviderResponse::text("done")))
    }
}

pub(crate) fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> AgentToolCall {
    AgentToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

/// In-process rmcp transport for a client; the other end is driven by the test.
pub(crate) struct ChannelRmcpTransport {
    outbound: UnboundedSender<TxJsonRpcMessage<RoleClient>>,
    inbound: UnboundedReceiver<RxJsonRpcMessage<RoleClient>>,
}

impl RmcpTransport<RoleClient> for ChannelRmcpTransport {
    type Error = io::Error;

    fn send(
        &mut self,
        item: TxJsonRpcMessage<RoleClient>,
    ) -> impl std::future::Future<Output = std::result::Result<(), Self::Error>> + Send + 'static
    {
        let tx = self.outbound.clone();
        async move {
            tx.send(item)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "scripted server gone"))
        }
    }

    async fn receive(&mut self) -> Option<RxJsonRpcMessage<RoleClient>> {
        self.inbound.recv().await
    }

    fn close(
        &mut self,
    ) -> impl std::future::Future<Output = std::result::Result<(), Self::Error>> + Send {
        self.inbound.close();
        std::future::ready(Ok(()))
    }
}

/// Server end of a [`ChannelRmcpTransport`].
pub(crate) struct ScriptedPeer {
    pub(crate) to_client: UnboundedSender<RxJsonRpcMessage<RoleClient>>,
    pub(crate) from_client: UnboundedReceiver<TxJsonRpcMessage<RoleClient>>,
}

impl ScriptedPeer {
    pub(crate) fn send(&self, message: ServerJsonRpcMessage) {
        let _ = self.to_client.send(message);
    }

    /// Next client reply to request `id`, as JSON.
    pub(crate) async fn next_response(&mut self, id: i64) -> Option<serde_json::Value> {
        let wait = async {
            while let Some(message) = self.from_client.recv().await {
                let Ok(value) = serde_json::to_value(message) else {
                    continue;
                };
                let answers_id = value.get("id").and_then(serde_json::Value::as_i64) == Some(id);
                if answers_id && (value.get("result").is_some() || value.get("error").is_some()) {
                    return Some(value);
                }
            }
            None
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .ok()
            .flatten()
    }
}

pub(crate) fn scripted_transport() -> (ChannelRmcpTransport, ScriptedPeer) {
    let (outbound, from_client) = unbounded_channel();
    let (to_client, inbound) = unbounded_channel();
    (
        ChannelRmcpTransport { outbound, inbound },
        ScriptedPeer {
            to_client,
            from_client,
        },
    )
}
