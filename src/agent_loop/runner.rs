//! The per-turn agent loop: call the model, run requested tools, repeat.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::{CapabilityAggregator, CapabilitySnapshot};
use crate::config::{HubSettings, DEFAULT_SYSTEM_PROMPT};
use crate::dispatch::ToolDispatcher;
use crate::error::{HubError, NotFoundKind, Result};
use crate::provider::{ModelProvider, ModelReply, ProviderRequest, ToolDefinition};
use crate::types::{AgentToolCall, ModelMessage, Usage};

use super::conversation::{ConversationStore, DEFAULT_MAX_CONVERSATIONS};
use super::events::{TurnEventEmitter, TurnEventPayload, TurnEventSink};
use super::types::{
    ConversationId, InvocationOutcome, ToolInvocationRecord, TurnResult, TurnStatus,
};

pub const NO_TOOLS_ADVISORY: &str = "no tools available";

/// Separator between server and tool in model-facing tool names.
const NAMESPACE_SEPARATOR: &str = "__";
const MAX_TOOL_NAME_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_rounds: usize,
    pub model_timeout: Duration,
    pub max_tokens: u32,
    pub system_prompt: String,
    pub max_conversations: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            model_timeout: Duration::from_secs(120),
            max_tokens: 4096,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_conversations: DEFAULT_MAX_CONVERSATIONS,
        }
    }
}

impl From<&HubSettings> for OrchestratorSettings {
    fn from(settings: &HubSettings) -> Self {
        Self {
            max_rounds: settings.max_tool_rounds.max(1),
            model_timeout: settings.model_timeout(),
            max_tokens: settings.max_tokens,
            system_prompt: settings.system_prompt.clone(),
            max_conversations: settings.max_conversations,
        }
    }
}

/// One user message to run through the loop.
#[derive(Clone)]
pub struct TurnRequest {
    pub message: String,
    /// Continue this conversation; a new one is started when `None`.
    pub conversation_id: Option<ConversationId>,
    /// Servers whose tools the model may use; all connected when `None`.
    pub server_contexts: Option<Vec<String>>,
    pub cancel: Option<CancellationToken>,
    pub event_sink: Option<TurnEventSink>,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            conversation_id: None,
            server_contexts: None,
            cancel: None,
            event_sink: None,
        }
    }

    pub fn in_conversation(mut self, id: ConversationId) -> Self {
        self.conversation_id = Some(id);
        self
    }

    pub fn with_servers(mut self, servers: Vec<String>) -> Self {
        self.server_contexts = Some(servers);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_event_sink(mut self, sink: TurnEventSink) -> Self {
        self.event_sink = Some(sink);
        self
    }
}

/// A tool offered to the model under its namespaced name.
#[derive(Debug, Clone)]
struct ExposedTool {
    exposed: String,
    server: String,
    tool: String,
    description: String,
    schema: Value,
}

/// The tools offered to the model for one turn.
#[derive(Debug, Default)]
struct ToolCatalog {
    tools: Vec<ExposedTool>,
}

impl ToolCatalog {
    fn build(snapshot: &CapabilitySnapshot, contexts: Option<&[String]>) -> Self {
        let mut taken = HashSet::new();
        let tools = snapshot
            .tools
            .iter()
            .filter(|entry| contexts.map_or(true, |allowed| allowed.contains(&entry.server)))
            .map(|entry| {
                let exposed = exposed_name(&entry.server, &entry.tool.name, &taken);
                taken.insert(exposed.clone());
                ExposedTool {
                    exposed,
                    server: entry.server.clone(),
                    tool: entry.tool.name.clone(),
                    description: entry.tool.description.clone().unwrap_or_default(),
                    schema: entry.tool.input_schema.clone(),
                }
            })
            .collect();
        Self { tools }
    }

    fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn resolve(&self, name: &str) -> Option<&ExposedTool> {
        self.tools.iter().find(|tool| tool.exposed == name)
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|tool| ToolDefinition {
                name: tool.exposed.clone(),
                description: tool.description.clone(),
                parameters: tool.schema.clone(),
            })
            .collect()
    }

    fn system_prompt(&self, preamble: &str) -> String {
        let mut prompt = preamble.to_string();
        if self.tools.is_empty() {
            return prompt;
        }
        prompt.push_str("\n\nYou have access to the following tools from MCP servers:");
        for (i, tool) in self.tools.iter().enumerate() {
            prompt.push_str(&format!(
                "\n{}. {} (from {}): {}",
                i + 1,
                tool.exposed,
                tool.server,
                tool.description
            ));
        }
        prompt
    }
}

/// `<server>__<tool>` restricted to `[A-Za-z0-9_-]` and 64 characters,
/// suffixed when it collides with a name already taken.
fn exposed_name(server: &str, tool: &str, taken: &HashSet<String>) -> String {
    let base: String = format!("{server}{NAMESPACE_SEPARATOR}{tool}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_TOOL_NAME_LEN)
        .collect();
    if !taken.contains(&base) {
        return base;
    }
    (2usize..)
        .map(|n| {
            let suffix = format!("_{n}");
            let mut candidate: String = base
                .chars()
                .take(MAX_TOOL_NAME_LEN - suffix.len())
                .collect();
            candidate.push_str(&suffix);
            candidate
        })
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or(base)
}

/// Best-effort split of an unresolvable model-facing name.
fn split_exposed_name(name: &str) -> (String, String) {
    match name.split_once(NAMESPACE_SEPARATOR) {
        Some((server, tool)) => (server.to_string(), tool.to_string()),
        None => (String::new(), name.to_string()),
    }
}

/// Models sometimes send arguments as a JSON-encoded string.
fn coerce_arguments(arguments: Value) -> Value {
    match arguments {
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(parsed @ Value::Object(_)) => parsed,
            _ => Value::String(raw),
        },
        other => other,
    }
}

enum Ending {
    Final(String),
    LoopLimit,
    ModelFailed(HubError),
    Cancelled,
}

/// Mutable state of one running turn.
struct TurnContext {
    messages: Vec<ModelMessage>,
    records: Vec<ToolInvocationRecord>,
    partial_text: Vec<String>,
    usage: Usage,
    rounds: usize,
}

/// Drives conversations through the model/tool loop.
pub struct ConversationOrchestrator {
    aggregator: Arc<CapabilityAggregator>,
    dispatcher: Arc<ToolDispatcher>,
    provider: Arc<dyn ModelProvider>,
    conversations: Arc<ConversationStore>,
    settings: OrchestratorSettings,
}

impl ConversationOrchestrator {
    pub fn new(
        aggregator: Arc<CapabilityAggregator>,
        dispatcher: Arc<ToolDispatcher>,
        provider: Arc<dyn ModelProvider>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            aggregator,
            dispatcher,
            provider,
            conversations: Arc::new(ConversationStore::with_capacity(settings.max_conversations)),
            settings,
        }
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Run one user message to completion.
    ///
    /// Only an unknown `conversation_id` is returned as `Err`; model, tool
    /// and loop-limit failures are reported inside the [`TurnResult`].
    pub async fn send(&self, request: TurnRequest) -> Result<TurnResult> {
        let (conversation_id, conversation) =
            self.conversations.resume_or_create(request.conversation_id)?;
        let mut conversation = conversation.lock().await;
        let cancel = request.cancel.unwrap_or_default();
        let emitter = TurnEventEmitter::new(conversation_id, request.event_sink);

        let snapshot = self.aggregator.aggregate(None).await;
        let catalog = ToolCatalog::build(&snapshot, request.server_contexts.as_deref());
        let advisory = catalog.is_empty().then(|| NO_TOOLS_ADVISORY.to_string());
        emitter.emit(TurnEventPayload::TurnStarted {
            tools: catalog.tools.len(),
        });
        info!(
            conversation = %conversation_id,
            tools = catalog.tools.len(),
            servers = snapshot.servers.len(),
            "turn started"
        );

        let mut messages = Vec::with_capacity(conversation.history().len() + 2);
        messages.push(ModelMessage::system(
            catalog.system_prompt(&self.settings.system_prompt),
        ));
        messages.extend(conversation.history().iter().cloned());
        messages.push(ModelMessage::user(&request.message));
        conversation.push_user(&request.message);

        let mut ctx = TurnContext {
            messages,
            records: Vec::new(),
            partial_text: Vec::new(),
            usage: Usage::default(),
            rounds: 0,
        };
        let ending = self
            .run_rounds(&mut ctx, &catalog, &cancel, &emitter, conversation_id)
            .await;

        let partial = ctx.partial_text.join("\n");
        let (status, response, error) = match ending {
            Ending::Final(text) => (TurnStatus::Completed, text, None),
            Ending::LoopLimit => {
                let error = HubError::ConversationLoopLimitExceeded {
                    rounds: ctx.rounds,
                    partial_text: partial.clone(),
                };
                warn!(conversation = %conversation_id, rounds = ctx.rounds, "tool round limit reached");
                (TurnStatus::LoopLimitExceeded, partial, Some(error.to_string()))
            }
            Ending::ModelFailed(error) => {
                warn!(conversation = %conversation_id, error = %error, "model call failed");
                (TurnStatus::ModelFailed, partial, Some(error.to_string()))
            }
            Ending::Cancelled => {
                info!(conversation = %conversation_id, "turn cancelled");
                (TurnStatus::Cancelled, partial, Some(HubError::Cancelled.to_string()))
            }
        };

        conversation.push_tool_invocations(ctx.records.clone());
        conversation.push_model(&response);
        emitter.emit(TurnEventPayload::TurnFinished {
            status,
            rounds: ctx.rounds,
        });
        debug!(
            conversation = %conversation_id,
            %status,
            rounds = ctx.rounds,
            tool_calls = ctx.records.len(),
            "turn finished"
        );

        Ok(TurnResult {
            conversation_id,
            status,
            response,
            tool_calls: ctx.records,
            rounds: ctx.rounds,
            usage: ctx.usage,
            error,
            advisory,
        })
    }

    async fn run_rounds(
        &self,
        ctx: &mut TurnContext,
        catalog: &ToolCatalog,
        cancel: &CancellationToken,
        emitter: &TurnEventEmitter,
        conversation_id: ConversationId,
    ) -> Ending {
        let definitions = catalog.definitions();

        for round in 1..=self.settings.max_rounds {
            ctx.rounds = round;
            emitter.emit(TurnEventPayload::ModelRoundStarted { round });
            debug!(conversation = %conversation_id, round, "calling model");

            let request = ProviderRequest {
                messages: ctx.messages.clone(),
                tools: definitions.clone(),
                max_tokens: self.settings.max_tokens,
            };
            let response = tokio::select! {
                _ = cancel.cancelled() => return Ending::Cancelled,
                result = tokio::time::timeout(
                    self.settings.model_timeout,
                    self.provider.generate_text(&request),
                ) => match result {
                    Ok(Ok(response)) => response,
                    Ok(Err(error)) => return Ending::ModelFailed(error),
                    Err(_) => {
                        return Ending::ModelFailed(HubError::Model(format!(
                            "no response within {}ms",
                            self.settings.model_timeout.as_millis()
                        )))
                    }
                },
            };
            ctx.usage.merge(&response.usage);

            let (text, calls) = match response.into_reply() {
                ModelReply::FinalText(text) => return Ending::Final(text),
                ModelReply::ToolRequests { text, calls } => (text, calls),
            };
            if !text.is_empty() {
                emitter.emit(TurnEventPayload::AssistantText { text: text.clone() });
                ctx.partial_text.push(text.clone());
            }
            ctx.messages
                .push(ModelMessage::assistant_with_tool_calls(&text, &calls));

            // Requests run one at a time, in the order the model listed them.
            for call in &calls {
                let record = self.execute(call, round, catalog, cancel, emitter).await;
                ctx.messages.push(tool_result_message(call, &record));
                ctx.records.push(record);
                if cancel.is_cancelled() {
                    return Ending::Cancelled;
                }
            }
        }
        Ending::LoopLimit
    }

    async fn execute(
        &self,
        call: &AgentToolCall,
        round: usize,
        catalog: &ToolCatalog,
        cancel: &CancellationToken,
        emitter: &TurnEventEmitter,
    ) -> ToolInvocationRecord {
        let started_at = Utc::now();
        let arguments = coerce_arguments(call.arguments.clone());

        let (server, tool, result) = match catalog.resolve(&call.name) {
            Some(entry) => {
                emitter.emit(TurnEventPayload::ToolCallStarted {
                    call_id: call.id.clone(),
                    server: entry.server.clone(),
                    tool: entry.tool.clone(),
                    arguments: arguments.clone(),
                });
                let result = self
                    .dispatcher
                    .invoke_cancellable(&entry.server, &entry.tool, arguments.clone(), cancel)
                    .await;
                (entry.server.clone(), entry.tool.clone(), result)
            }
            None => {
                let (server, tool) = split_exposed_name(&call.name);
                warn!(requested = %call.name, "model requested a tool outside this turn's catalog");
                let error = HubError::not_found(NotFoundKind::Tool, &server, &tool);
                (server, tool, Err(error))
            }
        };

        let outcome = match result {
            Ok(result) => InvocationOutcome::Ok { result },
            Err(error) => InvocationOutcome::failed(&error),
        };
        let record = ToolInvocationRecord {
            call_id: call.id.clone(),
            requested_name: call.name.clone(),
            server,
            tool,
            arguments,
            outcome,
            round,
            started_at,
            finished_at: Utc::now(),
        };
        emitter.emit(TurnEventPayload::ToolCallFinished {
            record: record.clone(),
        });
        record
    }
}

fn tool_result_message(call: &AgentToolCall, record: &ToolInvocationRecord) -> ModelMessage {
    match &record.outcome {
        InvocationOutcome::Ok { result } => {
            ModelMessage::tool_result(call.id.clone(), result.to_value_or_text(), result.is_error)
        }
        InvocationOutcome::Failed { error, .. } => {
            ModelMessage::tool_result(call.id.clone(), json!({ "error": error }), true)
        }
    }
}
