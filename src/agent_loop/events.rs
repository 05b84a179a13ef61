//! Turn event stream types.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{ConversationId, ToolInvocationRecord, TurnStatus};

/// Callback used for live turn events.
pub type TurnEventSink = Arc<dyn Fn(TurnEvent) + Send + Sync>;

/// Concrete event payloads emitted by the agent loop.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEventPayload {
    TurnStarted {
        tools: usize,
    },
    ModelRoundStarted {
        round: usize,
    },
    /// Text the model produced alongside tool requests.
    AssistantText {
        text: String,
    },
    ToolCallStarted {
        call_id: String,
        server: String,
        tool: String,
        arguments: serde_json::Value,
    },
    ToolCallFinished {
        record: ToolInvocationRecord,
    },
    TurnFinished {
        status: TurnStatus,
        rounds: usize,
    },
}

/// Envelope for turn events.
#[derive(Debug, Clone, Serialize)]
pub struct TurnEvent {
    pub conversation_id: ConversationId,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: TurnEventPayload,
}

pub(crate) struct TurnEventEmitter {
    conversation_id: ConversationId,
    seq: AtomicU64,
    sink: Option<TurnEventSink>,
}

impl TurnEventEmitter {
    pub(crate) fn new(conversation_id: ConversationId, sink: Option<TurnEventSink>) -> Self {
        Self {
            conversation_id,
            seq: AtomicU64::new(1),
            sink,
        }
    }

    pub(crate) fn emit(&self, payload: TurnEventPayload) {
        let Some(sink) = &self.sink else { return };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        (sink)(TurnEvent {
            conversation_id: self.conversation_id,
            seq,
            timestamp: Utc::now(),
            payload,
        });
    }
}
