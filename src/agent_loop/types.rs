//! Turn results and tool invocation records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::Display;
use uuid::Uuid;

use crate::error::{ErrorCategory, HubError, Result};
use crate::mcp::ToolOutcome;
use crate::types::Usage;

/// Unique conversation identifier.
pub type ConversationId = Uuid;

/// How a turn ended.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    LoopLimitExceeded,
    ModelFailed,
    Cancelled,
}

/// Result or error of one executed tool request.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationOutcome {
    /// The server answered. Its own `is_error` flag is kept in `result`.
    Ok { result: ToolOutcome },
    Failed {
        error: String,
        category: ErrorCategory,
    },
}

impl InvocationOutcome {
    pub fn failed(error: &HubError) -> Self {
        Self::Failed {
            error: error.to_string(),
            category: error.category(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// One tool request the model made and what came of it. Never mutated
/// after it is written.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolInvocationRecord {
    pub call_id: String,
    /// Name the model used.
    pub requested_name: String,
    pub server: String,
    pub tool: String,
    pub arguments: serde_json::Value,
    #[serde(flatten)]
    pub outcome: InvocationOutcome,
    pub round: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Outcome of one user message.
#[derive(Debug, Clone, Serialize)]
pub struct TurnResult {
    pub conversation_id: ConversationId,
    pub status: TurnStatus,
    /// Final text, or the best partial text when the turn did not complete.
    pub response: String,
    pub tool_calls: Vec<ToolInvocationRecord>,
    pub rounds: usize,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advisory: Option<String>,
}

impl TurnResult {
    pub fn is_completed(&self) -> bool {
        self.status == TurnStatus::Completed
    }

    /// Turn a non-completed result into the matching error.
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            TurnStatus::Completed => Ok(self),
            TurnStatus::LoopLimitExceeded => Err(HubError::ConversationLoopLimitExceeded {
                rounds: self.rounds,
                partial_text: self.response,
            }),
            TurnStatus::ModelFailed => Err(HubError::Model(
                self.error.unwrap_or_else(|| "model failed".to_string()),
            )),
            TurnStatus::Cancelled => Err(HubError::Cancelled),
        }
    }
}
