//! Error classification and recovery hints.

use serde::Serialize;
use strum::Display;

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    Connection,
    CapabilityFetch,
    NotFound,
    Validation,
    ToolExecution,
    Timeout,
    Model,
    LoopLimit,
    Authentication,
    RateLimit,
    Network,
    Server,
    Api,
    Configuration,
    Serialization,
    Cancelled,
    Unknown,
}

/// Suggested recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySuggestion {
    RetryConnect,
    RetryWithBackoff,
    CheckCredentials,
    CheckConfiguration,
    CheckArguments,
    IncreaseTimeout,
    RefreshCatalog,
    None,
}
