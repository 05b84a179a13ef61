//! Error types for the hub.

pub mod unified;

pub use unified::{ErrorCategory, RecoverySuggestion};

use std::fmt;

use serde::Serialize;
use strum::Display;
use thiserror::Error;

/// Which catalog section a capability fetch was reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CapabilitySection {
    Tools,
    Prompts,
    Resources,
}

/// What kind of name failed to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotFoundKind {
    Server,
    Tool,
    Prompt,
    Resource,
    Conversation,
}

/// Sub-kind of a failed request to a connected server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// The server answered with a protocol-level error or a malformed reply.
    Server,
    Timeout { timeout_ms: u64 },
    Transport,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server error"),
            Self::Timeout { timeout_ms } => write!(f, "timed out after {timeout_ms}ms"),
            Self::Transport => f.write_str("transport failure"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Primary error type for all hub operations.
///
/// Every variant is scoped to one server, one request, or one conversation
/// turn. Nothing here is fatal to the process.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection to '{server}' failed: {message}")]
    Connection { server: String, message: String },

    #[error("Fetching {section} from '{server}' failed: {message}")]
    CapabilityFetch {
        server: String,
        section: CapabilitySection,
        message: String,
    },

    #[error("{}", describe_not_found(.kind, .server, .name))]
    NotFound {
        kind: NotFoundKind,
        server: String,
        name: String,
    },

    #[error("Invalid arguments for '{tool}': {message}")]
    SchemaValidation { tool: String, message: String },

    #[error("Tool '{tool}' on '{server}' failed ({kind}): {message}")]
    ToolExecution {
        server: String,
        tool: String,
        kind: FailureKind,
        message: String,
    },

    #[error("{operation} on '{server}' failed ({kind}): {message}")]
    ServerRequest {
        server: String,
        operation: String,
        kind: FailureKind,
        message: String,
    },

    #[error("Model error: {0}")]
    Model(String),

    #[error("Conversation exceeded {rounds} tool rounds without a final answer")]
    ConversationLoopLimitExceeded { rounds: usize, partial_text: String },

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HubError {
    pub fn server_not_found(server: impl Into<String>) -> Self {
        let server = server.into();
        Self::NotFound {
            kind: NotFoundKind::Server,
            name: server.clone(),
            server,
        }
    }

    pub fn not_found(kind: NotFoundKind, server: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            server: server.into(),
            name: name.into(),
        }
    }

    pub fn connection(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::CapabilityFetch { .. } => ErrorCategory::CapabilityFetch,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::SchemaValidation { .. } => ErrorCategory::Validation,
            Self::ToolExecution { kind, .. } | Self::ServerRequest { kind, .. } => match kind {
                FailureKind::Timeout { .. } => ErrorCategory::Timeout,
                FailureKind::Cancelled => ErrorCategory::Cancelled,
                FailureKind::Server | FailureKind::Transport => ErrorCategory::ToolExecution,
            },
            Self::Model(_) => ErrorCategory::Model,
            Self::ConversationLoopLimitExceeded { .. } => ErrorCategory::LoopLimit,
            Self::Authentication(_) => ErrorCategory::Authentication,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Network(_) => ErrorCategory::Network,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Api { status, .. } => match status {
                401 | 403 => ErrorCategory::Authentication,
                429 => ErrorCategory::RateLimit,
                500..=599 => ErrorCategory::Server,
                _ => ErrorCategory::Api,
            },
            Self::Io(_) => ErrorCategory::Unknown,
        }
    }

    /// Whether the caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Connection
                | ErrorCategory::CapabilityFetch
                | ErrorCategory::RateLimit
                | ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::Server
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.category() == ErrorCategory::Timeout
    }

    /// Suggest recovery actions.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self.category() {
            ErrorCategory::Connection => RecoverySuggestion::RetryConnect,
            ErrorCategory::CapabilityFetch => RecoverySuggestion::RefreshCatalog,
            ErrorCategory::NotFound => RecoverySuggestion::RefreshCatalog,
            ErrorCategory::Validation => RecoverySuggestion::CheckArguments,
            ErrorCategory::Timeout => RecoverySuggestion::IncreaseTimeout,
            ErrorCategory::Authentication => RecoverySuggestion::CheckCredentials,
            ErrorCategory::Configuration => RecoverySuggestion::CheckConfiguration,
            ErrorCategory::RateLimit | ErrorCategory::Network | ErrorCategory::Server => {
                RecoverySuggestion::RetryWithBackoff
            }
            _ => RecoverySuggestion::None,
        }
    }
}

fn describe_not_found(kind: &NotFoundKind, server: &str, name: &str) -> String {
    match kind {
        NotFoundKind::Server => format!("Unknown or disconnected server '{name}'"),
        NotFoundKind::Conversation => format!("Unknown conversation '{name}'"),
        _ => format!("Unknown {kind} '{name}' (server '{server}')"),
    }
}

impl From<toml::de::Error> for HubError {
    fn from(error: toml::de::Error) -> Self {
        Self::Configuration(format!("invalid TOML: {error}"))
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_timeouts_are_retryable_but_validation_is_not() {
        let timeout = HubError::ToolExecution {
            server: "a".into(),
            tool: "search".into(),
            kind: FailureKind::Timeout { timeout_ms: 5000 },
            message: "no reply".into(),
        };
        assert!(timeout.is_timeout());
        assert!(timeout.is_retryable());
        assert!(timeout.to_string().contains("timed out after 5000ms"));

        let invalid = HubError::SchemaValidation {
            tool: "search".into(),
            message: "missing required field 'q'".into(),
        };
        assert_eq!(invalid.category(), ErrorCategory::Validation);
        assert!(!invalid.is_retryable());
    }

    #[test]
    fn not_found_names_the_server() {
        let err = HubError::not_found(NotFoundKind::Tool, "A", "fetch");
        assert_eq!(err.to_string(), "Unknown tool 'fetch' (server 'A')");
        assert_eq!(err.recovery_suggestion(), RecoverySuggestion::RefreshCatalog);
    }

    #[test]
    fn api_status_maps_to_category() {
        let err = HubError::Api {
            status: 503,
            message: "overloaded".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Server);
        assert!(err.is_retryable());

        let err = HubError::Api {
            status: 401,
            message: "bad key".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Authentication);
    }

    #[test]
    fn category_display_is_snake_case() {
        assert_eq!(ErrorCategory::LoopLimit.to_string(), "loop_limit");
        assert_eq!(CapabilitySection::Resources.to_string(), "resources");
    }
}
