//! MCP protocol boundary: session trait, rmcp-backed sessions, connectors.

pub mod client;
pub mod sampling;
pub mod schema;
pub mod transport;

pub use client::{McpSession, RmcpSession, SessionError};
pub use sampling::SamplingClient;
pub use schema::{
    McpPrompt, McpResource, McpTool, PromptArgument, PromptMessage, ResourceContent,
    SchemaBuilder, ToolOutcome,
};
pub use transport::{Connector, RmcpConnector};
