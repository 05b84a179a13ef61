//! mcp-hub: aggregate several MCP servers behind one hub.
//!
//! Connects to any number of Model Context Protocol servers, merges their
//! tools, prompts and resources into one catalog tagged by origin server,
//! routes calls to the right server, and runs a model/tool conversation
//! loop on top.
//!
//! # Quick Start
//!
//! ```no_run
//! use mcp_hub::agent_loop::TurnRequest;
//! use mcp_hub::config::HubConfig;
//! use mcp_hub::hub::McpHub;
//!
//! # async fn example() -> mcp_hub::error::Result<()> {
//! let config = HubConfig::load(None)?;
//! let hub = McpHub::from_config(&config)?;
//! hub.connect("search").await?;
//! let turn = hub.send_prompt(TurnRequest::new("Find the latest report")).await?;
//! println!("{}", turn.response);
//! # Ok(())
//! # }
//! ```

pub mod agent_loop;
pub mod capability;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod mcp;
pub mod provider;
pub mod registry;
pub mod types;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "cli")]
pub mod cli;

#[cfg(test)]
mod testing;

pub use error::{HubError, Result};
pub use hub::McpHub;
