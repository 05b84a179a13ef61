//! Command-line interface for the hub binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// MCP hub
#[derive(Parser, Debug)]
#[command(name = "mcp-hub", version, about = "Aggregate MCP servers and chat with their tools")]
pub struct Cli {
    /// Server catalog (JSON, or TOML with a .toml extension)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP control surface
    Serve(ServeArgs),
    /// List servers from the catalog
    Servers,
    /// Run one conversation turn against connected servers
    Chat(ChatArgs),
}

/// Arguments for `mcp-hub serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to listen on (overrides the configured bind address)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Connect every enabled server at startup
    #[arg(long)]
    pub connect_all: bool,
}

/// Arguments for `mcp-hub chat`.
#[derive(Parser, Debug)]
pub struct ChatArgs {
    /// Server to connect and expose; repeatable. Defaults to all servers.
    #[arg(short, long = "server", value_name = "NAME")]
    pub servers: Vec<String>,

    /// User prompt
    pub prompt: String,
}

impl Cli {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
