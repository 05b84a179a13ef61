//! Known MCP servers and their endpoints.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;

use crate::error::{HubError, Result};

/// How to reach an MCP server.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum ServerEndpoint {
    /// Spawn a local child process and speak MCP over its stdio.
    Stdio {
        command: String,
        args: Vec<String>,
        #[serde(skip)]
        env: BTreeMap<String, String>,
    },
    /// Remote server speaking streamable HTTP.
    StreamableHttp { url: String },
}

impl fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio { command, args, env } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .field("env", &env.keys().map(|k| (k, "***")).collect::<Vec<_>>())
                .finish(),
            Self::StreamableHttp { url } => {
                f.debug_struct("StreamableHttp").field("url", url).finish()
            }
        }
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio { command, args, .. } if args.is_empty() => write!(f, "stdio:{command}"),
            Self::Stdio { command, args, .. } => write!(f, "stdio:{command} {}", args.join(" ")),
            Self::StreamableHttp { url } => f.write_str(url),
        }
    }
}

/// A registered server: unique identifier plus endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerSpec {
    pub id: String,
    pub endpoint: ServerEndpoint,
}

impl ServerSpec {
    pub fn stdio(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: ServerEndpoint::Stdio {
                command: command.into(),
                args,
                env: BTreeMap::new(),
            },
        }
    }

    pub fn http(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: ServerEndpoint::StreamableHttp { url: url.into() },
        }
    }
}

/// Ordered set of known servers. Pure data, no I/O.
#[derive(Debug, Default, Clone)]
pub struct ServerRegistry {
    servers: Vec<ServerSpec>,
    index_by_id: HashMap<String, usize>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from specs, rejecting empty or duplicate ids.
    pub fn from_specs(specs: impl IntoIterator<Item = ServerSpec>) -> Result<Self> {
        let mut registry = Self::new();
        for spec in specs {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, spec: ServerSpec) -> Result<()> {
        let id = spec.id.trim();
        if id.is_empty() {
            return Err(HubError::Configuration(
                "MCP server id must not be empty".into(),
            ));
        }
        if self.index_by_id.contains_key(id) {
            return Err(HubError::Configuration(format!(
                "duplicate MCP server id '{id}'"
            )));
        }
        let id = id.to_string();
        self.index_by_id.insert(id.clone(), self.servers.len());
        self.servers.push(ServerSpec { id, ..spec });
        Ok(())
    }

    /// Remove a server, keeping the registration order of the rest.
    pub fn deregister(&mut self, id: &str) -> Option<ServerSpec> {
        let position = self.index_by_id.remove(id)?;
        let removed = self.servers.remove(position);
        for index in self.index_by_id.values_mut() {
            if *index > position {
                *index -= 1;
            }
        }
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<&ServerSpec> {
        self.index_by_id.get(id).map(|&index| &self.servers[index])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_by_id.contains_key(id)
    }

    /// Position in registration order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index_by_id.get(id).copied()
    }

    /// Identifiers in registration order.
    pub fn ids(&self) -> Vec<String> {
        self.servers.iter().map(|spec| spec.id.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerSpec> {
        self.servers.iter()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
