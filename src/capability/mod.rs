//! Capability catalogs: per-server caches and merged snapshots.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{live_session_of, ConnectHook, ConnectionManager, ConnectionState};
use crate::error::{CapabilitySection, HubError, NotFoundKind, Result};
use crate::mcp::{McpPrompt, McpResource, McpTool, SessionError};

/// Recorded failure of the latest fetch of one catalog section.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaleMark {
    pub error: String,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub(crate) struct CatalogSection<T> {
    pub(crate) items: Vec<T>,
    pub(crate) stale: Option<StaleMark>,
}

impl<T> Default for CatalogSection<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            stale: None,
        }
    }
}

impl<T> CatalogSection<T> {
    /// Replace on success; on failure keep the last good items and mark stale.
    fn apply(
        &mut self,
        server: &str,
        section: CapabilitySection,
        result: std::result::Result<Vec<T>, SessionError>,
    ) -> Option<SectionFailure> {
        match result {
            Ok(items) => {
                self.items = items;
                self.stale = None;
                None
            }
            Err(error) => {
                warn!(
                    server,
                    %section,
                    error = %error,
                    kept = self.items.len(),
                    "capability fetch failed, keeping previous entries"
                );
                self.stale = Some(StaleMark {
                    error: error.to_string(),
                    since: Utc::now(),
                });
                Some(SectionFailure {
                    section,
                    error: error.to_string(),
                })
            }
        }
    }
}

/// Cached catalog of one connected server.
#[derive(Debug, Clone, Default)]
pub(crate) struct ServerCatalog {
    pub(crate) tools: CatalogSection<McpTool>,
    pub(crate) prompts: CatalogSection<McpPrompt>,
    pub(crate) resources: CatalogSection<McpResource>,
    pub(crate) refreshed_at: Option<DateTime<Utc>>,
    applied_ticket: u64,
}

impl ServerCatalog {
    pub(crate) fn tool(&self, name: &str) -> Option<&McpTool> {
        self.tools.items.iter().find(|tool| tool.name == name)
    }

    pub(crate) fn prompt(&self, name: &str) -> Option<&McpPrompt> {
        self.prompts.items.iter().find(|prompt| prompt.name == name)
    }

    fn stale_sections(&self) -> impl Iterator<Item = (CapabilitySection, &StaleMark)> {
        [
            (CapabilitySection::Tools, self.tools.stale.as_ref()),
            (CapabilitySection::Prompts, self.prompts.stale.as_ref()),
            (CapabilitySection::Resources, self.resources.stale.as_ref()),
        ]
        .into_iter()
        .filter_map(|(section, mark)| mark.map(|mark| (section, mark)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolEntry {
    #[serde(flatten)]
    pub tool: McpTool,
    pub server: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptEntry {
    #[serde(flatten)]
    pub prompt: McpPrompt,
    pub server: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceEntry {
    #[serde(flatten)]
    pub resource: McpResource,
    pub server: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaleSection {
    pub server: String,
    pub section: CapabilitySection,
    pub error: String,
    pub since: DateTime<Utc>,
}

/// Merged, server-tagged view of all catalogs at one point in time.
///
/// Entries are grouped by server in connection order and keep each
/// server's own listing order. Nothing is re-sorted by name.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilitySnapshot {
    pub taken_at: DateTime<Utc>,
    pub servers: Vec<String>,
    pub tools: Vec<ToolEntry>,
    pub prompts: Vec<PromptEntry>,
    pub resources: Vec<ResourceEntry>,
    pub stale: Vec<StaleSection>,
}

impl CapabilitySnapshot {
    fn empty() -> Self {
        Self {
            taken_at: Utc::now(),
            servers: Vec::new(),
            tools: Vec::new(),
            prompts: Vec::new(),
            resources: Vec::new(),
            stale: Vec::new(),
        }
    }

    pub fn find_tool(&self, server: &str, name: &str) -> Option<&ToolEntry> {
        self.tools
            .iter()
            .find(|entry| entry.server == server && entry.tool.name == name)
    }

    pub fn tools_for<'a>(&'a self, server: &'a str) -> impl Iterator<Item = &'a ToolEntry> + 'a {
        self.tools.iter().filter(move |entry| entry.server == server)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.prompts.is_empty() && self.resources.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionFailure {
    pub section: CapabilitySection,
    pub error: String,
}

/// Outcome of one refresh.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub server: String,
    /// False when the result was discarded because the session it came
    /// from ended, or a newer refresh already landed.
    pub applied: bool,
    pub failures: Vec<SectionFailure>,
}

impl RefreshReport {
    fn discarded(server: &str) -> Self {
        Self {
            server: server.to_string(),
            applied: false,
            failures: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.applied && self.failures.is_empty()
    }

    pub fn errors(&self) -> Vec<HubError> {
        self.failures
            .iter()
            .map(|failure| HubError::CapabilityFetch {
                server: self.server.clone(),
                section: failure.section,
                message: failure.error.clone(),
            })
            .collect()
    }
}

/// Fetches and merges tool/prompt/resource catalogs of connected servers.
pub struct CapabilityAggregator {
    connections: Arc<ConnectionManager>,
    fetch_timeout: Duration,
}

impl CapabilityAggregator {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        let fetch_timeout = connections.settings().handshake_timeout;
        Self {
            connections,
            fetch_timeout,
        }
    }

    /// Re-fetch all three catalog sections of one connected server.
    ///
    /// Sections that fail keep their previous entries and are marked stale.
    pub async fn refresh(&self, server: &str) -> Result<RefreshReport> {
        let slot = self
            .connections
            .slot(server)
            .ok_or_else(|| HubError::server_not_found(server))?;

        let (live, ticket) = {
            let mut state = slot.state.lock().await;
            let live = live_session_of(server, &state)?;
            state.refresh_ticket += 1;
            (live, state.refresh_ticket)
        };

        let session = &live.session;
        let (tools, prompts, resources) = tokio::join!(
            bounded(self.fetch_timeout, session.list_tools()),
            bounded(self.fetch_timeout, session.list_prompts()),
            bounded(self.fetch_timeout, session.list_resources()),
        );

        let mut state = slot.state.lock().await;
        if state.epoch != live.epoch || state.status != ConnectionState::Connected {
            debug!(server, "discarding refresh from an ended session");
            return Ok(RefreshReport::discarded(server));
        }
        let mut catalog = state.catalog.take().unwrap_or_default();
        if ticket < catalog.applied_ticket {
            state.catalog = Some(catalog);
            debug!(server, "discarding refresh overtaken by a newer one");
            return Ok(RefreshReport::discarded(server));
        }

        let failures = [
            catalog.tools.apply(server, CapabilitySection::Tools, tools),
            catalog.prompts.apply(server, CapabilitySection::Prompts, prompts),
            catalog
                .resources
                .apply(server, CapabilitySection::Resources, resources),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
        catalog.applied_ticket = ticket;
        catalog.refreshed_at = Some(Utc::now());
        debug!(
            server,
            tools = catalog.tools.items.len(),
            prompts = catalog.prompts.items.len(),
            resources = catalog.resources.items.len(),
            "catalog refreshed"
        );
        state.catalog = Some(catalog);

        Ok(RefreshReport {
            server: server.to_string(),
            applied: true,
            failures,
        })
    }

    /// Build an aggregator whose catalog fetch runs as part of every connect.
    pub fn attached(connections: Arc<ConnectionManager>) -> Arc<Self> {
        let aggregator = Arc::new(Self::new(Arc::clone(&connections)));
        let hook: Weak<dyn ConnectHook> = Arc::<Self>::downgrade(&aggregator);
        connections.set_connect_hook(hook);
        aggregator
    }

    /// Refresh every connected server concurrently.
    pub async fn refresh_all(&self) -> Vec<(String, Result<RefreshReport>)> {
        let servers = self.connections.list_connected().await;
        let results =
            futures::future::join_all(servers.iter().map(|server| self.refresh(server))).await;
        servers.into_iter().zip(results).collect()
    }

    /// Merge the catalogs of connected servers, optionally only one.
    ///
    /// Each server's cache is copied under its own lock, one at a time;
    /// merging happens after every lock is released.
    pub async fn aggregate(&self, server_filter: Option<&str>) -> CapabilitySnapshot {
        let mut views = Vec::new();
        for (position, slot) in self.connections.slots_in_order() {
            if server_filter.is_some_and(|filter| filter != slot.id) {
                continue;
            }
            let state = slot.state.lock().await;
            if state.status != ConnectionState::Connected {
                continue;
            }
            // A catalog fetched before the last disconnect is never served.
            let catalog = state.catalog.clone().filter(|catalog| {
                match (catalog.refreshed_at, state.disconnected_at) {
                    (Some(refreshed), Some(disconnected)) => refreshed >= disconnected,
                    _ => true,
                }
            });
            views.push((state.connected_seq, position, slot.id.clone(), catalog));
        }
        views.sort_by_key(|(seq, position, ..)| (*seq, *position));

        let mut snapshot = CapabilitySnapshot::empty();
        for (_, _, server, catalog) in views {
            snapshot.servers.push(server.clone());
            let Some(catalog) = catalog else {
                continue;
            };
            snapshot.stale.extend(catalog.stale_sections().map(|(section, mark)| {
                StaleSection {
                    server: server.clone(),
                    section,
                    error: mark.error.clone(),
                    since: mark.since,
                }
            }));
            snapshot
                .tools
                .extend(catalog.tools.items.into_iter().map(|tool| ToolEntry {
                    tool,
                    server: server.clone(),
                }));
            snapshot
                .prompts
                .extend(catalog.prompts.items.into_iter().map(|prompt| PromptEntry {
                    prompt,
                    server: server.clone(),
                }));
            snapshot
                .resources
                .extend(catalog.resources.items.into_iter().map(|resource| ResourceEntry {
                    resource,
                    server: server.clone(),
                }));
        }
        snapshot
    }

    /// Look up one tool in a connected server's current catalog.
    pub async fn find_tool(&self, server: &str, name: &str) -> Result<McpTool> {
        let slot = self
            .connections
            .slot(server)
            .ok_or_else(|| HubError::server_not_found(server))?;
        let state = slot.state.lock().await;
        live_session_of(server, &state)?;
        state
            .catalog
            .as_ref()
            .and_then(|catalog| catalog.tool(name))
            .cloned()
            .ok_or_else(|| HubError::not_found(NotFoundKind::Tool, server, name))
    }

    /// Refresh every connected server on a fixed interval until `shutdown`
    /// fires. Query operations never refresh implicitly.
    pub fn spawn_periodic_refresh(
        self: &Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let results = aggregator.refresh_all().await;
                debug!(servers = results.len(), "periodic capability refresh");
                for (server, result) in results {
                    match result {
                        Ok(report) if !report.failures.is_empty() => {
                            warn!(server = %server, failed = report.failures.len(), "periodic refresh incomplete");
                        }
                        Ok(_) => {}
                        Err(error) => warn!(server = %server, error = %error, "periodic refresh failed"),
                    }
                }
            }
        })
    }
}

async fn bounded<T>(
    limit: Duration,
    fetch: impl std::future::Future<Output = std::result::Result<T, SessionError>>,
) -> std::result::Result<T, SessionError> {
    tokio::time::timeout(limit, fetch)
        .await
        .unwrap_or(Err(SessionError::Timeout(limit)))
}

/// First catalog fetch after a handshake. A failed fetch is logged and
/// left stale; the connection still counts as established.
#[async_trait]
impl ConnectHook for CapabilityAggregator {
    async fn on_connected(&self, server: &str) {
        match self.refresh(server).await {
            Ok(report) if !report.failures.is_empty() => {
                warn!(server, failed = report.failures.len(), "initial capability fetch incomplete");
            }
            Ok(_) => {}
            Err(error) => warn!(server, error = %error, "initial capability fetch failed"),
        }
    }
}
