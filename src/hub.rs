//! The hub facade: one handle over connections, catalogs, dispatch and turns.

use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent_loop::{
    ConversationId, ConversationOrchestrator, OrchestratorSettings, TurnRequest, TurnResult,
};
use crate::capability::{CapabilityAggregator, CapabilitySnapshot, RefreshReport};
use crate::config::{HubConfig, HubSettings};
use crate::connection::{ConnectOutcome, ConnectionManager, ServerStatus};
use crate::dispatch::ToolDispatcher;
use crate::error::{HubError, NotFoundKind, Result};
use crate::mcp::{Connector, PromptMessage, ResourceContent, RmcpConnector, ToolOutcome};
use crate::provider::{create_provider, ModelProvider, UnconfiguredProvider};

/// Owns every component and wires connect to the capability refresh.
pub struct McpHub {
    settings: HubSettings,
    connections: Arc<ConnectionManager>,
    aggregator: Arc<CapabilityAggregator>,
    dispatcher: Arc<ToolDispatcher>,
    orchestrator: ConversationOrchestrator,
    shutdown: CancellationToken,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl McpHub {
    pub fn new(
        config: &HubConfig,
        connector: Arc<dyn Connector>,
        provider: Arc<dyn ModelProvider>,
    ) -> Result<Self> {
        let settings = config.settings.clone();
        let connections = Arc::new(ConnectionManager::new(
            config.registry()?,
            connector,
            settings.connection_settings(),
        ));
        let aggregator = CapabilityAggregator::attached(Arc::clone(&connections));
        let dispatcher = Arc::new(ToolDispatcher::new(
            Arc::clone(&connections),
            settings.call_timeout(),
        ));
        let orchestrator = ConversationOrchestrator::new(
            Arc::clone(&aggregator),
            Arc::clone(&dispatcher),
            provider,
            OrchestratorSettings::from(&settings),
        );
        Ok(Self {
            settings,
            connections,
            aggregator,
            dispatcher,
            orchestrator,
            shutdown: CancellationToken::new(),
            refresher: Mutex::new(None),
        })
    }

    /// Production wiring: rmcp sessions and the Anthropic provider.
    ///
    /// A missing API key is not fatal; server operations still work and
    /// each turn reports the authentication error.
    pub fn from_config(config: &HubConfig) -> Result<Self> {
        let mut connector = RmcpConnector::new();
        let provider: Arc<dyn ModelProvider> = match create_provider(config) {
            Ok(provider) => {
                if config.settings.serve_sampling {
                    connector = connector.with_sampling(Arc::clone(&provider));
                }
                provider
            }
            Err(HubError::Authentication(reason)) => {
                warn!(reason = %reason, "model provider not configured; prompts will fail");
                Arc::new(UnconfiguredProvider::new(config.settings.model.clone(), reason))
            }
            Err(error) => return Err(error),
        };
        Self::new(config, Arc::new(connector), provider)
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn aggregator(&self) -> &Arc<CapabilityAggregator> {
        &self.aggregator
    }

    pub fn dispatcher(&self) -> &Arc<ToolDispatcher> {
        &self.dispatcher
    }

    pub fn orchestrator(&self) -> &ConversationOrchestrator {
        &self.orchestrator
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.connections.server_ids()
    }

    pub async fn connected_servers(&self) -> Vec<String> {
        self.connections.list_connected().await
    }

    pub async fn statuses(&self) -> Vec<ServerStatus> {
        self.connections.statuses().await
    }

    /// Connect a server. Its catalog is fetched on the connect task, so it
    /// is in place before any caller returns, even one that gave up waiting.
    /// A failed fetch is logged and marked stale; the connection still counts
    /// as successful.
    pub async fn connect(&self, id: &str) -> Result<ConnectOutcome> {
        self.connections.connect(id).await
    }

    /// Connect every registered server concurrently.
    pub async fn connect_all(&self) -> Vec<(String, Result<ConnectOutcome>)> {
        let ids = self.connections.server_ids();
        let results = join_all(ids.iter().map(|id| self.connect(id))).await;
        ids.into_iter().zip(results).collect()
    }

    pub async fn disconnect(&self, id: Option<&str>) -> Vec<String> {
        self.connections.disconnect(id).await
    }

    /// Refresh one server's catalog, or every connected server's.
    pub async fn refresh(&self, id: Option<&str>) -> Result<Vec<RefreshReport>> {
        match id {
            Some(id) => Ok(vec![self.aggregator.refresh(id).await?]),
            None => Ok(self
                .aggregator
                .refresh_all()
                .await
                .into_iter()
                .filter_map(|(server, result)| match result {
                    Ok(report) => Some(report),
                    Err(error) => {
                        warn!(server = %server, error = %error, "refresh failed");
                        None
                    }
                })
                .collect()),
        }
    }

    /// Merged catalog, optionally for one server. Naming an unregistered
    /// server is `NotFound`; a registered but disconnected one is empty.
    pub async fn snapshot(&self, server: Option<&str>) -> Result<CapabilitySnapshot> {
        if let Some(id) = server {
            if !self.connections.contains(id) {
                return Err(HubError::server_not_found(id));
            }
        }
        Ok(self.aggregator.aggregate(server).await)
    }

    pub async fn call_tool(&self, server: &str, tool: &str, arguments: Value) -> Result<ToolOutcome> {
        self.dispatcher.invoke(server, tool, arguments).await
    }

    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<Vec<ResourceContent>> {
        self.dispatcher.read_resource(server, uri).await
    }

    pub async fn get_prompt(
        &self,
        server: &str,
        name: &str,
        arguments: Value,
    ) -> Result<Vec<PromptMessage>> {
        self.dispatcher.get_prompt(server, name, arguments).await
    }

    pub async fn send_prompt(&self, request: TurnRequest) -> Result<TurnResult> {
        self.orchestrator.send(request).await
    }

    /// Forget a conversation. Unknown ids are `NotFound`.
    pub fn end_conversation(&self, id: ConversationId) -> Result<()> {
        if self.orchestrator.conversations().remove(&id) {
            info!(conversation = %id, "conversation ended");
            Ok(())
        } else {
            Err(HubError::not_found(
                NotFoundKind::Conversation,
                "",
                id.to_string(),
            ))
        }
    }

    /// Start the periodic refresh when `refresh_interval_secs` is set.
    /// Returns whether a refresher is running.
    pub fn start_periodic_refresh(&self) -> bool {
        let Some(every) = self.settings.refresh_interval() else {
            return false;
        };
        let mut refresher = self.refresher.lock().unwrap_or_else(PoisonError::into_inner);
        if refresher.is_none() {
            info!(every_secs = every.as_secs(), "starting periodic capability refresh");
            *refresher = Some(
                self.aggregator
                    .spawn_periodic_refresh(every, self.shutdown.child_token()),
            );
        }
        true
    }

    /// Stop background work and disconnect every server.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let refresher = self
            .refresher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = refresher {
            let _ = handle.await;
        }
        let closed = self.connections.disconnect(None).await;
        info!(servers = closed.len(), "hub shut down");
    }
}
