//! Opening sessions to registered servers.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::{ClientInfo, ProtocolVersion};
use rmcp::service::{ClientInitializeError, ServiceExt};
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{HubError, Result};
use crate::provider::ModelProvider;
use crate::registry::{ServerEndpoint, ServerSpec};

use super::client::{McpRunningService, McpSession, RmcpSession};
use super::sampling::SamplingClient;

/// Creates an initialized session for a server endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, spec: &ServerSpec) -> Result<Arc<dyn McpSession>>;
}

/// Production connector: stdio child processes and streamable HTTP.
#[derive(Clone, Default)]
pub struct RmcpConnector {
    sampler: Option<Arc<dyn ModelProvider>>,
}

impl RmcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer servers' sampling requests with `model`.
    pub fn with_sampling(mut self, model: Arc<dyn ModelProvider>) -> Self {
        self.sampler = Some(model);
        self
    }

    async fn open(
        &self,
        spec: &ServerSpec,
        client_info: ClientInfo,
    ) -> std::result::Result<McpRunningService, ClientInitializeError> {
        let handler = SamplingClient::new(client_info, self.sampler.clone());
        match &spec.endpoint {
            ServerEndpoint::Stdio { command, args, env } => {
                let mut command = Command::new(command);
                command.args(args).envs(env);
                let transport = TokioChildProcess::new(command).map_err(|error| {
                    ClientInitializeError::transport::<TokioChildProcess>(
                        error,
                        "spawn stdio transport",
                    )
                })?;
                handler.into_dyn().serve(transport).await
            }
            ServerEndpoint::StreamableHttp { url } => {
                let transport = StreamableHttpClientTransport::from_uri(url.as_str());
                handler.into_dyn().serve(transport).await
            }
        }
    }
}

#[async_trait]
impl Connector for RmcpConnector {
    async fn connect(&self, spec: &ServerSpec) -> Result<Arc<dyn McpSession>> {
        debug!(
            server = %spec.id,
            endpoint = %spec.endpoint,
            sampling = self.sampler.is_some(),
            "opening MCP session"
        );
        let service =
            handshake_with_protocol_fallback(&spec.id, |info| self.open(spec, info)).await?;
        info!(server = %spec.id, "MCP session initialized");
        Ok(Arc::new(RmcpSession::new(service)))
    }
}

/// Run the initialize handshake at the latest protocol version, retrying
/// once at 2024-11-05 when the server rejects the version.
pub(crate) async fn handshake_with_protocol_fallback<T, F, Fut>(
    server: &str,
    mut open: F,
) -> Result<T>
where
    F: FnMut(ClientInfo) -> Fut,
    Fut: Future<Output = std::result::Result<T, ClientInitializeError>>,
{
    let latest_client_info = ClientInfo {
        protocol_version: ProtocolVersion::LATEST,
        ..Default::default()
    };

    match open(latest_client_info).await {
        Ok(session) => return Ok(session),
        Err(error) if should_retry_protocol_fallback(&error) => {
            debug!(server, "server rejected latest protocol version, retrying with 2024-11-05");
        }
        Err(error) => return Err(map_client_initialize_error(server, error)),
    }

    let fallback_client_info = ClientInfo {
        protocol_version: ProtocolVersion::V_2024_11_05,
        ..Default::default()
    };
    open(fallback_client_info)
        .await
        .map_err(|error| map_client_initialize_error(server, error))
}

fn should_retry_protocol_fallback(error: &ClientInitializeError) -> bool {
    match error {
        ClientInitializeError::JsonRpcError(error) => {
            let message = error.message.to_ascii_lowercase();
            message.contains("protocol") && message.contains("version")
        }
        _ => false,
    }
}

fn map_client_initialize_error(server: &str, error: ClientInitializeError) -> HubError {
    let message = match error {
        ClientInitializeError::ConnectionClosed(context) => {
            format!("connection closed during initialize: {context}")
        }
        ClientInitializeError::TransportError { error, context } => {
            format!("transport error ({context}): {error}")
        }
        ClientInitializeError::JsonRpcError(error) => {
            format!("initialize rejected with JSON-RPC error {}: {}", error.code.0, error.message)
        }
        ClientInitializeError::Cancelled => "initialize cancelled".to_string(),
        other => format!("initialize failed: {other}"),
    };
    HubError::connection(server, message)
}
