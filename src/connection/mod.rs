//! Per-server connection lifecycle.
//!
//! Each registered server owns one [`ServerSlot`] whose mutex is the unit of
//! mutual exclusion: every state transition for that server happens under
//! it, while unrelated servers never contend. Slow work (handshakes, catalog
//! fetches, tool calls, session close) always runs with the lock released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::Display;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::ServerCatalog;
use crate::error::{HubError, Result};
use crate::mcp::{Connector, McpSession};
use crate::registry::{ServerRegistry, ServerSpec};

/// Connection state of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// How a successful `connect` call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// This call ran the handshake.
    Established,
    /// Another call's in-flight handshake succeeded.
    Joined,
    /// The server was already connected; nothing changed.
    AlreadyConnected,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub handshake_timeout: Duration,
    /// Consecutive tool-call timeouts that demote a server to `error`.
    /// Zero disables demotion.
    pub timeout_demotion_threshold: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            timeout_demotion_threshold: 3,
        }
    }
}

/// Presentation view of one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub id: String,
    pub endpoint: String,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_count: Option<usize>,
}

type AttemptResult = std::result::Result<(), String>;

/// Work run on the connect task once a session is up, before any caller
/// waiting on that connect is released.
#[async_trait]
pub trait ConnectHook: Send + Sync {
    async fn on_connected(&self, server: &str);
}

pub(crate) struct ServerSlot {
    pub(crate) id: String,
    pub(crate) spec: ServerSpec,
    pub(crate) state: Mutex<SlotState>,
}

pub(crate) struct SlotState {
    pub(crate) status: ConnectionState,
    pub(crate) session: Option<Arc<dyn McpSession>>,
    /// Bumped whenever a session starts or ends; work begun under an older
    /// epoch must not be applied.
    pub(crate) epoch: u64,
    /// Global connection order, used to order aggregated catalogs.
    pub(crate) connected_seq: u64,
    pub(crate) connected_at: Option<DateTime<Utc>>,
    pub(crate) disconnected_at: Option<DateTime<Utc>>,
    pub(crate) last_error: Option<String>,
    pub(crate) catalog: Option<ServerCatalog>,
    pub(crate) refresh_ticket: u64,
    consecutive_timeouts: u32,
    cancel: CancellationToken,
    pending: Option<watch::Receiver<Option<AttemptResult>>>,
}

impl SlotState {
    fn new() -> Self {
        Self {
            status: ConnectionState::Disconnected,
            session: None,
            epoch: 0,
            connected_seq: 0,
            connected_at: None,
            disconnected_at: None,
            last_error: None,
            catalog: None,
            refresh_ticket: 0,
            consecutive_timeouts: 0,
            cancel: CancellationToken::new(),
            pending: None,
        }
    }

    /// Tear down the live session. The caller closes the returned session
    /// after releasing the lock.
    fn end_session(&mut self, status: ConnectionState) -> Option<Arc<dyn McpSession>> {
        self.status = status;
        self.epoch += 1;
        self.cancel.cancel();
        self.catalog = None;
        self.pending = None;
        self.consecutive_timeouts = 0;
        self.disconnected_at = Some(Utc::now());
        self.session.take()
    }
}

impl ServerSlot {
    fn new(spec: ServerSpec) -> Self {
        Self {
            id: spec.id.clone(),
            spec,
            state: Mutex::new(SlotState::new()),
        }
    }
}

/// A connected session borrowed for one request.
#[derive(Clone)]
pub(crate) struct LiveSession {
    pub(crate) session: Arc<dyn McpSession>,
    pub(crate) cancel: CancellationToken,
    pub(crate) epoch: u64,
}

/// Owns every server's connection state and its transitions.
pub struct ConnectionManager {
    registry: RwLock<ServerRegistry>,
    slots: RwLock<HashMap<String, Arc<ServerSlot>>>,
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    connect_seq: Arc<AtomicU64>,
    hook: OnceLock<Weak<dyn ConnectHook>>,
}

impl ConnectionManager {
    pub fn new(
        registry: ServerRegistry,
        connector: Arc<dyn Connector>,
        settings: ConnectionSettings,
    ) -> Self {
        let slots = registry
            .iter()
            .map(|spec| (spec.id.clone(), Arc::new(ServerSlot::new(spec.clone()))))
            .collect();
        Self {
            registry: RwLock::new(registry),
            slots: RwLock::new(slots),
            connector,
            settings,
            connect_seq: Arc::new(AtomicU64::new(1)),
            hook: OnceLock::new(),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Install the post-connect hook. Only the first call takes effect.
    pub fn set_connect_hook(&self, hook: Weak<dyn ConnectHook>) -> bool {
        self.hook.set(hook).is_ok()
    }

    /// Add a server at runtime.
    pub fn register(&self, spec: ServerSpec) -> Result<()> {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry.register(spec.clone())?;
        let id = spec.id.trim().to_string();
        let slot = Arc::new(ServerSlot::new(ServerSpec { id: id.clone(), ..spec }));
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, slot);
        Ok(())
    }

    /// Disconnect and forget a server. Unknown ids return `false`.
    pub async fn deregister(&self, id: &str) -> bool {
        let slot = {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            if registry.deregister(id).is_none() {
                return false;
            }
            self.slots
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(id)
        };
        if let Some(slot) = slot {
            disconnect_slot(&slot).await;
        }
        info!(server = %id, "server deregistered");
        true
    }

    /// Known server ids in registration order.
    pub fn server_ids(&self) -> Vec<String> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ids()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    pub fn spec(&self, id: &str) -> Option<ServerSpec> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub(crate) fn slot(&self, id: &str) -> Option<Arc<ServerSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Slots in registration order, paired with their position.
    pub(crate) fn slots_in_order(&self) -> Vec<(usize, Arc<ServerSlot>)> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .iter()
            .enumerate()
            .filter_map(|(position, spec)| slots.get(&spec.id).map(|s| (position, Arc::clone(s))))
            .collect()
    }

    /// Connect a server, or observe the outcome of an attempt already in flight.
    ///
    /// The handshake runs on its own task, so a caller that gives up waiting
    /// never strands the server in `connecting`.
    pub async fn connect(&self, id: &str) -> Result<ConnectOutcome> {
        let slot = self.slot(id).ok_or_else(|| HubError::server_not_found(id))?;

        let (mut pending, outcome, epoch) = {
            let mut state = slot.state.lock().await;
            match (state.status, state.pending.clone()) {
                (ConnectionState::Connected, _) => return Ok(ConnectOutcome::AlreadyConnected),
                (ConnectionState::Connecting, Some(pending)) => {
                    debug!(server = %id, "joining in-flight connect");
                    (pending, ConnectOutcome::Joined, state.epoch)
                }
                _ => {
                    let pending = self.begin_attempt(&slot, &mut state);
                    (pending, ConnectOutcome::Established, state.epoch)
                }
            }
        };

        let waited = pending
            .wait_for(Option::is_some)
            .await
            .map(|value| value.clone());
        let result = match waited {
            Ok(value) => {
                value.unwrap_or_else(|| Err("connect attempt abandoned".to_string()))
            }
            Err(_) => settle_abandoned_attempt(&slot, epoch).await,
        };
        result
            .map(|()| outcome)
            .map_err(|message| HubError::connection(id, message))
    }

    fn begin_attempt(
        &self,
        slot: &Arc<ServerSlot>,
        state: &mut SlotState,
    ) -> watch::Receiver<Option<AttemptResult>> {
        state.status = ConnectionState::Connecting;
        state.epoch += 1;
        state.last_error = None;
        let (tx, rx) = watch::channel(None);
        state.pending = Some(rx.clone());
        info!(server = %slot.id, endpoint = %slot.spec.endpoint, "connecting");

        tokio::spawn(run_attempt(
            Arc::clone(&self.connector),
            Arc::clone(slot),
            state.epoch,
            self.settings.handshake_timeout,
            Arc::clone(&self.connect_seq),
            self.hook.get().and_then(|hook| hook.upgrade()),
            tx,
        ));
        rx
    }

    /// Disconnect one server, or every server when `id` is `None`.
    ///
    /// Unknown and already-disconnected servers are treated as satisfied.
    /// Returns the ids whose state actually changed.
    pub async fn disconnect(&self, id: Option<&str>) -> Vec<String> {
        let targets: Vec<Arc<ServerSlot>> = match id {
            Some(id) => self.slot(id).into_iter().collect(),
            None => self.slots_in_order().into_iter().map(|(_, s)| s).collect(),
        };
        let changed = futures::future::join_all(targets.iter().map(|slot| async move {
            disconnect_slot(slot).await.then(|| slot.id.clone())
        }))
        .await;
        changed.into_iter().flatten().collect()
    }

    /// Ids currently `connected`, in connection order.
    pub async fn list_connected(&self) -> Vec<String> {
        let mut connected = Vec::new();
        for (_, slot) in self.slots_in_order() {
            let state = slot.state.lock().await;
            if state.status == ConnectionState::Connected {
                connected.push((state.connected_seq, slot.id.clone()));
            }
        }
        connected.sort_by_key(|(seq, _)| *seq);
        connected.into_iter().map(|(_, id)| id).collect()
    }

    pub async fn state(&self, id: &str) -> Option<ConnectionState> {
        let slot = self.slot(id)?;
        let state = slot.state.lock().await;
        Some(state.status)
    }

    pub async fn statuses(&self) -> Vec<ServerStatus> {
        let mut statuses = Vec::new();
        for (_, slot) in self.slots_in_order() {
            let state = slot.state.lock().await;
            let connected = state.status == ConnectionState::Connected;
            statuses.push(ServerStatus {
                id: slot.id.clone(),
                endpoint: slot.spec.endpoint.to_string(),
                state: state.status,
                last_error: state.last_error.clone(),
                connected_at: state.connected_at.filter(|_| connected),
                tool_count: state.catalog.as_ref().map(|c| c.tools.items.len()),
            });
        }
        statuses
    }

    /// Borrow the live session of a connected server.
    pub(crate) async fn live_session(&self, id: &str) -> Result<LiveSession> {
        let slot = self.slot(id).ok_or_else(|| HubError::server_not_found(id))?;
        let state = slot.state.lock().await;
        live_session_of(id, &state)
    }

    /// Track consecutive tool-call timeouts and demote the server to `error`
    /// once the configured threshold is reached.
    pub(crate) async fn record_call_outcome(&self, id: &str, epoch: u64, timed_out: bool) {
        let Some(slot) = self.slot(id) else {
            return;
        };
        let session = {
            let mut state = slot.state.lock().await;
            if state.epoch != epoch || state.status != ConnectionState::Connected {
                return;
            }
            if !timed_out {
                state.consecutive_timeouts = 0;
                return;
            }
            state.consecutive_timeouts += 1;
            let threshold = self.settings.timeout_demotion_threshold;
            if threshold == 0 || state.consecutive_timeouts < threshold {
                warn!(
                    server = %id,
                    consecutive = state.consecutive_timeouts,
                    threshold,
                    "tool call timed out"
                );
                return;
            }
            let count = state.consecutive_timeouts;
            let session = state.end_session(ConnectionState::Error);
            state.last_error = Some(format!("{count} consecutive tool call timeouts"));
            warn!(server = %id, count, "server demoted to error after repeated timeouts");
            session
        };
        if let Some(session) = session {
            session.close().await;
        }
    }
}

pub(crate) fn live_session_of(id: &str, state: &SlotState) -> Result<LiveSession> {
    match (&state.status, &state.session) {
        (ConnectionState::Connected, Some(session)) => Ok(LiveSession {
            session: Arc::clone(session),
            cancel: state.cancel.clone(),
            epoch: state.epoch,
        }),
        _ => Err(HubError::server_not_found(id)),
    }
}

async fn run_attempt(
    connector: Arc<dyn Connector>,
    slot: Arc<ServerSlot>,
    epoch: u64,
    handshake_timeout: Duration,
    connect_seq: Arc<AtomicU64>,
    hook: Option<Arc<dyn ConnectHook>>,
    tx: watch::Sender<Option<AttemptResult>>,
) {
    let result = match tokio::time::timeout(handshake_timeout, connector.connect(&slot.spec)).await
    {
        Ok(result) => result,
        Err(_) => Err(HubError::connection(
            &slot.id,
            format!("handshake timed out after {}ms", handshake_timeout.as_millis()),
        )),
    };

    let mut state = slot.state.lock().await;
    if state.epoch != epoch {
        drop(state);
        if let Ok(session) = result {
            session.close().await;
        }
        debug!(server = %slot.id, "discarding handshake superseded by disconnect");
        let _ = tx.send(Some(Err("disconnected while the handshake was in flight".into())));
        return;
    }

    state.pending = None;
    let outcome = match result {
        Ok(session) => {
            state.status = ConnectionState::Connected;
            state.session = Some(session);
            state.connected_seq = connect_seq.fetch_add(1, Ordering::SeqCst);
            state.connected_at = Some(Utc::now());
            state.consecutive_timeouts = 0;
            state.cancel = CancellationToken::new();
            state.catalog = None;
            info!(server = %slot.id, "connected");
            Ok(())
        }
        Err(error) => {
            let message = match error {
                HubError::Connection { message, .. } => message,
                other => other.to_string(),
            };
            state.status = ConnectionState::Error;
            state.last_error = Some(message.clone());
            warn!(server = %slot.id, error = %message, "connect failed");
            Err(message)
        }
    };
    drop(state);
    if let (Ok(()), Some(hook)) = (&outcome, hook) {
        hook.on_connected(&slot.id).await;
    }
    let _ = tx.send(Some(outcome));
}

/// The attempt task ended without reporting, which only happens when it
/// panicked. A slot still `connecting` under that attempt moves to `error`
/// so the server can be retried.
async fn settle_abandoned_attempt(slot: &ServerSlot, epoch: u64) -> AttemptResult {
    let mut state = slot.state.lock().await;
    if state.epoch != epoch {
        return Err("connect attempt abandoned".to_string());
    }
    match state.status {
        ConnectionState::Connected => Ok(()),
        ConnectionState::Connecting => {
            let message = "connect attempt abandoned".to_string();
            state.status = ConnectionState::Error;
            state.pending = None;
            state.last_error = Some(message.clone());
            warn!(server = %slot.id, "connect task ended without a result");
            Err(message)
        }
        _ => Err("connect attempt abandoned".to_string()),
    }
}

/// Returns whether the slot's state changed.
async fn disconnect_slot(slot: &ServerSlot) -> bool {
    let session = {
        let mut state = slot.state.lock().await;
        if state.status == ConnectionState::Disconnected {
            return false;
        }
        let previous = state.status;
        let session = state.end_session(ConnectionState::Disconnected);
        info!(server = %slot.id, from = %previous, "disconnected");
        session
    };
    if let Some(session) = session {
        session.close().await;
    }
    true
}
