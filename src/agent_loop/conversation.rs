//! Append-only conversations and the store that hands them out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{HubError, NotFoundKind, Result};
use crate::types::ModelMessage;

use super::types::{ConversationId, ToolInvocationRecord};

/// One entry of a conversation's display history.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Turn {
    User {
        text: String,
        at: DateTime<Utc>,
    },
    Model {
        text: String,
        at: DateTime<Utc>,
    },
    ToolInvocations {
        records: Vec<ToolInvocationRecord>,
    },
}

/// An ordered, append-only sequence of turns.
///
/// Besides the display turns it keeps the text history replayed to the
/// model on the next user message.
#[derive(Debug, Clone)]
pub struct Conversation {
    id: ConversationId,
    created_at: DateTime<Utc>,
    turns: Vec<Turn>,
    history: Vec<ModelMessage>,
}

impl Conversation {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            turns: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub(crate) fn history(&self) -> &[ModelMessage] {
        &self.history
    }

    pub(crate) fn push_user(&mut self, text: &str) {
        self.turns.push(Turn::User {
            text: text.to_string(),
            at: Utc::now(),
        });
        self.history.push(ModelMessage::user(text));
    }

    pub(crate) fn push_tool_invocations(&mut self, records: Vec<ToolInvocationRecord>) {
        if !records.is_empty() {
            self.turns.push(Turn::ToolInvocations { records });
        }
    }

    pub(crate) fn push_model(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.turns.push(Turn::Model {
            text: text.to_string(),
            at: Utc::now(),
        });
        self.history.push(ModelMessage::assistant(text));
    }
}

pub type SharedConversation = Arc<Mutex<Conversation>>;

pub const DEFAULT_MAX_CONVERSATIONS: usize = 256;

struct StoreEntry {
    conversation: SharedConversation,
    last_used: u64,
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<ConversationId, StoreEntry>,
    clock: u64,
}

impl StoreInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Drop least recently used conversations until `capacity` is met.
    /// Conversations with a turn running are skipped.
    fn evict_to(&mut self, capacity: usize) -> Vec<ConversationId> {
        let mut evicted = Vec::new();
        while self.entries.len() > capacity {
            let idle = self
                .entries
                .iter()
                .filter(|(_, entry)| Arc::strong_count(&entry.conversation) == 1)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| *id);
            let Some(id) = idle else {
                break;
            };
            self.entries.remove(&id);
            evicted.push(id);
        }
        evicted
    }
}

/// Conversations keyed by id. Each conversation has its own lock, so turns
/// of different conversations never contend.
///
/// At most `capacity` conversations are kept; starting one more evicts the
/// least recently used idle conversation.
pub struct ConversationStore {
    inner: StdMutex<StoreInner>,
    capacity: usize,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_CONVERSATIONS)
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: StdMutex::new(StoreInner::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self) -> (ConversationId, SharedConversation) {
        let id = Uuid::new_v4();
        let conversation = Arc::new(Mutex::new(Conversation::new(id)));
        let mut inner = self.lock();
        let evicted = inner.evict_to(self.capacity - 1);
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), capacity = self.capacity, "evicted idle conversations");
        }
        let last_used = inner.tick();
        inner.entries.insert(
            id,
            StoreEntry {
                conversation: Arc::clone(&conversation),
                last_used,
            },
        );
        (id, conversation)
    }

    /// Look up a conversation and mark it as recently used.
    pub fn get(&self, id: &ConversationId) -> Option<SharedConversation> {
        let mut inner = self.lock();
        let now = inner.tick();
        inner.entries.get_mut(id).map(|entry| {
            entry.last_used = now;
            Arc::clone(&entry.conversation)
        })
    }

    /// Resume `id`, or start a new conversation when `None`.
    pub fn resume_or_create(
        &self,
        id: Option<ConversationId>,
    ) -> Result<(ConversationId, SharedConversation)> {
        match id {
            None => Ok(self.create()),
            Some(id) => self
                .get(&id)
                .map(|conversation| (id, conversation))
                .ok_or_else(|| HubError::not_found(NotFoundKind::Conversation, "", id.to_string())),
        }
    }

    pub fn remove(&self, id: &ConversationId) -> bool {
        self.lock().entries.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
