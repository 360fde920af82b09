//! Persistence boundary for conversations, messages, and users.
//!
//! The channel core never owns durable state. Everything below lives behind
//! the [`Store`] trait: conversations with their participant sets, the
//! ordered message lists, and the per-user blocked sets that feed outbound
//! filtering. [`MemoryStore`] is the in-process implementation used by tests
//! and local runs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::topic::{ConversationId, UserId};

/// A unique message identifier, assigned by the store in acceptance order.
pub type MessageId = u64;

/// A persisted chat message.
///
/// Immutable once created, except for read-by accumulation which stays
/// inside the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// User who sent the message.
    pub sender_id: UserId,
    /// Message body.
    pub content: String,
    /// Milliseconds since the epoch.
    pub inserted_at: u64,
    /// Users who have read the message; starts as just the sender.
    pub read_by: HashSet<UserId>,
}

/// Store failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PersistenceError {
    /// No conversation with that id.
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// The user is not a participant of the conversation.
    #[error("User {user_id} is not a participant of conversation {conversation_id}")]
    NotParticipant {
        /// Conversation checked.
        conversation_id: ConversationId,
        /// User checked.
        user_id: UserId,
    },

    /// Backend failure in a durable store implementation.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Durable state owned outside the channel core.
///
/// Calls may block on I/O; the router only invokes them under the owning
/// topic's dispatch lock, so one conversation's persistence never stalls
/// another's.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append a message to a conversation.
    ///
    /// # Errors
    ///
    /// Fails if the conversation does not exist or the sender is not a
    /// participant.
    async fn append_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> Result<Message, PersistenceError>;

    /// Fetch messages in insertion order, oldest first.
    ///
    /// `before` restricts to messages with a smaller id; at most `limit`
    /// of the newest qualifying messages are returned.
    ///
    /// # Errors
    ///
    /// Fails if the conversation does not exist.
    async fn get_messages(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>, PersistenceError>;

    /// Add a participant to a conversation.
    ///
    /// # Errors
    ///
    /// Fails if the conversation does not exist.
    async fn add_user(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), PersistenceError>;

    /// Remove a participant from a conversation.
    ///
    /// # Errors
    ///
    /// Fails if the conversation does not exist or the user is not a
    /// participant.
    async fn remove_user(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), PersistenceError>;

    /// The conversation's current participant set.
    ///
    /// # Errors
    ///
    /// Fails if the conversation does not exist.
    async fn get_users(
        &self,
        conversation_id: ConversationId,
    ) -> Result<HashSet<UserId>, PersistenceError>;

    /// Users this user has blocked. Feeds per-recipient outbound filtering.
    ///
    /// # Errors
    ///
    /// Fails on backend errors; an unknown user simply has no blocks.
    async fn blocked_users(&self, user_id: UserId) -> Result<HashSet<UserId>, PersistenceError>;
}

/// One conversation's durable state. Owned by the store, never handed out
/// whole.
#[derive(Debug)]
struct Conversation {
    title: String,
    participants: HashSet<UserId>,
    messages: Vec<Message>,
}

/// In-memory [`Store`] for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    conversations: DashMap<ConversationId, Conversation>,
    blocked: DashMap<UserId, HashSet<UserId>>,
    next_conversation_id: AtomicU64,
    next_message_id: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a conversation, returning its id.
    pub fn create_conversation(
        &self,
        title: impl Into<String>,
        participants: impl IntoIterator<Item = UserId>,
    ) -> ConversationId {
        let id = self.next_conversation_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.conversations.insert(
            id,
            Conversation {
                title: title.into(),
                participants: participants.into_iter().collect(),
                messages: Vec::new(),
            },
        );
        debug!(conversation = id, "Created conversation");
        id
    }

    /// The conversation's title, if it exists.
    #[must_use]
    pub fn title(&self, conversation_id: ConversationId) -> Option<String> {
        self.conversations
            .get(&conversation_id)
            .map(|c| c.title.clone())
    }

    /// Record that `user_id` has blocked `blocked_id`.
    pub fn block_user(&self, user_id: UserId, blocked_id: UserId) {
        self.blocked.entry(user_id).or_default().insert(blocked_id);
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> Result<Message, PersistenceError> {
        let mut conversation = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or(PersistenceError::ConversationNotFound(conversation_id))?;

        if !conversation.participants.contains(&sender_id) {
            return Err(PersistenceError::NotParticipant {
                conversation_id,
                user_id: sender_id,
            });
        }

        let message = Message {
            id: self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1,
            conversation_id,
            sender_id,
            content: content.to_string(),
            inserted_at: Self::now_millis(),
            read_by: HashSet::from([sender_id]),
        };
        conversation.messages.push(message.clone());

        Ok(message)
    }

    async fn get_messages(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>, PersistenceError> {
        let conversation = self
            .conversations
            .get(&conversation_id)
            .ok_or(PersistenceError::ConversationNotFound(conversation_id))?;

        let qualifying: Vec<Message> = conversation
            .messages
            .iter()
            .filter(|m| before.map_or(true, |b| m.id < b))
            .cloned()
            .collect();

        let skip = qualifying.len().saturating_sub(limit);
        Ok(qualifying.into_iter().skip(skip).collect())
    }

    async fn add_user(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), PersistenceError> {
        let mut conversation = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or(PersistenceError::ConversationNotFound(conversation_id))?;

        conversation.participants.insert(user_id);
        Ok(())
    }

    async fn remove_user(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), PersistenceError> {
        let mut conversation = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or(PersistenceError::ConversationNotFound(conversation_id))?;

        if !conversation.participants.remove(&user_id) {
            return Err(PersistenceError::NotParticipant {
                conversation_id,
                user_id,
            });
        }
        debug!(conversation = conversation_id, user = user_id, "Removed participant");
        Ok(())
    }

    async fn get_users(
        &self,
        conversation_id: ConversationId,
    ) -> Result<HashSet<UserId>, PersistenceError> {
        self.conversations
            .get(&conversation_id)
            .map(|c| c.participants.clone())
            .ok_or(PersistenceError::ConversationNotFound(conversation_id))
    }

    async fn blocked_users(&self, user_id: UserId) -> Result<HashSet<UserId>, PersistenceError> {
        Ok(self
            .blocked
            .get(&user_id)
            .map(|set| set.clone())
            .unwrap_or_default())
    }
}
