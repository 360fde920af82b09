//! Join authorization policies.
//!
//! The registry itself has no idea what makes a join legitimate; the
//! caller supplies a [`JoinPolicy`]. The stock [`StorePolicy`] asks the
//! store: conversation topics require the user to be a participant and
//! return recent history as the join snapshot, notify topics belong to
//! exactly their own user.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::channel::Assigns;
use crate::registry::JoinError;
use crate::store::{PersistenceError, Store};
use crate::topic::{Topic, TopicKind, UserId};

/// Default number of history messages returned by a conversation join.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// What a successful authorization grants the new member.
#[derive(Debug, Clone)]
pub struct JoinGrant {
    /// Initial-state payload returned in the join reply.
    pub snapshot: Value,
    /// Session assigns for the membership.
    pub assigns: Assigns,
}

/// Decides whether a user may join a topic, and with what initial state.
///
/// Runs before the membership is committed; the joining socket is not
/// visible to broadcasts until authorization succeeds.
#[async_trait]
pub trait JoinPolicy: Send + Sync {
    /// Authorize `user_id` to join `topic`.
    ///
    /// # Errors
    ///
    /// [`JoinError::Unauthorized`] when the user may not join, or a
    /// persistence error if the check itself failed.
    async fn authorize(&self, topic: &Topic, user_id: UserId) -> Result<JoinGrant, JoinError>;
}

/// Store-backed authorization: participants may join their conversations,
/// users may join their own notify topic.
pub struct StorePolicy {
    store: Arc<dyn Store>,
    history_limit: usize,
}

impl StorePolicy {
    /// Create a policy over a store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Override how much history a conversation join returns.
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    fn deny(topic: &Topic, err: PersistenceError) -> JoinError {
        match err {
            // Whether the conversation is missing or the user is outside
            // it, the requester only learns "unauthorized".
            PersistenceError::ConversationNotFound(_) | PersistenceError::NotParticipant { .. } => {
                JoinError::Unauthorized(topic.as_str().to_string())
            }
            other => JoinError::Persistence(other),
        }
    }
}

#[async_trait]
impl JoinPolicy for StorePolicy {
    async fn authorize(&self, topic: &Topic, user_id: UserId) -> Result<JoinGrant, JoinError> {
        match topic.kind() {
            TopicKind::Conversation(conversation_id) => {
                let participants = self
                    .store
                    .get_users(conversation_id)
                    .await
                    .map_err(|e| Self::deny(topic, e))?;
                if !participants.contains(&user_id) {
                    return Err(JoinError::Unauthorized(topic.as_str().to_string()));
                }

                let history = self
                    .store
                    .get_messages(conversation_id, None, self.history_limit)
                    .await
                    .map_err(|e| Self::deny(topic, e))?;
                let blocked = self
                    .store
                    .blocked_users(user_id)
                    .await
                    .map_err(JoinError::Persistence)?;

                Ok(JoinGrant {
                    snapshot: json!({ "messages": history }),
                    assigns: Assigns { blocked },
                })
            }
            TopicKind::Notify(owner) => {
                if owner != user_id {
                    return Err(JoinError::Unauthorized(topic.as_str().to_string()));
                }
                Ok(JoinGrant {
                    snapshot: json!({}),
                    assigns: Assigns::default(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, StorePolicy) {
        let store = Arc::new(MemoryStore::new());
        let policy = StorePolicy::new(store.clone());
        (store, policy)
    }

    #[tokio::test]
    async fn test_participant_may_join_conversation() {
        let (store, policy) = setup();
        let conversation = store.create_conversation("general", [1, 2]);
        store.append_message(conversation, 1, "hello").await.unwrap();

        let grant = policy
            .authorize(&Topic::conversation(conversation), 2)
            .await
            .unwrap();
        let messages = grant.snapshot["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["content"], "hello");
    }

    #[tokio::test]
    async fn test_non_participant_denied() {
        let (store, policy) = setup();
        let conversation = store.create_conversation("private", [1]);

        let err = policy
            .authorize(&Topic::conversation(conversation), 9)
            .await
            .unwrap_err();
        assert!(matches!(err, JoinError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_missing_conversation_denied() {
        let (_store, policy) = setup();
        let err = policy
            .authorize(&Topic::conversation(404), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, JoinError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_notify_topic_is_private() {
        let (_store, policy) = setup();

        assert!(policy.authorize(&Topic::notify(5), 5).await.is_ok());
        let err = policy.authorize(&Topic::notify(5), 6).await.unwrap_err();
        assert!(matches!(err, JoinError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_grant_carries_blocked_assigns() {
        let (store, policy) = setup();
        let conversation = store.create_conversation("general", [1, 2]);
        store.block_user(2, 1);

        let grant = policy
            .authorize(&Topic::conversation(conversation), 2)
            .await
            .unwrap();
        assert!(grant.assigns.blocked.contains(&1));
    }

    #[tokio::test]
    async fn test_history_limit() {
        let (store, policy) = setup();
        let conversation = store.create_conversation("busy", [1]);
        for i in 0..10 {
            store
                .append_message(conversation, 1, &format!("m{i}"))
                .await
                .unwrap();
        }

        let policy = policy.with_history_limit(3);
        let grant = policy
            .authorize(&Topic::conversation(conversation), 1)
            .await
            .unwrap();
        let messages = grant.snapshot["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2]["content"], "m9");
    }
}
