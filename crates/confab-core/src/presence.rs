//! Presence events and deferred forced leaves.
//!
//! When a user is removed from a conversation they get told twice: a
//! `removed` push on their private notify topic right away, and a forced
//! leave from the conversation channel after a grace period. The grace
//! period gives their client time to react on its own; if it does not,
//! the tracker evicts the membership and pushes a close frame.
//!
//! Pending evictions are keyed by `(topic, connection)` so they can be
//! cancelled individually. Rejoining the conversation does not cancel an
//! eviction unless [`PresenceConfig::cancel_on_rejoin`] says so.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::debug;

use confab_protocol::Frame;

use crate::events;
use crate::registry::ChannelRegistry;
use crate::socket::{ConnectionId, Socket};
use crate::topic::{ConversationId, Topic, UserId};

type PendingKey = (String, ConnectionId);

/// Presence tuning knobs.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// How long a removed user keeps their membership before eviction.
    pub grace: Duration,
    /// Cancel a pending eviction when the connection rejoins the topic.
    pub cancel_on_rejoin: bool,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            cancel_on_rejoin: false,
        }
    }
}

/// What happened on a topic. Transient: produced, delivered, forgotten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    /// Topic the transition happened on.
    pub topic: Topic,
    /// Which transition it was.
    pub kind: PresenceEventKind,
    /// User the transition concerns.
    pub user_id: UserId,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
}

/// The membership transitions worth announcing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEventKind {
    /// A user joined the topic.
    Joined,
    /// A user was removed from the conversation.
    Removed,
}

/// Tracks membership transitions and owns the pending-eviction timers.
pub struct PresenceTracker {
    registry: Arc<ChannelRegistry>,
    pending: Arc<DashMap<PendingKey, JoinHandle<()>>>,
    config: PresenceConfig,
}

impl PresenceTracker {
    /// Create a tracker over a registry.
    #[must_use]
    pub fn new(registry: Arc<ChannelRegistry>, config: PresenceConfig) -> Self {
        Self {
            registry,
            pending: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Announce a fresh join to the rest of the topic.
    ///
    /// The joiner already learned the outcome from the join reply, so the
    /// broadcast excludes them. Also cancels a pending eviction for this
    /// membership when configured to.
    pub fn announce_join(&self, topic: &Topic, socket: &Socket) -> PresenceEvent {
        if self.config.cancel_on_rejoin {
            self.cancel(topic, socket.connection_id());
        }
        self.registry.broadcast(
            topic,
            events::USER_JOINED,
            &json!({ "user_id": socket.user_id() }),
            Some(socket.connection_id()),
        );
        PresenceEvent {
            topic: topic.clone(),
            kind: PresenceEventKind::Joined,
            user_id: socket.user_id(),
            timestamp: now_millis(),
        }
    }

    /// React to a user being removed from a conversation.
    ///
    /// Pushes a single `removed` notification to the user's notify topic
    /// and schedules a forced leave for every connection they hold on the
    /// conversation topic.
    pub fn user_removed(&self, conversation: ConversationId, user_id: UserId) -> PresenceEvent {
        let conversation_topic = Topic::conversation(conversation);
        let payload = json!({
            "user_id": user_id,
            "conversation": conversation,
        });
        self.registry
            .broadcast(&Topic::notify(user_id), events::REMOVED, &payload, None);

        for connection_id in self.registry.user_connections(&conversation_topic, user_id) {
            self.schedule_forced_leave(&conversation_topic, connection_id);
        }

        PresenceEvent {
            topic: conversation_topic,
            kind: PresenceEventKind::Removed,
            user_id,
            timestamp: now_millis(),
        }
    }

    /// Schedule an eviction of `connection_id` from `topic` after the
    /// grace period. Rescheduling the same membership restarts the clock.
    pub fn schedule_forced_leave(&self, topic: &Topic, connection_id: ConnectionId) {
        let key = (topic.as_str().to_string(), connection_id.clone());
        let registry = Arc::clone(&self.registry);
        let pending = Arc::clone(&self.pending);
        let topic = topic.clone();
        let grace = self.config.grace;

        debug!(
            topic = %topic,
            conn = %connection_id,
            grace_ms = grace.as_millis() as u64,
            "Scheduled forced leave"
        );
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            pending.remove(&task_key);
            // A membership given up in the meantime leaves nothing to
            // evict; the leave is a no-op then.
            if let Some(socket) = registry.leave(&topic, &task_key.1) {
                socket.send(Frame::close(topic.as_str()));
                debug!(topic = %topic, conn = %task_key.1, "Forced leave");
            }
        });

        if let Some(previous) = self.pending.insert(key, handle) {
            previous.abort();
        }
    }

    /// Cancel a pending eviction. Returns whether one was pending.
    pub fn cancel(&self, topic: &Topic, connection_id: &ConnectionId) -> bool {
        let key = (topic.as_str().to_string(), connection_id.clone());
        match self.pending.remove(&key) {
            Some((_, handle)) => {
                handle.abort();
                debug!(topic = %topic, conn = %connection_id, "Cancelled forced leave");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending eviction for a connection. Used on disconnect,
    /// when the memberships are torn down anyway.
    pub fn cancel_all(&self, connection_id: &ConnectionId) {
        let keys: Vec<PendingKey> = self
            .pending
            .iter()
            .filter(|entry| &entry.key().1 == connection_id)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, handle)) = self.pending.remove(&key) {
                handle.abort();
            }
        }
    }

    /// Number of evictions currently pending.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
