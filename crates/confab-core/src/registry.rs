//! Channel registry: topic lookup, join/leave lifecycle, broadcast.
//!
//! The registry owns the map from topic names to live [`Channel`]s and
//! the per-connection set of joined topics. Channels are created lazily
//! on first join and dropped once their last member leaves (unless
//! configured otherwise). All membership mutation funnels through here
//! so a connection can hold at most one membership per topic.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};

use crate::channel::{Channel, Member};
use crate::policy::JoinPolicy;
use crate::socket::{ConnectionId, Socket};
use crate::store::PersistenceError;
use crate::topic::{Topic, TopicError, UserId};

/// Why a join request was refused.
#[derive(Debug, Error)]
pub enum JoinError {
    /// The topic string failed to parse.
    #[error("invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    /// The connection already holds a membership on the topic.
    #[error("already joined: {0}")]
    AlreadyJoined(String),

    /// The join policy rejected the user.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The connection is at its joined-topic cap.
    #[error("joined topic limit reached")]
    LimitExceeded,

    /// The policy's store lookup failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Registry tuning knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum topics a single connection may be joined to.
    pub max_joined_topics: usize,
    /// Keep channels alive after their last member leaves.
    pub keep_empty_channels: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_joined_topics: 100,
            keep_empty_channels: false,
        }
    }
}

/// Successful join: the topic plus the initial-state snapshot to send
/// back in the reply.
#[derive(Debug, Clone)]
pub struct JoinAck {
    /// The topic that was joined.
    pub topic: Topic,
    /// Initial-state payload granted by the policy.
    pub snapshot: Value,
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Live channels.
    pub channels: usize,
    /// Connections the registry is tracking.
    pub connections: usize,
    /// Memberships summed across all connections.
    pub memberships: usize,
}

/// Topic-to-channel map plus per-connection membership bookkeeping.
pub struct ChannelRegistry {
    channels: DashMap<String, Arc<Channel>>,
    joined: DashMap<ConnectionId, DashSet<String>>,
    config: RegistryConfig,
}

impl ChannelRegistry {
    /// Create a registry with the given configuration.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            channels: DashMap::new(),
            joined: DashMap::new(),
            config,
        }
    }

    /// Create a registry with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RegistryConfig::default())
    }

    /// Join `socket` to `topic`, authorizing through `policy`.
    ///
    /// The topic slot is reserved before the policy runs, so a second
    /// join racing this one fails with `AlreadyJoined` instead of
    /// producing a duplicate membership. The member only becomes visible
    /// to broadcasts once the policy has granted the join.
    ///
    /// # Errors
    ///
    /// `AlreadyJoined` if this connection already holds (or is acquiring)
    /// a membership on the topic, `LimitExceeded` at the per-connection
    /// topic cap, or whatever the policy refused with.
    pub async fn join(
        &self,
        topic: &Topic,
        socket: &Socket,
        policy: &dyn JoinPolicy,
    ) -> Result<JoinAck, JoinError> {
        let raw = topic.as_str();

        {
            let conn_topics = self.joined.entry(socket.connection_id().clone()).or_default();
            if conn_topics.contains(raw) {
                return Err(JoinError::AlreadyJoined(raw.to_string()));
            }
            if conn_topics.len() >= self.config.max_joined_topics {
                return Err(JoinError::LimitExceeded);
            }
            conn_topics.insert(raw.to_string());
        }

        // No locks are held across the policy call.
        let mut member = Member::joining(socket.clone());
        let grant = match policy.authorize(topic, socket.user_id()).await {
            Ok(grant) => grant,
            Err(err) => {
                member.terminate();
                self.release_reservation(socket.connection_id(), raw);
                debug!(
                    topic = %raw,
                    user = socket.user_id(),
                    error = %err,
                    "Join refused"
                );
                return Err(err);
            }
        };
        member.promote(grant.assigns);

        // Inserting under the map entry keeps the channel from being torn
        // down between creation and the first membership.
        let channel = self
            .channels
            .entry(raw.to_string())
            .or_insert_with(|| {
                debug!(topic = %raw, "Created channel");
                Arc::new(Channel::new(topic.clone()))
            });
        if !channel.insert_member(member) {
            drop(channel);
            self.release_reservation(socket.connection_id(), raw);
            return Err(JoinError::AlreadyJoined(raw.to_string()));
        }
        drop(channel);

        debug!(
            topic = %raw,
            user = socket.user_id(),
            conn = %socket.connection_id(),
            "Joined channel"
        );
        Ok(JoinAck {
            topic: topic.clone(),
            snapshot: grant.snapshot,
        })
    }

    /// Remove `connection_id` from `topic`.
    ///
    /// Idempotent: leaving a topic the connection never joined returns
    /// `None` and changes nothing. Returns the member's socket so the
    /// caller can still push a closing frame to it.
    pub fn leave(&self, topic: &Topic, connection_id: &ConnectionId) -> Option<Socket> {
        let raw = topic.as_str();
        if let Some(conn_topics) = self.joined.get(connection_id) {
            conn_topics.remove(raw);
        }

        let removed = self
            .channels
            .get(raw)
            .and_then(|channel| channel.remove_member(connection_id));
        if removed.is_some() {
            self.drop_channel_if_empty(raw);
            debug!(topic = %raw, conn = %connection_id, "Left channel");
        }
        removed
    }

    /// Remove `connection_id` from every topic it joined, returning the
    /// topics that were left. Used on disconnect.
    pub fn leave_all(&self, connection_id: &ConnectionId) -> Vec<Topic> {
        let Some((_, topics)) = self.joined.remove(connection_id) else {
            return Vec::new();
        };

        let mut left = Vec::new();
        for raw in topics.iter() {
            let raw = raw.clone();
            if let Some(channel) = self.channels.get(&raw) {
                channel.remove_member(connection_id);
            }
            self.drop_channel_if_empty(&raw);
            if let Ok(topic) = raw.parse::<Topic>() {
                left.push(topic);
            }
        }

        if !left.is_empty() {
            debug!(conn = %connection_id, channels = left.len(), "Left all channels");
        }
        left
    }

    /// Fan a push frame out to the topic's members, excluding at most one
    /// connection. Returns how many members it was queued for.
    ///
    /// A topic with no live channel delivers to nobody; that is normal
    /// for notify topics whose owner is offline.
    pub fn broadcast(
        &self,
        topic: &Topic,
        event: &str,
        payload: &Value,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        match self.channels.get(topic.as_str()) {
            Some(channel) => channel.fan_out(event, payload, exclude),
            None => {
                trace!(topic = %topic, event, "Broadcast to topic without channel");
                0
            }
        }
    }

    /// Look up the live channel for a topic.
    #[must_use]
    pub fn channel(&self, topic: &Topic) -> Option<Arc<Channel>> {
        self.channels
            .get(topic.as_str())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `connection_id` currently holds a membership on `topic`.
    #[must_use]
    pub fn is_joined(&self, topic: &Topic, connection_id: &ConnectionId) -> bool {
        self.channels
            .get(topic.as_str())
            .is_some_and(|channel| channel.is_member(connection_id))
    }

    /// Number of members on a topic.
    #[must_use]
    pub fn member_count(&self, topic: &Topic) -> usize {
        self.channels
            .get(topic.as_str())
            .map_or(0, |channel| channel.member_count())
    }

    /// Connections a user holds on a topic. A user on two devices joined
    /// to the same conversation shows up twice.
    #[must_use]
    pub fn user_connections(&self, topic: &Topic, user_id: UserId) -> Vec<ConnectionId> {
        self.channels
            .get(topic.as_str())
            .map_or_else(Vec::new, |channel| channel.user_connections(user_id))
    }

    /// Topics a connection is joined to.
    #[must_use]
    pub fn joined_topics(&self, connection_id: &ConnectionId) -> Vec<Topic> {
        self.joined.get(connection_id).map_or_else(Vec::new, |topics| {
            topics
                .iter()
                .filter_map(|raw| raw.parse::<Topic>().ok())
                .collect()
        })
    }

    /// Current registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            channels: self.channels.len(),
            connections: self.joined.len(),
            memberships: self.joined.iter().map(|topics| topics.len()).sum(),
        }
    }

    fn release_reservation(&self, connection_id: &ConnectionId, raw: &str) {
        if let Some(conn_topics) = self.joined.get(connection_id) {
            conn_topics.remove(raw);
        }
    }

    fn drop_channel_if_empty(&self, raw: &str) {
        if self.config.keep_empty_channels {
            return;
        }
        if self.channels.remove_if(raw, |_, channel| channel.is_empty()).is_some() {
            debug!(topic = %raw, "Dropped empty channel");
        }
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Assigns;
    use crate::policy::JoinGrant;
    use async_trait::async_trait;
    use confab_protocol::Frame;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct AllowAll;

    #[async_trait]
    impl JoinPolicy for AllowAll {
        async fn authorize(&self, _topic: &Topic, _user_id: UserId) -> Result<JoinGrant, JoinError> {
            Ok(JoinGrant {
                snapshot: json!({}),
                assigns: Assigns::default(),
            })
        }
    }

    struct DenyAll;

    #[async_trait]
    impl JoinPolicy for DenyAll {
        async fn authorize(&self, topic: &Topic, _user_id: UserId) -> Result<JoinGrant, JoinError> {
            Err(JoinError::Unauthorized(topic.as_str().to_string()))
        }
    }

    fn socket(user_id: UserId) -> (Socket, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = Socket::new(crate::socket::SocketIdentity::new(user_id), tx);
        (socket, rx)
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let registry = ChannelRegistry::with_defaults();
        let topic = Topic::conversation(1);
        let (socket, _rx) = socket(1);

        let ack = registry.join(&topic, &socket, &AllowAll).await.unwrap();
        assert_eq!(ack.topic.as_str(), "conversation:1");
        assert!(registry.is_joined(&topic, socket.connection_id()));
        assert_eq!(registry.member_count(&topic), 1);

        assert!(registry.leave(&topic, socket.connection_id()).is_some());
        assert!(!registry.is_joined(&topic, socket.connection_id()));
        // Last member out drops the channel.
        assert_eq!(registry.stats().channels, 0);

        // Leaving again is a no-op.
        assert!(registry.leave(&topic, socket.connection_id()).is_none());
    }

    #[tokio::test]
    async fn test_double_join_rejected() {
        let registry = ChannelRegistry::with_defaults();
        let topic = Topic::conversation(1);
        let (socket, _rx) = socket(1);

        registry.join(&topic, &socket, &AllowAll).await.unwrap();
        let err = registry.join(&topic, &socket, &AllowAll).await.unwrap_err();
        assert!(matches!(err, JoinError::AlreadyJoined(_)));
        assert_eq!(registry.member_count(&topic), 1);
    }

    #[tokio::test]
    async fn test_refused_join_leaves_no_state() {
        let registry = ChannelRegistry::with_defaults();
        let topic = Topic::conversation(1);
        let (socket, _rx) = socket(1);

        let err = registry.join(&topic, &socket, &DenyAll).await.unwrap_err();
        assert!(matches!(err, JoinError::Unauthorized(_)));
        assert!(!registry.is_joined(&topic, socket.connection_id()));
        assert_eq!(registry.member_count(&topic), 0);

        // The reservation was rolled back, so a later join succeeds.
        registry.join(&topic, &socket, &AllowAll).await.unwrap();
        assert!(registry.is_joined(&topic, socket.connection_id()));
    }

    #[tokio::test]
    async fn test_joined_topic_limit() {
        let registry = ChannelRegistry::new(RegistryConfig {
            max_joined_topics: 1,
            ..RegistryConfig::default()
        });
        let (socket, _rx) = socket(1);

        registry
            .join(&Topic::conversation(1), &socket, &AllowAll)
            .await
            .unwrap();
        let err = registry
            .join(&Topic::conversation(2), &socket, &AllowAll)
            .await
            .unwrap_err();
        assert!(matches!(err, JoinError::LimitExceeded));
    }

    #[tokio::test]
    async fn test_leave_all_on_disconnect() {
        let registry = ChannelRegistry::with_defaults();
        let (socket, _rx) = socket(1);

        registry
            .join(&Topic::conversation(1), &socket, &AllowAll)
            .await
            .unwrap();
        registry
            .join(&Topic::notify(1), &socket, &AllowAll)
            .await
            .unwrap();

        let left = registry.leave_all(socket.connection_id());
        assert_eq!(left.len(), 2);
        assert_eq!(registry.stats().channels, 0);
        assert_eq!(registry.stats().connections, 0);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let registry = ChannelRegistry::with_defaults();
        let topic = Topic::conversation(7);
        let (alice, mut alice_rx) = socket(1);
        let (bob, mut bob_rx) = socket(2);

        registry.join(&topic, &alice, &AllowAll).await.unwrap();
        registry.join(&topic, &bob, &AllowAll).await.unwrap();

        let delivered = registry.broadcast(
            &topic,
            "new_msg",
            &json!({"message": {"content": "hi"}}),
            Some(alice.connection_id()),
        );
        assert_eq!(delivered, 1);
        assert!(alice_rx.try_recv().is_err());
        match bob_rx.try_recv().unwrap() {
            Frame::Push { topic: t, event, .. } => {
                assert_eq!(t, "conversation:7");
                assert_eq!(event, "new_msg");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_without_channel_delivers_nothing() {
        let registry = ChannelRegistry::with_defaults();
        assert_eq!(
            registry.broadcast(&Topic::notify(9), "removed", &json!({}), None),
            0
        );
    }

    #[tokio::test]
    async fn test_keep_empty_channels() {
        let registry = ChannelRegistry::new(RegistryConfig {
            keep_empty_channels: true,
            ..RegistryConfig::default()
        });
        let topic = Topic::conversation(1);
        let (socket, _rx) = socket(1);

        registry.join(&topic, &socket, &AllowAll).await.unwrap();
        registry.leave(&topic, socket.connection_id());
        assert_eq!(registry.stats().channels, 1);
        assert_eq!(registry.member_count(&topic), 0);
    }

    #[tokio::test]
    async fn test_membership_never_exceeds_one() {
        let registry = ChannelRegistry::with_defaults();
        let topic = Topic::conversation(3);
        let (socket, _rx) = socket(1);

        registry.join(&topic, &socket, &AllowAll).await.unwrap();
        assert!(registry.join(&topic, &socket, &AllowAll).await.is_err());
        registry.leave(&topic, socket.connection_id());
        registry.leave(&topic, socket.connection_id());
        registry.join(&topic, &socket, &AllowAll).await.unwrap();
        assert_eq!(registry.member_count(&topic), 1);
        assert_eq!(
            registry.user_connections(&topic, 1),
            vec![socket.connection_id().clone()]
        );
    }

    #[tokio::test]
    async fn test_stats() {
        let registry = ChannelRegistry::with_defaults();
        let (s1, _rx1) = socket(1);
        let (s2, _rx2) = socket(2);

        registry
            .join(&Topic::conversation(1), &s1, &AllowAll)
            .await
            .unwrap();
        registry
            .join(&Topic::conversation(1), &s2, &AllowAll)
            .await
            .unwrap();
        registry
            .join(&Topic::notify(1), &s1, &AllowAll)
            .await
            .unwrap();

        let stats = registry.stats();
        assert_eq!(stats.channels, 2);
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.memberships, 3);
    }
}
