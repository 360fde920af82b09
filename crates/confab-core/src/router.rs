//! Client event routing.
//!
//! The router sits between raw frames and the channel layer: it parses
//! the closed client event set, checks membership, serializes dispatch
//! per topic, calls the store, and turns outcomes into reply and push
//! frames. Everything a connected client can ask for goes through here.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use confab_protocol::Frame;

use crate::events;
use crate::policy::JoinPolicy;
use crate::presence::PresenceTracker;
use crate::registry::{ChannelRegistry, JoinError};
use crate::socket::Socket;
use crate::store::{PersistenceError, Store};
use crate::topic::{ConversationId, Topic, TopicError, TopicKind, UserId};

/// Why a client event was refused before touching any state.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The topic string failed to parse.
    #[error("invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    /// The event name is outside the closed set.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// The payload does not fit the event's expected shape.
    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),

    /// The sender holds no membership on the topic.
    #[error("not joined: {0}")]
    NotJoined(String),

    /// The topic accepts no client events at all.
    #[error("events are not accepted on {0}")]
    UnsupportedTopic(String),
}

/// The closed set of client events. Anything else is refused with a
/// validation error before it can touch state.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Post a message to the conversation.
    Create(CreateBody),
    /// Remove a participant from the conversation.
    Remove { user_id: UserId },
}

/// The two accepted shapes of a `create` payload. Both produce a message;
/// the roster shape names the intended audience and uses its title as the
/// content.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum CreateBody {
    Roster {
        users: Vec<UserId>,
        title: String,
    },
    Content {
        content: String,
        #[serde(rename = "type")]
        kind: String,
    },
}

impl CreateBody {
    /// The message content this body carries.
    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            CreateBody::Roster { title, .. } => title,
            CreateBody::Content { content, .. } => content,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let ok = match self {
            CreateBody::Roster { users, title } => !users.is_empty() && !title.is_empty(),
            CreateBody::Content { content, kind } => !content.is_empty() && !kind.is_empty(),
        };
        if ok {
            Ok(())
        } else {
            Err(ValidationError::MalformedPayload(events::CREATE))
        }
    }
}

impl ClientEvent {
    /// Parse an `(event, payload)` pair into a validated client event.
    ///
    /// # Errors
    ///
    /// `UnknownEvent` for anything outside the closed set, or
    /// `MalformedPayload` when the payload does not fit the event's shape
    /// or has empty required fields.
    pub fn parse(event: &str, payload: &Value) -> Result<Self, ValidationError> {
        match event {
            events::CREATE => {
                let body: CreateBody = serde_json::from_value(payload.clone())
                    .map_err(|_| ValidationError::MalformedPayload(events::CREATE))?;
                body.validate()?;
                Ok(ClientEvent::Create(body))
            }
            events::REMOVE => {
                #[derive(Deserialize)]
                struct RemoveBody {
                    user_id: UserId,
                }
                let body: RemoveBody = serde_json::from_value(payload.clone())
                    .map_err(|_| ValidationError::MalformedPayload(events::REMOVE))?;
                Ok(ClientEvent::Remove {
                    user_id: body.user_id,
                })
            }
            other => Err(ValidationError::UnknownEvent(other.to_string())),
        }
    }
}

/// Frame-level orchestration of joins, leaves, and client events.
///
/// Every method returns the reply frame for the requesting socket; pushes
/// to other members go out through the registry as a side effect. An error
/// outcome only ever reaches the requester.
pub struct MessageRouter {
    registry: Arc<ChannelRegistry>,
    store: Arc<dyn Store>,
    presence: Arc<PresenceTracker>,
    policy: Arc<dyn JoinPolicy>,
}

impl MessageRouter {
    /// Wire up a router over its collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<ChannelRegistry>,
        store: Arc<dyn Store>,
        presence: Arc<PresenceTracker>,
        policy: Arc<dyn JoinPolicy>,
    ) -> Self {
        Self {
            registry,
            store,
            presence,
            policy,
        }
    }

    /// The registry this router dispatches through.
    #[must_use]
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Handle a join request. Replies `ok` with the initial-state snapshot
    /// or `error` with the refusal reasons.
    pub async fn handle_join(&self, socket: &Socket, topic: &str, msg_ref: u64) -> Frame {
        let parsed: Topic = match topic.parse() {
            Ok(parsed) => parsed,
            Err(err) => {
                return Frame::reply_error(topic, [JoinError::from(err).to_string()], msg_ref)
            }
        };

        match self.registry.join(&parsed, socket, self.policy.as_ref()).await {
            Ok(ack) => {
                if matches!(parsed.kind(), TopicKind::Conversation(_)) {
                    self.presence.announce_join(&parsed, socket);
                }
                Frame::reply_ok(topic, ack.snapshot, msg_ref)
            }
            Err(err) => Frame::reply_error(topic, [err.to_string()], msg_ref),
        }
    }

    /// Handle a leave request. Leaving is idempotent, so the reply is `ok`
    /// whether or not a membership existed. Cancels any pending eviction
    /// for this membership.
    pub fn handle_leave(&self, socket: &Socket, topic: &str, msg_ref: u64) -> Frame {
        let parsed: Topic = match topic.parse() {
            Ok(parsed) => parsed,
            Err(err) => {
                return Frame::reply_error(topic, [ValidationError::from(err).to_string()], msg_ref)
            }
        };

        self.presence.cancel(&parsed, socket.connection_id());
        self.registry.leave(&parsed, socket.connection_id());
        Frame::reply_ok(topic, json!({}), msg_ref)
    }

    /// Tear down everything a connection holds: pending evictions and all
    /// memberships. Returns the topics that were left.
    pub fn handle_disconnect(&self, socket: &Socket) -> Vec<Topic> {
        self.presence.cancel_all(socket.connection_id());
        self.registry.leave_all(socket.connection_id())
    }

    /// Handle a client event on a topic.
    ///
    /// The event runs under the topic's dispatch lock, so events on one
    /// conversation apply in a single serial order while other topics
    /// proceed in parallel. Membership is re-checked under the lock; a
    /// socket evicted while queueing gets a `not joined` error.
    pub async fn handle_event(
        &self,
        socket: &Socket,
        topic: &str,
        event: &str,
        payload: &Value,
        msg_ref: u64,
    ) -> Frame {
        let parsed: Topic = match topic.parse() {
            Ok(parsed) => parsed,
            Err(err) => {
                return Frame::reply_error(topic, [ValidationError::from(err).to_string()], msg_ref)
            }
        };
        let conversation_id = match parsed.kind() {
            TopicKind::Conversation(id) => id,
            TopicKind::Notify(_) => {
                let err = ValidationError::UnsupportedTopic(topic.to_string());
                return Frame::reply_error(topic, [err.to_string()], msg_ref);
            }
        };

        let client_event = match ClientEvent::parse(event, payload) {
            Ok(client_event) => client_event,
            Err(err) => {
                debug!(topic = %topic, event, error = %err, "Rejected client event");
                return Frame::reply_error(topic, [err.to_string()], msg_ref);
            }
        };

        let Some(channel) = self.registry.channel(&parsed) else {
            let err = ValidationError::NotJoined(topic.to_string());
            return Frame::reply_error(topic, [err.to_string()], msg_ref);
        };
        let _dispatch = channel.dispatch_guard().await;
        if !channel.is_member(socket.connection_id()) {
            let err = ValidationError::NotJoined(topic.to_string());
            return Frame::reply_error(topic, [err.to_string()], msg_ref);
        }

        match client_event {
            ClientEvent::Create(body) => {
                self.apply_create(&parsed, conversation_id, socket, &body, msg_ref)
                    .await
            }
            ClientEvent::Remove { user_id } => {
                self.apply_remove(&parsed, conversation_id, socket, user_id, msg_ref)
                    .await
            }
        }
    }

    async fn apply_create(
        &self,
        topic: &Topic,
        conversation_id: ConversationId,
        socket: &Socket,
        body: &CreateBody,
        msg_ref: u64,
    ) -> Frame {
        if let CreateBody::Roster { users, .. } = body {
            let participants = match self.store.get_users(conversation_id).await {
                Ok(participants) => participants,
                Err(err) => return Frame::reply_error(topic.as_str(), [err.to_string()], msg_ref),
            };
            if !users.iter().all(|user| participants.contains(user)) {
                return Frame::reply_error(topic.as_str(), ["invalid participant list"], msg_ref);
            }
        }

        match self
            .store
            .append_message(conversation_id, socket.user_id(), body.content())
            .await
        {
            Ok(message) => {
                let payload = json!({
                    "message": serde_json::to_value(&message).unwrap_or(Value::Null),
                });
                let delivered = self.registry.broadcast(
                    topic,
                    events::NEW_MSG,
                    &payload,
                    Some(socket.connection_id()),
                );
                debug!(
                    topic = %topic,
                    message = message.id,
                    sender = message.sender_id,
                    delivered,
                    "Created message"
                );
                Frame::reply_ok(topic.as_str(), payload, msg_ref)
            }
            Err(err) => Frame::reply_error(topic.as_str(), [err.to_string()], msg_ref),
        }
    }

    async fn apply_remove(
        &self,
        topic: &Topic,
        conversation_id: ConversationId,
        socket: &Socket,
        user_id: UserId,
        msg_ref: u64,
    ) -> Frame {
        // Channel membership outlives a removal until the grace timer
        // fires, so the requester's authority comes from the participant
        // set, not from still being a member.
        match self.store.get_users(conversation_id).await {
            Ok(participants) if participants.contains(&socket.user_id()) => {}
            Ok(_) => {
                let err = PersistenceError::NotParticipant {
                    conversation_id,
                    user_id: socket.user_id(),
                };
                return Frame::reply_error(topic.as_str(), [err.to_string()], msg_ref);
            }
            Err(err) => return Frame::reply_error(topic.as_str(), [err.to_string()], msg_ref),
        }

        match self.store.remove_user(conversation_id, user_id).await {
            Ok(()) => {
                self.presence.user_removed(conversation_id, user_id);
                debug!(
                    topic = %topic,
                    removed = user_id,
                    by = socket.user_id(),
                    "Removed participant"
                );
                Frame::reply_ok(topic.as_str(), json!({}), msg_ref)
            }
            Err(err) => Frame::reply_error(topic.as_str(), [err.to_string()], msg_ref),
        }
    }
}
