//! Frame types for the Confab channel protocol.
//!
//! Every message on a connection is one frame, multiplexed by topic.
//! Frames are serialized using MessagePack for efficient binary encoding.
//! Client requests carry a `ref` that the matching reply echoes back, so
//! concurrent in-flight requests can be told apart.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of a correlated request, carried in a [`Frame::Reply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    /// Request succeeded; the payload carries the result.
    Ok,
    /// Request failed; the payload carries `{"reasons": [..]}`.
    Error,
}

/// A protocol frame.
///
/// Join, Leave, and Event travel client to server; Reply, Push, Error,
/// and Close travel server to client. Ping and Pong go both ways.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Request membership of a topic.
    #[serde(rename = "join")]
    Join {
        /// Target topic, e.g. `conversation:42`.
        topic: String,
        /// Join parameters; empty object when the topic needs none.
        payload: Value,
        /// Correlation reference echoed by the reply.
        #[serde(rename = "ref")]
        msg_ref: u64,
    },

    /// Give up membership of a topic.
    #[serde(rename = "leave")]
    Leave {
        /// Topic to leave.
        topic: String,
        /// Correlation reference echoed by the reply.
        #[serde(rename = "ref")]
        msg_ref: u64,
    },

    /// A domain event pushed by the client to a joined topic.
    #[serde(rename = "event")]
    Event {
        /// Target topic.
        topic: String,
        /// Event name, e.g. `create` or `remove`.
        event: String,
        /// Event payload.
        payload: Value,
        /// Correlation reference echoed by the reply.
        #[serde(rename = "ref")]
        msg_ref: u64,
    },

    /// Correlated answer to a Join, Leave, or Event request.
    #[serde(rename = "reply")]
    Reply {
        /// Topic the request addressed.
        topic: String,
        /// `ok` or `error`.
        status: ReplyStatus,
        /// Result payload, or `{"reasons": [..]}` on error.
        payload: Value,
        /// Reference of the originating request.
        #[serde(rename = "ref")]
        msg_ref: u64,
    },

    /// A broadcast event pushed by the server to a topic member.
    #[serde(rename = "push")]
    Push {
        /// Topic the event belongs to.
        topic: String,
        /// Event name, e.g. `new_msg` or `removed`.
        event: String,
        /// Event payload.
        payload: Value,
    },

    /// Out-of-band error notice not tied to any request.
    #[serde(rename = "error")]
    Error {
        /// Topic the error relates to, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        /// Human-readable reason.
        reason: String,
    },

    /// Server-side shutdown of one topic membership.
    #[serde(rename = "close")]
    Close {
        /// Topic whose membership was closed.
        topic: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Short name of the frame variant, for logs and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Join { .. } => "join",
            Frame::Leave { .. } => "leave",
            Frame::Event { .. } => "event",
            Frame::Reply { .. } => "reply",
            Frame::Push { .. } => "push",
            Frame::Error { .. } => "error",
            Frame::Close { .. } => "close",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
        }
    }

    /// Create a new Join frame.
    #[must_use]
    pub fn join(topic: impl Into<String>, payload: Value, msg_ref: u64) -> Self {
        Frame::Join {
            topic: topic.into(),
            payload,
            msg_ref,
        }
    }

    /// Create a new Leave frame.
    #[must_use]
    pub fn leave(topic: impl Into<String>, msg_ref: u64) -> Self {
        Frame::Leave {
            topic: topic.into(),
            msg_ref,
        }
    }

    /// Create a new Event frame.
    #[must_use]
    pub fn event(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
        msg_ref: u64,
    ) -> Self {
        Frame::Event {
            topic: topic.into(),
            event: event.into(),
            payload,
            msg_ref,
        }
    }

    /// Create an `ok` reply carrying a result payload.
    #[must_use]
    pub fn reply_ok(topic: impl Into<String>, payload: Value, msg_ref: u64) -> Self {
        Frame::Reply {
            topic: topic.into(),
            status: ReplyStatus::Ok,
            payload,
            msg_ref,
        }
    }

    /// Create an `error` reply from a list of reasons.
    #[must_use]
    pub fn reply_error<S: Into<String>>(
        topic: impl Into<String>,
        reasons: impl IntoIterator<Item = S>,
        msg_ref: u64,
    ) -> Self {
        Frame::Reply {
            topic: topic.into(),
            status: ReplyStatus::Error,
            payload: error_reasons(reasons),
            msg_ref,
        }
    }

    /// Create a new Push frame.
    #[must_use]
    pub fn push(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Frame::Push {
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Create a new Error notice.
    #[must_use]
    pub fn error_notice(topic: Option<String>, reason: impl Into<String>) -> Self {
        Frame::Error {
            topic,
            reason: reason.into(),
        }
    }

    /// Create a new Close frame.
    #[must_use]
    pub fn close(topic: impl Into<String>) -> Self {
        Frame::Close {
            topic: topic.into(),
        }
    }

    /// Create a new Ping frame with timestamp.
    #[must_use]
    pub fn ping_with_timestamp(timestamp: u64) -> Self {
        Frame::Ping {
            timestamp: Some(timestamp),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

/// Build the `{"reasons": [..]}` payload used by error replies.
#[must_use]
pub fn error_reasons<S: Into<String>>(reasons: impl IntoIterator<Item = S>) -> Value {
    let list: Vec<Value> = reasons
        .into_iter()
        .map(|r| Value::String(r.into()))
        .collect();
    serde_json::json!({ "reasons": list })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_kind() {
        let join = Frame::join("conversation:1", json!({}), 1);
        assert_eq!(join.kind(), "join");

        let push = Frame::push("conversation:1", "new_msg", json!({"id": 7}));
        assert_eq!(push.kind(), "push");
    }

    #[test]
    fn test_reply_echoes_ref() {
        let reply = Frame::reply_ok("conversation:1", json!({}), 42);
        match reply {
            Frame::Reply {
                msg_ref, status, ..
            } => {
                assert_eq!(msg_ref, 42);
                assert_eq!(status, ReplyStatus::Ok);
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn test_error_reply_payload() {
        let reply = Frame::reply_error("conversation:1", ["user is not a participant"], 3);
        match reply {
            Frame::Reply {
                status, payload, ..
            } => {
                assert_eq!(status, ReplyStatus::Error);
                assert_eq!(payload, json!({"reasons": ["user is not a participant"]}));
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn test_ref_field_name_on_wire() {
        let event = Frame::event("conversation:9", "create", json!({"content": "hi"}), 5);
        let encoded = serde_json::to_value(&event).expect("serialize");
        assert_eq!(encoded["type"], "event");
        assert_eq!(encoded["ref"], 5);
        assert_eq!(encoded["topic"], "conversation:9");
    }
}
