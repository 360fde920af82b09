//! Topic names for Confab channels.
//!
//! A topic is a namespaced string address: `conversation:<id>` for a shared
//! conversation channel, `notify:<user id>` for a user's private
//! notification channel. Topics are parsed once at the edge and immutable
//! afterwards.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A user identifier, resolved from an authenticated token.
pub type UserId = u64;

/// A conversation identifier, owned by the store.
pub type ConversationId = u64;

/// Maximum topic string length.
pub const MAX_TOPIC_LENGTH: usize = 128;

/// Errors from parsing a topic string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    /// Topic string was empty.
    #[error("Topic cannot be empty")]
    Empty,

    /// Topic string exceeds [`MAX_TOPIC_LENGTH`].
    #[error("Topic too long")]
    TooLong,

    /// Topic had no `namespace:id` shape or an unknown namespace.
    #[error("Unknown topic namespace: {0}")]
    UnknownNamespace(String),

    /// The id part was not a valid integer.
    #[error("Invalid topic id: {0}")]
    InvalidId(String),
}

/// What a topic addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// A shared conversation channel.
    Conversation(ConversationId),
    /// A user's private notification channel.
    Notify(UserId),
}

/// A parsed, validated topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    raw: String,
    kind: TopicKind,
}

impl Topic {
    /// Topic for a conversation channel.
    #[must_use]
    pub fn conversation(id: ConversationId) -> Self {
        Self {
            raw: format!("conversation:{id}"),
            kind: TopicKind::Conversation(id),
        }
    }

    /// Private notify topic for a user.
    #[must_use]
    pub fn notify(user_id: UserId) -> Self {
        Self {
            raw: format!("notify:{user_id}"),
            kind: TopicKind::Notify(user_id),
        }
    }

    /// Parse a raw topic string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is empty, too long, or not of the
    /// form `conversation:<id>` / `notify:<id>`.
    pub fn parse(raw: &str) -> Result<Self, TopicError> {
        if raw.is_empty() {
            return Err(TopicError::Empty);
        }
        if raw.len() > MAX_TOPIC_LENGTH {
            return Err(TopicError::TooLong);
        }

        let (namespace, id) = raw
            .split_once(':')
            .ok_or_else(|| TopicError::UnknownNamespace(raw.to_string()))?;

        let id: u64 = id
            .parse()
            .map_err(|_| TopicError::InvalidId(id.to_string()))?;

        let kind = match namespace {
            "conversation" => TopicKind::Conversation(id),
            "notify" => TopicKind::Notify(id),
            other => return Err(TopicError::UnknownNamespace(other.to_string())),
        };

        Ok(Self {
            raw: raw.to_string(),
            kind,
        })
    }

    /// The topic's kind and embedded id.
    #[must_use]
    pub fn kind(&self) -> TopicKind {
        self.kind
    }

    /// The conversation id, if this is a conversation topic.
    #[must_use]
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self.kind {
            TopicKind::Conversation(id) => Some(id),
            TopicKind::Notify(_) => None,
        }
    }

    /// The owning user id, if this is a notify topic.
    #[must_use]
    pub fn notify_user(&self) -> Option<UserId> {
        match self.kind {
            TopicKind::Conversation(_) => None,
            TopicKind::Notify(id) => Some(id),
        }
    }

    /// The raw topic string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::parse(s)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_conversation() {
        let topic = Topic::parse("conversation:28").unwrap();
        assert_eq!(topic.kind(), TopicKind::Conversation(28));
        assert_eq!(topic.conversation_id(), Some(28));
        assert_eq!(topic.notify_user(), None);
        assert_eq!(topic.as_str(), "conversation:28");
    }

    #[test]
    fn test_parse_notify() {
        let topic = Topic::parse("notify:1").unwrap();
        assert_eq!(topic.kind(), TopicKind::Notify(1));
        assert_eq!(topic.notify_user(), Some(1));
    }

    #[test]
    fn test_constructors_round_trip() {
        assert_eq!(Topic::conversation(42), Topic::parse("conversation:42").unwrap());
        assert_eq!(Topic::notify(7), Topic::parse("notify:7").unwrap());
    }

    #[test]
    fn test_parse_rejects_bad_topics() {
        assert_eq!(Topic::parse(""), Err(TopicError::Empty));
        assert!(matches!(
            Topic::parse("lobby"),
            Err(TopicError::UnknownNamespace(_))
        ));
        assert!(matches!(
            Topic::parse("room:12"),
            Err(TopicError::UnknownNamespace(_))
        ));
        assert!(matches!(
            Topic::parse("conversation:lobby"),
            Err(TopicError::InvalidId(_))
        ));
        assert!(matches!(
            Topic::parse("conversation:"),
            Err(TopicError::InvalidId(_))
        ));

        let long = format!("conversation:{}", "9".repeat(MAX_TOPIC_LENGTH));
        assert_eq!(Topic::parse(&long), Err(TopicError::TooLong));
    }
}
