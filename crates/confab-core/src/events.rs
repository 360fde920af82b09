//! Event names used on the wire.
//!
//! Client events form a closed set; anything else is rejected with a
//! validation error. Server events are pushed to topic members.

/// Client event: post a message to a conversation.
pub const CREATE: &str = "create";

/// Client event: remove a participant from a conversation.
pub const REMOVE: &str = "remove";

/// Server event: a new message was posted to the conversation.
pub const NEW_MSG: &str = "new_msg";

/// Server event: a user joined the conversation.
pub const USER_JOINED: &str = "user_joined";

/// Server event on a notify topic: the user was removed from a conversation.
pub const REMOVED: &str = "removed";
