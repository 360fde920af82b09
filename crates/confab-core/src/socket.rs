//! Authenticated client sockets.
//!
//! A [`Socket`] is one authenticated connection: the resolved user id, a
//! unique connection id, and the outbound frame queue the connection task
//! drains into the transport. Sockets are cheap to clone and shared between
//! the registry, channels, and the presence tracker.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use confab_protocol::Frame;

use crate::topic::UserId;

/// Counter to keep generated ids unique within one timestamp tick.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{timestamp:x}_{counter:x}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The identity minted by authentication, before the transport is bound.
///
/// The upgrade handler turns this into a full [`Socket`] once the
/// connection's outbound queue exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketIdentity {
    /// The authenticated user.
    pub user_id: UserId,
    /// Fresh id for this connection.
    pub connection_id: ConnectionId,
}

impl SocketIdentity {
    /// Mint an identity for an authenticated user.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            connection_id: ConnectionId::generate(),
        }
    }
}

struct SocketShared {
    user_id: UserId,
    connection_id: ConnectionId,
    outbound: mpsc::UnboundedSender<Frame>,
}

/// One authenticated client connection.
#[derive(Clone)]
pub struct Socket {
    shared: Arc<SocketShared>,
}

impl Socket {
    /// Bind an authenticated identity to a connection's outbound queue.
    #[must_use]
    pub fn new(identity: SocketIdentity, outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            shared: Arc::new(SocketShared {
                user_id: identity.user_id,
                connection_id: identity.connection_id,
                outbound,
            }),
        }
    }

    /// The authenticated user id.
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.shared.user_id
    }

    /// The unique connection id.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.shared.connection_id
    }

    /// Queue a frame for delivery to this connection.
    ///
    /// Returns `false` if the connection has gone away; the disconnect
    /// cleanup path owns removing stale memberships, so failure here is
    /// not an error.
    pub fn send(&self, frame: Frame) -> bool {
        self.shared.outbound.send(frame).is_ok()
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("user_id", &self.shared.user_id)
            .field("connection_id", &self.shared.connection_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_socket_send() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let socket = Socket::new(SocketIdentity::new(7), tx);

        assert_eq!(socket.user_id(), 7);
        assert!(socket.send(Frame::push("conversation:1", "new_msg", json!({}))));

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.kind(), "push");
    }

    #[test]
    fn test_socket_send_after_disconnect() {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = Socket::new(SocketIdentity::new(7), tx);
        drop(rx);

        assert!(!socket.send(Frame::close("conversation:1")));
    }
}
