//! Per-topic channel state.
//!
//! A channel owns the live membership of one topic: which sockets are
//! joined, their session-scoped assigns, and the per-member lifecycle
//! state machine. It also carries the topic's dispatch lock, which
//! serializes event handling so all events on one topic are totally
//! ordered while different topics run in parallel.
//!
//! Broadcast fan-out takes the membership map's lock for the whole
//! delivery loop: the recipient set is one consistent snapshot, so a
//! concurrently joining socket never sees the in-flight event and a
//! concurrently leaving one is never skipped.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tracing::{debug, trace};

use confab_protocol::Frame;

use crate::events;
use crate::socket::{ConnectionId, Socket};
use crate::topic::{Topic, UserId};

/// Lifecycle of one socket's membership in one topic.
///
/// `Joining` covers the authorization check; a failure there moves straight
/// to `Terminated` without the member ever being visible to broadcasts.
/// `Terminated` is final; rejoining builds a fresh membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    /// Join requested, authorization in flight.
    Joining,
    /// Full member; receives broadcasts and may push events.
    Joined,
    /// Leave in progress (explicit, disconnect, or forced).
    Leaving,
    /// Membership is gone.
    Terminated,
}

/// Session-scoped state attached to one membership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assigns {
    /// Users whose messages this member does not want to see.
    pub blocked: HashSet<UserId>,
}

/// One socket's membership of a channel.
#[derive(Debug)]
pub struct Member {
    socket: Socket,
    assigns: Assigns,
    state: MemberState,
}

impl Member {
    /// Start a membership in the `Joining` state.
    #[must_use]
    pub fn joining(socket: Socket) -> Self {
        Self {
            socket,
            assigns: Assigns::default(),
            state: MemberState::Joining,
        }
    }

    /// Authorization passed: move to `Joined` with the granted assigns.
    ///
    /// Returns `false` if the member was not `Joining`.
    pub fn promote(&mut self, assigns: Assigns) -> bool {
        if self.state != MemberState::Joining {
            return false;
        }
        self.assigns = assigns;
        self.state = MemberState::Joined;
        true
    }

    /// Begin leaving. Legal from `Joining` (failed authorization) and
    /// `Joined`; returns `false` otherwise.
    pub fn begin_leave(&mut self) -> bool {
        match self.state {
            MemberState::Joining | MemberState::Joined => {
                self.state = MemberState::Leaving;
                true
            }
            MemberState::Leaving | MemberState::Terminated => false,
        }
    }

    /// Final transition. Discards assigns.
    pub fn terminate(&mut self) {
        self.assigns = Assigns::default();
        self.state = MemberState::Terminated;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> MemberState {
        self.state
    }

    /// The member's socket.
    #[must_use]
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// The member's session assigns.
    #[must_use]
    pub fn assigns(&self) -> &Assigns {
        &self.assigns
    }

    /// Per-recipient outbound filter.
    ///
    /// Pure and side-effect free: decides whether (and in what form) a
    /// broadcast payload reaches this member. Chat messages from a sender
    /// this member has blocked are suppressed; everything else passes
    /// unchanged.
    #[must_use]
    pub fn filter_outbound(&self, event: &str, payload: &Value) -> Option<Value> {
        if event == events::NEW_MSG {
            let sender = payload
                .get("message")
                .and_then(|m| m.get("sender_id"))
                .and_then(Value::as_u64);
            if let Some(sender) = sender {
                if self.assigns.blocked.contains(&sender) {
                    return None;
                }
            }
        }
        Some(payload.clone())
    }
}

/// Live state for one topic.
#[derive(Debug)]
pub struct Channel {
    topic: Topic,
    members: Mutex<HashMap<ConnectionId, Member>>,
    dispatch: tokio::sync::Mutex<()>,
}

impl Channel {
    /// Create an empty channel for a topic.
    #[must_use]
    pub fn new(topic: Topic) -> Self {
        Self {
            topic,
            members: Mutex::new(HashMap::new()),
            dispatch: tokio::sync::Mutex::new(()),
        }
    }

    /// The channel's topic.
    #[must_use]
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Hold the returned guard across event handling to keep all events on
    /// this topic totally ordered. Store calls run under it; only this
    /// topic waits on them.
    pub async fn dispatch_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.dispatch.lock().await
    }

    /// The membership lock is never held across an await and no code under
    /// it panics, so poisoning cannot leave the map inconsistent.
    fn lock_members(&self) -> MutexGuard<'_, HashMap<ConnectionId, Member>> {
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a joined member.
    ///
    /// Returns `false` if the connection is already a member or the member
    /// has not reached `Joined`.
    pub fn insert_member(&self, member: Member) -> bool {
        if member.state() != MemberState::Joined {
            return false;
        }
        let mut members = self.lock_members();
        let conn = member.socket.connection_id().clone();
        if members.contains_key(&conn) {
            return false;
        }
        debug!(topic = %self.topic, conn = %conn, "Member joined");
        members.insert(conn, member);
        true
    }

    /// Remove a membership, walking it through `Leaving` to `Terminated`.
    ///
    /// Idempotent: removing a non-member returns `None`. The removed
    /// member's socket is returned so callers can notify it.
    pub fn remove_member(&self, connection_id: &ConnectionId) -> Option<Socket> {
        let mut members = self.lock_members();
        let mut member = members.remove(connection_id)?;
        member.begin_leave();
        member.terminate();
        debug!(topic = %self.topic, conn = %connection_id, "Member left");
        Some(member.socket)
    }

    /// Whether a connection is currently a joined member.
    #[must_use]
    pub fn is_member(&self, connection_id: &ConnectionId) -> bool {
        self.lock_members()
            .get(connection_id)
            .is_some_and(|m| m.state() == MemberState::Joined)
    }

    /// Number of current members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.lock_members().len()
    }

    /// Whether the channel has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.member_count() == 0
    }

    /// Connections through which a user is currently joined.
    #[must_use]
    pub fn user_connections(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.lock_members()
            .values()
            .filter(|m| m.socket.user_id() == user_id && m.state() == MemberState::Joined)
            .map(|m| m.socket.connection_id().clone())
            .collect()
    }

    /// Deliver an event to every joined member except `exclude`.
    ///
    /// The membership lock is held for the whole loop, so the recipient set
    /// is a single snapshot. Each recipient's outbound filter runs before
    /// delivery. Returns the number of members the event was queued for.
    pub fn fan_out(
        &self,
        event: &str,
        payload: &Value,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        let members = self.lock_members();
        let mut delivered = 0;

        for (conn, member) in members.iter() {
            if member.state() != MemberState::Joined {
                continue;
            }
            if exclude.is_some_and(|ex| ex == conn) {
                continue;
            }
            let Some(filtered) = member.filter_outbound(event, payload) else {
                trace!(topic = %self.topic, conn = %conn, event, "Outbound filter suppressed event");
                continue;
            };
            if member
                .socket
                .send(Frame::push(self.topic.as_str(), event, filtered))
            {
                delivered += 1;
            }
        }

        trace!(topic = %self.topic, event, recipients = delivered, "Fanned out event");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SocketIdentity;
    use confab_protocol::Frame;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn test_socket(user_id: UserId) -> (Socket, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Socket::new(SocketIdentity::new(user_id), tx), rx)
    }

    fn joined_member(socket: Socket) -> Member {
        let mut member = Member::joining(socket);
        assert!(member.promote(Assigns::default()));
        member
    }

    #[test]
    fn test_member_state_machine() {
        let (socket, _rx) = test_socket(1);
        let mut member = Member::joining(socket);
        assert_eq!(member.state(), MemberState::Joining);

        assert!(member.promote(Assigns::default()));
        assert_eq!(member.state(), MemberState::Joined);

        // Promoting twice is illegal
        assert!(!member.promote(Assigns::default()));

        assert!(member.begin_leave());
        assert_eq!(member.state(), MemberState::Leaving);
        assert!(!member.begin_leave());

        member.terminate();
        assert_eq!(member.state(), MemberState::Terminated);
    }

    #[test]
    fn test_failed_authorization_never_reaches_joined() {
        let (socket, _rx) = test_socket(1);
        let mut member = Member::joining(socket);

        // Authorization failed: straight to Terminated
        member.terminate();
        assert_eq!(member.state(), MemberState::Terminated);
        assert!(!member.promote(Assigns::default()));
    }

    #[test]
    fn test_insert_and_remove_member() {
        let channel = Channel::new(Topic::conversation(1));
        let (socket, _rx) = test_socket(1);
        let conn = socket.connection_id().clone();

        assert!(channel.insert_member(joined_member(socket.clone())));
        assert!(channel.is_member(&conn));
        assert_eq!(channel.member_count(), 1);

        // A socket appears at most once
        assert!(!channel.insert_member(joined_member(socket)));
        assert_eq!(channel.member_count(), 1);

        assert!(channel.remove_member(&conn).is_some());
        assert!(channel.is_empty());

        // Removing a non-member is a no-op
        assert!(channel.remove_member(&conn).is_none());
    }

    #[test]
    fn test_insert_rejects_unjoined_member() {
        let channel = Channel::new(Topic::conversation(1));
        let (socket, _rx) = test_socket(1);
        assert!(!channel.insert_member(Member::joining(socket)));
        assert!(channel.is_empty());
    }

    #[test]
    fn test_fan_out_excludes_sender() {
        let channel = Channel::new(Topic::conversation(1));
        let (sender, mut sender_rx) = test_socket(1);
        let (other, mut other_rx) = test_socket(2);
        let sender_conn = sender.connection_id().clone();

        channel.insert_member(joined_member(sender));
        channel.insert_member(joined_member(other));

        let payload = json!({"message": {"id": 1, "sender_id": 1, "content": "hi"}});
        let delivered = channel.fan_out(events::NEW_MSG, &payload, Some(&sender_conn));
        assert_eq!(delivered, 1);

        assert!(sender_rx.try_recv().is_err());
        let frame = other_rx.try_recv().unwrap();
        match frame {
            Frame::Push { topic, event, .. } => {
                assert_eq!(topic, "conversation:1");
                assert_eq!(event, events::NEW_MSG);
            }
            other => panic!("expected push, got {other:?}"),
        }
    }

    #[test]
    fn test_outbound_filter_suppresses_blocked_sender() {
        let channel = Channel::new(Topic::conversation(1));
        let (sender, _sender_rx) = test_socket(1);
        let (blocker, mut blocker_rx) = test_socket(2);
        let sender_conn = sender.connection_id().clone();

        channel.insert_member(joined_member(sender));

        let mut member = Member::joining(blocker);
        member.promote(Assigns {
            blocked: HashSet::from([1]),
        });
        channel.insert_member(member);

        let payload = json!({"message": {"id": 5, "sender_id": 1, "content": "hi"}});
        let delivered = channel.fan_out(events::NEW_MSG, &payload, Some(&sender_conn));
        assert_eq!(delivered, 0);
        assert!(blocker_rx.try_recv().is_err());

        // System events are not filtered
        let delivered = channel.fan_out(
            events::USER_JOINED,
            &json!({"user_id": 1}),
            Some(&sender_conn),
        );
        assert_eq!(delivered, 1);
        assert!(blocker_rx.try_recv().is_ok());
    }

    #[test]
    fn test_user_connections() {
        let channel = Channel::new(Topic::conversation(1));
        let (first, _rx1) = test_socket(7);
        let (second, _rx2) = test_socket(7);
        let (other, _rx3) = test_socket(8);

        channel.insert_member(joined_member(first.clone()));
        channel.insert_member(joined_member(second));
        channel.insert_member(joined_member(other));

        let conns = channel.user_connections(7);
        assert_eq!(conns.len(), 2);
        assert!(conns.contains(first.connection_id()));
        assert_eq!(channel.user_connections(9).len(), 0);
    }
}
