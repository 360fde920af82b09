//! # confab-core
//!
//! Channel subsystem for the confab realtime chat layer.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Topic** - parsed `conversation:<id>` / `notify:<user>` names
//! - **AuthGate** - token verification in front of the upgrade
//! - **ChannelRegistry** - topic membership, join policy, broadcast fan-out
//! - **Channel** - per-topic membership state machine and dispatch lock
//! - **MessageRouter** - the closed client event set applied over the store
//! - **PresenceTracker** - removal notifications and deferred forced leaves
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐    ┌───────────────┐    ┌─────────────────┐    ┌─────────┐
//! │ Socket │───▶│ MessageRouter │───▶│ ChannelRegistry │───▶│ Channel │
//! └────────┘    └───────┬───────┘    └─────────────────┘    └─────────┘
//!                       │
//!            ┌──────────┴──────────┐
//!            ▼                     ▼
//!     ┌───────────┐       ┌─────────────────┐
//!     │   Store   │       │ PresenceTracker │
//!     └───────────┘       └─────────────────┘
//! ```
//!
//! Events for one topic apply in a single serial order; different topics
//! run in parallel. Broadcasts read the membership once, under one lock,
//! and exclude at most the sender.

pub mod auth;
pub mod channel;
pub mod events;
pub mod policy;
pub mod presence;
pub mod registry;
pub mod router;
pub mod socket;
pub mod store;
pub mod topic;

pub use auth::{AuthError, AuthGate, AuthService, JwtAuth};
pub use channel::{Assigns, Channel, Member, MemberState};
pub use policy::{JoinGrant, JoinPolicy, StorePolicy};
pub use presence::{PresenceConfig, PresenceEvent, PresenceEventKind, PresenceTracker};
pub use registry::{ChannelRegistry, JoinAck, JoinError, RegistryConfig, RegistryStats};
pub use router::{ClientEvent, CreateBody, MessageRouter, ValidationError};
pub use socket::{ConnectionId, Socket, SocketIdentity};
pub use store::{MemoryStore, Message, MessageId, PersistenceError, Store};
pub use topic::{ConversationId, Topic, TopicError, TopicKind, UserId};
