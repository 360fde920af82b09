//! # confab-protocol
//!
//! Wire protocol definitions for the Confab realtime chat layer.
//!
//! This crate defines the binary protocol used between Confab clients and
//! servers: one multiplexed connection carries length-prefixed MessagePack
//! frames addressed to topics, with `ref`-correlated request/reply pairs.
//!
//! ## Frame Types
//!
//! - `Join` / `Leave` - Topic membership requests
//! - `Event` - Client-pushed domain events (`create`, `remove`)
//! - `Reply` - Correlated `ok`/`error` answer to a request
//! - `Push` - Server-broadcast events (`new_msg`, `removed`, ...)
//! - `Error` / `Close` - Out-of-band notices and channel shutdown
//!
//! ## Example
//!
//! ```rust
//! use confab_protocol::{Frame, codec};
//! use serde_json::json;
//!
//! // Join a conversation topic, then push a message to it
//! let join = Frame::join("conversation:42", json!({}), 1);
//! let create = Frame::event("conversation:42", "create", json!({"content": "hi", "type": "text"}), 2);
//!
//! // Encode and decode
//! let encoded = codec::encode(&join).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(join, decoded);
//! # let _ = create;
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{error_reasons, Frame, ReplyStatus};
pub use version::{Version, PROTOCOL_VERSION};
