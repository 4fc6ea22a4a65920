//! # beacon-protocol
//!
//! Client message envelope for the Beacon pub/sub and presence broker.
//!
//! The transport layer decodes these envelopes off the socket and hands
//! them to the broker; the broker's replies and fan-out deliveries travel
//! back the same way.
//!
//! ## Envelope Types
//!
//! - `subscribe` / `unsubscribe` - Channel membership
//! - `publish` / `broadcast` - Send messages to channels
//! - `presence_join` / `presence_leave` / `presence_update` - Per-channel presence
//! - `query_subscribe` / `query_unsubscribe` / `query_update` - Query change feeds
//! - `ping` / `pong` / `error` - Keepalive and failures
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{codec, Envelope};
//! use serde_json::json;
//!
//! let envelope = Envelope::publish("room:1", json!({"msg": "hi"}));
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{Envelope, EnvelopeType, QUERY_UPDATE_CHANNEL, SYSTEM_CHANNEL_PREFIX};
