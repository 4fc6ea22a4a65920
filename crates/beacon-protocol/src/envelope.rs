//! Envelope types for the Beacon protocol.
//!
//! An envelope is the unit exchanged between a client and the broker. Every
//! envelope carries a type tag and a millisecond timestamp; the channel, the
//! JSON payload and the originating client id are optional.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Channel name that carries query-change notifications.
pub const QUERY_UPDATE_CHANNEL: &str = "query_update";

/// Prefix of channels that require the `admin` permission.
pub const SYSTEM_CHANNEL_PREFIX: &str = "system:";

/// Envelope type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Subscribe,
    Unsubscribe,
    Publish,
    Broadcast,
    PresenceJoin,
    PresenceLeave,
    PresenceUpdate,
    QuerySubscribe,
    QueryUnsubscribe,
    QueryUpdate,
    Ping,
    Pong,
    Error,
}

impl EnvelopeType {
    /// Wire name of the type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::Subscribe => "subscribe",
            EnvelopeType::Unsubscribe => "unsubscribe",
            EnvelopeType::Publish => "publish",
            EnvelopeType::Broadcast => "broadcast",
            EnvelopeType::PresenceJoin => "presence_join",
            EnvelopeType::PresenceLeave => "presence_leave",
            EnvelopeType::PresenceUpdate => "presence_update",
            EnvelopeType::QuerySubscribe => "query_subscribe",
            EnvelopeType::QueryUnsubscribe => "query_unsubscribe",
            EnvelopeType::QueryUpdate => "query_update",
            EnvelopeType::Ping => "ping",
            EnvelopeType::Pong => "pong",
            EnvelopeType::Error => "error",
        }
    }

    /// Whether only the broker may emit this type.
    ///
    /// `pong` travels both ways: a client sends one to answer a broker `ping`.
    #[must_use]
    pub fn is_server_originated(&self) -> bool {
        matches!(
            self,
            EnvelopeType::Broadcast | EnvelopeType::QueryUpdate | EnvelopeType::Error
        )
    }
}

impl std::fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Envelope type.
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    /// Target or source channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// JSON payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: u64,
    /// Originating client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl Envelope {
    /// Create an empty envelope of the given type, stamped with the current time.
    #[must_use]
    pub fn new(kind: EnvelopeType) -> Self {
        Self {
            kind,
            channel: None,
            data: None,
            timestamp: now_millis(),
            client_id: None,
        }
    }

    /// Set the channel.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Set the originating client.
    #[must_use]
    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Create a new Subscribe envelope.
    #[must_use]
    pub fn subscribe(channel: impl Into<String>) -> Self {
        Self::new(EnvelopeType::Subscribe).with_channel(channel)
    }

    /// Create a new Unsubscribe envelope.
    #[must_use]
    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Self::new(EnvelopeType::Unsubscribe).with_channel(channel)
    }

    /// Create a new Publish envelope.
    #[must_use]
    pub fn publish(channel: impl Into<String>, data: Value) -> Self {
        Self::new(EnvelopeType::Publish)
            .with_channel(channel)
            .with_data(data)
    }

    /// Create a Broadcast envelope carrying a fan-out delivery.
    #[must_use]
    pub fn broadcast(channel: impl Into<String>, data: Value) -> Self {
        Self::new(EnvelopeType::Broadcast)
            .with_channel(channel)
            .with_data(data)
    }

    /// Create a QueryUpdate envelope.
    #[must_use]
    pub fn query_update(data: Value) -> Self {
        Self::new(EnvelopeType::QueryUpdate)
            .with_channel(QUERY_UPDATE_CHANNEL)
            .with_data(data)
    }

    /// Create a new Ping envelope.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(EnvelopeType::Ping)
    }

    /// Create a new Pong envelope.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(EnvelopeType::Pong)
    }

    /// Create an Error envelope.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EnvelopeType::Error).with_data(Value::String(message.into()))
    }

    /// Borrow the channel, if present.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }
}
