//! Connected client sessions.
//!
//! A session is created by a successful connection handshake and is the
//! only place a client's permissions live. It also owns the channel
//! subscriptions made on the client's behalf.

use crate::channel::SubscriptionHandle;
use crate::clock::now_millis;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Public view of a connected client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Client identifier.
    pub id: String,
    /// Authenticated identity (token subject or API key name).
    pub user_id: Option<String>,
    /// When the session was established (ms since epoch).
    pub connected_at: u64,
    /// When the client last published (ms since epoch).
    pub last_message_at: Option<u64>,
    /// Channels subscribed through the broker.
    pub subscriptions: Vec<String>,
    /// Granted permission strings.
    pub permissions: Vec<String>,
    /// Remote address.
    pub ip: Option<String>,
    /// Caller-maintained metadata, e.g. `reconnectAttempts`.
    pub metadata: Map<String, Value>,
}

impl ClientInfo {
    /// Create a fresh client record.
    #[must_use]
    pub fn new(id: impl Into<String>, permissions: Vec<String>) -> Self {
        Self {
            id: id.into(),
            user_id: None,
            connected_at: now_millis(),
            last_message_at: None,
            subscriptions: Vec::new(),
            permissions,
            ip: None,
            metadata: Map::new(),
        }
    }
}

/// A session and the subscriptions it owns.
#[derive(Debug)]
pub struct Session {
    /// Client record.
    pub info: ClientInfo,
    /// Channel → subscription made for this client.
    pub handles: HashMap<String, SubscriptionHandle>,
}

impl Session {
    /// Cancel every channel subscription owned by this session.
    pub fn release(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.unsubscribe();
        }
        self.info.subscriptions.clear();
    }
}

/// Client id → session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning any session it replaced.
    pub fn register(&self, info: ClientInfo) -> Option<Session> {
        let id = info.id.clone();
        self.sessions.insert(
            id,
            Session {
                info,
                handles: HashMap::new(),
            },
        )
    }

    /// Remove a session.
    pub fn remove(&self, client_id: &str) -> Option<Session> {
        self.sessions.remove(client_id).map(|(_, session)| session)
    }

    /// Whether a session exists.
    #[must_use]
    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    /// Snapshot of one client.
    #[must_use]
    pub fn info(&self, client_id: &str) -> Option<ClientInfo> {
        self.sessions.get(client_id).map(|s| s.info.clone())
    }

    /// Snapshot of every client.
    #[must_use]
    pub fn all(&self) -> Vec<ClientInfo> {
        self.sessions.iter().map(|s| s.info.clone()).collect()
    }

    /// Permissions granted to a client.
    #[must_use]
    pub fn permissions(&self, client_id: &str) -> Option<Vec<String>> {
        self.sessions
            .get(client_id)
            .map(|s| s.info.permissions.clone())
    }

    /// Attach a channel subscription to a client.
    ///
    /// A previous subscription of the same client to the same channel is
    /// cancelled. Returns `false` (and cancels `handle`) if the client has
    /// no session.
    pub fn attach(&self, client_id: &str, handle: SubscriptionHandle) -> bool {
        let Some(mut session) = self.sessions.get_mut(client_id) else {
            handle.unsubscribe();
            return false;
        };

        let channel = handle.channel().to_string();
        if let Some(previous) = session.handles.insert(channel.clone(), handle) {
            previous.unsubscribe();
        } else {
            session.info.subscriptions.push(channel);
        }
        true
    }

    /// Detach and cancel a client's subscription to a channel.
    pub fn detach(&self, client_id: &str, channel: &str) -> bool {
        let Some(mut session) = self.sessions.get_mut(client_id) else {
            return false;
        };
        match session.handles.remove(channel) {
            Some(handle) => {
                handle.unsubscribe();
                session.info.subscriptions.retain(|c| c != channel);
                true
            }
            None => false,
        }
    }

    /// Record that the client just sent a message.
    pub fn touch(&self, client_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(client_id) {
            session.info.last_message_at = Some(now_millis());
        }
    }

    /// Set one metadata key. Returns `false` if the client has no session.
    pub fn set_metadata(&self, client_id: &str, key: &str, value: Value) -> bool {
        match self.sessions.get_mut(client_id) {
            Some(mut session) => {
                session.info.metadata.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Number of sessions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Remove and release every session.
    pub fn clear(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for id in ids {
            if let Some(mut session) = self.remove(&id) {
                session.release();
            }
        }
    }
}
