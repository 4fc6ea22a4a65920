//! Presence tracking for Beacon.
//!
//! Presence records which clients are active in a channel and what state
//! they share. Records only change on explicit updates; stale records stay
//! until [`PresenceRegistry::prune_stale`] is called.

use crate::clock::now_millis;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Presence record for one client in one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    /// Client identifier.
    pub client_id: String,
    /// Client-supplied presence state.
    pub data: Value,
    /// First update for this channel (ms since epoch). Never changes.
    pub joined_at: u64,
    /// Most recent update (ms since epoch).
    pub last_seen_at: u64,
}

impl PresenceEntry {
    fn new(client_id: &str, data: Value) -> Self {
        let now = now_millis();
        Self {
            client_id: client_id.to_string(),
            data,
            joined_at: now,
            last_seen_at: now,
        }
    }

    /// Check if this entry has seen no update for the given duration.
    #[must_use]
    pub fn is_stale(&self, timeout: Duration) -> bool {
        let timeout = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        now_millis().saturating_sub(self.last_seen_at) > timeout
    }
}

/// Channel → client → presence record.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    channels: DashMap<String, HashMap<String, PresenceEntry>>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a client's presence in a channel.
    ///
    /// `joined_at` is kept from an existing record; `last_seen_at` is always
    /// set to now. Returns `true` if the client was not present before.
    pub fn update(&self, client_id: &str, channel: &str, data: Value) -> bool {
        let mut members = self.channels.entry(channel.to_string()).or_default();

        match members.get_mut(client_id) {
            Some(entry) => {
                entry.data = data;
                entry.last_seen_at = now_millis();
                false
            }
            None => {
                members.insert(client_id.to_string(), PresenceEntry::new(client_id, data));
                debug!(channel = %channel, client = %client_id, "Presence: member joined");
                true
            }
        }
    }

    /// All presence records for a channel, unordered.
    #[must_use]
    pub fn get(&self, channel: &str) -> Vec<PresenceEntry> {
        self.channels
            .get(channel)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove a client's presence from one channel.
    pub fn leave(&self, client_id: &str, channel: &str) -> Option<PresenceEntry> {
        let removed = self
            .channels
            .get_mut(channel)
            .and_then(|mut members| members.remove(client_id));

        if removed.is_some() {
            self.channels
                .remove_if(channel, |_, members| members.is_empty());
            debug!(channel = %channel, client = %client_id, "Presence: member left");
        }
        removed
    }

    /// Remove a client's presence from every channel.
    ///
    /// Returns the channels the client was present in.
    pub fn remove_client(&self, client_id: &str) -> Vec<String> {
        let mut left = Vec::new();
        for mut members in self.channels.iter_mut() {
            if members.remove(client_id).is_some() {
                left.push(members.key().clone());
            }
        }
        self.channels.retain(|_, members| !members.is_empty());
        left
    }

    /// Remove records with no update for `timeout`.
    ///
    /// Returns `(channel, client_id)` pairs that were removed.
    pub fn prune_stale(&self, timeout: Duration) -> Vec<(String, String)> {
        let mut pruned = Vec::new();
        for mut members in self.channels.iter_mut() {
            let channel = members.key().clone();
            members.retain(|client_id, entry| {
                let stale = entry.is_stale(timeout);
                if stale {
                    debug!(channel = %channel, client = %client_id, "Presence: pruned stale member");
                    pruned.push((channel.clone(), client_id.clone()));
                }
                !stale
            });
        }
        self.channels.retain(|_, members| !members.is_empty());
        pruned
    }

    /// Total number of presence records.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.channels.iter().map(|members| members.len()).sum()
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_preserves_joined_at() {
        let presence = PresenceRegistry::new();

        assert!(presence.update("client-a", "room:1", json!({"status": "online"})));
        let first = presence.get("room:1").remove(0);

        std::thread::sleep(Duration::from_millis(5));
        assert!(!presence.update("client-a", "room:1", json!({"status": "away"})));
        let second = presence.get("room:1").remove(0);

        assert_eq!(second.joined_at, first.joined_at);
        assert!(second.last_seen_at > first.last_seen_at);
        assert_eq!(second.data, json!({"status": "away"}));
        assert_eq!(presence.entry_count(), 1);
    }

    #[test]
    fn test_presence_is_per_channel() {
        let presence = PresenceRegistry::new();
        presence.update("client-a", "room:1", Value::Null);
        presence.update("client-a", "room:2", Value::Null);
        presence.update("client-b", "room:1", Value::Null);

        assert_eq!(presence.get("room:1").len(), 2);
        assert_eq!(presence.get("room:2").len(), 1);
        assert!(presence.get("room:3").is_empty());
    }

    #[test]
    fn test_leave_and_remove_client() {
        let presence = PresenceRegistry::new();
        presence.update("client-a", "room:1", Value::Null);
        presence.update("client-a", "room:2", Value::Null);
        presence.update("client-b", "room:2", Value::Null);

        assert!(presence.leave("client-a", "room:1").is_some());
        assert!(presence.leave("client-a", "room:1").is_none());

        let mut left = presence.remove_client("client-a");
        left.sort();
        assert_eq!(left, vec!["room:2".to_string()]);
        assert_eq!(presence.entry_count(), 1);
    }

    #[test]
    fn test_prune_stale() {
        let presence = PresenceRegistry::new();
        presence.update("client-a", "room:1", Value::Null);

        assert!(presence.prune_stale(Duration::from_secs(60)).is_empty());

        std::thread::sleep(Duration::from_millis(10));
        let pruned = presence.prune_stale(Duration::from_millis(1));
        assert_eq!(pruned, vec![("room:1".to_string(), "client-a".to_string())]);
        assert!(presence.get("room:1").is_empty());
    }

    #[test]
    fn test_huge_timeout_never_stale() {
        let presence = PresenceRegistry::new();
        presence.update("client-a", "room:1", Value::Null);
        let entry = presence.get("room:1").remove(0);

        assert!(!entry.is_stale(Duration::MAX));
        assert!(!entry.is_stale(Duration::from_secs(u64::MAX)));
        assert!(presence.prune_stale(Duration::MAX).is_empty());
    }
}
