//! Channel registry for Beacon.
//!
//! Channels are created lazily by their first subscriber and pruned as soon
//! as their last subscriber leaves. Stats live alongside the subscriber list,
//! so a pruned channel has no stats either.

use crate::clock::now_millis;
use crate::error::BrokerError;
use crate::subscriber::Subscriber;
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Identifier of a single subscription within the registry.
pub type SubscriptionId = u64;

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.contains("..") {
        return Err("Channel name cannot contain '..'");
    }
    if name.contains('/') {
        return Err("Channel name cannot contain '/'");
    }
    Ok(())
}

/// The scope of a channel: everything before the first `:`.
#[must_use]
pub fn channel_scope(name: &str) -> &str {
    name.split_once(':').map_or(name, |(scope, _)| scope)
}

/// Statistics for a live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStats {
    /// Channel name.
    pub channel: String,
    /// Current number of subscribers.
    pub subscriber_count: usize,
    /// Messages published while the channel had subscribers.
    pub message_count: u64,
    /// When the first subscriber arrived (ms since epoch).
    pub created_at: u64,
    /// When the last message was published (ms since epoch).
    pub last_message_at: Option<u64>,
}

impl ChannelStats {
    fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            subscriber_count: 0,
            message_count: 0,
            created_at: now_millis(),
            last_message_at: None,
        }
    }
}

struct ChannelEntry {
    /// Subscribers in insertion order.
    subscribers: Vec<(SubscriptionId, Arc<dyn Subscriber>)>,
    stats: ChannelStats,
}

type ChannelTable = DashMap<String, ChannelEntry>;

/// Removes one subscription, pruning the channel once it is empty.
fn remove_subscription(channels: &ChannelTable, channel: &str, id: SubscriptionId) -> bool {
    let removed = match channels.get_mut(channel) {
        Some(mut entry) => {
            let before = entry.subscribers.len();
            entry.subscribers.retain(|(sid, _)| *sid != id);
            entry.stats.subscriber_count = entry.subscribers.len();
            before != entry.subscribers.len()
        }
        None => false,
    };

    if channels
        .remove_if(channel, |_, entry| entry.subscribers.is_empty())
        .is_some()
    {
        debug!(channel = %channel, "Deleted empty channel");
    }

    removed
}

/// Handle returned by [`ChannelRegistry::subscribe`].
///
/// Dropping the handle leaves the subscription in place; call
/// [`SubscriptionHandle::unsubscribe`] to cancel it.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    channel: String,
    channels: Weak<ChannelTable>,
    active: AtomicBool,
}

impl SubscriptionHandle {
    /// Subscription identifier.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Channel this subscription belongs to.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether `unsubscribe` has not been called yet.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove this subscription.
    ///
    /// Returns `true` if the subscription was still registered. Calling it
    /// again is a no-op.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        let Some(channels) = self.channels.upgrade() else {
            return false;
        };
        let removed = remove_subscription(&channels, &self.channel, self.id);
        if removed {
            debug!(channel = %self.channel, subscription = self.id, "Unsubscribed");
        }
        removed
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Maps channel names to their subscribers and performs fan-out.
pub struct ChannelRegistry {
    channels: Arc<ChannelTable>,
    next_id: AtomicU64,
}

impl ChannelRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to a channel, creating it on first use.
    pub fn subscribe<S>(&self, channel: &str, subscriber: S) -> SubscriptionHandle
    where
        S: Subscriber + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber: Arc<dyn Subscriber> = Arc::new(subscriber);

        let mut entry = self.channels.entry(channel.to_string()).or_insert_with(|| {
            debug!(channel = %channel, "Creating new channel");
            ChannelEntry {
                subscribers: Vec::new(),
                stats: ChannelStats::new(channel),
            }
        });
        entry.subscribers.push((id, subscriber));
        entry.stats.subscriber_count = entry.subscribers.len();

        debug!(
            channel = %channel,
            subscription = id,
            subscribers = entry.stats.subscriber_count,
            "Subscribed"
        );

        SubscriptionHandle {
            id,
            channel: channel.to_string(),
            channels: Arc::downgrade(&self.channels),
            active: AtomicBool::new(true),
        }
    }

    /// Publish a message to every subscriber of a channel.
    ///
    /// Subscribers are invoked in insertion order and all deliveries are
    /// awaited together. Returns the number of subscribers the message was
    /// fanned out to; a channel without subscribers yields `0` and its stats
    /// are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Delivery`] if any subscriber rejected the
    /// message. Every subscriber is still attempted.
    pub async fn publish(&self, channel: &str, data: Value) -> Result<usize, BrokerError> {
        let subscribers = {
            let Some(mut entry) = self.channels.get_mut(channel) else {
                trace!(channel = %channel, "Publish to channel without subscribers");
                return Ok(0);
            };
            if entry.subscribers.is_empty() {
                return Ok(0);
            }
            entry.stats.subscriber_count = entry.subscribers.len();
            entry.stats.message_count += 1;
            entry.stats.last_message_at = Some(now_millis());
            let subscribers: Vec<Arc<dyn Subscriber>> =
                entry.subscribers.iter().map(|(_, s)| Arc::clone(s)).collect();
            subscribers
        };

        let total = subscribers.len();
        let data = Arc::new(data);
        let results = join_all(subscribers.iter().map(|s| s.deliver(channel, &data))).await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(channel = %channel, failed, total, "Subscriber delivery failed");
            return Err(BrokerError::Delivery {
                channel: channel.to_string(),
                failed,
                total,
            });
        }

        trace!(channel = %channel, recipients = total, "Published message");
        Ok(total)
    }

    /// Stats for one channel, or for every live channel when `channel` is `None`.
    #[must_use]
    pub fn stats(&self, channel: Option<&str>) -> Vec<ChannelStats> {
        match channel {
            Some(name) => self
                .channels
                .get(name)
                .map(|e| vec![e.stats.clone()])
                .unwrap_or_default(),
            None => self.channels.iter().map(|e| e.stats.clone()).collect(),
        }
    }

    /// Check if a channel exists.
    #[must_use]
    pub fn channel_exists(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Get the subscriber count for a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    /// Number of live channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of subscriptions across all channels.
    #[must_use]
    pub fn total_subscriptions(&self) -> usize {
        self.channels.iter().map(|e| e.subscribers.len()).sum()
    }

    /// Drop every channel and subscription.
    pub fn clear(&self) {
        self.channels.clear();
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
