//! Broker-wide counters and snapshots.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters updated as a side effect of broker operations.
#[derive(Debug, Default)]
pub struct StatsCollector {
    messages_published: AtomicU64,
    connections_total: AtomicU64,
    rejected_total: AtomicU64,
}

impl StatsCollector {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a publish that reached at least one subscriber.
    pub fn record_publish(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an accepted connection.
    pub fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an action refused by the security gate.
    pub fn record_rejection(&self) {
        self.rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages fanned out since start.
    #[must_use]
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    /// Connections accepted since start.
    #[must_use]
    pub fn connections_total(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Actions refused since start.
    #[must_use]
    pub fn rejected_total(&self) -> u64 {
        self.rejected_total.load(Ordering::Relaxed)
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.messages_published.store(0, Ordering::Relaxed);
        self.connections_total.store(0, Ordering::Relaxed);
        self.rejected_total.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time view of the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStats {
    /// Connected clients.
    pub active_connections: usize,
    /// Live channels.
    pub channel_count: usize,
    /// Subscriptions across all channels.
    pub total_subscriptions: usize,
    /// Presence records across all channels.
    pub presence_entries: usize,
    /// Standing query subscriptions.
    pub query_subscriptions: usize,
    /// Messages fanned out since start.
    pub messages_published: u64,
    /// Connections accepted since start.
    pub connections_total: u64,
    /// Actions refused by the security gate since start.
    pub rejected_total: u64,
}
