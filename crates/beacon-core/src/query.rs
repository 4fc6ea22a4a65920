//! Standing query subscriptions.
//!
//! The broker does not run queries. An external executor reports fresh
//! results through [`QueryRegistry::notify`], which fans them out on the
//! shared `query_update` channel. Consumers filter by `subscriptionId`.
//!
//! Matching is an exact comparison of the query text; queries that differ
//! only in whitespace or case are distinct.

use crate::channel::ChannelRegistry;
use crate::clock::now_millis;
use crate::error::BrokerError;
use beacon_protocol::QUERY_UPDATE_CHANNEL;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, trace};
use uuid::Uuid;

/// A client's standing interest in a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySubscription {
    /// Subscription identifier.
    pub id: String,
    /// Query text, matched verbatim.
    pub query: String,
    /// Query parameters as supplied by the client.
    pub params: Option<Value>,
    /// Owning client.
    pub client_id: String,
    /// Most recent result delivered for this subscription.
    pub last_result: Option<Value>,
    /// When the subscription was created (ms since epoch).
    pub created_at: u64,
}

/// Subscription id → query subscription.
#[derive(Debug, Default)]
pub struct QueryRegistry {
    subscriptions: DashMap<String, QuerySubscription>,
}

impl QueryRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a query subscription and return its id.
    ///
    /// Identical queries from different clients get separate subscriptions.
    pub fn subscribe(&self, client_id: &str, query: &str, params: Option<Value>) -> String {
        let id = format!("qsub_{}", Uuid::new_v4().simple());
        self.subscriptions.insert(
            id.clone(),
            QuerySubscription {
                id: id.clone(),
                query: query.to_string(),
                params,
                client_id: client_id.to_string(),
                last_result: None,
                created_at: now_millis(),
            },
        );
        debug!(client = %client_id, subscription = %id, "Query subscription added");
        id
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, subscription_id: &str) -> Option<QuerySubscription> {
        let removed = self.subscriptions.remove(subscription_id).map(|(_, s)| s);
        if removed.is_some() {
            debug!(subscription = %subscription_id, "Query subscription removed");
        }
        removed
    }

    /// Look up a subscription.
    #[must_use]
    pub fn get(&self, subscription_id: &str) -> Option<QuerySubscription> {
        self.subscriptions.get(subscription_id).map(|s| s.clone())
    }

    /// Ids of subscriptions whose query text equals `query`.
    #[must_use]
    pub fn matching(&self, query: &str) -> Vec<String> {
        self.subscriptions
            .iter()
            .filter(|s| s.query == query)
            .map(|s| s.key().clone())
            .collect()
    }

    /// Publish a new result to every subscription of `query`.
    ///
    /// Each match is published as `{subscriptionId, query, result}` on the
    /// `query_update` channel. Returns the number of matching subscriptions.
    ///
    /// # Errors
    ///
    /// Returns the first delivery failure after every match was published.
    pub async fn notify(
        &self,
        channels: &ChannelRegistry,
        query: &str,
        result: Value,
    ) -> Result<usize, BrokerError> {
        let matches = self.matching(query);
        let mut first_error = None;

        for id in &matches {
            if let Some(mut subscription) = self.subscriptions.get_mut(id) {
                subscription.last_result = Some(result.clone());
            }

            let update = json!({
                "subscriptionId": id,
                "query": query,
                "result": result,
            });
            if let Err(e) = channels.publish(QUERY_UPDATE_CHANNEL, update).await {
                first_error.get_or_insert(e);
            }
        }

        trace!(matches = matches.len(), "Query update fanned out");
        match first_error {
            Some(e) => Err(e),
            None => Ok(matches.len()),
        }
    }

    /// Remove every subscription owned by a client. Returns how many were removed.
    pub fn remove_client(&self, client_id: &str) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|_, s| s.client_id != client_id);
        before.saturating_sub(self.subscriptions.len())
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.subscriptions.clear();
    }
}
