//! The broker façade.
//!
//! [`Broker`] owns every registry and the security gate. It is constructed
//! explicitly and shared by reference (typically behind an `Arc`) with
//! whatever runs the transport loop.

use crate::channel::{validate_channel_name, ChannelRegistry, ChannelStats, SubscriptionHandle};
use crate::config::BrokerConfig;
use crate::error::{AuthError, BrokerError};
use crate::presence::{PresenceEntry, PresenceRegistry};
use crate::query::QueryRegistry;
use crate::security::{
    allows, is_admin, is_reserved_channel, sanitize_data, validate_message, ApiKeyConfig,
    AuthClaims, Operation, SecurityGate, TokenVerifier,
};
use crate::session::{ClientInfo, SessionRegistry};
use crate::stats::{BrokerStats, StatsCollector};
use crate::subscriber::{NoopSubscriber, Subscriber};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Metadata key holding the caller-maintained reconnect counter.
pub const RECONNECT_ATTEMPTS_KEY: &str = "reconnectAttempts";

const BASE_BACKOFF_MS: u64 = 1_000;
const MAX_BACKOFF_MS: u64 = 30_000;

/// A decoded connection attempt handed over by the transport.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRequest {
    /// Identifier the transport assigned to the connection.
    pub client_id: String,
    /// Bearer token, if presented.
    pub token: Option<String>,
    /// API key, if presented.
    pub api_key: Option<String>,
    /// Remote address.
    pub ip: Option<String>,
    /// Initial client metadata.
    pub metadata: Map<String, Value>,
}

impl ConnectionRequest {
    /// Create a request without credentials.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    /// Attach a bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Attach an API key.
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Attach the remote address.
    #[must_use]
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Attach one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

struct Identity {
    user_id: Option<String>,
    permissions: Vec<String>,
}

/// Realtime pub/sub and presence broker.
pub struct Broker {
    config: BrokerConfig,
    gate: SecurityGate,
    channels: ChannelRegistry,
    presence: PresenceRegistry,
    queries: QueryRegistry,
    sessions: SessionRegistry,
    counters: StatsCollector,
    running: AtomicBool,
}

impl Broker {
    /// Create a broker from configuration.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        info!("Creating broker with config: {:?}", redacted(&config));
        Self {
            gate: SecurityGate::new(&config),
            config,
            channels: ChannelRegistry::new(),
            presence: PresenceRegistry::new(),
            queries: QueryRegistry::new(),
            sessions: SessionRegistry::new(),
            counters: StatsCollector::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Create a broker that verifies bearer tokens with `verifier`.
    #[must_use]
    pub fn with_verifier(config: BrokerConfig, verifier: Arc<dyn TokenVerifier>) -> Self {
        let mut broker = Self::new(config);
        broker.gate = broker.gate.with_verifier(verifier);
        broker
    }

    /// Broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    // ---- lifecycle ----

    /// Mark the broker as running. Idempotent.
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::AcqRel) {
            info!("Broker started");
        }
    }

    /// Drop every subscription, presence record, query subscription,
    /// channel stat, session and counter. Idempotent.
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        self.sessions.clear();
        self.channels.clear();
        self.presence.clear();
        self.queries.clear();
        self.gate.reset();
        self.counters.reset();
        if was_running {
            info!("Broker stopped");
        }
    }

    /// Whether [`Broker::start`] was called more recently than [`Broker::stop`].
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // ---- channels ----

    /// Publish to a channel without any security checks.
    ///
    /// Returns the number of subscribers reached; `0` for a channel nobody
    /// is subscribed to.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Delivery`] if a subscriber rejected the message.
    pub async fn publish(&self, channel: &str, data: Value) -> Result<usize, BrokerError> {
        let count = self.channels.publish(channel, data).await?;
        if count > 0 {
            self.counters.record_publish();
        }
        Ok(count)
    }

    /// Subscribe to a channel without any security checks.
    pub fn subscribe<S>(&self, channel: &str, subscriber: S) -> SubscriptionHandle
    where
        S: Subscriber + 'static,
    {
        self.channels.subscribe(channel, subscriber)
    }

    // ---- presence ----

    /// Insert or refresh a client's presence in a channel.
    ///
    /// Returns `true` if the client was not present before.
    pub fn update_presence(&self, client_id: &str, channel: &str, data: Value) -> bool {
        self.presence.update(client_id, channel, data)
    }

    /// Remove a client's presence from a channel.
    pub fn leave_presence(&self, client_id: &str, channel: &str) -> Option<PresenceEntry> {
        self.presence.leave(client_id, channel)
    }

    /// Presence records for a channel.
    #[must_use]
    pub fn get_presence(&self, channel: &str) -> Vec<PresenceEntry> {
        self.presence.get(channel)
    }

    /// Evict presence records older than the configured presence timeout.
    ///
    /// The broker never calls this on its own.
    pub fn sweep_stale_presence(&self) -> Vec<(String, String)> {
        let pruned = self.presence.prune_stale(self.config.presence_timeout());
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "Swept stale presence");
        }
        pruned
    }

    // ---- query subscriptions ----

    /// Register a standing query subscription.
    pub fn subscribe_to_query(&self, client_id: &str, query: &str, params: Option<Value>) -> String {
        self.queries.subscribe(client_id, query, params)
    }

    /// Remove a query subscription. Unknown ids are a no-op.
    pub fn unsubscribe_from_query(&self, subscription_id: &str) -> bool {
        self.queries.unsubscribe(subscription_id).is_some()
    }

    /// Fan out a fresh result to every subscription of `query`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Delivery`] if a `query_update` subscriber failed.
    pub async fn notify_query_update(&self, query: &str, result: Value) -> Result<usize, BrokerError> {
        let matched = self.queries.notify(&self.channels, query, result).await?;
        if matched > 0 {
            self.counters.record_publish();
        }
        Ok(matched)
    }

    /// Owner of a query subscription.
    #[must_use]
    pub fn query_owner(&self, subscription_id: &str) -> Option<String> {
        self.queries.get(subscription_id).map(|s| s.client_id)
    }

    // ---- stats ----

    /// Stats for one channel, or every live channel.
    #[must_use]
    pub fn get_channel_stats(&self, channel: Option<&str>) -> Vec<ChannelStats> {
        self.channels.stats(channel)
    }

    /// One client's session, or every session.
    #[must_use]
    pub fn get_client_info(&self, client_id: Option<&str>) -> Vec<ClientInfo> {
        match client_id {
            Some(id) => self.sessions.info(id).into_iter().collect(),
            None => self.sessions.all(),
        }
    }

    /// Number of connected clients.
    #[must_use]
    pub fn get_active_connections(&self) -> usize {
        self.sessions.count()
    }

    /// Aggregate broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            active_connections: self.sessions.count(),
            channel_count: self.channels.channel_count(),
            total_subscriptions: self.channels.total_subscriptions(),
            presence_entries: self.presence.entry_count(),
            query_subscriptions: self.queries.count(),
            messages_published: self.counters.messages_published(),
            connections_total: self.counters.connections_total(),
            rejected_total: self.counters.rejected_total(),
        }
    }

    // ---- security gate ----

    /// Register an API key.
    pub fn add_api_key(&self, key: impl Into<String>, config: ApiKeyConfig) {
        self.gate.add_api_key(key, config);
    }

    /// Verify a bearer token.
    ///
    /// # Errors
    ///
    /// See [`SecurityGate::authenticate`].
    pub async fn authenticate(&self, token: &str) -> Result<AuthClaims, AuthError> {
        self.gate.authenticate(token).await
    }

    /// Admit a connection and register its session.
    ///
    /// A bearer token is tried first, then an API key. When `require_auth`
    /// is set, missing or rejected credentials refuse the connection;
    /// otherwise the client is admitted with no permissions.
    ///
    /// A reconnect under a live client id replaces the old session only
    /// after the new one has passed the per-IP cap.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::Auth`] for missing or rejected credentials
    /// - [`BrokerError::RateLimit`] when the per-IP connection cap is reached
    pub async fn handle_connection(
        &self,
        request: ConnectionRequest,
    ) -> Result<ClientInfo, BrokerError> {
        let client_id = request.client_id.clone();
        let identity = match self.resolve_identity(&request).await {
            Ok(identity) => identity,
            Err(e) => return Err(self.reject(&client_id, e)),
        };

        let previous = self.sessions.info(&client_id);
        let reuses_slot = matches!(
            (previous.as_ref().and_then(|p| p.ip.as_deref()), request.ip.as_deref()),
            (Some(old), Some(new)) if old == new
        );

        if !reuses_slot {
            if let Some(ip) = request.ip.as_deref() {
                if !self.gate.acquire_connection(ip) {
                    let err = BrokerError::RateLimit(format!("too many connections from {ip}"));
                    return Err(self.reject(&client_id, err));
                }
            }
        }

        if previous.is_some() {
            debug!(client = %client_id, "Replacing existing session");
            self.teardown(&client_id, !reuses_slot);
        }

        let mut info = ClientInfo::new(client_id.clone(), identity.permissions);
        info.user_id = identity.user_id;
        info.ip = request.ip;
        info.metadata = request.metadata;

        if let Some(mut previous) = self.sessions.register(info.clone()) {
            previous.release();
        }
        self.counters.record_connection();
        info!(
            client = %client_id,
            user = info.user_id.as_deref().unwrap_or("-"),
            "Client connected"
        );
        Ok(info)
    }

    async fn resolve_identity(&self, request: &ConnectionRequest) -> Result<Identity, BrokerError> {
        let mut token_error = None;

        if let Some(token) = request.token.as_deref() {
            match self.gate.authenticate(token).await {
                Ok(claims) => {
                    return Ok(Identity {
                        user_id: Some(claims.sub),
                        permissions: claims.permissions,
                    })
                }
                Err(e) => {
                    debug!(client = %request.client_id, error = %e, "Bearer token rejected");
                    token_error = Some(e);
                }
            }
        }

        if let Some(key) = request.api_key.as_deref() {
            match self.gate.authenticate_api_key(key) {
                Ok(api_key) => {
                    return Ok(Identity {
                        user_id: Some(api_key.name),
                        permissions: api_key.permissions,
                    })
                }
                Err(e) if self.config.require_auth => return Err(e.into()),
                Err(e) => {
                    debug!(client = %request.client_id, error = %e, "API key rejected");
                }
            }
        }

        if self.config.require_auth {
            return Err(token_error.unwrap_or(AuthError::Required).into());
        }
        Ok(Identity {
            user_id: None,
            permissions: Vec::new(),
        })
    }

    /// Tear down a client's session, subscriptions, presence and queries.
    ///
    /// Returns `false` if the client had no session.
    pub fn disconnect(&self, client_id: &str) -> bool {
        self.teardown(client_id, true)
    }

    fn teardown(&self, client_id: &str, release_slot: bool) -> bool {
        let Some(mut session) = self.sessions.remove(client_id) else {
            return false;
        };

        session.release();
        if release_slot {
            if let Some(ip) = session.info.ip.as_deref() {
                self.gate.release_connection(ip);
            }
        }
        let left = self.presence.remove_client(client_id);
        let queries = self.queries.remove_client(client_id);
        self.gate.forget_client(client_id);

        info!(
            client = %client_id,
            presence = left.len(),
            queries,
            "Client disconnected"
        );
        true
    }

    /// Whether a client holds any grant on a channel.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Validation`] for a malformed channel name.
    pub fn check_channel_permission(
        &self,
        client_id: &str,
        channel: &str,
    ) -> Result<bool, BrokerError> {
        validate_channel(channel)?;
        Ok(self
            .sessions
            .permissions(client_id)
            .is_some_and(|p| allows(&p, channel, None)))
    }

    /// Count one operation against the client's rate-limit window.
    pub fn enforce_rate_limit(&self, client_id: &str, operation: &str) -> bool {
        self.gate.enforce_rate_limit(client_id, operation)
    }

    /// See [`validate_message`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Validation`] for oversized or blocked payloads.
    pub fn validate_message(&self, payload: &Value) -> Result<(), BrokerError> {
        validate_message(payload)
    }

    /// See [`sanitize_data`].
    #[must_use]
    pub fn sanitize_data(&self, payload: Value) -> Value {
        sanitize_data(payload)
    }

    /// Subscribe a client to a channel after permission checks.
    ///
    /// The subscription only registers interest; delivery to the client's
    /// socket is left to the transport. See [`Broker::subscribe_client_with`].
    ///
    /// # Errors
    ///
    /// See [`Broker::subscribe_client_with`].
    pub fn subscribe_client(&self, client_id: &str, channel: &str) -> Result<(), BrokerError> {
        self.subscribe_client_with(client_id, channel, NoopSubscriber)
    }

    /// Subscribe a client to a channel with its own subscriber.
    ///
    /// The subscription is owned by the client's session and cancelled on
    /// disconnect.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::Validation`] for a malformed channel name
    /// - [`BrokerError::UnknownClient`] without a session
    /// - [`BrokerError::Permission`] without `admin` on a `system:` channel,
    ///   or without a read grant on the channel's scope
    pub fn subscribe_client_with<S>(
        &self,
        client_id: &str,
        channel: &str,
        subscriber: S,
    ) -> Result<(), BrokerError>
    where
        S: Subscriber + 'static,
    {
        self.authorize(client_id, channel, Operation::Read)
            .map_err(|e| self.reject(client_id, e))?;

        let handle = self.channels.subscribe(channel, subscriber);
        if !self.sessions.attach(client_id, handle) {
            return Err(BrokerError::UnknownClient(client_id.to_string()));
        }
        debug!(client = %client_id, channel = %channel, "Client subscribed");
        Ok(())
    }

    /// Cancel a client's subscription to a channel.
    pub fn unsubscribe_client(&self, client_id: &str, channel: &str) -> bool {
        self.sessions.detach(client_id, channel)
    }

    /// Publish on behalf of a client.
    ///
    /// Checks run in order: rate limit, payload validation, session,
    /// write permission. The payload is then sanitized, published, and
    /// returned in its sanitized form.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::RateLimit`] when the publish window is used up
    /// - [`BrokerError::Validation`] for a rejected payload or channel name
    /// - [`BrokerError::UnknownClient`] without a session
    /// - [`BrokerError::Permission`] without a write grant
    /// - [`BrokerError::Delivery`] if a subscriber rejected the message
    pub async fn publish_from_client(
        &self,
        client_id: &str,
        channel: &str,
        data: Value,
    ) -> Result<Value, BrokerError> {
        if !self.gate.enforce_rate_limit(client_id, "publish") {
            let err = BrokerError::RateLimit(format!("publish limit reached for {client_id}"));
            return Err(self.reject(client_id, err));
        }
        validate_message(&data).map_err(|e| self.reject(client_id, e))?;
        self.authorize(client_id, channel, Operation::Write)
            .map_err(|e| self.reject(client_id, e))?;

        let sanitized = sanitize_data(data);
        self.sessions.touch(client_id);
        let count = self.publish(channel, sanitized.clone()).await?;
        debug!(client = %client_id, channel = %channel, recipients = count, "Client published");
        Ok(sanitized)
    }

    fn authorize(
        &self,
        client_id: &str,
        channel: &str,
        operation: Operation,
    ) -> Result<(), BrokerError> {
        validate_channel(channel)?;
        let permissions = self
            .sessions
            .permissions(client_id)
            .ok_or_else(|| BrokerError::UnknownClient(client_id.to_string()))?;

        if is_reserved_channel(channel) && !is_admin(&permissions) {
            return Err(BrokerError::Permission(format!(
                "{channel} requires admin"
            )));
        }
        if !allows(&permissions, channel, Some(operation)) {
            return Err(BrokerError::Permission(format!(
                "no {} grant for {channel}",
                operation.as_str()
            )));
        }
        Ok(())
    }

    fn reject(&self, client_id: &str, err: BrokerError) -> BrokerError {
        self.counters.record_rejection();
        warn!(client = %client_id, kind = err.kind(), error = %err, "Rejected client action");
        err
    }

    // ---- client metadata ----

    /// Set one metadata entry on a client's session.
    pub fn set_client_metadata(&self, client_id: &str, key: &str, value: Value) -> bool {
        self.sessions.set_metadata(client_id, key, value)
    }

    /// Reconnect delay for a client: `min(1000ms * 2^attempts, 30s)`.
    ///
    /// `attempts` is read from the session's `reconnectAttempts` metadata,
    /// which the caller maintains; a missing value counts as zero.
    #[must_use]
    pub fn get_backoff_time(&self, client_id: &str) -> Duration {
        let attempts = self
            .sessions
            .info(client_id)
            .and_then(|info| info.metadata.get(RECONNECT_ATTEMPTS_KEY).and_then(Value::as_u64))
            .unwrap_or(0);

        let ms = u32::try_from(attempts)
            .ok()
            .and_then(|a| 2u64.checked_pow(a))
            .and_then(|factor| factor.checked_mul(BASE_BACKOFF_MS))
            .map_or(MAX_BACKOFF_MS, |ms| ms.min(MAX_BACKOFF_MS));
        Duration::from_millis(ms)
    }
}

fn validate_channel(channel: &str) -> Result<(), BrokerError> {
    validate_channel_name(channel).map_err(|e| BrokerError::Validation(e.to_string()))
}

fn redacted(config: &BrokerConfig) -> BrokerConfig {
    let mut config = config.clone();
    if config.jwt_secret.is_some() {
        config.jwt_secret = Some("<redacted>".to_string());
    }
    config
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
