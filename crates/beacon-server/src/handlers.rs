//! Connection handlers for the Beacon server.
//!
//! The WebSocket endpoint admits a connection through the broker's security
//! gate, then runs one task per connection that multiplexes inbound
//! envelopes, channel deliveries and keepalive pings.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use beacon_core::security::is_admin;
use beacon_core::{Broker, BrokerError, ClientInfo, ConnectionRequest, Delivery, SubscriptionHandle};
use beacon_protocol::{codec, Envelope, EnvelopeType, ProtocolError, QUERY_UPDATE_CHANNEL};
use bytes::BytesMut;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MIN_TICK: Duration = Duration::from_secs(1);

/// Shared server state.
pub struct AppState {
    /// The broker.
    pub broker: Broker,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            broker: Broker::new(config.broker.clone()),
            config,
        }
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/queries/notify", post(notify_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to bind or serve.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    state.broker.start();
    if config.presence.sweep {
        spawn_presence_sweep(state.clone());
    }

    let app = router(state.clone());
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Beacon server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    state.broker.stop();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn spawn_presence_sweep(state: Arc<AppState>) {
    let period = state.broker.config().presence_timeout().max(MIN_TICK);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !state.broker.is_running() {
                break;
            }
            let evicted = state.broker.sweep_stale_presence();
            if !evicted.is_empty() {
                metrics::record_presence_evicted(evicted.len());
            }
        }
    });
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "running": state.broker.is_running(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Aggregate broker statistics.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.broker.stats())
}

/// Body of `POST /queries/notify`.
#[derive(Debug, Deserialize)]
struct NotifyRequest {
    query: String,
    #[serde(default)]
    result: Value,
}

/// Entry point for the external query executor.
async fn notify_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<NotifyRequest>,
) -> Response {
    if let Err(status) = authorize_admin(&state.broker, &headers).await {
        return status.into_response();
    }

    match state
        .broker
        .notify_query_update(&request.query, request.result)
        .await
    {
        Ok(notified) => Json(json!({ "notified": notified })).into_response(),
        Err(e) => {
            warn!(query = %request.query, error = %e, "Query notification failed");
            (status_for(&e), Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn authorize_admin(broker: &Broker, headers: &HeaderMap) -> Result<(), StatusCode> {
    if !broker.config().require_auth {
        return Ok(());
    }
    let token = bearer_token(headers).ok_or(StatusCode::UNAUTHORIZED)?;
    let claims = broker
        .authenticate(&token)
        .await
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    if is_admin(&claims.permissions) {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

/// Credentials accepted on the WebSocket URL.
#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    token: Option<String>,
    api_key: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !state.broker.config().security.is_origin_allowed(origin) {
        warn!(origin = origin.unwrap_or("-"), remote = %remote, "Rejected disallowed origin");
        metrics::record_rejection("origin");
        return StatusCode::FORBIDDEN.into_response();
    }

    let request = connection_request(params, &headers, remote);
    let info = match state.broker.handle_connection(request).await {
        Ok(info) => info,
        Err(e) => {
            metrics::record_rejection(e.kind());
            return (status_for(&e), e.to_string()).into_response();
        }
    };

    let client_id = info.id.clone();
    let on_failure = state.clone();
    ws.on_failed_upgrade(move |e| {
        warn!(client = %client_id, error = %e, "WebSocket upgrade failed");
        on_failure.broker.disconnect(&client_id);
    })
    .on_upgrade(move |socket| handle_websocket(socket, state, info))
}

fn connection_request(
    params: ConnectParams,
    headers: &HeaderMap,
    remote: SocketAddr,
) -> ConnectionRequest {
    let mut request = ConnectionRequest::new(format!("client_{}", Uuid::new_v4().simple()))
        .with_ip(remote.ip().to_string());
    if let Some(token) = params.token.or_else(|| bearer_token(headers)) {
        request = request.with_token(token);
    }
    if let Some(key) = params.api_key {
        request = request.with_api_key(key);
    }
    request
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

fn status_for(err: &BrokerError) -> StatusCode {
    match err {
        BrokerError::Auth(_) => StatusCode::UNAUTHORIZED,
        BrokerError::Permission(_) => StatusCode::FORBIDDEN,
        BrokerError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
        BrokerError::Validation(_) | BrokerError::UnknownClient(_) => StatusCode::BAD_REQUEST,
        BrokerError::Delivery { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Wire format of a connection, following the last inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wire {
    /// JSON text frames.
    Json,
    /// Length-prefixed MessagePack binary frames.
    MessagePack,
}

/// Per-connection dispatch state.
struct Connection {
    client_id: String,
    deliveries: mpsc::UnboundedSender<Delivery>,
    queries: HashSet<String>,
    query_feed: Option<SubscriptionHandle>,
}

impl Connection {
    fn new(client_id: String, deliveries: mpsc::UnboundedSender<Delivery>) -> Self {
        Self {
            client_id,
            deliveries,
            queries: HashSet::new(),
            query_feed: None,
        }
    }

    /// Turn a channel delivery into the envelope sent to the client.
    ///
    /// Query updates are only forwarded for this connection's own
    /// subscriptions.
    fn outbound(&self, delivery: Delivery) -> Option<Envelope> {
        if delivery.channel == QUERY_UPDATE_CHANNEL {
            let owned = delivery
                .data
                .get("subscriptionId")
                .and_then(Value::as_str)
                .is_some_and(|id| self.queries.contains(id));
            if !owned {
                return None;
            }
        }

        let data = Arc::try_unwrap(delivery.data).unwrap_or_else(|shared| (*shared).clone());
        Some(if delivery.channel == QUERY_UPDATE_CHANNEL {
            Envelope::query_update(data)
        } else {
            Envelope::broadcast(delivery.channel, data)
        })
    }

    fn close(&mut self, broker: &Broker) {
        if let Some(feed) = self.query_feed.take() {
            feed.unsubscribe();
        }
        broker.disconnect(&self.client_id);
    }
}

/// Handle an admitted WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, info: ClientInfo) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    debug!(client = %info.id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
    let mut conn = Connection::new(info.id, tx);
    let mut wire = Wire::Json;
    let mut read_buffer = BytesMut::with_capacity(4096);

    let period = state.broker.config().ping_interval().max(MIN_TICK);
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            Some(delivery) = rx.recv() => {
                let Some(envelope) = conn.outbound(delivery) else {
                    continue;
                };
                if send_envelope(&mut sender, &envelope, wire).await.is_err() {
                    break;
                }
            }

            _ = ping.tick() => {
                if send_envelope(&mut sender, &Envelope::ping(), wire).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                let decoded = match msg {
                    Some(Ok(Message::Text(text))) => {
                        wire = Wire::Json;
                        metrics::record_message(text.len(), "inbound");
                        vec![codec::decode_json(&text)]
                    }
                    Some(Ok(Message::Binary(data))) => {
                        wire = Wire::MessagePack;
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);
                        drain_frames(&mut read_buffer)
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) => {
                        debug!(client = %conn.client_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(client = %conn.client_id, error = %e, "WebSocket error");
                        metrics::record_rejection("websocket");
                        break;
                    }
                    None => {
                        debug!(client = %conn.client_id, "WebSocket stream ended");
                        break;
                    }
                };

                let mut closed = false;
                for envelope in decoded {
                    let reply = match envelope {
                        Ok(envelope) => dispatch(&state.broker, &mut conn, envelope).await,
                        Err(e) => Some(Envelope::error(format!("malformed envelope: {e}"))),
                    };
                    if let Some(reply) = reply {
                        if send_envelope(&mut sender, &reply, wire).await.is_err() {
                            closed = true;
                            break;
                        }
                    }
                }
                if closed {
                    break;
                }
            }
        }
    }

    conn.close(&state.broker);
    metrics::set_active_channels(state.broker.stats().channel_count);

    debug!(client = %conn.client_id, "WebSocket disconnected");
}

/// Decode every complete MessagePack frame in `buf`.
///
/// A malformed frame discards the rest of the buffer.
fn drain_frames(buf: &mut BytesMut) -> Vec<Result<Envelope, ProtocolError>> {
    let mut frames = Vec::new();
    loop {
        match codec::decode_from(buf) {
            Ok(Some(envelope)) => frames.push(Ok(envelope)),
            Ok(None) => break,
            Err(e) => {
                buf.clear();
                frames.push(Err(e));
                break;
            }
        }
    }
    frames
}

/// Handle an envelope, turning a broker error into an `error` envelope.
async fn dispatch(broker: &Broker, conn: &mut Connection, envelope: Envelope) -> Option<Envelope> {
    let kind = envelope.kind;
    let channel = envelope.channel.clone();

    match handle_envelope(broker, conn, envelope).await {
        Ok(reply) => reply,
        Err(e) => {
            metrics::record_rejection(e.kind());
            debug!(client = %conn.client_id, kind = %kind, error = %e, "Envelope rejected");
            let mut reply = Envelope::error(e.to_string());
            reply.channel = channel;
            Some(reply)
        }
    }
}

async fn handle_envelope(
    broker: &Broker,
    conn: &mut Connection,
    envelope: Envelope,
) -> Result<Option<Envelope>, BrokerError> {
    let Envelope {
        kind, channel, data, ..
    } = envelope;
    if kind.is_server_originated() {
        return Err(BrokerError::Validation(format!(
            "{kind} envelopes are server-originated"
        )));
    }
    let data = data.unwrap_or_default();

    match kind {
        EnvelopeType::Subscribe => {
            let channel = require_channel(kind, &channel)?;
            broker.subscribe_client_with(&conn.client_id, channel, conn.deliveries.clone())?;
            metrics::record_subscription();
            metrics::set_active_channels(broker.stats().channel_count);
            Ok(None)
        }

        EnvelopeType::Unsubscribe => {
            let channel = require_channel(kind, &channel)?;
            broker.unsubscribe_client(&conn.client_id, channel);
            Ok(None)
        }

        EnvelopeType::Publish => {
            let channel = require_channel(kind, &channel)?;
            broker
                .publish_from_client(&conn.client_id, channel, data)
                .await?;
            Ok(None)
        }

        EnvelopeType::PresenceJoin | EnvelopeType::PresenceUpdate => {
            let channel = require_channel(kind, &channel)?;
            if !broker.check_channel_permission(&conn.client_id, channel)? {
                return Err(BrokerError::Permission(format!("no grant for {channel}")));
            }
            broker.update_presence(&conn.client_id, channel, data);
            Ok(Some(presence_snapshot(broker, channel)))
        }

        EnvelopeType::PresenceLeave => {
            let channel = require_channel(kind, &channel)?;
            broker.leave_presence(&conn.client_id, channel);
            Ok(Some(presence_snapshot(broker, channel)))
        }

        EnvelopeType::QuerySubscribe => {
            let query = data
                .get("query")
                .and_then(Value::as_str)
                .ok_or_else(|| BrokerError::Validation("query_subscribe requires data.query".into()))?;
            let id = broker.subscribe_to_query(&conn.client_id, query, data.get("params").cloned());
            conn.queries.insert(id.clone());
            if conn.query_feed.is_none() {
                conn.query_feed = Some(broker.subscribe(QUERY_UPDATE_CHANNEL, conn.deliveries.clone()));
            }
            Ok(Some(
                Envelope::new(EnvelopeType::QuerySubscribe)
                    .with_data(json!({ "subscriptionId": id })),
            ))
        }

        EnvelopeType::QueryUnsubscribe => {
            let id = data
                .get("subscriptionId")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    BrokerError::Validation("query_unsubscribe requires data.subscriptionId".into())
                })?;
            if !conn.queries.remove(id) {
                return Err(BrokerError::Validation(format!("unknown query subscription {id}")));
            }
            broker.unsubscribe_from_query(id);
            Ok(None)
        }

        EnvelopeType::Ping => Ok(Some(Envelope::pong())),

        // Pong answers a server keepalive.
        _ => Ok(None),
    }
}

fn require_channel(kind: EnvelopeType, channel: &Option<String>) -> Result<&str, BrokerError> {
    channel
        .as_deref()
        .ok_or_else(|| BrokerError::Validation(format!("{kind} requires a channel")))
}

fn presence_snapshot(broker: &Broker, channel: &str) -> Envelope {
    let entries = broker.get_presence(channel);
    Envelope::new(EnvelopeType::PresenceUpdate)
        .with_channel(channel)
        .with_data(json!(entries))
}

/// Send an envelope in the connection's wire format.
async fn send_envelope(
    sender: &mut SplitSink<WebSocket, Message>,
    envelope: &Envelope,
    wire: Wire,
) -> Result<()> {
    let message = match wire {
        Wire::Json => Message::Text(codec::encode_json(envelope)?),
        Wire::MessagePack => Message::Binary(codec::encode(envelope)?.to_vec()),
    };
    let len = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    metrics::record_message(len, "outbound");
    sender.send(message).await?;
    Ok(())
}
