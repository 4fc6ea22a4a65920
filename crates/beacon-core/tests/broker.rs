//! End-to-end broker behaviour through the public API.

use async_trait::async_trait;
use beacon_core::{
    ApiKeyConfig, AuthClaims, AuthError, Broker, BrokerConfig, BrokerError, ConnectionRequest,
    Delivery, DeliveryError, FnSubscriber, NoopSubscriber, RateLimitConfig, TokenVerifier,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

const SECRET: &str = "integration-secret";

fn jwt(sub: &str, permissions: &[&str], ttl_secs: i64) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let claims = AuthClaims {
        sub: sub.to_string(),
        exp: (now + ttl_secs) as usize,
        permissions: permissions.iter().map(|p| p.to_string()).collect(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn secured_broker() -> Broker {
    Broker::new(BrokerConfig {
        require_auth: true,
        jwt_secret: Some(SECRET.to_string()),
        ..BrokerConfig::default()
    })
}

async fn connect(broker: &Broker, id: &str, permissions: &[&str]) {
    broker
        .handle_connection(ConnectionRequest::new(id).with_token(jwt(id, permissions, 3600)))
        .await
        .unwrap();
}

#[tokio::test]
async fn publish_without_subscribers_reaches_nobody() {
    let broker = Broker::default();

    assert_eq!(broker.publish("room:empty", json!("hello")).await.unwrap(), 0);
    assert!(broker.get_channel_stats(Some("room:empty")).is_empty());
    assert_eq!(broker.stats().messages_published, 0);
}

#[tokio::test]
async fn subscribers_receive_in_subscription_order() {
    let broker = Broker::default();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = ["first", "second", "third"]
        .into_iter()
        .map(|name| {
            let seen = seen.clone();
            broker.subscribe(
                "room:order",
                FnSubscriber::new(move |_: &str, _: &Value| {
                    seen.lock().unwrap().push(name);
                    Ok(())
                }),
            )
        })
        .collect();

    assert_eq!(broker.publish("room:order", json!(1)).await.unwrap(), 3);
    assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);

    let stats = broker.get_channel_stats(Some("room:order")).remove(0);
    assert_eq!(stats.subscriber_count, 3);
    assert_eq!(stats.message_count, 1);
    assert!(stats.last_message_at.is_some());

    for handle in &handles {
        assert!(handle.unsubscribe());
        assert!(!handle.unsubscribe());
    }
    assert!(broker.get_channel_stats(Some("room:order")).is_empty());
}

#[tokio::test]
async fn failing_subscriber_does_not_block_others() {
    let broker = Broker::default();
    let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();

    let _bad = broker.subscribe(
        "room:mixed",
        FnSubscriber::new(|_: &str, _: &Value| Err(DeliveryError("closed".into()))),
    );
    let _good = broker.subscribe("room:mixed", tx);

    let err = broker.publish("room:mixed", json!("x")).await.unwrap_err();
    assert!(matches!(err, BrokerError::Delivery { failed: 1, total: 2, .. }));
    assert_eq!(*rx.recv().await.unwrap().data, json!("x"));
}

#[tokio::test]
async fn presence_rejoin_keeps_joined_at() {
    let broker = Broker::default();

    assert!(broker.update_presence("client-a", "room:1", json!({"status": "online"})));
    let first = broker.get_presence("room:1").remove(0);

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    assert!(!broker.update_presence("client-a", "room:1", json!({"status": "away"})));
    let second = broker.get_presence("room:1").remove(0);

    assert_eq!(second.joined_at, first.joined_at);
    assert!(second.last_seen_at >= first.last_seen_at);
    assert_eq!(second.data, json!({"status": "away"}));

    assert!(broker.leave_presence("client-a", "room:1").is_some());
    assert!(broker.get_presence("room:1").is_empty());
}

#[tokio::test]
async fn query_updates_reach_only_live_subscriptions() {
    let broker = Broker::default();
    let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
    let _handle = broker.subscribe("query_update", tx);

    let id = broker.subscribe_to_query("client-a", "SELECT * FROM todos", Some(json!({"done": false})));
    assert!(id.starts_with("qsub_"));
    assert_eq!(broker.query_owner(&id).as_deref(), Some("client-a"));

    let rows = json!([{"id": 1}]);
    assert_eq!(
        broker
            .notify_query_update("SELECT * FROM todos", rows.clone())
            .await
            .unwrap(),
        1
    );
    let delivery = rx.recv().await.unwrap();
    assert_eq!(delivery.data["subscriptionId"], json!(id));
    assert_eq!(delivery.data["result"], rows);

    assert!(broker.unsubscribe_from_query(&id));
    assert!(!broker.unsubscribe_from_query(&id));
    assert_eq!(
        broker
            .notify_query_update("SELECT * FROM todos", json!([]))
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn publish_rate_limit_closes_window() {
    let broker = Broker::new(BrokerConfig {
        rate_limit: Some(RateLimitConfig {
            window_ms: 60_000,
            max_connections: 100,
            max_messages_per_minute: 3,
        }),
        ..BrokerConfig::default()
    });

    let results: Vec<bool> = (0..4)
        .map(|_| broker.enforce_rate_limit("client-a", "publish"))
        .collect();
    assert_eq!(results, vec![true, true, true, false]);
    assert!(broker.enforce_rate_limit("client-a", "subscribe"));
    assert!(broker.enforce_rate_limit("client-b", "publish"));
}

#[tokio::test]
async fn rate_limit_disabled_without_config() {
    let broker = Broker::default();
    assert!((0..1000).all(|_| broker.enforce_rate_limit("client-a", "publish")));
}

#[tokio::test]
async fn sanitize_strips_handlers_and_scripts() {
    let broker = Broker::default();
    let cleaned = broker.sanitize_data(json!({
        "onClick": "x",
        "name": "<script>evil()</script>ok",
    }));
    assert_eq!(cleaned, json!({"name": "ok"}));

    assert!(broker.validate_message(&json!({"text": "javascript:alert(1)"})).is_err());
    assert!(broker.validate_message(&json!({"text": "plain"})).is_ok());
}

#[tokio::test]
async fn read_grant_does_not_allow_publish() {
    let broker = secured_broker();
    connect(&broker, "reader", &["read:public"]).await;

    broker.subscribe_client("reader", "public:news").unwrap();
    assert_eq!(broker.get_client_info(Some("reader"))[0].subscriptions, vec!["public:news"]);

    let err = broker
        .publish_from_client("reader", "public:news", json!("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Permission(_)));
    assert!(matches!(
        broker.subscribe_client("reader", "private:x"),
        Err(BrokerError::Permission(_))
    ));
}

#[tokio::test]
async fn authorized_publish_is_delivered() {
    let broker = secured_broker();
    connect(&broker, "writer", &["write:room"]).await;
    connect(&broker, "listener", &["read:room"]).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
    broker.subscribe_client_with("listener", "room:1", tx).unwrap();

    let payload = json!({"text": "hello"});
    let sent = broker
        .publish_from_client("writer", "room:1", payload.clone())
        .await
        .unwrap();
    assert_eq!(sent, payload);

    let delivery = rx.recv().await.unwrap();
    assert_eq!(delivery.channel, "room:1");
    assert_eq!(*delivery.data, payload);
    assert_eq!(broker.get_channel_stats(Some("room:1"))[0].message_count, 1);

    assert!(broker.unsubscribe_client("listener", "room:1"));
    assert!(broker.get_channel_stats(Some("room:1")).is_empty());
}

#[tokio::test]
async fn expired_and_invalid_tokens_are_distinct() {
    let broker = secured_broker();

    let expired = broker.authenticate(&jwt("user-1", &[], -3600)).await.unwrap_err();
    assert_eq!(expired, AuthError::Expired);

    let invalid = broker.authenticate("not-a-jwt").await.unwrap_err();
    assert!(matches!(invalid, AuthError::InvalidToken(_)));

    let claims = broker.authenticate(&jwt("user-1", &["room"], 60)).await.unwrap();
    assert_eq!(claims.sub, "user-1");
    assert_eq!(claims.permissions, vec!["room"]);
}

#[tokio::test]
async fn authenticate_without_secret_is_not_configured() {
    let broker = Broker::default();
    assert_eq!(
        broker.authenticate("anything").await.unwrap_err(),
        AuthError::NotConfigured
    );
}

#[tokio::test]
async fn api_key_connection() {
    let broker = secured_broker();
    broker.add_api_key("sk-live", ApiKeyConfig::new("ingest", vec!["write:metrics".into()]));

    let info = broker
        .handle_connection(ConnectionRequest::new("svc").with_api_key("sk-live"))
        .await
        .unwrap();
    assert_eq!(info.user_id.as_deref(), Some("ingest"));

    let err = broker
        .handle_connection(ConnectionRequest::new("svc-2").with_api_key("sk-wrong"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Auth(AuthError::InvalidApiKey)));
}

struct StaticVerifier(HashMap<String, AuthClaims>);

#[async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<AuthClaims, AuthError> {
        self.0
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::InvalidToken("unknown token".into()))
    }
}

#[tokio::test]
async fn custom_verifier_is_used() {
    let claims = AuthClaims {
        sub: "ops".into(),
        exp: usize::MAX,
        permissions: vec!["admin".into()],
    };
    let verifier = StaticVerifier(HashMap::from([("opaque-1".to_string(), claims)]));
    let broker = Broker::with_verifier(
        BrokerConfig {
            require_auth: true,
            ..BrokerConfig::default()
        },
        Arc::new(verifier),
    );

    broker
        .handle_connection(ConnectionRequest::new("ops-1").with_token("opaque-1"))
        .await
        .unwrap();
    broker.subscribe_client("ops-1", "system:alerts").unwrap();
}

#[tokio::test]
async fn reconnect_replaces_session() {
    let broker = secured_broker();
    connect(&broker, "client-a", &["room"]).await;
    broker.subscribe_client("client-a", "room:1").unwrap();

    connect(&broker, "client-a", &["room"]).await;

    assert_eq!(broker.get_active_connections(), 1);
    assert!(broker.get_client_info(Some("client-a"))[0].subscriptions.is_empty());
    assert!(broker.get_channel_stats(Some("room:1")).is_empty());
}

#[tokio::test]
async fn disconnect_releases_everything() {
    let broker = Broker::new(BrokerConfig {
        security: beacon_core::SecurityConfig {
            allowed_origins: Vec::new(),
            max_connections_per_ip: Some(1),
        },
        ..BrokerConfig::default()
    });

    broker
        .handle_connection(ConnectionRequest::new("a").with_ip("192.0.2.1"))
        .await
        .unwrap();
    let _raw = broker.subscribe("room:1", NoopSubscriber);
    broker.update_presence("a", "room:1", json!({}));
    broker.subscribe_to_query("a", "q", None);

    assert!(matches!(
        broker
            .handle_connection(ConnectionRequest::new("b").with_ip("192.0.2.1"))
            .await,
        Err(BrokerError::RateLimit(_))
    ));

    assert!(broker.disconnect("a"));
    let stats = broker.stats();
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.presence_entries, 0);
    assert_eq!(stats.query_subscriptions, 0);
    assert_eq!(stats.channel_count, 1);
    assert_eq!(stats.connections_total, 1);

    broker
        .handle_connection(ConnectionRequest::new("b").with_ip("192.0.2.1"))
        .await
        .unwrap();
}
