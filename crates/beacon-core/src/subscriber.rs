//! Subscriber abstraction for channel fan-out.
//!
//! A subscriber is anything that can accept a delivery for a channel. The
//! broker awaits every delivery of a publish before the publish completes,
//! so a bounded queue applies backpressure to publishers.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// A failed delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DeliveryError(pub String);

/// A message delivered to a queue-backed subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Channel the message was published on.
    pub channel: String,
    /// Message payload, shared between all subscribers of one publish.
    pub data: Arc<Value>,
}

/// Receives messages published to a channel.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Deliver one published message.
    async fn deliver(&self, channel: &str, data: &Arc<Value>) -> Result<(), DeliveryError>;
}

/// Subscriber that discards every message.
///
/// Used for registration-only subscriptions where delivery to the client's
/// socket is handled by the transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSubscriber;

#[async_trait]
impl Subscriber for NoopSubscriber {
    async fn deliver(&self, _channel: &str, _data: &Arc<Value>) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// Adapts a synchronous closure into a subscriber.
pub struct FnSubscriber<F>(F);

impl<F> FnSubscriber<F>
where
    F: Fn(&str, &Value) -> Result<(), DeliveryError> + Send + Sync,
{
    /// Wrap a closure.
    #[must_use]
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn(&str, &Value) -> Result<(), DeliveryError> + Send + Sync,
{
    async fn deliver(&self, channel: &str, data: &Arc<Value>) -> Result<(), DeliveryError> {
        (self.0)(channel, data)
    }
}

#[async_trait]
impl Subscriber for mpsc::UnboundedSender<Delivery> {
    async fn deliver(&self, channel: &str, data: &Arc<Value>) -> Result<(), DeliveryError> {
        self.send(Delivery {
            channel: channel.to_string(),
            data: Arc::clone(data),
        })
        .map_err(|_| DeliveryError("receiver dropped".to_string()))
    }
}

#[async_trait]
impl Subscriber for mpsc::Sender<Delivery> {
    async fn deliver(&self, channel: &str, data: &Arc<Value>) -> Result<(), DeliveryError> {
        self.send(Delivery {
            channel: channel.to_string(),
            data: Arc::clone(data),
        })
        .await
        .map_err(|_| DeliveryError("receiver dropped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unbounded_sender_delivers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let data = Arc::new(json!({"n": 1}));

        tx.deliver("room:1", &data).await.unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.channel, "room:1");
        assert_eq!(*delivery.data, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_closed_queue_fails_delivery() {
        let (tx, rx) = mpsc::channel::<Delivery>(1);
        drop(rx);

        let result = tx.deliver("room:1", &Arc::new(Value::Null)).await;
        assert_eq!(result, Err(DeliveryError("receiver dropped".to_string())));
    }

    #[tokio::test]
    async fn test_fn_subscriber() {
        let subscriber = FnSubscriber::new(|channel: &str, data: &Value| {
            if data.is_null() {
                Err(DeliveryError(format!("empty message on {channel}")))
            } else {
                Ok(())
            }
        });

        assert!(subscriber.deliver("a", &Arc::new(json!(1))).await.is_ok());
        assert!(subscriber.deliver("a", &Arc::new(Value::Null)).await.is_err());
    }
}
