//! # beacon-core
//!
//! The realtime pub/sub and presence broker behind Beacon.
//!
//! This crate provides:
//!
//! - **ChannelRegistry** - Named channels with ordered subscriber fan-out
//! - **PresenceRegistry** - Per-channel, per-client presence records
//! - **QueryRegistry** - Standing query subscriptions fed by an external executor
//! - **SecurityGate** - Token and API-key auth, permissions, rate limits, payload hygiene
//! - **Broker** - The façade that composes all of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────────┐
//! │  Transport  │────▶│    Broker    │────▶│ ChannelRegistry │──▶ Subscribers
//! └─────────────┘     └──────────────┘     └─────────────────┘
//!                       │    │     │                ▲
//!                       ▼    │     ▼                │
//!            ┌──────────────┐│ ┌──────────────┐     │
//!            │ SecurityGate ││ │ QueryRegistry│─────┘ (query_update)
//!            └──────────────┘│ └──────────────┘
//!                            ▼
//!                   ┌──────────────────┐
//!                   │ PresenceRegistry │
//!                   └──────────────────┘
//! ```
//!
//! Every registry is sharded behind a `DashMap`, so each documented
//! operation is atomic with respect to the others. No lock is held while
//! subscriber deliveries are awaited.

pub mod broker;
pub mod channel;
mod clock;
pub mod config;
pub mod error;
pub mod presence;
pub mod query;
pub mod security;
pub mod session;
pub mod stats;
pub mod subscriber;

pub use broker::{Broker, ConnectionRequest, RECONNECT_ATTEMPTS_KEY};
pub use channel::{ChannelRegistry, ChannelStats, SubscriptionHandle};
pub use config::{BrokerConfig, RateLimitConfig, SecurityConfig};
pub use error::{AuthError, BrokerError};
pub use presence::{PresenceEntry, PresenceRegistry};
pub use query::{QueryRegistry, QuerySubscription};
pub use security::{ApiKeyConfig, AuthClaims, JwtVerifier, Operation, SecurityGate, TokenVerifier};
pub use session::{ClientInfo, SessionRegistry};
pub use stats::{BrokerStats, StatsCollector};
pub use subscriber::{Delivery, DeliveryError, FnSubscriber, NoopSubscriber, Subscriber};
