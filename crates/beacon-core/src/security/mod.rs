//! The security gate applied at the publish/subscribe boundary.
//!
//! The gate verifies identity (bearer token or API key), evaluates channel
//! permissions, enforces rate limits and cleans payloads. It holds no
//! session state; the broker passes it the permissions it needs.

pub mod auth;
pub mod permissions;
pub mod rate_limit;
pub mod sanitize;

pub use auth::{ApiKeyConfig, AuthClaims, JwtVerifier, TokenVerifier};
pub use permissions::{
    allows, is_admin, is_reserved_channel, is_system_channel, Operation, ADMIN_PERMISSION,
};
pub use rate_limit::{RateLimitWindow, RateLimiter};
pub use sanitize::{sanitize_data, validate_message, MAX_MESSAGE_SIZE};

use crate::config::BrokerConfig;
use crate::error::AuthError;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Identity, permission, rate and payload checks.
pub struct SecurityGate {
    verifier: Option<Arc<dyn TokenVerifier>>,
    api_keys: DashMap<String, ApiKeyConfig>,
    limiter: RateLimiter,
}

impl SecurityGate {
    /// Build a gate from broker configuration.
    ///
    /// A JWT verifier is installed when `jwt_secret` is set.
    #[must_use]
    pub fn new(config: &BrokerConfig) -> Self {
        let verifier = config
            .jwt_secret
            .as_deref()
            .map(|secret| Arc::new(JwtVerifier::new(secret)) as Arc<dyn TokenVerifier>);

        Self {
            verifier,
            api_keys: DashMap::new(),
            limiter: RateLimiter::new(config.rate_limit.clone(), config.ip_connection_cap()),
        }
    }

    /// Replace the token verifier.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Verify a bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NotConfigured`] without a verifier, otherwise
    /// whatever the verifier reports ([`AuthError::Expired`] or
    /// [`AuthError::InvalidToken`]).
    pub async fn authenticate(&self, token: &str) -> Result<AuthClaims, AuthError> {
        let verifier = self.verifier.as_ref().ok_or(AuthError::NotConfigured)?;
        let claims = verifier.verify(token).await?;
        debug!(user = %claims.sub, "Token verified");
        Ok(claims)
    }

    /// Register an API key.
    pub fn add_api_key(&self, key: impl Into<String>, config: ApiKeyConfig) {
        debug!(name = %config.name, "API key registered");
        self.api_keys.insert(key.into(), config);
    }

    /// Remove an API key. Returns whether it was registered.
    pub fn remove_api_key(&self, key: &str) -> bool {
        self.api_keys.remove(key).is_some()
    }

    /// Look up an API key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidApiKey`] for unknown keys.
    pub fn authenticate_api_key(&self, key: &str) -> Result<ApiKeyConfig, AuthError> {
        self.api_keys
            .get(key)
            .map(|entry| entry.clone())
            .ok_or(AuthError::InvalidApiKey)
    }

    /// Count one operation against the client's window.
    pub fn enforce_rate_limit(&self, client_id: &str, operation: &str) -> bool {
        self.limiter.check(client_id, operation)
    }

    /// Claim a per-IP connection slot.
    pub fn acquire_connection(&self, ip: &str) -> bool {
        self.limiter.acquire_connection(ip)
    }

    /// Release a per-IP connection slot.
    pub fn release_connection(&self, ip: &str) {
        self.limiter.release_connection(ip);
    }

    /// Drop the rate-limit windows of a departed client.
    pub fn forget_client(&self, client_id: &str) {
        self.limiter.forget_client(client_id);
    }

    #[cfg(test)]
    pub(crate) fn connections_for(&self, ip: &str) -> usize {
        self.limiter.connections_for(ip)
    }

    #[cfg(test)]
    pub(crate) fn window_count(&self) -> usize {
        self.limiter.window_count()
    }

    /// Forget rate-limit windows and connection counts. API keys are kept.
    pub fn reset(&self) {
        self.limiter.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;

    #[tokio::test]
    async fn test_authenticate_not_configured() {
        let gate = SecurityGate::new(&BrokerConfig::default());
        assert_eq!(
            gate.authenticate("anything").await,
            Err(AuthError::NotConfigured)
        );
    }

    #[tokio::test]
    async fn test_authenticate_expired_vs_invalid() {
        let config = BrokerConfig {
            jwt_secret: Some("secret".into()),
            ..BrokerConfig::default()
        };
        let gate = SecurityGate::new(&config);

        let expired = auth::tests::token("secret", "user-1", &[], -3600);
        let forged = auth::tests::token("wrong", "user-1", &[], 3600);

        let expired_err = gate.authenticate(&expired).await.unwrap_err();
        let forged_err = gate.authenticate(&forged).await.unwrap_err();
        assert_eq!(expired_err, AuthError::Expired);
        assert!(matches!(forged_err, AuthError::InvalidToken(_)));
        assert_ne!(expired_err.to_string(), forged_err.to_string());
    }

    #[test]
    fn test_api_keys() {
        let gate = SecurityGate::new(&BrokerConfig::default());
        gate.add_api_key("k-123", ApiKeyConfig::new("ingest", vec!["write:metrics".into()]));

        let key = gate.authenticate_api_key("k-123").unwrap();
        assert_eq!(key.name, "ingest");
        assert_eq!(
            gate.authenticate_api_key("k-999"),
            Err(AuthError::InvalidApiKey)
        );

        assert!(gate.remove_api_key("k-123"));
        assert!(gate.authenticate_api_key("k-123").is_err());
    }

    #[test]
    fn test_rate_limit_through_gate() {
        let config = BrokerConfig {
            rate_limit: Some(RateLimitConfig {
                max_messages_per_minute: 3,
                ..RateLimitConfig::default()
            }),
            ..BrokerConfig::default()
        };
        let gate = SecurityGate::new(&config);

        let results: Vec<bool> = (0..4)
            .map(|_| gate.enforce_rate_limit("client-a", "publish"))
            .collect();
        assert_eq!(results, vec![true, true, true, false]);

        gate.reset();
        assert!(gate.enforce_rate_limit("client-a", "publish"));
    }
}
