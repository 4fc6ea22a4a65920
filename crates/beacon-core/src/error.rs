//! Error types surfaced by the broker.

use thiserror::Error;

/// Identity verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No token verifier is configured.
    #[error("not configured")]
    NotConfigured,

    /// The token signature is valid but its expiry has passed.
    #[error("token expired")]
    Expired,

    /// The token could not be verified.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The API key is not registered.
    #[error("invalid api key")]
    InvalidApiKey,

    /// Authentication is required but no credentials were presented.
    #[error("authentication required")]
    Required,
}

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Missing, invalid or expired credentials.
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Insufficient permission for a channel operation.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Per-IP connection cap or per-operation message cap exceeded.
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// Malformed channel name or rejected payload.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No session is registered for the client.
    #[error("Unknown client: {0}")]
    UnknownClient(String),

    /// One or more subscribers failed to accept a delivery.
    #[error("Delivery failed on {channel}: {failed} of {total} subscribers")]
    Delivery {
        /// Channel the message was published to.
        channel: String,
        /// Number of failed deliveries.
        failed: usize,
        /// Number of attempted deliveries.
        total: usize,
    },
}

impl BrokerError {
    /// Short, stable label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Auth(_) => "auth",
            BrokerError::Permission(_) => "permission",
            BrokerError::RateLimit(_) => "rate_limit",
            BrokerError::Validation(_) => "validation",
            BrokerError::UnknownClient(_) => "unknown_client",
            BrokerError::Delivery { .. } => "delivery",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_and_invalid_are_distinct() {
        assert_eq!(AuthError::Expired.to_string(), "token expired");
        assert_eq!(
            AuthError::InvalidToken("InvalidSignature".into()).to_string(),
            "invalid token: InvalidSignature"
        );
        assert_ne!(
            AuthError::Expired.to_string(),
            AuthError::InvalidToken(String::new()).to_string()
        );
    }

    #[test]
    fn test_error_kind_labels() {
        let err: BrokerError = AuthError::Required.into();
        assert_eq!(err.kind(), "auth");
        assert_eq!(err.to_string(), "Authentication failed: authentication required");
        assert_eq!(BrokerError::RateLimit("x".into()).kind(), "rate_limit");
    }
}
