//! Broker configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Keepalive ping interval in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Presence records older than this are considered stale.
    #[serde(default = "default_presence_timeout")]
    pub presence_timeout_ms: u64,

    /// Reject connections that present no credentials.
    #[serde(default)]
    pub require_auth: bool,

    /// Shared HS256 secret for bearer tokens.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Rate limiting. Absent means unlimited.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// Connection admission rules.
    #[serde(default)]
    pub security: SecurityConfig,
}

/// Rate limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Length of a rate-limit window in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Maximum concurrent connections per IP.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum operations of one kind per client per window.
    #[serde(default = "default_max_messages")]
    pub max_messages_per_minute: u32,
}

/// Connection admission configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Accepted `Origin` values. Empty accepts any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Additional per-IP connection cap.
    #[serde(default)]
    pub max_connections_per_ip: Option<usize>,
}

fn default_ping_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_presence_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_connections() -> usize {
    100
}

fn default_max_messages() -> u32 {
    60
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
            presence_timeout_ms: default_presence_timeout(),
            require_auth: false,
            jwt_secret: None,
            rate_limit: None,
            security: SecurityConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_connections: default_max_connections(),
            max_messages_per_minute: default_max_messages(),
        }
    }
}

impl BrokerConfig {
    /// Keepalive ping interval.
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Presence staleness timeout.
    #[must_use]
    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    /// Effective per-IP connection cap, if any.
    ///
    /// The smaller of `rate_limit.max_connections` and
    /// `security.max_connections_per_ip` wins when both are set.
    #[must_use]
    pub fn ip_connection_cap(&self) -> Option<usize> {
        let rate_cap = self.rate_limit.as_ref().map(|r| r.max_connections);
        match (rate_cap, self.security.max_connections_per_ip) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl SecurityConfig {
    /// Whether a connection from `origin` may be accepted.
    #[must_use]
    pub fn is_origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        origin.is_some_and(|o| self.allowed_origins.iter().any(|allowed| allowed == o))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.ping_interval_ms, 30_000);
        assert_eq!(config.presence_timeout_ms, 60_000);
        assert!(!config.require_auth);
        assert!(config.rate_limit.is_none());
        assert_eq!(config.ip_connection_cap(), None);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            require_auth = true
            jwt_secret = "s3cret"

            [rate_limit]
            max_messages_per_minute = 3

            [security]
            allowed_origins = ["https://app.example"]
            max_connections_per_ip = 5
        "#;

        let config: BrokerConfig = toml::from_str(toml_str).unwrap();
        assert!(config.require_auth);
        assert_eq!(config.jwt_secret.as_deref(), Some("s3cret"));

        let rate = config.rate_limit.as_ref().unwrap();
        assert_eq!(rate.window_ms, 60_000);
        assert_eq!(rate.max_messages_per_minute, 3);
        assert_eq!(config.ip_connection_cap(), Some(5));
    }

    #[test]
    fn test_origin_check() {
        let mut security = SecurityConfig::default();
        assert!(security.is_origin_allowed(None));

        security.allowed_origins = vec!["https://app.example".into()];
        assert!(security.is_origin_allowed(Some("https://app.example")));
        assert!(!security.is_origin_allowed(Some("https://evil.example")));
        assert!(!security.is_origin_allowed(None));
    }
}
