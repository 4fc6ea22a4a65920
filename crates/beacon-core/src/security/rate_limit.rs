//! Fixed-window operation limits and per-IP connection caps.
//!
//! Windows are keyed by `(client, operation)` and live until the client is
//! forgotten or the limiter is reset.

use crate::config::RateLimitConfig;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// One fixed window for a `(client, operation)` key.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitWindow {
    /// Operations counted in this window.
    pub count: u32,
    /// When the window closes.
    pub reset_at: Instant,
}

/// Operation and connection limiter.
#[derive(Debug, Default)]
pub struct RateLimiter {
    config: Option<RateLimitConfig>,
    ip_cap: Option<usize>,
    windows: DashMap<(String, String), RateLimitWindow>,
    connections: DashMap<String, usize>,
}

impl RateLimiter {
    /// Create a limiter. `config = None` disables operation limits.
    #[must_use]
    pub fn new(config: Option<RateLimitConfig>, ip_cap: Option<usize>) -> Self {
        Self {
            config,
            ip_cap,
            windows: DashMap::new(),
            connections: DashMap::new(),
        }
    }

    /// Count one `operation` by `client_id`.
    ///
    /// Returns `false` once the client has used up the window's allowance.
    /// An expired or missing window is replaced by a fresh one.
    pub fn check(&self, client_id: &str, operation: &str) -> bool {
        let Some(limit) = &self.config else {
            return true;
        };

        let now = Instant::now();
        let mut window = self
            .windows
            .entry((client_id.to_string(), operation.to_string()))
            .or_insert(RateLimitWindow {
                count: 0,
                reset_at: now,
            });

        if now >= window.reset_at {
            *window = RateLimitWindow {
                count: 1,
                reset_at: now + Duration::from_millis(limit.window_ms),
            };
            return true;
        }

        if window.count >= limit.max_messages_per_minute {
            return false;
        }
        window.count += 1;
        true
    }

    /// Drop every window held by `client_id`.
    pub fn forget_client(&self, client_id: &str) {
        self.windows.retain(|(client, _), _| client != client_id);
    }

    /// Claim a connection slot for `ip`. Returns `false` if the cap is reached.
    pub fn acquire_connection(&self, ip: &str) -> bool {
        let Some(cap) = self.ip_cap else {
            return true;
        };

        let mut count = self.connections.entry(ip.to_string()).or_insert(0);
        if *count >= cap {
            return false;
        }
        *count += 1;
        true
    }

    /// Release a connection slot claimed by [`RateLimiter::acquire_connection`].
    pub fn release_connection(&self, ip: &str) {
        if self.ip_cap.is_none() {
            return;
        }
        if let Some(mut count) = self.connections.get_mut(ip) {
            *count = count.saturating_sub(1);
        }
        self.connections.remove_if(ip, |_, count| *count == 0);
    }

    #[cfg(test)]
    pub(crate) fn connections_for(&self, ip: &str) -> usize {
        self.connections.get(ip).map(|c| *c).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Forget every window and connection count.
    pub fn reset(&self) {
        self.windows.clear();
        self.connections.clear();
    }
}
