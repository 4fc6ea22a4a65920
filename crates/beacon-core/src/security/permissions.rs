//! Channel permission evaluation.
//!
//! Permission strings are either a bare scope (`room`, read and write), an
//! operation-qualified scope (`read:room`, `write:room`), a bare operation
//! (`read`, `write`) or `admin`. A channel's scope is the part of its name
//! before the first `:`.

use crate::channel::channel_scope;
use beacon_protocol::{QUERY_UPDATE_CHANNEL, SYSTEM_CHANNEL_PREFIX};

/// Permission that satisfies every check, including reserved channels.
pub const ADMIN_PERMISSION: &str = "admin";

/// Channel operation being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Subscribe / receive.
    Read,
    /// Publish.
    Write,
}

impl Operation {
    /// Permission prefix for this operation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
        }
    }
}

/// Whether the channel is a `system:` channel.
#[must_use]
pub fn is_system_channel(channel: &str) -> bool {
    channel.starts_with(SYSTEM_CHANNEL_PREFIX)
}

/// Whether the channel is reserved for administrators: `system:` channels
/// and the broker-fed `query_update` channel.
#[must_use]
pub fn is_reserved_channel(channel: &str) -> bool {
    is_system_channel(channel) || channel == QUERY_UPDATE_CHANNEL
}

/// Whether the permission list contains `admin`.
#[must_use]
pub fn is_admin(permissions: &[String]) -> bool {
    permissions.iter().any(|p| p == ADMIN_PERMISSION)
}

/// Evaluate a permission list against a channel.
///
/// With `operation = None` any grant on the channel's scope is enough.
#[must_use]
pub fn allows(permissions: &[String], channel: &str, operation: Option<Operation>) -> bool {
    if is_admin(permissions) {
        return true;
    }
    if is_reserved_channel(channel) {
        return false;
    }

    let scope = channel_scope(channel);
    permissions.iter().any(|p| {
        if p == scope {
            return true;
        }
        match (operation, p.split_once(':')) {
            (Some(op), Some((prefix, granted))) => prefix == op.as_str() && granted == scope,
            (Some(op), None) => p == op.as_str(),
            (None, Some((_, granted))) => granted == scope,
            (None, None) => false,
        }
    })
}
