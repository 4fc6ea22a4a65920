//! Payload validation and sanitization.

use crate::error::BrokerError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Maximum serialized payload size (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

static SCRIPT_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("Invalid script block regex")
});

/// Patterns that reject a payload outright.
static BLOCKED_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"(?i)<script\b", r"(?i)javascript\s*:", r"(?i)\bon[a-z]+\s*="]
        .iter()
        .map(|p| Regex::new(p).expect("Invalid blocked pattern regex"))
        .collect()
});

/// Reject oversized payloads and payloads carrying script injection patterns.
///
/// # Errors
///
/// Returns [`BrokerError::Validation`] describing the first violation.
pub fn validate_message(payload: &Value) -> Result<(), BrokerError> {
    let serialized = serde_json::to_string(payload)
        .map_err(|e| BrokerError::Validation(format!("unserializable payload: {e}")))?;

    if serialized.len() > MAX_MESSAGE_SIZE {
        return Err(BrokerError::Validation(format!(
            "payload of {} bytes exceeds maximum {MAX_MESSAGE_SIZE}",
            serialized.len()
        )));
    }

    if BLOCKED_PATTERNS.iter().any(|re| re.is_match(&serialized)) {
        return Err(BrokerError::Validation(
            "payload contains a blocked pattern".to_string(),
        ));
    }

    Ok(())
}

/// Strip event-handler keys and `<script>` blocks from a payload.
///
/// Object keys starting with `on` are dropped and script blocks are removed
/// from every string, recursively. Other values pass through unchanged.
#[must_use]
pub fn sanitize_data(payload: Value) -> Value {
    match payload {
        Value::String(s) => Value::String(strip_scripts(s)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_data).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .filter(|(key, _)| !key.starts_with("on"))
                .map(|(key, value)| (key, sanitize_data(value)))
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    }
}

fn strip_scripts(s: String) -> String {
    if SCRIPT_BLOCK.is_match(&s) {
        SCRIPT_BLOCK.replace_all(&s, "").into_owned()
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_strips_handlers_and_scripts() {
        let cleaned = sanitize_data(json!({
            "onClick": "x",
            "name": "<script>evil()</script>ok",
        }));
        assert_eq!(cleaned, json!({"name": "ok"}));
    }

    #[test]
    fn test_sanitize_recurses() {
        let cleaned = sanitize_data(json!({
            "items": [{"onload": 1, "title": "a<SCRIPT src=x>\n</script>b"}, 3, null],
            "nested": {"deep": {"onerror": true, "keep": false}},
        }));
        assert_eq!(
            cleaned,
            json!({
                "items": [{"title": "ab"}, 3, null],
                "nested": {"deep": {"keep": false}},
            })
        );
    }

    #[test]
    fn test_sanitize_primitives_unchanged() {
        assert_eq!(sanitize_data(json!(42)), json!(42));
        assert_eq!(sanitize_data(json!("plain")), json!("plain"));
        assert_eq!(sanitize_data(Value::Null), Value::Null);
    }

    #[test]
    fn test_validate_accepts_plain_payload() {
        assert!(validate_message(&json!({"msg": "hi", "count": 2})).is_ok());
    }

    #[test]
    fn test_validate_rejects_blocked_patterns() {
        for payload in [
            json!({"html": "<script>alert(1)</script>"}),
            json!({"href": "JavaScript:alert(1)"}),
            json!({"html": "<img src=x onerror=alert(1)>"}),
        ] {
            assert!(matches!(
                validate_message(&payload),
                Err(BrokerError::Validation(_))
            ));
        }
    }

    #[test]
    fn test_validate_rejects_oversized_payload() {
        let payload = json!({"blob": "a".repeat(MAX_MESSAGE_SIZE)});
        assert!(matches!(
            validate_message(&payload),
            Err(BrokerError::Validation(_))
        ));
    }
}
