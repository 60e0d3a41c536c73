//! Payload redaction for flow logging
//!
//! Every flow channel emission is logged. Payloads routinely carry
//! passwords, tokens, and encryption keys, so they pass through [`redact`]
//! before reaching a tracing subscriber.

use serde_json::{Map, Value};

/// Replacement for sensitive values
pub const REDACTED: &str = "[REDACTED]";

/// Longest string logged verbatim
pub const MAX_LOGGED_STRING: usize = 256;

/// Whether a JSON key names a secret
#[must_use]
pub fn is_sensitive(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.contains("password")
        || key.contains("secret")
        || key.ends_with("token")
        || key.ends_with("_key")
        || key == "aeskey"
}

/// Copy of `value` with secrets masked and long strings shortened
#[must_use]
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    let inner = if is_sensitive(key) && !inner.is_null() {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact(inner)
                    };
                    (key.clone(), inner)
                })
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        Value::String(s) if s.chars().count() > MAX_LOGGED_STRING => {
            let kept: String = s.chars().take(MAX_LOGGED_STRING).collect();
            let dropped = s.chars().count() - MAX_LOGGED_STRING;
            Value::String(format!("{kept}...(+{dropped} chars)"))
        }
        other => other.clone(),
    }
}
