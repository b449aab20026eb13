//! Uniform `{ok, result}` / `{ok: false, error}` envelope.
//!
//! Hardware servers are heterogeneous: some answer with the envelope,
//! some with a bare value. The `ok` key is the discriminator.

use serde_json::{json, Value};

/// `{ "ok": true, "result": result }`
pub fn ok(result: Value) -> Value {
    json!({ "ok": true, "result": result })
}

/// `{ "ok": false, "error": message }`
pub fn err(message: impl Into<String>) -> Value {
    json!({ "ok": false, "error": message.into() })
}

/// The body carries the success/failure discriminator.
pub fn has_discriminator(body: &Value) -> bool {
    body.as_object().is_some_and(|m| m.contains_key("ok"))
}

/// Pass an envelope through as-is, wrap anything else as a success.
pub fn normalize(body: Value) -> Value {
    if has_discriminator(&body) {
        body
    } else {
        ok(body)
    }
}

/// `true` only for an explicit `"ok": true`.
pub fn is_ok(envelope: &Value) -> bool {
    envelope.get("ok").and_then(Value::as_bool) == Some(true)
}

/// Failure reason of an envelope, if it reports one.
pub fn error_message(envelope: &Value) -> Option<String> {
    if is_ok(envelope) {
        return None;
    }
    match envelope.get("error") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => Some("unknown error".to_string()),
        Some(other) => Some(other.to_string()),
    }
}
