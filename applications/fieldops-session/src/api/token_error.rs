use serde_json::Value;

/// Whether an error body says the bearer token itself is the problem.
///
/// Backends phrase this differently, so any of these count: a `token_not_valid` code,
/// a `detail` string mentioning "token" in any case, or a `messages` field.
pub fn is_token_invalid_error(body: &Value) -> bool {
    if body.get("code").and_then(Value::as_str) == Some("token_not_valid") {
        return true;
    }

    if let Some(detail) = body.get("detail").and_then(Value::as_str) {
        if detail.to_ascii_lowercase().contains("token") {
            return true;
        }
    }

    body.get("messages").is_some()
}
