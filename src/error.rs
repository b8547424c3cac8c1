//! Unified error surface for the relay.
//!
//! One closed enum carries every error kind named in the error-handling
//! design: client protocol passthroughs, account-health transitions, proxy
//! and concurrency failures, and quota rejections. The HTTP boundary always
//! renders `{error:{type, message}}`, matching the upstream error shape so
//! clients see one consistent envelope regardless of which provider or
//! which internal component raised it.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    /// 4xx from upstream that reflects the client's own input; passed
    /// through after sanitization. Does not change account status.
    #[error("client protocol error: {0}")]
    ClientProtocol(String),

    /// Upstream 401. Caller already transitioned the account to
    /// `unauthorized`; this is what's left to tell the client once every
    /// account has been exhausted.
    #[error("unauthorized: {0}")]
    Auth(String),

    /// Upstream 429, or `ApiKey`-scoped rate limiting.
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// Upstream 529/overloaded.
    #[error("overloaded: {0}")]
    Overload(String),

    /// Repeated 5xx within the ledger window.
    #[error("upstream error: {0}")]
    Transient5xx(String),

    /// Stream idle/total timeout.
    #[error("stream timeout: {0}")]
    StreamTimeout(String),

    /// Strict-proxy construction failure. `code` is the upstream/system
    /// error code, preserved for diagnostics.
    #[error("proxy error ({code}): {message}")]
    Proxy { code: String, message: String },

    /// All candidate accounts were full on entry or emptied by retries.
    #[error("concurrency exceeded: {0}")]
    ConcurrencyFull(String),

    /// Pre-flight cost/rate rejection (C13). No upstream call was made.
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// 400/404/413/422 and friends that are not retried.
    #[error("non-retryable client error: {0}")]
    NonRetryable4xx(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("kv store error: {0}")]
    Kv(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Machine-readable type string, matching the upstream error JSON shape
    /// clients already parse.
    fn error_type(&self) -> &'static str {
        match self {
            RelayError::ClientProtocol(_) => "client_protocol_error",
            RelayError::Auth(_) => "authentication_error",
            RelayError::RateLimit(_) => "rate_limit_error",
            RelayError::Overload(_) => "overloaded_error",
            RelayError::Transient5xx(_) => "api_error",
            RelayError::StreamTimeout(_) => "timeout_error",
            RelayError::Proxy { .. } => "proxy_error",
            RelayError::ConcurrencyFull(_) => "concurrency_error",
            RelayError::Quota(_) => "quota_exceeded",
            RelayError::NonRetryable4xx(_) => "invalid_request_error",
            RelayError::ModelNotFound(_) => "not_found_error",
            RelayError::AccountNotFound(_) => "not_found_error",
            RelayError::InvalidRequest(_) => "invalid_request_error",
            RelayError::Kv(_) => "internal_server_error",
            RelayError::Internal(_) => "internal_server_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            RelayError::ClientProtocol(_) => StatusCode::BAD_REQUEST,
            RelayError::Auth(_) => StatusCode::UNAUTHORIZED,
            RelayError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            RelayError::Overload(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Transient5xx(_) => StatusCode::BAD_GATEWAY,
            RelayError::StreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Proxy { .. } => StatusCode::BAD_GATEWAY,
            RelayError::ConcurrencyFull(_) => StatusCode::TOO_MANY_REQUESTS,
            RelayError::Quota(_) => StatusCode::TOO_MANY_REQUESTS,
            RelayError::NonRetryable4xx(_) => StatusCode::BAD_REQUEST,
            RelayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::AccountNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::Kv(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for the retryable categories named in section 4.9: 5xx,
    /// overload, stream timeout, proxy failure, concurrency-exceeded.
    /// Auth/quota/client-protocol/non-retryable-4xx are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Overload(_)
                | RelayError::Transient5xx(_)
                | RelayError::StreamTimeout(_)
                | RelayError::Proxy { .. }
                | RelayError::ConcurrencyFull(_)
        )
    }

    /// Strip anything that looks like a credential or an internal upstream
    /// URL before an error string reaches the client. Permitted-domain
    /// substrings pass through untouched; everything else that looks like a
    /// URL or bearer token is redacted.
    pub fn sanitized_message(&self) -> String {
        sanitize(&self.to_string())
    }
}

/// Redacts bearer tokens, basic-auth userinfo, and non-allow-listed URLs
/// from an upstream-derived error string.
pub fn sanitize(input: &str) -> String {
    static BEARER: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"(?i)bearer\s+[A-Za-z0-9._\-]+").unwrap());
    static URL: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"https?://[^\s\]\)\"']+").unwrap());
    const ALLOWED_DOMAINS: &[&str] = &["anthropic.com", "openai.com", "googleapis.com"];

    let redacted = BEARER.replace_all(input, "Bearer [redacted]");
    URL.replace_all(&redacted, |caps: &regex::Captures| {
        let url = &caps[0];
        if ALLOWED_DOMAINS.iter().any(|d| url.contains(d)) {
            url.to_string()
        } else {
            "[redacted-url]".to_string()
        }
    })
    .into_owned()
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_type = self.error_type();
        let message = self.sanitized_message();

        crate::logger::error(
            "relay_error",
            &format!("status={} type={} message={}", status.as_u16(), error_type, message),
        );

        (
            status,
            Json(serde_json::json!({
                "error": { "type": error_type, "message": message }
            })),
        )
            .into_response()
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(RelayError::Transient5xx("x".into()).is_retryable());
        assert!(RelayError::Proxy { code: "ECONNREFUSED".into(), message: "x".into() }.is_retryable());
        assert!(!RelayError::Auth("x".into()).is_retryable());
        assert!(!RelayError::Quota("x".into()).is_retryable());
    }

    #[test]
    fn sanitize_redacts_bearer_and_unlisted_url() {
        let msg = "upstream said Bearer sk-ant-secret123 at http://10.0.0.5:9999/internal";
        let out = sanitize(msg);
        assert!(!out.contains("sk-ant-secret123"));
        assert!(!out.contains("10.0.0.5"));
    }

    #[test]
    fn sanitize_preserves_allowlisted_domain() {
        let msg = "request to https://api.anthropic.com/v1/messages failed";
        let out = sanitize(msg);
        assert!(out.contains("api.anthropic.com"));
    }
}
