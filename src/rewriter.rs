//! C7 — Request rewriter contract. The core only calls through this
//! boundary; it never inspects prompt contents itself. The default
//! implementation here is a passthrough plus the `forceStream` heuristic
//! the spec names — vendor-specific field filtering and dialect
//! conversion (the donor app's `forward::handlers::{anthropic,openai,gemini}`)
//! stay out of scope: the core treats rewriting as an external contract.

use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::accounts::Account;

pub struct RewriteOutcome {
    pub body: Value,
    pub headers: HeaderMap,
    pub force_stream: bool,
}

pub trait RequestRewriter: Send + Sync {
    fn rewrite(&self, body: &Value, account: &Account, client_headers: &HeaderMap) -> RewriteOutcome;
    fn derive_beta_header(&self, model: &str) -> String;
}

/// Default contract implementation: passes the body and headers through
/// unchanged, only flipping `forceStream` for the large "main" models.
pub struct PassthroughRewriter;

/// Large main models get `forceStream=true` so a non-stream client
/// request is converted to a stream upstream and re-aggregated by C10 —
/// the spec's rationale is these models' latency profile favors streaming
/// regardless of what the client asked for.
fn is_main_model(model: &str) -> bool {
    let m = model.to_ascii_lowercase();
    m.contains("sonnet") || m.contains("opus")
}

impl RequestRewriter for PassthroughRewriter {
    fn rewrite(&self, body: &Value, _account: &Account, client_headers: &HeaderMap) -> RewriteOutcome {
        let model = body.get("model").and_then(Value::as_str).unwrap_or("");
        RewriteOutcome { body: body.clone(), headers: client_headers.clone(), force_stream: is_main_model(model) }
    }

    fn derive_beta_header(&self, _model: &str) -> String {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_stream_only_for_main_models() {
        assert!(is_main_model("claude-sonnet-4-5-20250929"));
        assert!(is_main_model("claude-opus-4-1-20250805"));
        assert!(!is_main_model("claude-haiku-4-5-20251001"));
    }
}
