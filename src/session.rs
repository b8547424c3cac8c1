//! C5 — Session map. Deterministic `sessionFingerprint` derivation that
//! folds in the calling apiKey, plus sticky mapping storage with a
//! bounded wait-for-slot guard used when a sticky account is momentarily
//! at capacity.

use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::RelayResult;
use crate::kv::{self, Kv};

fn sha256_hex32(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p.as_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(digest)[..32].to_string()
}

/// Derives the sticky-session fingerprint for a request body, folding in
/// `api_key_id` so two keys sending identical prompts never collide.
/// Returns `None` when none of the three derivation rules apply — callers
/// treat that as "no stickiness for this request".
pub fn session_fingerprint(api_key_id: &str, body: &Value) -> Option<String> {
    if let Some(user_id) = body.pointer("/metadata/user_id").and_then(Value::as_str) {
        if let Some(uuid) = extract_account_session_uuid(user_id) {
            return Some(sha256_hex32(&[api_key_id, &uuid]));
        }
    }

    let ephemeral = collect_ephemeral_texts(body);
    if !ephemeral.is_empty() {
        let joined = ephemeral.join("\u{0}");
        return Some(sha256_hex32(&[api_key_id, &joined]));
    }

    if let Some(system_text) = extract_system_text(body) {
        if !system_text.is_empty() {
            return Some(sha256_hex32(&[api_key_id, &system_text]));
        }
    }

    if let Some(first_user_text) = extract_first_user_text(body) {
        if !first_user_text.is_empty() {
            return Some(sha256_hex32(&[api_key_id, &first_user_text]));
        }
    }

    None
}

fn extract_account_session_uuid(user_id: &str) -> Option<String> {
    const MARKER: &str = "_account__session_";
    let idx = user_id.find(MARKER)?;
    Some(user_id[idx + MARKER.len()..].to_string())
}

fn collect_ephemeral_texts(body: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let mut scan = |blocks: &Value| {
        if let Some(arr) = blocks.as_array() {
            for block in arr {
                let is_ephemeral =
                    block.pointer("/cache_control/type").and_then(Value::as_str) == Some("ephemeral");
                if is_ephemeral {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        out.push(text.to_string());
                    }
                }
            }
        }
    };
    if let Some(system) = body.get("system") {
        scan(system);
    }
    if let Some(messages) = body.get("messages") {
        scan(messages);
    }
    out
}

fn extract_system_text(body: &Value) -> Option<String> {
    match body.get("system") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(blocks)) => {
            let joined: String = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\u{0}");
            Some(joined)
        }
        _ => None,
    }
}

fn extract_first_user_text(body: &Value) -> Option<String> {
    let messages = body.get("messages")?.as_array()?;
    let first_user = messages.iter().find(|m| m.get("role").and_then(Value::as_str) == Some("user"))?;
    match first_user.get("content") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(blocks)) => blocks.iter().find_map(|b| b.get("text").and_then(Value::as_str)).map(String::from),
        _ => None,
    }
}

pub async fn get_mapping(kv: &Kv, fingerprint: &str) -> RelayResult<Option<String>> {
    kv.get(&kv::session_mapping_key(fingerprint)).await
}

pub async fn put_mapping(kv: &Kv, fingerprint: &str, account_id: &str, ttl: Duration) -> RelayResult<()> {
    kv.set(&kv::session_mapping_key(fingerprint), account_id, Some(ttl)).await
}

/// Extends the mapping's TTL only when it's below `threshold` of its
/// original lifetime — avoids rewriting on every single request.
pub async fn extend_if_below(
    kv: &Kv,
    fingerprint: &str,
    account_id: &str,
    full_ttl: Duration,
    threshold: Duration,
    remaining: Duration,
) -> RelayResult<()> {
    if remaining < threshold {
        put_mapping(kv, fingerprint, account_id, full_ttl).await?;
    }
    Ok(())
}

pub async fn delete_mapping(kv: &Kv, fingerprint: &str) -> RelayResult<()> {
    kv.del(&kv::session_mapping_key(fingerprint)).await
}

/// Bounded wait for a sticky account to free a concurrency slot. Polls
/// `count_fn` every `poll_interval` up to `max_wait`; returns `true` if a
/// slot was observed free within the budget.
pub async fn wait_for_slot<F, Fut>(max_wait: Duration, poll_interval: Duration, mut has_capacity: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        if has_capacity().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_folds_in_api_key() {
        let body = json!({"messages": [{"role": "user", "content": "hello"}]});
        let fp1 = session_fingerprint("key-a", &body).unwrap();
        let fp2 = session_fingerprint("key-b", &body).unwrap();
        assert_ne!(fp1, fp2);
        assert_eq!(fp1.len(), 32);
    }

    #[test]
    fn fingerprint_prefers_account_session_marker() {
        let body = json!({
            "metadata": {"user_id": "foo_account__session_abc-123"},
            "messages": [{"role": "user", "content": "hello"}]
        });
        let fp = session_fingerprint("key-a", &body).unwrap();
        let expected = sha256_hex32(&["key-a", "abc-123"]);
        assert_eq!(fp, expected);
    }

    #[test]
    fn no_derivable_signal_returns_none() {
        let body = json!({});
        assert!(session_fingerprint("key-a", &body).is_none());
    }

    #[tokio::test]
    async fn mapping_round_trip() {
        let kv = Kv::in_memory();
        put_mapping(&kv, "fp1", "acc-1", Duration::from_secs(3600)).await.unwrap();
        assert_eq!(get_mapping(&kv, "fp1").await.unwrap(), Some("acc-1".to_string()));
        delete_mapping(&kv, "fp1").await.unwrap();
        assert_eq!(get_mapping(&kv, "fp1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn wait_for_slot_times_out() {
        let got = wait_for_slot(Duration::from_millis(50), Duration::from_millis(10), || async { false }).await;
        assert!(!got);
    }
}
