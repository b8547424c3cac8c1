//! C11 — Response cache. Only populated for the delayed-success case: a
//! non-stream 200 whose client disconnected before the body finished.
//! `apiKeyId` is mandatory in the fingerprint — callers passing none are
//! refused rather than silently caching under a collision-prone key.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{RelayError, RelayResult};
use crate::kv::{self, Kv};

pub const MAX_CACHE_BYTES: usize = 5 * 1024 * 1024;
pub const CACHE_TTL_SECS: u64 = 180;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub usage: serde_json::Value,
}

/// Builds the cache fingerprint from the fields the spec names. `stream`
/// and `metadata` are deliberately excluded. Returns an error (rather than
/// silently hashing an empty key id) when `api_key_id` is missing.
pub fn fingerprint(api_key_id: &str, request: &serde_json::Value) -> RelayResult<String> {
    if api_key_id.is_empty() {
        crate::logger::error("cache", "refused to build a response-cache key with no apiKeyId");
        return Err(RelayError::InvalidRequest("response cache requires an apiKeyId".to_string()));
    }

    let canonical = serde_json::json!({
        "apiKeyId": api_key_id,
        "model": request.get("model"),
        "messages": request.get("messages"),
        "system": request.get("system"),
        "max_tokens": request.get("max_tokens"),
        "temperature": request.get("temperature"),
        "top_p": request.get("top_p"),
        "top_k": request.get("top_k"),
        "stop_sequences": request.get("stop_sequences"),
    });
    let serialized =
        serde_json::to_string(&canonical).map_err(|e| RelayError::Internal(e.to_string()))?;
    let digest = Sha256::digest(serialized.as_bytes());
    Ok(hex::encode(digest)[..32].to_string())
}

pub async fn get(kv: &Kv, fp: &str) -> RelayResult<Option<CachedResponse>> {
    let raw = kv.get(&kv::response_cache_key(fp)).await?;
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

/// Stores a response under `fp` with the fixed TTL, refusing bodies over
/// the size cap — callers are expected to have already checked disconnect
/// + status + non-stream preconditions before calling this.
pub async fn put(kv: &Kv, fp: &str, entry: &CachedResponse) -> RelayResult<()> {
    if entry.body.len() > MAX_CACHE_BYTES {
        crate::logger::warn("cache", &format!("response too large to cache ({} bytes)", entry.body.len()));
        return Ok(());
    }
    let serialized = serde_json::to_string(entry).map_err(|e| RelayError::Internal(e.to_string()))?;
    kv.set(&kv::response_cache_key(fp), &serialized, Some(std::time::Duration::from_secs(CACHE_TTL_SECS)))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_requires_api_key_id() {
        let req = json!({"model": "claude-sonnet-4-5-20250929"});
        assert!(fingerprint("", &req).is_err());
        assert!(fingerprint("key-1", &req).is_ok());
    }

    #[test]
    fn fingerprint_ignores_stream_and_metadata() {
        let base = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
        let mut with_stream = base.clone();
        with_stream["stream"] = json!(true);
        with_stream["metadata"] = json!({"user_id": "u1"});
        assert_eq!(fingerprint("key-1", &base).unwrap(), fingerprint("key-1", &with_stream).unwrap());
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let kv = Kv::in_memory();
        let fp = fingerprint("key-1", &json!({"model": "m"})).unwrap();
        let entry = CachedResponse {
            status: 200,
            headers: vec![],
            body: "{\"ok\":true}".to_string(),
            usage: json!({"input_tokens": 1}),
        };
        put(&kv, &fp, &entry).await.unwrap();
        let got = get(&kv, &fp).await.unwrap().unwrap();
        assert_eq!(got.body, entry.body);
    }

    #[tokio::test]
    async fn oversized_body_is_not_cached() {
        let kv = Kv::in_memory();
        let fp = fingerprint("key-1", &json!({"model": "m"})).unwrap();
        let entry = CachedResponse {
            status: 200,
            headers: vec![],
            body: "x".repeat(MAX_CACHE_BYTES + 1),
            usage: json!({}),
        };
        put(&kv, &fp, &entry).await.unwrap();
        assert!(get(&kv, &fp).await.unwrap().is_none());
    }
}
