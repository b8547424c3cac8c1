//! In-process KV backend implementing the same atomic semantics as the
//! Redis scripts. Used by tests and by any deployment that doesn't need
//! cross-process sharing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Default)]
struct Store {
    strings: HashMap<String, (String, Option<Instant>)>,
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, Vec<(String, f64)>>,
    zset_expiry: HashMap<String, Instant>,
}

impl Store {
    fn string_live(&mut self, key: &str) -> Option<String> {
        match self.strings.get(key) {
            Some((_, Some(exp))) if *exp <= Instant::now() => {
                self.strings.remove(key);
                None
            }
            Some((v, _)) => Some(v.clone()),
            None => None,
        }
    }
}

pub struct MemoryBackend {
    store: Mutex<Store>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self { store: Mutex::new(Store::default()) }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let mut s = self.store.lock().await;
        let exp = ttl.map(|d| Instant::now() + d);
        s.strings.insert(key.to_string(), (value.to_string(), exp));
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.store.lock().await.string_live(key)
    }

    pub async fn del(&self, key: &str) {
        let mut s = self.store.lock().await;
        s.strings.remove(key);
        s.hashes.remove(key);
        s.zsets.remove(key);
        s.zset_expiry.remove(key);
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) {
        let mut s = self.store.lock().await;
        s.hashes.entry(key.to_string()).or_default().insert(field.to_string(), value.to_string());
    }

    pub async fn hget(&self, key: &str, field: &str) -> Option<String> {
        let s = self.store.lock().await;
        s.hashes.get(key).and_then(|h| h.get(field)).cloned()
    }

    pub async fn hgetall(&self, key: &str) -> HashMap<String, String> {
        let s = self.store.lock().await;
        s.hashes.get(key).cloned().unwrap_or_default()
    }

    pub async fn hdel(&self, key: &str, field: &str) {
        let mut s = self.store.lock().await;
        if let Some(h) = s.hashes.get_mut(key) {
            h.remove(field);
        }
    }

    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let s = self.store.lock().await;
        s.hashes.keys().filter(|k| k.starts_with(prefix)).cloned().collect()
    }

    pub async fn incrbyfloat(&self, key: &str, delta: f64) -> f64 {
        let mut s = self.store.lock().await;
        let cur: f64 = s.string_live(key).and_then(|v| v.parse().ok()).unwrap_or(0.0);
        let next = cur + delta;
        let exp = s.strings.get(key).and_then(|(_, e)| *e);
        s.strings.insert(key.to_string(), (next.to_string(), exp));
        next
    }

    pub async fn set_expire(&self, key: &str, ttl: Duration) {
        let mut s = self.store.lock().await;
        if let Some(entry) = s.strings.get_mut(key) {
            entry.1 = Some(Instant::now() + ttl);
        }
    }

    /// `None` covers both "no TTL set" and "key missing/expired" — callers
    /// that need to tell those apart should `get` first.
    pub async fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let s = self.store.lock().await;
        match s.strings.get(key) {
            Some((_, Some(exp))) => exp.checked_duration_since(Instant::now()),
            _ => None,
        }
    }

    fn trim_zset(zset: &mut Vec<(String, f64)>, max_score_exclusive: f64) {
        zset.retain(|(_, score)| *score >= max_score_exclusive);
    }

    pub async fn zadd(&self, key: &str, member: &str, score: f64) {
        let mut s = self.store.lock().await;
        let z = s.zsets.entry(key.to_string()).or_default();
        z.retain(|(m, _)| m != member);
        z.push((member.to_string(), score));
    }

    pub async fn zrem(&self, key: &str, member: &str) {
        let mut s = self.store.lock().await;
        if let Some(z) = s.zsets.get_mut(key) {
            z.retain(|(m, _)| m != member);
        }
    }

    pub async fn zremrangebyscore(&self, key: &str, max_score_exclusive_below: f64) {
        let mut s = self.store.lock().await;
        if let Some(z) = s.zsets.get_mut(key) {
            Self::trim_zset(z, max_score_exclusive_below);
        }
    }

    pub async fn zcard(&self, key: &str) -> u64 {
        let s = self.store.lock().await;
        s.zsets.get(key).map(|z| z.len() as u64).unwrap_or(0)
    }

    pub async fn zscore(&self, key: &str, member: &str) -> Option<f64> {
        let s = self.store.lock().await;
        s.zsets.get(key).and_then(|z| z.iter().find(|(m, _)| m == member).map(|(_, sc)| *sc))
    }

    /// Members with score in `[min, max]`, descending by score.
    pub async fn zrevrangebyscore(&self, key: &str, min: f64, max: f64, limit: Option<usize>) -> Vec<(String, f64)> {
        let s = self.store.lock().await;
        let mut v: Vec<(String, f64)> = s
            .zsets
            .get(key)
            .map(|z| z.iter().filter(|(_, sc)| *sc >= min && *sc <= max).cloned().collect())
            .unwrap_or_default();
        v.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        if let Some(n) = limit {
            v.truncate(n);
        }
        v
    }

    pub async fn zset_set_expire(&self, key: &str, ttl: Duration) {
        let mut s = self.store.lock().await;
        if s.zsets.contains_key(key) {
            s.zset_expiry.insert(key.to_string(), Instant::now() + ttl);
        }
    }

    /// Sweep all zsets whose TTL has elapsed and all expired members.
    pub async fn sweep_expired(&self) {
        let mut s = self.store.lock().await;
        let now = Instant::now();
        let expired_keys: Vec<String> = s
            .zset_expiry
            .iter()
            .filter(|(_, exp)| **exp <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for k in expired_keys {
            s.zsets.remove(&k);
            s.zset_expiry.remove(&k);
        }
    }

    /// All zset keys currently tracked (used by the concurrency sweeper).
    pub async fn zset_keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let s = self.store.lock().await;
        s.zsets.keys().filter(|k| k.starts_with(prefix)).cloned().collect()
    }

    /// Atomic (single lock acquisition) equivalent of the Redis acquire
    /// script: trim expired, add member at `expire_at_ms`, return new count.
    pub async fn acquire(&self, key: &str, member: &str, now_ms: i64, expire_at_ms: i64) -> u64 {
        let mut s = self.store.lock().await;
        let z = s.zsets.entry(key.to_string()).or_default();
        Self::trim_zset(z, now_ms as f64);
        z.retain(|(m, _)| m != member);
        z.push((member.to_string(), expire_at_ms as f64));
        z.len() as u64
    }

    pub async fn release(&self, key: &str, member: &str, now_ms: i64) {
        let mut s = self.store.lock().await;
        if let Some(z) = s.zsets.get_mut(key) {
            z.retain(|(m, _)| m != member);
            Self::trim_zset(z, now_ms as f64);
        }
    }

    pub async fn refresh(&self, key: &str, member: &str, expire_at_ms: i64) -> bool {
        let mut s = self.store.lock().await;
        if let Some(z) = s.zsets.get_mut(key) {
            if let Some(entry) = z.iter_mut().find(|(m, _)| m == member) {
                entry.1 = expire_at_ms as f64;
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incrbyfloat_accumulates() {
        let be = MemoryBackend::new();
        assert_eq!(be.incrbyfloat("k", 1.5).await, 1.5);
        assert_eq!(be.incrbyfloat("k", 2.5).await, 4.0);
    }

    #[tokio::test]
    async fn zset_trim_and_card() {
        let be = MemoryBackend::new();
        be.zadd("z", "a", 100.0).await;
        be.zadd("z", "b", 200.0).await;
        be.zremrangebyscore("z", 150.0).await;
        assert_eq!(be.zcard("z").await, 1);
    }

    #[tokio::test]
    async fn string_ttl_expires() {
        let be = MemoryBackend::new();
        be.set("s", "v", Some(Duration::from_millis(10))).await;
        assert_eq!(be.get("s").await, Some("v".to_string()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(be.get("s").await, None);
    }
}
