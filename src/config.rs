//! Process configuration, loaded from `settings.toml` under the platform
//! data directory. Parse-on-read with fallback to defaults, auto-fill of
//! any newly-introduced field followed by a save-back — same shape as the
//! donor app's `Settings::load`.

use dirs::data_dir;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RelayConfig {
    /// Redis connection string. `redis://127.0.0.1/` if unset.
    pub kv_url: String,
    /// HTTP bind address for the relay's client-facing surface.
    pub bind_addr: String,

    pub request_timeout_ms: u64,
    pub upstream_wait_after_disconnect: DisconnectWaitConfig,
    pub stream_timeout: StreamTimeoutConfig,
    pub session: SessionConfig,
    pub retry: RetryEngineConfig,
    pub response_cache: ResponseCacheConfig,
    pub concurrency: ConcurrencyConfig,

    /// Seed accounts/keys loaded at startup if the store is empty. Mutation
    /// afterwards goes through the C3/C13 store operations directly — the
    /// admin CRUD surface that would normally front them is out of scope.
    pub seed_accounts: Vec<SeedAccount>,
    pub seed_api_keys: Vec<SeedApiKey>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            kv_url: "redis://127.0.0.1/".to_string(),
            bind_addr: "127.0.0.1:8787".to_string(),
            request_timeout_ms: 600_000,
            upstream_wait_after_disconnect: DisconnectWaitConfig::default(),
            stream_timeout: StreamTimeoutConfig::default(),
            session: SessionConfig::default(),
            retry: RetryEngineConfig::default(),
            response_cache: ResponseCacheConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            seed_accounts: Vec::new(),
            seed_api_keys: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DisconnectWaitConfig {
    pub non_stream_ms: u64,
    pub stream_ms: u64,
    pub enabled: bool,
}

impl Default for DisconnectWaitConfig {
    fn default() -> Self {
        Self { non_stream_ms: 180_000, stream_ms: 180_000, enabled: true }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct StreamTimeoutConfig {
    pub total_ms: u64,
    pub idle_ms: u64,
    pub enabled: bool,
}

impl Default for StreamTimeoutConfig {
    fn default() -> Self {
        Self { total_ms: 180_000, idle_ms: 30_000, enabled: true }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct StickyConcurrencyConfig {
    pub wait_enabled: bool,
    pub max_wait_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for StickyConcurrencyConfig {
    fn default() -> Self {
        Self { wait_enabled: true, max_wait_ms: 1200, poll_interval_ms: 200 }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SessionConfig {
    pub sticky_ttl_hours: u64,
    pub renewal_threshold_minutes: u64,
    pub sticky_concurrency: StickyConcurrencyConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sticky_ttl_hours: 1,
            renewal_threshold_minutes: 10,
            sticky_concurrency: StickyConcurrencyConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RetryEngineConfig {
    pub max_accounts_stream: u32,
    pub max_accounts_nonstream: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub retryable_statuses: Vec<u16>,
    pub server_error_threshold: u32,
    pub server_error_window_minutes: u32,
    pub server_error_cooldown_minutes: u32,
    pub stream_timeout_threshold_per_hour: u32,
    pub stream_timeout_cooldown_minutes: u32,
    pub overload_cooldown_minutes: u32,
}

impl Default for RetryEngineConfig {
    fn default() -> Self {
        Self {
            max_accounts_stream: 3,
            max_accounts_nonstream: 3,
            initial_delay_ms: 300,
            max_delay_ms: 3000,
            retryable_statuses: vec![500, 502, 503, 504, 520, 524, 529],
            server_error_threshold: 3,
            server_error_window_minutes: 5,
            server_error_cooldown_minutes: 6,
            stream_timeout_threshold_per_hour: 2,
            stream_timeout_cooldown_minutes: 6,
            overload_cooldown_minutes: 10,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ResponseCacheConfig {
    pub ttl_seconds: u64,
    pub max_bytes: usize,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self { ttl_seconds: 180, max_bytes: 5 * 1024 * 1024 }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub default_lease_ms: u64,
    pub lease_refresh_interval_ms: u64,
    pub lease_margin_ms: u64,
    pub sweep_interval_secs: u64,
    pub stale_warn_age_minutes: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            default_lease_ms: 600_000,
            lease_refresh_interval_ms: 300_000,
            lease_margin_ms: 30_000,
            sweep_interval_secs: 60,
            stale_warn_age_minutes: 5,
        }
    }
}

/// Proxy policy for one account. `enabled=true` with an unreachable/invalid
/// target is a hard failure (strict mode, invariant 4) — there is no
/// "fall through to direct connection" branch here, unlike the donor app's
/// `ProxyConfig`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ProxyPolicy {
    pub enabled: bool,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct SeedAccount {
    pub id: String,
    pub platform: String,
    pub name: String,
    pub priority: i64,
    pub api_key: Option<String>,
    pub endpoints: Vec<String>,
    pub max_concurrent_tasks: u32,
    pub session_id_limit_enabled: bool,
    pub session_id_max_count: u32,
    pub session_id_window_minutes: u32,
    pub proxy: Option<ProxyPolicy>,
    pub supported_models: Vec<String>,
    pub cost_multiplier: Option<f64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct SeedApiKey {
    pub id: String,
    pub key_material: String,
    pub name: String,
    pub claude_account_id: Option<String>,
    pub total_cost_limit: f64,
    pub daily_cost_limit: f64,
    pub concurrency_limit: u32,
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u32,
}

fn settings_path() -> PathBuf {
    let mut p = data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("provider-relay");
    fs::create_dir_all(&p).ok();
    p.push("settings.toml");
    p
}

pub fn load() -> RelayConfig {
    let p = settings_path();
    let cfg = if p.exists() {
        let s = fs::read_to_string(&p).unwrap_or_default();
        toml::from_str(&s).unwrap_or_else(|e| {
            crate::logger::error("config", &format!("failed to parse {:?}: {}", p, e));
            RelayConfig::default()
        })
    } else {
        RelayConfig::default()
    };
    cfg
}

pub fn save(cfg: &RelayConfig) -> Result<(), String> {
    let p = settings_path();
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("failed to create config dir: {e}"))?;
    }
    let s = toml::to_string_pretty(cfg).map_err(|e| format!("failed to serialize config: {e}"))?;
    fs::write(&p, &s).map_err(|e| format!("failed to write {:?}: {e}", p))?;
    Ok(())
}

pub fn reset() -> Result<(), String> {
    let p = settings_path();
    if p.exists() {
        fs::remove_file(&p).map_err(|e| format!("failed to remove {:?}: {e}", p))?;
    }
    Ok(())
}

#[cfg(target_os = "windows")]
#[allow(dead_code)]
mod platform_security {
    use std::{ffi::c_void, ptr::null_mut};
    use windows::{
        core::PCWSTR,
        Win32::{
            Foundation::{LocalFree, HLOCAL},
            Security::Cryptography::{
                CryptProtectData, CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN, CRYPT_INTEGER_BLOB,
            },
        },
    };

    unsafe fn vec_from_blob(blob: &CRYPT_INTEGER_BLOB) -> Vec<u8> {
        if blob.pbData.is_null() || blob.cbData == 0 {
            Vec::new()
        } else {
            std::slice::from_raw_parts(blob.pbData, blob.cbData as usize).to_vec()
        }
    }

    unsafe fn blob_from_slice(slice: &[u8]) -> CRYPT_INTEGER_BLOB {
        CRYPT_INTEGER_BLOB { cbData: slice.len() as u32, pbData: slice.as_ptr() as *mut u8 }
    }

    fn free_blob(blob: &mut CRYPT_INTEGER_BLOB) {
        unsafe {
            if !blob.pbData.is_null() {
                let _ = LocalFree(HLOCAL(blob.pbData as *mut c_void));
                blob.pbData = null_mut();
                blob.cbData = 0;
            }
        }
    }

    /// Protects one account credential (OAuth token / static key) at rest.
    /// Falls back to identity if DPAPI is unavailable.
    pub fn protect(data: &[u8]) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }
        unsafe {
            let in_blob = blob_from_slice(data);
            let mut out_blob = CRYPT_INTEGER_BLOB { cbData: 0, pbData: null_mut() };
            if CryptProtectData(&in_blob, PCWSTR::null(), None, None, None, CRYPTPROTECT_UI_FORBIDDEN, &mut out_blob)
                .is_err()
            {
                return data.to_vec();
            }
            let result = vec_from_blob(&out_blob);
            free_blob(&mut out_blob);
            result
        }
    }

    pub fn unprotect(data: &[u8]) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }
        unsafe {
            let in_blob = blob_from_slice(data);
            let mut out_blob = CRYPT_INTEGER_BLOB { cbData: 0, pbData: null_mut() };
            if CryptUnprotectData(&in_blob, None, None, None, None, CRYPTPROTECT_UI_FORBIDDEN, &mut out_blob).is_err()
            {
                return data.to_vec();
            }
            let result = vec_from_blob(&out_blob);
            free_blob(&mut out_blob);
            result
        }
    }
}

#[cfg(target_os = "windows")]
pub use platform_security::{protect, unprotect};

#[cfg(not(target_os = "windows"))]
pub fn protect(data: &[u8]) -> Vec<u8> {
    data.to_vec()
}
#[cfg(not(target_os = "windows"))]
pub fn unprotect(data: &[u8]) -> Vec<u8> {
    data.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_retry_statuses() {
        let cfg = RelayConfig::default();
        assert!(cfg.retry.retryable_statuses.contains(&529));
        assert!(cfg.retry.retryable_statuses.contains(&520));
    }
}
