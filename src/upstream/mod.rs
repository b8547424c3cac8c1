//! C8 — Upstream client. Two call shapes (`do_request`/`do_stream_request`)
//! over a per-account `reqwest::Client`, a strict proxy-construction rule
//! (no direct-connection fallback), and a stream timeout monitor with
//! separate total/idle thresholds.
//!
//! The donor app's `forward::client::create_client` treats a proxy that
//! fails to resolve as a warning and falls back to a direct connection
//! (see its `create_client`/`create_proxies`). This is a deliberate
//! redesign: here, `account.proxy` with `enabled=true` that fails to
//! build is a hard, typed error — there is no silent direct fallback.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::{header::HeaderMap, Client, Proxy};
use tokio::sync::mpsc;

use crate::config::ProxyPolicy;
use crate::error::{RelayError, RelayResult};

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Builds a strict proxy agent from an account's policy. `enabled=false`
/// (or absent) allows a direct connection; `enabled=true` with a bad
/// target raises `RelayError::Proxy` — callers must not fall back.
fn build_proxy(policy: &ProxyPolicy) -> RelayResult<Proxy> {
    let mut url = format!("{}://{}:{}", policy.scheme, policy.host, policy.port);
    if let (Some(user), Some(pass)) = (policy.username.as_ref(), policy.password.as_ref()) {
        url = format!("{}://{}:{}@{}:{}", policy.scheme, user, pass, policy.host, policy.port);
    }
    Proxy::all(&url).map_err(|e| RelayError::Proxy {
        code: "PROXY_CONSTRUCTION_FAILED".to_string(),
        message: e.to_string(),
    })
}

pub fn build_client(proxy: Option<&ProxyPolicy>, timeout: Duration) -> RelayResult<Client> {
    let mut builder = Client::builder().timeout(timeout).connect_timeout(Duration::from_secs(10));
    if let Some(policy) = proxy {
        if policy.enabled {
            builder = builder.proxy(build_proxy(policy)?);
        }
    }
    builder.build().map_err(|e| RelayError::Internal(format!("failed to build upstream client: {e}")))
}

pub async fn do_request(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    body: &serde_json::Value,
    timeout_ms: u64,
) -> RelayResult<UpstreamResponse> {
    let resp = client
        .post(url)
        .headers(headers)
        .timeout(Duration::from_millis(timeout_ms))
        .json(body)
        .send()
        .await
        .map_err(classify_transport_error)?;

    let status = resp.status().as_u16();
    let headers = resp.headers().clone();
    let body = resp.bytes().await.map_err(classify_transport_error)?;
    Ok(UpstreamResponse { status, headers, body })
}

fn classify_transport_error(e: reqwest::Error) -> RelayError {
    if e.is_timeout() {
        RelayError::StreamTimeout(e.to_string())
    } else if e.is_connect() {
        RelayError::Transient5xx(format!("connection failed: {e}"))
    } else {
        RelayError::Transient5xx(e.to_string())
    }
}

pub struct StreamHead {
    pub status: u16,
    pub headers: HeaderMap,
}

/// Reason a stream was aborted by the timeout monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    Total,
    Idle,
}

/// Opens a streaming upstream call. Returns the response head immediately
/// and a channel of body chunks; chunk errors (including monitor aborts)
/// are sent as the terminal item on the channel.
pub async fn do_stream_request(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    body: &serde_json::Value,
    total_timeout: Duration,
    idle_timeout: Duration,
) -> RelayResult<(StreamHead, mpsc::Receiver<Result<Bytes, RelayError>>)> {
    let resp = client.post(url).headers(headers).json(body).send().await.map_err(classify_transport_error)?;

    let status = resp.status().as_u16();
    let resp_headers = resp.headers().clone();
    let head = StreamHead { status, headers: resp_headers };

    let (tx, rx) = mpsc::channel(32);
    let mut byte_stream = resp.bytes_stream();

    tokio::spawn(async move {
        let deadline = tokio::time::sleep(total_timeout);
        tokio::pin!(deadline);
        let mut idle = tokio::time::sleep(idle_timeout);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    let _ = tx.send(Err(RelayError::StreamTimeout("TOTAL_TIMEOUT".to_string()))).await;
                    break;
                }
                _ = &mut idle => {
                    let _ = tx.send(Err(RelayError::StreamTimeout("IDLE_TIMEOUT".to_string()))).await;
                    break;
                }
                chunk = byte_stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            idle = tokio::time::sleep(idle_timeout);
                            if tx.send(Ok(bytes)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx.send(Err(classify_transport_error(e))).await;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
    });

    Ok((head, rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_policy_allows_direct_connection() {
        let policy = ProxyPolicy { enabled: false, ..Default::default() };
        let client = build_client(Some(&policy), Duration::from_secs(30));
        assert!(client.is_ok());
    }

    #[test]
    fn enabled_policy_with_bad_scheme_is_a_typed_error() {
        let policy =
            ProxyPolicy { enabled: true, scheme: "not-a-scheme".to_string(), host: "proxy.local".to_string(), port: 0, username: None, password: None };
        let err = build_client(Some(&policy), Duration::from_secs(30)).unwrap_err();
        assert!(matches!(err, RelayError::Proxy { .. }));
    }
}
