//! C0 — HTTP surface. A client-facing `/v1/messages` endpoint (stream and
//! non-stream) wired through auth (C13), scheduling (C6), rewriting (C7),
//! the upstream client under the retry engine (C8/C9), the aggregator
//! (C10), and usage/cost recording (C12/C2) — plus a `/health` endpoint
//! reporting the health of the concurrency ledger and a
//! `/v1/responses/:fingerprint` pickup route for the response cache (C11).
//! The non-stream path runs in a detached task so a client disconnect
//! doesn't cut the upstream call short; see `run_nonstream_with_disconnect_wait`.
//!
//! The donor app's `server.rs` routes a large admin/analytics surface
//! (`/api/stats/*`, `/api/projects/*`, `/api/tools/*`, `/api/auto-config/*`)
//! alongside its forwarding routes. None of that survives here: the admin
//! surface is a contract the core doesn't implement (see SPEC_FULL.md §6),
//! and the unified/per-vendor forwarding handlers belong to the rewriter's
//! contract, not the core pipeline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::accounts::{self, AccountStatus};
use crate::aggregator::{self, StreamResponseAggregator};
use crate::auth;
use crate::cache;
use crate::concurrency;
use crate::config::RelayConfig;
use crate::context::RequestContext;
use crate::error::{RelayError, RelayResult};
use crate::kv::Kv;
use crate::rewriter::{PassthroughRewriter, RequestRewriter};
use crate::scheduler::{self, SchedulingInput};
use crate::session;
use crate::upstream;
use crate::usage::{self, UpstreamUsage};

#[derive(Clone)]
pub struct AppState {
    pub kv: Kv,
    pub config: Arc<RelayConfig>,
    pub rewriter: Arc<dyn RequestRewriter>,
}

impl AppState {
    pub fn new(kv: Kv, config: RelayConfig) -> Self {
        Self { kv, config: Arc::new(config), rewriter: Arc::new(PassthroughRewriter) }
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let stale = concurrency::get_stale_records(&state.kv, "concurrency:", 30.0).await.unwrap_or_default();
    Json(json!({
        "status": "ok",
        "stale_leases": stale.len(),
    }))
}

fn bearer_key(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("authorization")?.to_str().ok()?;
    raw.strip_prefix("Bearer ").map(str::trim).map(String::from)
}

fn upstream_url(account: &accounts::Account) -> RelayResult<String> {
    account
        .endpoints
        .first()
        .cloned()
        .ok_or_else(|| RelayError::AccountNotFound(format!("account {} has no endpoints configured", account.id)))
}

fn upstream_headers(account: &accounts::Account, client_headers: &HeaderMap) -> RelayResult<HeaderMap> {
    let mut headers = client_headers.clone();
    if let Some(key) = &account.api_key {
        headers.insert("x-api-key", key.parse().map_err(|_| RelayError::Internal("invalid account api key".to_string()))?);
    }
    headers.remove("authorization");
    headers.remove("host");
    headers.remove("content-length");
    Ok(headers)
}

/// One scheduling + upstream attempt. Returns `Ok` with either a final
/// JSON body (non-stream) or a stream handle; `Err` is always a
/// `RelayError` the caller decides whether to retry.
enum Attempt {
    NonStream(Value, UpstreamUsage, accounts::Account),
    Stream(
        upstream::StreamHead,
        tokio::sync::mpsc::Receiver<Result<bytes::Bytes, RelayError>>,
        accounts::Account,
        concurrency::ConcurrencyGuard,
    ),
}

async fn run_one_attempt(
    state: &AppState,
    ctx: &mut RequestContext,
    body: &Value,
    client_headers: &HeaderMap,
    wants_stream: bool,
) -> RelayResult<Attempt> {
    let cfg = &state.config;
    let model = body.get("model").and_then(Value::as_str).unwrap_or("").to_string();
    let fingerprint = session::session_fingerprint(&ctx.api_key.id, body);
    ctx.session_fingerprint = fingerprint.clone();

    let selection = scheduler::select(
        &state.kv,
        SchedulingInput {
            platform: "anthropic",
            pinned_account_id: ctx.api_key.claude_account_id.as_deref(),
            pinned_group_id: None,
            session_fingerprint: fingerprint.as_deref(),
            requested_model: &model,
            excluded_accounts: &ctx.excluded_accounts,
            current_session_id: None,
            sticky_ttl: Duration::from_secs(cfg.session.sticky_ttl_hours * 3600),
            sticky_renewal_threshold: Duration::from_secs(cfg.session.renewal_threshold_minutes * 60),
            wait_enabled: cfg.session.sticky_concurrency.wait_enabled,
            max_wait: Duration::from_millis(cfg.session.sticky_concurrency.max_wait_ms),
            poll_interval: Duration::from_millis(cfg.session.sticky_concurrency.poll_interval_ms),
        },
    )
    .await?;

    let account = selection.account;
    ctx.account = Some(account.clone());

    let concurrency_key = crate::kv::concurrency_key(&account.id);
    let mut guard =
        concurrency::ConcurrencyGuard::acquire(&state.kv, &concurrency_key, account.max_concurrent_tasks, &ctx.request_id)
            .await?;

    let rewritten = state.rewriter.rewrite(body, &account, client_headers);
    let force_stream = wants_stream || rewritten.force_stream;

    let url = upstream_url(&account)?;
    let headers = upstream_headers(&account, &rewritten.headers)?;
    let client = upstream::build_client(account.proxy.as_ref(), Duration::from_millis(cfg.request_timeout_ms))?;

    if force_stream {
        guard.spawn_refresher();
        let (head, rx) = upstream::do_stream_request(
            &client,
            &url,
            headers,
            &rewritten.body,
            Duration::from_millis(cfg.stream_timeout.total_ms),
            Duration::from_millis(cfg.stream_timeout.idle_ms),
        )
        .await?;
        if head.status >= 400 {
            let err = apply_error_status_policy(state, &account, head.status, &Value::Null, false).await?;
            guard.release().await;
            return Err(err);
        }
        return Ok(Attempt::Stream(head, rx, account, guard));
    }

    let resp = upstream::do_request(&client, &url, headers, &rewritten.body, cfg.request_timeout_ms).await;
    guard.release().await;

    let resp = resp?;
    if resp.status >= 400 {
        let parsed: Value = serde_json::from_slice(&resp.body).unwrap_or(Value::Null);
        let err = apply_error_status_policy(state, &account, resp.status, &parsed, false).await?;
        return Err(err);
    }

    accounts::clear_server_errors(&state.kv, &account.platform, &account.id).await?;
    let parsed: Value = serde_json::from_slice(&resp.body)
        .map_err(|e| RelayError::Internal(format!("upstream returned invalid json: {e}")))?;
    let usage = parse_upstream_usage(&parsed);
    Ok(Attempt::NonStream(parsed, usage, account))
}

/// Applies the status/ledger transitions named in section 4's state
/// machine for one failed attempt, then returns the classified error for
/// the retry loop to act on. `client_disconnected` carves out the
/// 504-while-disconnected case, which must not touch the 5xx ledger.
async fn apply_error_status_policy(
    state: &AppState,
    account: &accounts::Account,
    status: u16,
    body: &Value,
    client_disconnected: bool,
) -> RelayResult<RelayError> {
    let cfg = &state.config.retry;

    if status == 401 {
        accounts::mark_status(&state.kv, &account.platform, &account.id, AccountStatus::Unauthorized, "401", None)
            .await?;
    } else if status == 429 {
        accounts::mark_status(
            &state.kv,
            &account.platform,
            &account.id,
            AccountStatus::RateLimited,
            "429",
            Some(60),
        )
        .await?;
    } else if matches!(status, 520 | 524 | 529) {
        accounts::mark_status(
            &state.kv,
            &account.platform,
            &account.id,
            AccountStatus::Overloaded,
            "overload",
            Some(cfg.overload_cooldown_minutes as u64 * 60),
        )
        .await?;
    } else if !(status == 504 && client_disconnected) && matches!(status, 500 | 502 | 503 | 504) {
        accounts::record_server_error(&state.kv, &account.platform, &account.id, &status.to_string()).await?;
        let count = accounts::get_server_error_count(&state.kv, &account.platform, &account.id).await?;
        if count >= cfg.server_error_threshold as u64 {
            accounts::mark_status(
                &state.kv,
                &account.platform,
                &account.id,
                AccountStatus::TempError,
                "5xx_threshold",
                Some(cfg.server_error_cooldown_minutes as u64 * 60),
            )
            .await?;
        }
    }

    Ok(crate::retry::classify_response(status, body, client_disconnected))
}

/// Records a stream timeout against the account's own ledger (distinct
/// from the 5xx ledger) and promotes to `temp_error` once it crosses the
/// per-hour threshold.
async fn apply_stream_timeout_policy(state: &AppState, account: &accounts::Account, reason: &str) -> RelayResult<()> {
    let cfg = &state.config.retry;
    accounts::record_stream_timeout(&state.kv, &account.platform, &account.id, reason).await?;
    let count = accounts::get_stream_timeout_count(&state.kv, &account.platform, &account.id).await?;
    if count >= cfg.stream_timeout_threshold_per_hour as u64 {
        accounts::mark_status(
            &state.kv,
            &account.platform,
            &account.id,
            AccountStatus::TempError,
            "stream_timeout_threshold",
            Some(cfg.stream_timeout_cooldown_minutes as u64 * 60),
        )
        .await?;
    }
    Ok(())
}

fn parse_upstream_usage(body: &Value) -> UpstreamUsage {
    let u = body.get("usage").cloned().unwrap_or(Value::Null);
    UpstreamUsage {
        input_tokens: u.get("input_tokens").and_then(Value::as_i64).unwrap_or(0),
        output_tokens: u.get("output_tokens").and_then(Value::as_i64).unwrap_or(0),
        cache_creation_input_tokens: u.get("cache_creation_input_tokens").and_then(Value::as_i64).unwrap_or(0),
        cache_read_input_tokens: u.get("cache_read_input_tokens").and_then(Value::as_i64).unwrap_or(0),
    }
}

async fn record_usage(state: &AppState, ctx: &RequestContext, model: &str, usage: UpstreamUsage) {
    let Some(account) = &ctx.account else { return };
    if let Err(e) = usage::record(&state.kv, &ctx.api_key.id, ctx.api_key.total_cost_limit, model, account, usage).await
    {
        crate::logger::error("usage", &format!("failed to record usage for {}: {}", ctx.api_key.id, e));
    }
}

/// Walks the scheduler across exclusions, retrying up to `budget` times.
/// Factored out of `messages` so the non-stream path can run it inside a
/// detached task that outlives a client disconnect.
async fn run_retry_loop(
    state: AppState,
    mut ctx: RequestContext,
    body: Value,
    headers: HeaderMap,
    wants_stream: bool,
    budget: u32,
) -> (RequestContext, RelayResult<Attempt>) {
    let mut attempted = 0usize;
    loop {
        match run_one_attempt(&state, &mut ctx, &body, &headers, wants_stream).await {
            Ok(attempt) => return (ctx, Ok(attempt)),
            Err(err) if err.is_retryable() && crate::retry::attempts_remaining(attempted, budget) => {
                attempted += 1;
                ctx.exclude_current();
                continue;
            }
            Err(err) => return (ctx, Err(err)),
        }
    }
}

/// `POST /v1/messages`. Runs the retry loop across up to
/// `retry.max_accounts_{stream,nonstream}` accounts, falling back from a
/// stream attempt to a non-stream retry (replayed as synthetic SSE) when
/// every streaming candidate is exhausted.
async fn messages(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let Some(key_material) = bearer_key(&headers) else {
        return RelayError::Auth("missing bearer token".to_string()).into_response();
    };
    let api_key = match auth::resolve(&state.kv, &key_material).await {
        Ok(k) => k,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = auth::enforce_cost_limits(&state.kv, &api_key).await {
        return e.into_response();
    }
    let request_id = Uuid::new_v4().to_string();
    if let Err(e) = auth::enforce_rate_limit(&state.kv, &api_key, &request_id).await {
        return e.into_response();
    }
    let key_guard = match auth::admit_concurrency(&state.kv, &api_key, &request_id).await {
        Ok(g) => g,
        Err(e) => return e.into_response(),
    };

    let wants_stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let model = body.get("model").and_then(Value::as_str).unwrap_or("").to_string();
    let ctx = RequestContext::new(request_id, api_key.clone());
    let budget = if wants_stream { state.config.retry.max_accounts_stream } else { state.config.retry.max_accounts_nonstream };

    if !wants_stream {
        if let Some(hit) = lookup_cached_response(&state, &api_key.id, &body).await {
            key_guard.release().await;
            return hit;
        }
    }

    if wants_stream {
        let (ctx, outcome) = run_retry_loop(state.clone(), ctx, body.clone(), headers.clone(), true, budget).await;
        return match outcome {
            Ok(Attempt::NonStream(resp, usage, account)) => {
                record_usage(&state, &ctx, &model, usage).await;
                let _ = account;
                key_guard.release().await;
                Json(resp).into_response()
            }
            Ok(Attempt::Stream(head, rx, account, guard)) => {
                key_guard.release().await;
                stream_response(state, ctx, head, rx, account, model, guard).await
            }
            Err(stream_err) => {
                // Every streaming candidate failed. Fall back to a
                // non-stream retry loop over the same exclusion set and
                // replay a successful result as synthetic SSE, so a client
                // that asked for `stream:true` still gets one.
                let fallback_budget = state.config.retry.max_accounts_nonstream;
                let (ctx, fallback) =
                    run_retry_loop(state.clone(), ctx, body, headers, false, fallback_budget).await;
                match fallback {
                    Ok(Attempt::NonStream(resp, usage, account)) => {
                        record_usage(&state, &ctx, &model, usage).await;
                        let _ = account;
                        key_guard.release().await;
                        sse_response_from_json(&resp)
                    }
                    Ok(Attempt::Stream(head, rx, account, guard)) => {
                        key_guard.release().await;
                        stream_response(state, ctx, head, rx, account, model, guard).await
                    }
                    Err(_) => {
                        key_guard.release().await;
                        stream_err.into_response()
                    }
                }
            }
        };
    }

    run_nonstream_with_disconnect_wait(state, ctx, body, headers, budget, model, key_guard).await
}

/// Runs the non-stream retry loop in a detached task so a client disconnect
/// doesn't cut the upstream call short. A disconnect is detected when the
/// response oneshot's receiver is dropped (`tx.closed()`); from that point
/// the attempt is given `upstream_wait_after_disconnect.non_stream_ms` more
/// to finish. A 200 that lands inside that window is cached (C11) for the
/// client's eventual `GET /v1/responses/:fingerprint` retry; past the
/// deadline the attempt is abandoned without touching the account's error
/// ledger — this is not an upstream failure, just a client that left.
async fn run_nonstream_with_disconnect_wait(
    state: AppState,
    ctx: RequestContext,
    body: Value,
    headers: HeaderMap,
    budget: u32,
    model: String,
    key_guard: concurrency::ConcurrencyGuard,
) -> Response {
    let wait_enabled = state.config.upstream_wait_after_disconnect.enabled;
    let wait_ms = state.config.upstream_wait_after_disconnect.non_stream_ms;
    let (tx, rx) = tokio::sync::oneshot::channel::<Response>();
    let cache_body = body.clone();

    tokio::spawn(async move {
        let cancel = ctx.cancellation.clone();
        let work = run_retry_loop(state.clone(), ctx, body, headers, false, budget);
        tokio::pin!(work);

        tokio::select! {
            biased;
            (ctx_done, outcome) = &mut work => {
                key_guard.release().await;
                let _ = tx.send(finish_nonstream(&state, &ctx_done, &model, outcome).await);
            }
            _ = tx.closed(), if wait_enabled => {
                tokio::select! {
                    (ctx_done, outcome) = &mut work => {
                        key_guard.release().await;
                        cache_delayed_success(&state, &ctx_done, &cache_body, &outcome).await;
                        let _ = finish_nonstream(&state, &ctx_done, &model, outcome).await;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {
                        cancel.cancel();
                        key_guard.release().await;
                    }
                }
            }
        }
    });

    rx.await.unwrap_or_else(|_| StatusCode::NO_CONTENT.into_response())
}

/// Renders one retry-loop outcome into the client-facing response. A
/// non-stream client can still land an `Attempt::Stream` here — the
/// rewriter forces streaming upstream for "main" models regardless of what
/// the client asked for — so that case is drained and re-aggregated into a
/// single JSON body (C10) rather than passed through as raw SSE.
async fn finish_nonstream(state: &AppState, ctx: &RequestContext, model: &str, outcome: RelayResult<Attempt>) -> Response {
    match outcome {
        Ok(Attempt::NonStream(resp, usage, _account)) => {
            record_usage(state, ctx, model, usage).await;
            Json(resp).into_response()
        }
        Ok(Attempt::Stream(_head, rx, account, guard)) => {
            aggregate_stream_to_json(state, ctx, rx, account, model, guard).await
        }
        Err(err) => err.into_response(),
    }
}

/// Drains a stream attempt to completion and renders it as a single JSON
/// response, for the non-stream client that got `forceStream=true`'d by the
/// rewriter. Mirrors `stream_response`'s event-feeding loop but returns the
/// final body instead of forwarding raw SSE bytes.
async fn aggregate_stream_to_json(
    state: &AppState,
    ctx: &RequestContext,
    mut rx: tokio::sync::mpsc::Receiver<Result<bytes::Bytes, RelayError>>,
    account: accounts::Account,
    model: &str,
    guard: concurrency::ConcurrencyGuard,
) -> Response {
    let mut buffer = Vec::new();
    let mut aggregator = StreamResponseAggregator::new();
    let mut event_name = String::new();

    while let Some(item) = rx.recv().await {
        match item {
            Ok(chunk) => {
                for line in aggregator::drain_sse_lines(&mut buffer, &chunk) {
                    if let Some(name) = aggregator::parse_sse_event_name(&line) {
                        event_name = name.to_string();
                    } else if let Some(data) = aggregator::parse_sse_data(&line) {
                        if aggregator::is_sse_done(data) {
                            continue;
                        }
                        if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                            aggregator.feed(&event_name, &parsed);
                        }
                    }
                }
            }
            Err(RelayError::StreamTimeout(reason)) => {
                apply_stream_timeout_policy(state, &account, &reason).await.ok();
                break;
            }
            Err(_) => break,
        }
    }

    accounts::record_session_id(&state.kv, &account.platform, &account.id, &ctx.request_id, 60).await.ok();
    let usage = UpstreamUsage {
        input_tokens: aggregator.usage().input_tokens,
        output_tokens: aggregator.usage().output_tokens,
        cache_creation_input_tokens: aggregator.usage().cache_creation_input_tokens,
        cache_read_input_tokens: aggregator.usage().cache_read_input_tokens,
    };
    record_usage(state, ctx, model, usage).await;
    guard.release().await;

    if let Some(err_body) = aggregator.error() {
        return (StatusCode::BAD_GATEWAY, Json(err_body.clone())).into_response();
    }
    Json(aggregator.build_final_response()).into_response()
}

/// Synthesizes an SSE response from a final JSON body — the stream-
/// exhausted-then-non-stream-succeeded fallback path, for a client that
/// originally asked for `stream:true`.
fn sse_response_from_json(body: &Value) -> Response {
    let events = aggregator::convert_json_to_sse(body);
    let body_stream = stream::iter(events.into_iter().map(Ok::<_, std::io::Error>));
    let body = Body::from_stream(body_stream);
    let mut response = Response::new(body);
    response.headers_mut().insert("content-type", "text/event-stream".parse().unwrap());
    response
}

/// `cache::get` half of C11: a non-stream request whose fingerprint matches
/// a still-live cache entry is served directly, with no scheduling or
/// upstream call at all. `None` means "no hit" — the caller proceeds with
/// the normal retry loop.
async fn lookup_cached_response(state: &AppState, api_key_id: &str, body: &Value) -> Option<Response> {
    let fp = cache::fingerprint(api_key_id, body).ok()?;
    let entry = cache::get(&state.kv, &fp).await.ok()??;
    let parsed: Value = serde_json::from_str(&entry.body).unwrap_or(Value::Null);
    Some((StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK), Json(parsed)).into_response())
}

/// Caches a delayed 200 so a client that disconnected and later retries
/// via `GET /v1/responses/:fingerprint` can pick up the result without
/// re-billing. Only non-stream 200s are ever cached — see C11.
async fn cache_delayed_success(state: &AppState, ctx: &RequestContext, body: &Value, outcome: &RelayResult<Attempt>) {
    let Ok(Attempt::NonStream(resp, _usage, _account)) = outcome else { return };
    let Ok(fp) = cache::fingerprint(&ctx.api_key.id, body) else { return };
    let entry = cache::CachedResponse {
        status: 200,
        headers: Vec::new(),
        body: resp.to_string(),
        usage: resp.get("usage").cloned().unwrap_or(Value::Null),
    };
    if let Err(e) = cache::put(&state.kv, &fp, &entry).await {
        crate::logger::error("cache", &format!("failed to cache delayed response: {e}"));
    }
}

async fn stream_response(
    state: AppState,
    ctx: RequestContext,
    head: upstream::StreamHead,
    mut rx: tokio::sync::mpsc::Receiver<Result<bytes::Bytes, RelayError>>,
    account: accounts::Account,
    model: String,
    guard: concurrency::ConcurrencyGuard,
) -> Response {
    let status = StatusCode::from_u16(head.status).unwrap_or(StatusCode::OK);
    let (out_tx, out_rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, std::io::Error>>(32);

    tokio::spawn(async move {
        let mut buffer = Vec::new();
        let mut aggregator = StreamResponseAggregator::new();
        let mut event_name = String::new();

        while let Some(item) = rx.recv().await {
            match item {
                Ok(chunk) => {
                    let _ = out_tx.send(Ok(chunk.clone())).await;
                    for line in aggregator::drain_sse_lines(&mut buffer, &chunk) {
                        if let Some(name) = aggregator::parse_sse_event_name(&line) {
                            event_name = name.to_string();
                        } else if let Some(data) = aggregator::parse_sse_data(&line) {
                            if aggregator::is_sse_done(data) {
                                continue;
                            }
                            if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                                aggregator.feed(&event_name, &parsed);
                            }
                        }
                    }
                }
                Err(RelayError::StreamTimeout(reason)) => {
                    apply_stream_timeout_policy(&state, &account, &reason).await.ok();
                    break;
                }
                Err(_) => break,
            }
        }

        accounts::record_session_id(&state.kv, &account.platform, &account.id, &ctx.request_id, 60).await.ok();
        let usage = UpstreamUsage {
            input_tokens: aggregator.usage().input_tokens,
            output_tokens: aggregator.usage().output_tokens,
            cache_creation_input_tokens: aggregator.usage().cache_creation_input_tokens,
            cache_read_input_tokens: aggregator.usage().cache_read_input_tokens,
        };
        record_usage(&state, &ctx, &model, usage).await;
        guard.release().await;
    });

    let body_stream = stream::unfold(out_rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
    let body = Body::from_stream(body_stream);

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert("content-type", "text/event-stream".parse().unwrap());
    response
}

/// `GET /v1/responses/:fingerprint` — returns a previously cached response
/// (C11) if the client reconnects after a disconnect-before-complete.
async fn cached_response(
    State(state): State<AppState>,
    axum::extract::Path(fingerprint): axum::extract::Path<String>,
) -> Response {
    match cache::get(&state.kv, &fingerprint).await {
        Ok(Some(entry)) => {
            let body: Value = serde_json::from_str(&entry.body).unwrap_or(Value::Null);
            (StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK), Json(body)).into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => e.into_response(),
    }
}

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::permissive();
    Router::new()
        .route("/health", get(health))
        .route("/v1/messages", post(messages))
        .route("/v1/responses/:fingerprint", get(cached_response))
        .layer(cors)
        .with_state(state)
}

/// Periodically restores accounts whose cooldown has elapsed and trims
/// expired concurrency leases — the background half of the state machine
/// that `mark_status`/`ConcurrencyGuard` only set up the data for.
fn spawn_maintenance(state: AppState) {
    let sweep_interval = Duration::from_secs(state.config.concurrency.sweep_interval_secs);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(sweep_interval).await;
            if let Err(e) = accounts::sweep_recoveries(&state.kv, "anthropic").await {
                crate::logger::error("maintenance", &format!("account recovery sweep failed: {e}"));
            }
            match concurrency::cleanup_all(&state.kv, "concurrency:").await {
                Ok(reports) => {
                    for r in reports.iter().filter(|r| r.removed > 0) {
                        crate::logger::debug("maintenance", &format!("trimmed {} expired leases from {}", r.removed, r.key));
                    }
                }
                Err(e) => crate::logger::error("maintenance", &format!("concurrency sweep failed: {e}")),
            }
        }
    });
}

pub async fn serve(state: AppState) {
    let addr: SocketAddr = state.config.bind_addr.parse().unwrap_or_else(|_| "127.0.0.1:8787".parse().unwrap());
    spawn_maintenance(state.clone());
    let app = app(state);
    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind relay listener");
    crate::logger::info("server", &format!("listening on {addr}"));
    axum::serve(listener, app).await.expect("relay server exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> AppState {
        AppState::new(Kv::in_memory(), RelayConfig::default())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let a = app(test_state());
        let h = tokio::spawn(async move { axum::serve(listener, a).await.unwrap() });
        let r = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        let s = r.json::<serde_json::Value>().await.unwrap();
        assert_eq!(s["status"], "ok");
        h.abort();
    }

    #[tokio::test]
    async fn messages_rejects_missing_bearer_token() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let a = app(test_state());
        let h = tokio::spawn(async move { axum::serve(listener, a).await.unwrap() });
        let client = reqwest::Client::new();
        let r = client
            .post(format!("http://{addr}/v1/messages"))
            .json(&json!({"model": "claude-sonnet-4-5-20250929", "messages": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status(), reqwest::StatusCode::UNAUTHORIZED);
        h.abort();
    }

    fn sample_account() -> accounts::Account {
        accounts::Account {
            id: "acc-1".to_string(),
            platform: "anthropic".to_string(),
            name: "a".to_string(),
            status: accounts::AccountStatus::Active,
            schedulable: true,
            priority: 0,
            last_used_at: 0,
            api_key: None,
            endpoints: vec!["https://api.anthropic.com/v1/messages".to_string()],
            max_concurrent_tasks: 5,
            session_id_limit_enabled: false,
            session_id_max_count: 0,
            session_id_window_minutes: 60,
            proxy: None,
            supported_models: vec![],
            cost_multiplier: None,
        }
    }

    fn sample_ctx() -> RequestContext {
        RequestContext::new(
            "req-1".to_string(),
            auth::ApiKey {
                id: "key-1".to_string(),
                key_material: "cr_x".to_string(),
                name: "t".to_string(),
                enabled: true,
                claude_account_id: None,
                total_cost_limit: 0.0,
                daily_cost_limit: 0.0,
                concurrency_limit: 0,
                rate_limit_requests: 0,
                rate_limit_window_secs: 60,
            },
        )
    }

    #[tokio::test]
    async fn delayed_success_is_cached_and_servable() {
        let state = test_state();
        let ctx = sample_ctx();
        let body = json!({"model": "claude-sonnet-4-5-20250929", "messages": []});
        let resp = json!({"id": "msg_1", "usage": {"input_tokens": 1, "output_tokens": 2}});
        let usage = UpstreamUsage { input_tokens: 1, output_tokens: 2, cache_creation_input_tokens: 0, cache_read_input_tokens: 0 };
        let outcome: RelayResult<Attempt> = Ok(Attempt::NonStream(resp.clone(), usage, sample_account()));

        cache_delayed_success(&state, &ctx, &body, &outcome).await;

        let fp = cache::fingerprint(&ctx.api_key.id, &body).unwrap();
        let cached = cache::get(&state.kv, &fp).await.unwrap().unwrap();
        assert_eq!(cached.status, 200);
        let parsed: Value = serde_json::from_str(&cached.body).unwrap();
        assert_eq!(parsed["id"], "msg_1");
    }

    #[tokio::test]
    async fn cache_delayed_success_ignores_error_outcomes() {
        let state = test_state();
        let ctx = sample_ctx();
        let body = json!({"model": "claude-sonnet-4-5-20250929", "messages": []});
        let outcome: RelayResult<Attempt> = Err(RelayError::Auth("nope".to_string()));

        cache_delayed_success(&state, &ctx, &body, &outcome).await;

        let fp = cache::fingerprint(&ctx.api_key.id, &body).unwrap();
        assert!(cache::get(&state.kv, &fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lookup_cached_response_serves_a_prior_hit_without_upstream() {
        let state = test_state();
        let body = json!({"model": "claude-sonnet-4-5-20250929", "messages": []});
        let fp = cache::fingerprint("key-1", &body).unwrap();
        let entry = cache::CachedResponse {
            status: 200,
            headers: Vec::new(),
            body: json!({"id": "msg_cached"}).to_string(),
            usage: Value::Null,
        };
        cache::put(&state.kv, &fp, &entry).await.unwrap();

        let hit = lookup_cached_response(&state, "key-1", &body).await;
        assert!(hit.is_some());

        let miss = lookup_cached_response(&state, "key-2", &body).await;
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn aggregate_stream_to_json_drains_sse_into_a_single_response() {
        let state = test_state();
        let ctx = sample_ctx();
        let account = sample_account();
        accounts::create_account(&state.kv, &account).await.unwrap();
        let guard = concurrency::ConcurrencyGuard::acquire(
            &state.kv,
            &crate::kv::concurrency_key(&account.id),
            account.max_concurrent_tasks,
            "req-1",
        )
        .await
        .unwrap();

        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let chunk = concat!(
            "event: message_start\n",
            "data: {\"message\":{\"id\":\"msg_1\",\"model\":\"claude-sonnet-4-5-20250929\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n",
            "event: message_delta\n",
            "data: {\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":3}}\n\n",
        );
        tx.send(Ok(bytes::Bytes::from(chunk))).await.unwrap();
        drop(tx);

        let response = aggregate_stream_to_json(&state, &ctx, rx, account, "claude-sonnet-4-5-20250929", guard).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").map(|v| v.to_str().unwrap()),
            Some("application/json")
        );
    }

    #[test]
    fn sse_response_from_json_sets_event_stream_content_type() {
        let body = json!({"id": "msg_1", "content": [{"type": "text", "text": "hi"}], "stop_reason": "end_turn"});
        let response = sse_response_from_json(&body);
        assert_eq!(response.headers().get("content-type").map(|v| v.to_str().unwrap()), Some("text/event-stream"));
    }
}
