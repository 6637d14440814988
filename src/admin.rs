//! Admin HTTP control plane
//!
//! Exposes the impairment state, rule DSL and receipt manager over a small
//! axum surface. Malformed input gets `400`, missing receipts `404`, wrong
//! methods `405`. Connection-level failures never surface here except
//! through receipts.

use std::sync::Arc;

use anyhow::Context;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::info;

use crate::constants::RECEIPT_STREAM_BUFFER;
use crate::impair::{ImpairConfig, ImpairState, Profile};
use crate::inspect::{parse_initial, HelloResult};
use crate::receipts::ReceiptManager;
use crate::rules::{self, RuleSet, SharedRules};

/// Shared handles behind every admin endpoint.
#[derive(Clone)]
pub struct AdminState {
    pub impair: Arc<ImpairState>,
    pub rules: SharedRules,
    pub receipts: Arc<ReceiptManager>,
}

/// Build the admin router.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/impair/status", get(impair_status))
        .route("/impair/clear", post(impair_clear))
        .route("/impair/apply", post(impair_apply))
        .route("/rules", get(rules_list).post(rules_load).delete(rules_clear))
        .route("/rules/test", get(rules_test))
        .route("/receipts", get(receipts_query))
        .route("/receipts/pubkey", get(receipts_pubkey))
        .route("/receipts/verify", get(receipts_verify))
        .route("/receipts/stream", get(receipts_stream))
        .route("/quic/parse_initial", post(quic_parse_initial))
        .with_state(state)
}

/// Bind and serve the admin API until shutdown fires. A bind failure is
/// fatal for the process.
pub async fn serve(
    addr: String,
    state: AdminState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind admin API on {addr}"))?;
    info!(%addr, "admin API listening");
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .context("admin server")
}

async fn healthz() -> &'static str {
    "ok"
}

async fn impair_status(State(st): State<AdminState>) -> Json<ImpairConfig> {
    Json(st.impair.snapshot())
}

async fn impair_clear(State(st): State<AdminState>) -> Json<ImpairConfig> {
    Json(st.impair.apply(ImpairConfig::default()))
}

#[derive(Debug, Default, Deserialize)]
struct ApplyParams {
    profile: Option<String>,
    threshold_bytes: Option<usize>,
    latency_ms: Option<u64>,
    bandwidth_kbps: Option<u64>,
    bandwidth_down_kbps: Option<u64>,
    blackhole_seconds: Option<u64>,
}

/// Apply a full config from a JSON body, or from query parameters for quick
/// curl-driven testing.
async fn impair_apply(
    State(st): State<AdminState>,
    Query(params): Query<ApplyParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let cfg = if is_json(&headers) {
        match serde_json::from_slice::<ImpairConfig>(&body) {
            Ok(cfg) => cfg,
            Err(e) => {
                return (StatusCode::BAD_REQUEST, format!("bad json: {e}")).into_response();
            }
        }
    } else {
        ImpairConfig {
            profile: Profile::from_name(params.profile.as_deref().unwrap_or("")),
            threshold_bytes: params.threshold_bytes.unwrap_or(0),
            latency_ms: params.latency_ms.unwrap_or(0),
            bandwidth_kbps: params.bandwidth_kbps.unwrap_or(0),
            bandwidth_down_kbps: params.bandwidth_down_kbps.unwrap_or(0),
            blackhole_seconds: params.blackhole_seconds.unwrap_or(0),
            ..ImpairConfig::default()
        }
    };
    Json(st.impair.apply(cfg)).into_response()
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"))
}

async fn rules_list(State(st): State<AdminState>) -> Json<serde_json::Value> {
    let set = st.rules.read().expect("ruleset lock poisoned").clone();
    let raws: Vec<String> = set.rules.iter().map(|r| r.raw.clone()).collect();
    Json(json!({ "rules": raws }))
}

/// Replace the whole ruleset from a text/plain body. A parse error on any
/// line rejects the load and leaves the previous set in place.
async fn rules_load(State(st): State<AdminState>, body: String) -> Response {
    match rules::parse(&body) {
        Ok(set) => {
            let loaded = set.rules.len();
            *st.rules.write().expect("ruleset lock poisoned") = Arc::new(set);
            info!(loaded, "ruleset replaced");
            Json(json!({ "loaded": loaded })).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, format!("parse error: {e}")).into_response(),
    }
}

async fn rules_clear(State(st): State<AdminState>) -> StatusCode {
    *st.rules.write().expect("ruleset lock poisoned") = Arc::new(RuleSet::default());
    StatusCode::NO_CONTENT
}

#[derive(Debug, Default, Deserialize)]
struct RuleTestParams {
    ch_bytes: Option<usize>,
    pqc_hint: Option<String>,
    cipher_count: Option<usize>,
    sni: Option<String>,
    alpn: Option<String>,
    ja3: Option<String>,
}

/// Evaluate the current ruleset against synthesized hello metadata.
async fn rules_test(
    State(st): State<AdminState>,
    Query(params): Query<RuleTestParams>,
) -> Json<serde_json::Value> {
    let mut fake = HelloResult::default();
    if let Some(n) = params.ch_bytes {
        fake.handshake_bytes = n;
    }
    if let Some(v) = params.pqc_hint {
        fake.pqc_hint = v == "1" || v == "true";
    }
    if let Some(n) = params.cipher_count {
        fake.cipher_suites = n;
    }
    if let Some(sni) = params.sni {
        fake.sni = sni;
    }
    if let Some(alpn) = params.alpn {
        fake.alpn.push(alpn);
    }
    if let Some(ja3) = params.ja3 {
        fake.ja3 = ja3.to_lowercase();
    }

    let set = st.rules.read().expect("ruleset lock poisoned").clone();
    match set.matches(&fake) {
        Some(profile) => Json(json!({ "matched": true, "profile": profile })),
        None => Json(json!({ "matched": false })),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ReceiptQuery {
    id: Option<u64>,
    limit: Option<usize>,
}

async fn receipts_query(
    State(st): State<AdminState>,
    Query(q): Query<ReceiptQuery>,
) -> Response {
    if let Some(id) = q.id {
        return match st.receipts.get(id) {
            Ok(receipt) => Json(receipt).into_response(),
            Err(_) => (StatusCode::NOT_FOUND, "not found").into_response(),
        };
    }
    Json(json!({ "receipts": st.receipts.list(q.limit.unwrap_or(0)) })).into_response()
}

async fn receipts_pubkey(State(st): State<AdminState>) -> Json<serde_json::Value> {
    Json(json!({ "ed25519_pubkey_hex": st.receipts.public_key_hex() }))
}

async fn receipts_verify(
    State(st): State<AdminState>,
    Query(q): Query<ReceiptQuery>,
) -> Response {
    let Some(id) = q.id else {
        return (StatusCode::BAD_REQUEST, "id required").into_response();
    };
    match st.receipts.get(id) {
        Ok(receipt) => {
            let v = st.receipts.verify(&receipt);
            Json(json!({ "id": id, "hash_ok": v.hash_ok, "sig_ok": v.sig_ok })).into_response()
        }
        Err(_) => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

/// NDJSON stream of every future receipt, one JSON object per line. Client
/// disconnect drops the body, which detaches the subscriber.
async fn receipts_stream(State(st): State<AdminState>) -> Response {
    let lines = st
        .receipts
        .subscribe(RECEIPT_STREAM_BUFFER)
        .map(|receipt| {
            let mut line = serde_json::to_vec(&receipt).unwrap_or_default();
            line.push(b'\n');
            Ok::<_, std::convert::Infallible>(line)
        });
    let mut response = Response::new(Body::from_stream(lines));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Parse a hex-encoded UDP datagram as a QUIC Initial.
async fn quic_parse_initial(body: String) -> Response {
    let hex_str = body.trim();
    if hex_str.is_empty() {
        return (StatusCode::BAD_REQUEST, "hex body required").into_response();
    }
    match hex::decode(hex_str) {
        Ok(datagram) => Json(parse_initial(&datagram)).into_response(),
        Err(_) => (StatusCode::BAD_REQUEST, "bad hex").into_response(),
    }
}
