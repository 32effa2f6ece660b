use std::net::SocketAddr;

use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::assets;
use crate::enrich::{enrich, RequestContext};
use crate::error::ApiError;
use crate::http::state::AppState;
use crate::model::CollectBody;
use crate::observability::metrics;

fn collect_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), value.to_str().unwrap_or("").to_string()))
        .collect()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.dispatcher.all_healthy() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// `GET|HEAD /px.gif` (spec §4.5). Dispatches a synthetic `"pageview"` event
/// enriched from the request before responding with the fixed 1×1 GIF;
/// `axum`'s router strips the body for HEAD automatically.
pub async fn pixel_gif(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    let mut event = crate::model::Event {
        event_type: Some("pageview".to_string()),
        ..Default::default()
    };
    let header_pairs = collect_headers(&headers);
    let ctx = RequestContext {
        headers: &header_pairs,
        raw_query: query.as_deref(),
        peer_addr: &addr.to_string(),
        forwarded_for: header_str(&headers, "x-forwarded-for"),
        body: &[],
    };
    enrich(&mut event, &ctx, &state.config, &state.timing);
    state.dispatcher.emit(std::slice::from_ref(&event)).await;

    (
        StatusCode::OK,
        [("content-type", "image/gif"), ("cache-control", "no-store")],
        assets::TRANSPARENT_PIXEL_GIF,
    )
}

/// `GET /hmac/public-key` (spec §4.5). 404 when HMAC is not configured;
/// otherwise a one-hour-cacheable JSON document — the public key is the
/// same for every requester, unlike the IP-specific `/hmac.js`.
pub async fn hmac_public_key(State(state): State<AppState>) -> Response {
    if !state.hmac.is_configured() {
        return ApiError::NotFound.into_response();
    }
    let body = serde_json::json!({
        "public_key": state.hmac.public_key_base64(),
        "algorithm": "HMAC-SHA256",
        "header": crate::auth::hmac_auth::HMAC_HEADER,
    });
    (
        StatusCode::OK,
        [("content-type", "application/json"), ("cache-control", "public, max-age=3600")],
        body.to_string(),
    )
        .into_response()
}

pub async fn hmac_js(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if !state.hmac.is_configured() {
        return ApiError::NotFound.into_response();
    }
    let client_ip = client_addr(&state, &headers, &addr.to_string());
    (
        StatusCode::OK,
        [("content-type", "application/javascript"), ("cache-control", "no-store")],
        state.hmac.client_script_for_request(&client_ip),
    )
        .into_response()
}

macro_rules! static_asset_handler {
    ($name:ident, $content:expr) => {
        pub async fn $name() -> impl IntoResponse {
            (
                StatusCode::OK,
                [("content-type", "application/javascript"), ("cache-control", "public, max-age=3600")],
                $content,
            )
        }
    };
}

static_asset_handler!(pixel_js, assets::PIXEL_JS);
static_asset_handler!(pixel_umd_js, assets::PIXEL_UMD_JS);
static_asset_handler!(pixel_esm_js, assets::PIXEL_ESM_JS);

/// Client-IP resolution shared with `crate::enrich::resolve_client_ip` so the
/// address used to derive/verify an HMAC signature is identical to the one
/// enrichment stamps onto `server.ip`.
fn client_addr(state: &AppState, headers: &HeaderMap, peer: &str) -> String {
    let header_pairs = collect_headers(headers);
    let ctx = crate::enrich::RequestContext {
        headers: &header_pairs,
        raw_query: None,
        peer_addr: peer,
        forwarded_for: header_str(headers, "x-forwarded-for"),
        body: &[],
    };
    crate::enrich::resolve_client_ip(&ctx, &state.config)
}

/// `POST /collect` (spec §4.5). Steps: content-type check, body-size check,
/// JSON parse (single object or array), optional HMAC verification,
/// enrichment, dispatch, 202 with the accepted count.
pub async fn collect(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    collect_events(&state, &headers, &addr.to_string(), query.as_deref(), body).await
}

/// The body of `/collect`, factored out so the stealth-ingestion path in
/// `crate::proxy` (an arbitrary-path POST carrying the HMAC header) can
/// share it without going through axum's extractor-based routing.
pub async fn collect_events(
    state: &AppState,
    headers: &HeaderMap,
    peer_addr: &str,
    raw_query: Option<&str>,
    body: Bytes,
) -> Result<Response, ApiError> {
    metrics::ingest::request_received();

    if let Some(content_type) = header_str(headers, "content-type") {
        if !content_type.to_ascii_lowercase().contains("application/json") {
            metrics::ingest::rejected("content_type");
            return Err(ApiError::UnsupportedMediaType);
        }
    }

    if body.len() > state.config.max_body_bytes {
        metrics::ingest::rejected("body_too_large");
        return Err(ApiError::BodyTooLarge);
    }

    let client_ip = client_addr(state, headers, peer_addr);

    if state.config.hmac_required() {
        let signature = header_str(headers, "x-gotrack-hmac");
        if state.hmac.verify(&client_ip, signature, &body) {
            metrics::hmac::verify_success();
        } else {
            metrics::hmac::verify_failure();
            metrics::ingest::rejected("hmac");
            return Err(ApiError::Unauthorized);
        }
    }

    let parsed = CollectBody::parse(&body).map_err(|_| {
        metrics::ingest::rejected("malformed_json");
        ApiError::MalformedJson
    })?;
    let mut events = parsed.into_events();

    if state.config.dnt_enabled && header_str(headers, "dnt") == Some("1") {
        metrics::ingest::rejected("dnt");
        return Ok((
            StatusCode::ACCEPTED,
            [("content-type", "application/json"), ("x-accepted-count", "0")],
            r#"{"accepted":0,"status":"ok"}"#,
        )
            .into_response());
    }

    let header_pairs = collect_headers(headers);
    let ctx = RequestContext {
        headers: &header_pairs,
        raw_query,
        peer_addr,
        forwarded_for: header_str(headers, "x-forwarded-for"),
        body: &body,
    };
    for event in &mut events {
        enrich(event, &ctx, &state.config, &state.timing);
    }

    metrics::ingest::events_accepted(events.len() as u64);
    state.dispatcher.emit(&events).await;

    let accepted = events.len();
    let accepted_count_header = accepted.to_string();
    Ok((
        StatusCode::ACCEPTED,
        [
            ("content-type", "application/json"),
            ("x-accepted-count", accepted_count_header.as_str()),
        ],
        format!(r#"{{"accepted":{accepted},"status":"ok"}}"#),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_addr_falls_back_to_peer_when_proxy_not_trusted() {
        let state = test_state(false);
        let headers = HeaderMap::new();
        assert_eq!(client_addr(&state, &headers, "9.9.9.9:1"), "9.9.9.9");
    }

    fn test_state(trust_proxy: bool) -> AppState {
        use crate::auth::HmacAuthenticator;
        use crate::auth::detection::TimingTracker;
        use crate::config::{Config, KafkaConfig, RelationalConfig};
        use crate::dispatch::Dispatcher;
        use std::sync::Arc;

        let config = Config {
            server_addr: "0.0.0.0:8080".to_string(),
            outputs: vec![],
            trust_proxy,
            max_body_bytes: 1024,
            forward_destination: None,
            hmac_secret: None,
            hmac_public_key: None,
            redact_secrets: true,
            dnt_enabled: false,
            log_path: "stdout".to_string(),
            kafka: KafkaConfig::default(),
            relational: RelationalConfig::default(),
            enable_https: false,
            ssl_cert_file: None,
            ssl_key_file: None,
            metrics_enabled: false,
            metrics_addr: "0.0.0.0:9090".to_string(),
            metrics_tls_cert: None,
            metrics_tls_key: None,
            metrics_client_ca: None,
            metrics_require_tls: false,
        };

        AppState {
            config: Arc::new(config),
            dispatcher: Arc::new(Dispatcher::new(vec![])),
            hmac: Arc::new(HmacAuthenticator::new(None, None, false, true)),
            timing: Arc::new(TimingTracker::new()),
            http_client: reqwest::Client::new(),
        }
    }
}
