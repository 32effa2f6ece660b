//! Transparent reverse proxy with HTML rewriting (spec §4.6). Activated
//! only when `FORWARD_DESTINATION` is configured: everything that isn't a
//! tracking-surface path or a stealth-ingestion POST is forwarded verbatim
//! to the configured origin, with HTML responses rewritten in place to
//! embed the tracking script and pixel.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use once_cell::sync::Lazy;
use regex::RegexBuilder;
use std::io::Read;
use tracing::warn;

use crate::auth::hmac_auth::HMAC_HEADER;
use crate::http::handlers::collect_events;
use crate::http::state::AppState;
use crate::observability::metrics;

/// Paths that always belong to the tracking surface regardless of proxy
/// mode, checked before the stealth-ingestion rule (spec §4.6 step 1).
const TRACKING_ALLOW_LIST: &[&str] = &[
    "/px.gif",
    "/collect",
    "/healthz",
    "/readyz",
    "/metrics",
    "/hmac.js",
    "/hmac/public-key",
    "/pixel.js",
    "/pixel.umd.js",
    "/pixel.esm.js",
];

const PROXY_REQUEST_TIMEOUT: Duration = Duration::from_secs(25);

/// Proxy pass-through bodies aren't bounded by `max_body_bytes` (that cap
/// is specific to the ingestion path's untrusted client payloads); this is
/// just a backstop against an origin streaming an unbounded response.
const PROXY_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

static BODY_CLOSE_RE: Lazy<regex::Regex> =
    Lazy::new(|| RegexBuilder::new(r"</body>").case_insensitive(true).build().unwrap());
static HTML_CLOSE_RE: Lazy<regex::Regex> =
    Lazy::new(|| RegexBuilder::new(r"</html>").case_insensitive(true).build().unwrap());

fn is_html_content_type(content_type: &str) -> bool {
    let base = content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    matches!(base.as_str(), "text/html" | "application/xhtml+xml" | "application/xhtml")
}

/// The fallback handler mounted when proxy mode is enabled. Implements the
/// routing rule of spec §4.6: tracking-allow-list paths are already bound
/// to their own routes above this fallback, so reaching here means either
/// stealth ingestion (step 2) or a genuine proxy pass-through (step 3).
pub async fn fallback(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let path = req.uri().path();
    if TRACKING_ALLOW_LIST.iter().any(|p| *p == path) {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }

    let is_stealth = req.method() == Method::POST && req.headers().contains_key(HMAC_HEADER);
    if is_stealth {
        let (parts, body) = req.into_parts();
        let query = parts.uri.query().map(|q| q.to_string());
        let bytes = match axum::body::to_bytes(body, state.config.max_body_bytes + 1).await {
            Ok(b) => b,
            Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response(),
        };
        return collect_events(&state, &parts.headers, &addr.to_string(), query.as_deref(), bytes)
            .await
            .into_response();
    }

    proxy_request(&state, addr, req).await.into_response()
}

/// Forward `req` to the configured origin, rewriting HTML bodies on the
/// way back (spec §4.6). Returns 502 on any transport-level failure.
async fn proxy_request(state: &AppState, addr: SocketAddr, req: Request<Body>) -> Response {
    let Some(destination) = &state.config.forward_destination else {
        return (StatusCode::BAD_GATEWAY, "proxy not configured").into_response();
    };

    metrics::proxy::request();
    let start = Instant::now();

    let (parts, body) = req.into_parts();
    let original_path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_default();
    let upstream_url = match build_upstream_url(destination, &parts.uri) {
        Some(url) => url,
        None => {
            metrics::proxy::error();
            return (StatusCode::BAD_GATEWAY, "invalid upstream destination").into_response();
        }
    };

    let body_bytes = match axum::body::to_bytes(body, PROXY_MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response(),
    };

    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
    let mut upstream_req = state.http_client.request(method, &upstream_url).body(body_bytes.to_vec());

    for (name, value) in parts.headers.iter() {
        if name == axum::http::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            upstream_req = upstream_req.header(name.as_str(), v);
        }
    }
    if let Some(host) = host_of(&upstream_url) {
        upstream_req = upstream_req.header("host", host);
    }
    upstream_req = upstream_req.header("x-forwarded-for", addr.ip().to_string());

    let upstream_response = match upstream_req.timeout(PROXY_REQUEST_TIMEOUT).send().await {
        Ok(resp) => resp,
        Err(e) => {
            metrics::proxy::error();
            warn!(error = %e, url = %upstream_url, "upstream proxy request failed");
            return (StatusCode::BAD_GATEWAY, "upstream request failed").into_response();
        }
    };

    metrics::proxy::duration(start.elapsed().as_secs_f64());
    build_client_response(state, upstream_response, &original_path_and_query).await
}

fn build_upstream_url(destination: &str, uri: &axum::http::Uri) -> Option<String> {
    let base = destination.trim_end_matches('/');
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Some(format!("{base}{path_and_query}"))
}

fn host_of(url: &str) -> Option<String> {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest)?;
    let host_port = without_scheme.split(['/', '?', '#']).next()?;
    Some(host_port.to_string())
}

async fn build_client_response(state: &AppState, upstream: reqwest::Response, original_path_and_query: &str) -> Response {
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let is_gzipped = upstream
        .headers()
        .get(reqwest::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false);

    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers().iter() {
        if matches!(
            name.as_str(),
            "content-length" | "transfer-encoding" | "connection"
        ) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response_headers.insert(name, value);
        }
    }

    if !is_html_content_type(&content_type) {
        let body = match upstream.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed reading non-html upstream body");
                return (StatusCode::BAD_GATEWAY, "upstream request failed").into_response();
            }
        };
        return (status, response_headers, body).into_response();
    }

    let raw_body = match upstream.bytes().await {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "failed reading html upstream body");
            return (StatusCode::BAD_GATEWAY, "upstream request failed").into_response();
        }
    };

    let decompressed = if is_gzipped {
        match gunzip(&raw_body) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to gunzip upstream html body");
                raw_body.to_vec()
            }
        }
    } else {
        raw_body.to_vec()
    };

    let injection = injection_payload(state, original_path_and_query);
    let rewritten = inject_before_close(&decompressed, &injection);
    metrics::proxy::html_rewritten();

    let final_body = if is_gzipped {
        match gzip(&rewritten) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to re-gzip rewritten html body");
                rewritten
            }
        }
    } else {
        rewritten
    };

    response_headers.insert("content-length", HeaderValue::from_str(&final_body.len().to_string()).unwrap());
    (status, response_headers, final_body).into_response()
}

/// Builds the script(s) + pixel `<img>` to inject before the body closes.
/// `original_path_and_query` feeds the pixel's `url=` parameter so the
/// auto-injected pageview can still be attributed to the proxied page.
fn injection_payload(state: &AppState, original_path_and_query: &str) -> String {
    let encoded = percent_encode(original_path_and_query);
    let pixel_img = format!(r#"<img src="/px.gif?e=pageview&amp;auto=1&amp;url={encoded}" width="1" height="1" style="display:none" alt="" />"#);
    let pixel_lib = format!("<script>{}</script>", crate::assets::PIXEL_JS);

    if state.hmac.is_configured() {
        format!(r#"<script src="/hmac.js"></script>{pixel_lib}{pixel_img}"#)
    } else {
        format!("{pixel_lib}{pixel_img}")
    }
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Inserts `injection` immediately before the first case-insensitive
/// `</body>`; failing that, before the first `</html>`; failing that,
/// appends it (spec §4.6 step 4).
fn inject_before_close(body: &[u8], injection: &str) -> Vec<u8> {
    let text = String::from_utf8_lossy(body);
    if let Some(m) = BODY_CLOSE_RE.find(&text) {
        let mut out = String::with_capacity(text.len() + injection.len());
        out.push_str(&text[..m.start()]);
        out.push_str(injection);
        out.push_str("</body>");
        out.push_str(&text[m.end()..]);
        return out.into_bytes();
    }
    if let Some(m) = HTML_CLOSE_RE.find(&text) {
        let mut out = String::with_capacity(text.len() + injection.len());
        out.push_str(&text[..m.start()]);
        out.push_str(injection);
        out.push_str("</html>");
        out.push_str(&text[m.end()..]);
        return out.into_bytes();
    }
    let mut out = text.into_owned();
    out.push_str(injection);
    out.into_bytes()
}

fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(bytes, Compression::default());
    let mut out = Vec::new();
    encoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_before_lowercase_body_close() {
        let body = b"<html><body>hi</body></html>";
        let out = inject_before_close(body, "<X/>");
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "<html><body>hi<X/></body></html>");
    }

    #[test]
    fn injects_before_uppercase_body_close() {
        let body = b"<HTML><BODY>hi</BODY></HTML>";
        let out = inject_before_close(body, "<X/>");
        let text = String::from_utf8(out).unwrap();
        // The matcher is case-insensitive, but the spliced-in closing tag is
        // always lower-cased (spec §4.6 step 4), regardless of how the
        // source document cased it.
        assert_eq!(text, "<HTML><BODY>hi<X/></body></HTML>");
    }

    #[test]
    fn falls_back_to_html_close_when_no_body_tag() {
        let body = b"<html>hi</html>";
        let out = inject_before_close(body, "<X/>");
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "<html>hi<X/></html>");
    }

    #[test]
    fn appends_when_neither_tag_present() {
        let body = b"hello world";
        let out = inject_before_close(body, "<X/>");
        assert_eq!(out, b"hello world<X/>");
    }

    #[test]
    fn is_html_content_type_matches_known_variants() {
        assert!(is_html_content_type("text/html; charset=utf-8"));
        assert!(is_html_content_type("application/xhtml+xml"));
        assert!(!is_html_content_type("application/json"));
    }

    #[test]
    fn gzip_round_trips() {
        let original = b"<html><body>hello</body></html>".to_vec();
        let compressed = gzip(&original).unwrap();
        let decompressed = gunzip(&compressed).unwrap();
        assert_eq!(decompressed, original);
    }

    #[test]
    fn percent_encode_escapes_reserved_characters() {
        assert_eq!(percent_encode("/a b"), "%2Fa%20b");
    }
}
