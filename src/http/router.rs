use axum::extract::Request;
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::http::state::AppState;
use crate::proxy;

/// `CorsLayer` answers preflights with its own default `200 OK`; spec §4.7
/// requires `204`. Wraps the CORS layer so it sees the preflight response
/// tower-http generates (which never reaches the route handlers) and
/// rewrites the status before it goes out.
async fn normalize_preflight_status(req: Request, next: Next) -> Response {
    let is_options = req.method() == Method::OPTIONS;
    let mut response = next.run(req).await;
    if is_options {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

/// Assembles the gateway's route table and middleware stack (spec §4.7).
/// Middleware order: request tracing, then the preflight-status rewrite,
/// then CORS, then the route multiplexer — tracing wraps everything so even
/// CORS preflights and rejected requests are logged, and the rewrite sits
/// between tracing and CORS so it sees the preflight response CORS
/// generates before it goes out.
///
/// When `forward_destination` is configured, a fallback is mounted that
/// implements the routing rule of spec §4.6: anything not matched by the
/// tracking routes above is either stealth ingestion or a pass-through
/// proxy request (`crate::proxy::fallback` makes that distinction).
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE, "dnt".parse().unwrap()]);

    let has_proxy = state.config.forward_destination.is_some();

    let mut router = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/px.gif", get(handlers::pixel_gif).head(handlers::pixel_gif))
        .route("/collect", post(handlers::collect))
        .route("/hmac/public-key", get(handlers::hmac_public_key))
        .route("/hmac.js", get(handlers::hmac_js))
        .route("/pixel.js", get(handlers::pixel_js).head(handlers::pixel_js))
        .route("/pixel.umd.js", get(handlers::pixel_umd_js).head(handlers::pixel_umd_js))
        .route("/pixel.esm.js", get(handlers::pixel_esm_js).head(handlers::pixel_esm_js));

    if has_proxy {
        router = router.fallback(proxy::fallback);
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(normalize_preflight_status))
                .layer(cors),
        )
        .with_state(state)
}
