use std::sync::Arc;

use crate::auth::detection::TimingTracker;
use crate::auth::HmacAuthenticator;
use crate::config::Config;
use crate::dispatch::Dispatcher;

/// Shared, immutable application state handed to every handler via axum's
/// `State` extractor. Everything behind the `Arc` is safe to clone cheaply
/// per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    pub hmac: Arc<HmacAuthenticator>,
    pub timing: Arc<TimingTracker>,
    pub http_client: reqwest::Client,
}
