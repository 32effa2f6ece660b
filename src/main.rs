use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info, warn};

use gotrack_gateway::auth::detection::TimingTracker;
use gotrack_gateway::auth::HmacAuthenticator;
use gotrack_gateway::config::Config;
use gotrack_gateway::dispatch::Dispatcher;
use gotrack_gateway::http::state::AppState;
use gotrack_gateway::sinks::{BrokerSink, LogSink, RelationalSink, Sink};
use gotrack_gateway::{http, observability};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    observability::logging::init_logging();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let metrics_handle = if config.metrics_enabled {
        match observability::metrics::init() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "failed to install metrics recorder");
                None
            }
        }
    } else {
        None
    };

    let sinks = build_sinks(&config);
    if sinks.is_empty() {
        warn!("no output sinks configured (OUTPUTS is empty or names no known sink)");
    }
    let dispatcher = Arc::new(Dispatcher::new(sinks));

    if let Err(e) = dispatcher.start_all().await {
        error!(error = %e, "no sink could start; exiting");
        std::process::exit(1);
    }

    let hmac = Arc::new(HmacAuthenticator::new(
        config.hmac_secret.clone(),
        config.hmac_public_key.clone(),
        config.hmac_secret.is_some(),
        config.redact_secrets,
    ));

    if config.forward_destination.is_some() {
        info!(destination = ?config.forward_destination, "reverse proxy mode enabled");
    }
    if config.enable_https {
        // TLS termination is out of this gateway's scope (spec §1): the
        // cert/key paths are accepted as configuration for a deployment's
        // front door (e.g. a sidecar or load balancer) to consume, not
        // enforced by this process's own listener.
        info!(cert = ?config.ssl_cert_file, key = ?config.ssl_key_file, "ENABLE_HTTPS set; TLS termination is expected upstream of this listener");
    }

    let state = AppState {
        config: Arc::new(config.clone()),
        dispatcher: dispatcher.clone(),
        hmac,
        timing: Arc::new(TimingTracker::new()),
        http_client: reqwest::Client::new(),
    };

    let router = http::router::build_router(state);
    let addr: SocketAddr = match config.server_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(addr = %config.server_addr, error = %e, "invalid SERVER_ADDR");
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "failed to bind main listener");
            std::process::exit(1);
        }
    };
    info!(addr = %addr, "gotrack-gateway listening");

    if let Some(handle) = metrics_handle {
        spawn_metrics_server(&config, handle);
    }

    let serve = axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>());
    if let Err(e) = serve.with_graceful_shutdown(shutdown_signal()).await {
        error!(error = %e, "server exited with error");
    }

    dispatcher.close_all().await;
    info!("gotrack-gateway shut down cleanly");
}

/// Builds the sinks named in `OUTPUTS`, skipping any name that isn't one of
/// the three known sink kinds (spec §4.3.1-.3). Order is registration
/// order for the dispatcher's fan-out (spec §4.4).
fn build_sinks(config: &Config) -> Vec<Box<dyn Sink>> {
    let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
    for name in &config.outputs {
        match name.as_str() {
            "log" => sinks.push(Box::new(LogSink::new(config.log_path.clone()))),
            "broker" => sinks.push(Box::new(BrokerSink::new(config.kafka.clone()))),
            "relational" => sinks.push(Box::new(RelationalSink::new(config.relational.clone()))),
            other => warn!(sink = other, "unknown sink name in OUTPUTS, ignoring"),
        }
    }
    sinks
}

/// A minimal second listener exposing the Prometheus text endpoint,
/// mirroring the teacher's separation of its metrics push/serve task from
/// the main request-serving loop. `METRICS_REQUIRE_TLS`/client-CA pinning
/// is accepted as configuration but, like the main listener's TLS, left to
/// a front door upstream of this process.
fn spawn_metrics_server(config: &Config, handle: metrics_exporter_prometheus::PrometheusHandle) {
    let addr = config.metrics_addr.clone();
    tokio::spawn(async move {
        let Ok(socket_addr) = addr.parse::<SocketAddr>() else {
            error!(addr = %addr, "invalid METRICS_ADDR, metrics server not started");
            return;
        };
        let router = axum::Router::new()
            .route("/metrics", axum::routing::get(move || { let handle = handle.clone(); async move { handle.render() } }));
        match tokio::net::TcpListener::bind(socket_addr).await {
            Ok(listener) => {
                info!(addr = %socket_addr, "metrics server listening");
                if let Err(e) = axum::serve(listener, router).await {
                    error!(error = %e, "metrics server exited with error");
                }
            }
            Err(e) => error!(addr = %socket_addr, error = %e, "failed to bind metrics listener"),
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
