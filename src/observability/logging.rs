use std::fs;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes the logging system with console output and daily-rotated
/// JSON file output under `logs/`.
pub fn init_logging() {
    let _ = fs::create_dir_all("logs");

    let file_appender = tracing_appender::rolling::daily("logs", "gotrack-gateway.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);
    let console_layer = fmt::layer().with_writer(std::io::stdout);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("gotrack_gateway=info".parse().unwrap()))
        .with(file_layer)
        .with(console_layer)
        .init();

    // Keep the non-blocking writer's flush guard alive for the process lifetime.
    std::mem::forget(guard);
}
