use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{error, warn};

use crate::error::{GatewayError, Result};
use crate::model::Event;
use crate::observability::metrics;
use crate::sinks::Sink;

struct SinkEntry {
    sink: Box<dyn Sink>,
    healthy: AtomicBool,
}

/// Fans an accepted batch of events out to every configured sink, in
/// registration order (spec §4.4). A single sink's failure is logged and
/// counted but never aborts delivery to the sinks after it — `OUTPUTS` is a
/// fan-out list, not a pipeline.
///
/// A sink that fails `start` is marked unhealthy and skipped by every
/// subsequent `emit` for the life of the process (spec §4.3: a failed
/// `start` is fatal for that sink, not for the gateway).
pub struct Dispatcher {
    sinks: Vec<SinkEntry>,
}

impl Dispatcher {
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        Self {
            sinks: sinks
                .into_iter()
                .map(|sink| SinkEntry {
                    sink,
                    healthy: AtomicBool::new(false),
                })
                .collect(),
        }
    }

    /// Starts every configured sink. Per-sink failures are logged and leave
    /// that sink unhealthy rather than aborting the whole process; only
    /// when *no* sink could start (and at least one was configured) does
    /// this return an error, which the caller treats as fatal.
    pub async fn start_all(&self) -> Result<()> {
        for entry in &self.sinks {
            match entry.sink.start().await {
                Ok(()) => entry.healthy.store(true, Ordering::SeqCst),
                Err(e) => {
                    error!(sink = entry.sink.name(), error = %e, "sink failed to start");
                    entry.healthy.store(false, Ordering::SeqCst);
                }
            }
        }
        if !self.sinks.is_empty() && !self.sinks.iter().any(|e| e.healthy.load(Ordering::SeqCst)) {
            return Err(GatewayError::SinkStart {
                sink: "all".to_string(),
                message: "no configured sink could start".to_string(),
            });
        }
        Ok(())
    }

    pub async fn close_all(&self) {
        for entry in self.sinks.iter().rev() {
            if let Err(e) = entry.sink.close().await {
                error!(sink = entry.sink.name(), error = %e, "sink failed to close cleanly");
            }
        }
    }

    /// `true` once every configured sink has reported healthy at startup
    /// (spec §4.5 `/readyz`). Vacuously true when no sinks are configured.
    pub fn all_healthy(&self) -> bool {
        self.sinks.iter().all(|e| e.healthy.load(Ordering::SeqCst))
    }

    /// Synchronous from the handler's perspective: this returns only after
    /// every sink has been offered the batch, so a 200 response means every
    /// enabled sink accepted it (or the failure was already logged).
    pub async fn emit(&self, events: &[Event]) {
        if events.is_empty() || self.sinks.is_empty() {
            return;
        }
        let start = Instant::now();
        for entry in &self.sinks {
            if !entry.healthy.load(Ordering::SeqCst) {
                continue;
            }
            let sink = &entry.sink;
            match sink.enqueue(events).await {
                Ok(()) => metrics::dispatch::sink_success(sink.name()),
                Err(e) => {
                    metrics::dispatch::sink_error(sink.name());
                    warn!(sink = sink.name(), error = %e, events = events.len(), "sink enqueue failed");
                }
            }
        }
        metrics::dispatch::duration(start.elapsed().as_secs_f64());
    }
}
