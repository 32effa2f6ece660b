//! Prometheus metrics for the gateway.
//!
//! Mirrors the teacher's metric-catalog pattern (a name enum plus thin
//! recording wrappers per subsystem) but scoped to what this gateway does:
//! ingest, dispatch to sinks, HMAC verification, and the reverse proxy.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    IngestRequestsTotal,
    IngestAcceptedEventsTotal,
    IngestRejectedTotal,
    DispatchDurationSeconds,
    SinkEnqueueSuccessTotal,
    SinkEnqueueErrorTotal,
    HmacVerifySuccessTotal,
    HmacVerifyFailureTotal,
    ProxyRequestsTotal,
    ProxyErrorsTotal,
    ProxyDurationSeconds,
    HtmlRewriteTotal,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::IngestRequestsTotal => "gotrack_ingest_requests_total",
            MetricName::IngestAcceptedEventsTotal => "gotrack_ingest_accepted_events_total",
            MetricName::IngestRejectedTotal => "gotrack_ingest_rejected_total",
            MetricName::DispatchDurationSeconds => "gotrack_dispatch_duration_seconds",
            MetricName::SinkEnqueueSuccessTotal => "gotrack_sink_enqueue_success_total",
            MetricName::SinkEnqueueErrorTotal => "gotrack_sink_enqueue_error_total",
            MetricName::HmacVerifySuccessTotal => "gotrack_hmac_verify_success_total",
            MetricName::HmacVerifyFailureTotal => "gotrack_hmac_verify_failure_total",
            MetricName::ProxyRequestsTotal => "gotrack_proxy_requests_total",
            MetricName::ProxyErrorsTotal => "gotrack_proxy_errors_total",
            MetricName::ProxyDurationSeconds => "gotrack_proxy_duration_seconds",
            MetricName::HtmlRewriteTotal => "gotrack_html_rewrite_total",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Install the global Prometheus recorder. Call once at startup.
pub fn init() -> Result<metrics_exporter_prometheus::PrometheusHandle, Box<dyn std::error::Error>> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

pub mod ingest {
    use super::MetricName;

    pub fn request_received() {
        ::metrics::counter!(MetricName::IngestRequestsTotal.as_str()).increment(1);
    }

    pub fn events_accepted(n: u64) {
        ::metrics::counter!(MetricName::IngestAcceptedEventsTotal.as_str()).increment(n);
    }

    pub fn rejected(reason: &'static str) {
        ::metrics::counter!(MetricName::IngestRejectedTotal.as_str(), "reason" => reason).increment(1);
    }
}

pub mod dispatch {
    use super::MetricName;

    pub fn duration(secs: f64) {
        ::metrics::histogram!(MetricName::DispatchDurationSeconds.as_str()).record(secs);
    }

    pub fn sink_success(sink: &str) {
        ::metrics::counter!(MetricName::SinkEnqueueSuccessTotal.as_str(), "sink" => sink.to_string()).increment(1);
    }

    pub fn sink_error(sink: &str) {
        ::metrics::counter!(MetricName::SinkEnqueueErrorTotal.as_str(), "sink" => sink.to_string()).increment(1);
    }
}

pub mod hmac {
    use super::MetricName;

    pub fn verify_success() {
        ::metrics::counter!(MetricName::HmacVerifySuccessTotal.as_str()).increment(1);
    }

    pub fn verify_failure() {
        ::metrics::counter!(MetricName::HmacVerifyFailureTotal.as_str()).increment(1);
    }
}

pub mod proxy {
    use super::MetricName;

    pub fn request() {
        ::metrics::counter!(MetricName::ProxyRequestsTotal.as_str()).increment(1);
    }

    pub fn error() {
        ::metrics::counter!(MetricName::ProxyErrorsTotal.as_str()).increment(1);
    }

    pub fn duration(secs: f64) {
        ::metrics::histogram!(MetricName::ProxyDurationSeconds.as_str()).record(secs);
    }

    pub fn html_rewritten() {
        ::metrics::counter!(MetricName::HtmlRewriteTotal.as_str()).increment(1);
    }
}
