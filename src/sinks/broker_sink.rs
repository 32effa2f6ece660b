use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord};
use tokio::sync::{mpsc, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::config::KafkaConfig;
use crate::error::{GatewayError, Result};
use crate::model::Event;
use crate::observability::metrics;
use crate::sinks::Sink;

struct State {
    producer: FutureProducer,
    report_tx: Mutex<Option<mpsc::UnboundedSender<DeliveryFuture>>>,
    drainer: Mutex<Option<JoinHandle<()>>>,
}

/// Kafka/compatible broker sink (spec §4.3.2). `enqueue` only hands records
/// to librdkafka's internal queue and returns; a background task drains the
/// resulting delivery-report futures so a slow broker round trip never blocks
/// the dispatcher's synchronous fan-out.
pub struct BrokerSink {
    config: KafkaConfig,
    state: OnceCell<Arc<State>>,
}

impl BrokerSink {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            state: OnceCell::new(),
        }
    }

    fn build_producer(&self) -> Result<FutureProducer> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", self.config.brokers.join(","))
            .set("acks", &self.config.acks)
            .set("compression.type", &self.config.compression)
            .set("message.timeout.ms", "30000");

        if let Some(mechanism) = &self.config.sasl_mechanism {
            client_config.set("security.protocol", "SASL_SSL").set("sasl.mechanism", mechanism);
            if let Some(user) = &self.config.sasl_user {
                client_config.set("sasl.username", user);
            }
            if let Some(password) = &self.config.sasl_password {
                client_config.set("sasl.password", password);
            }
        }
        if let Some(ca) = &self.config.tls_ca {
            client_config.set("ssl.ca.location", ca);
        }
        if self.config.tls_skip_verify {
            client_config.set("enable.ssl.certificate.verification", "false");
        }

        client_config.create().map_err(|e| GatewayError::SinkStart {
            sink: self.name().to_string(),
            message: e.to_string(),
        })
    }
}

/// Drains delivery-report futures as librdkafka resolves them, logging and
/// counting failures. Exits once `rx` is closed and drained — `close()`
/// drops the sender to signal this, then awaits the task's `JoinHandle`.
async fn drain_delivery_reports(mut rx: mpsc::UnboundedReceiver<DeliveryFuture>, sink_name: &'static str) {
    while let Some(delivery) = rx.recv().await {
        match delivery.await {
            Ok(Ok(_)) => metrics::dispatch::sink_success(sink_name),
            Ok(Err((err, _))) => {
                metrics::dispatch::sink_error(sink_name);
                warn!(sink = sink_name, error = %err, "broker delivery failed");
            }
            Err(_) => {
                metrics::dispatch::sink_error(sink_name);
                warn!(sink = sink_name, "broker delivery future canceled");
            }
        }
    }
}

#[async_trait]
impl Sink for BrokerSink {
    fn name(&self) -> &'static str {
        "broker"
    }

    async fn start(&self) -> Result<()> {
        if self.config.brokers.is_empty() {
            return Err(GatewayError::SinkStart {
                sink: self.name().to_string(),
                message: "no brokers configured".to_string(),
            });
        }
        let producer = self.build_producer()?;
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let drainer = tokio::spawn(drain_delivery_reports(report_rx, self.name()));

        let state = Arc::new(State {
            producer,
            report_tx: Mutex::new(Some(report_tx)),
            drainer: Mutex::new(Some(drainer)),
        });

        self.state.set(state).map_err(|_| GatewayError::SinkStart {
            sink: self.name().to_string(),
            message: "started more than once".to_string(),
        })
    }

    async fn enqueue(&self, events: &[Event]) -> Result<()> {
        let state = self.state.get().ok_or_else(|| GatewayError::SinkEnqueue {
            sink: self.name().to_string(),
            message: "sink used before start()".to_string(),
        })?;

        for event in events {
            let payload = serde_json::to_vec(event)?;
            let key = event.event_id.clone().unwrap_or_default();
            let event_type = event.event_type.clone().unwrap_or_default();
            // Spec §6 broker wire format: `event_type` mirrors the event's
            // `type`, `schema` pins the payload shape for downstream consumers.
            let headers = OwnedHeaders::new()
                .insert(Header {
                    key: "event_type",
                    value: Some(event_type.as_str()),
                })
                .insert(Header {
                    key: "schema",
                    value: Some("v1"),
                });
            let record = FutureRecord::to(&self.config.topic)
                .key(&key)
                .payload(&payload)
                .headers(headers);

            match state.producer.send_result(record) {
                Ok(delivery) => {
                    let tx = state.report_tx.lock().await;
                    if let Some(tx) = tx.as_ref() {
                        let _ = tx.send(delivery);
                    }
                }
                Err((err, _)) => {
                    metrics::dispatch::sink_error(self.name());
                    warn!(sink = self.name(), error = %err, "broker enqueue failed");
                    return Err(GatewayError::SinkEnqueue {
                        sink: self.name().to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let Some(state) = self.state.get() else {
            return Ok(());
        };
        // Wait for librdkafka to finish sending what's already queued, then
        // drop the sender to signal the drainer and await it draining the
        // delivery reports those sends produced.
        if let Err(e) = state.producer.flush(Duration::from_secs(10)) {
            error!(sink = self.name(), error = %e, "flush on shutdown failed");
        }
        state.report_tx.lock().await.take();
        if let Some(handle) = state.drainer.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_without_brokers_is_an_error() {
        let sink = BrokerSink::new(KafkaConfig {
            brokers: vec![],
            topic: "events".to_string(),
            acks: "all".to_string(),
            compression: "none".to_string(),
            sasl_mechanism: None,
            sasl_user: None,
            sasl_password: None,
            tls_ca: None,
            tls_skip_verify: false,
        });
        let err = sink.start().await.unwrap_err();
        assert!(matches!(err, GatewayError::SinkStart { .. }));
    }

    #[tokio::test]
    async fn enqueue_before_start_is_an_error() {
        let sink = BrokerSink::new(KafkaConfig {
            brokers: vec!["localhost:9092".to_string()],
            topic: "events".to_string(),
            acks: "all".to_string(),
            compression: "none".to_string(),
            sasl_mechanism: None,
            sasl_user: None,
            sasl_password: None,
            tls_ca: None,
            tls_skip_verify: false,
        });
        let err = sink.enqueue(&[Event::default()]).await.unwrap_err();
        assert!(matches!(err, GatewayError::SinkEnqueue { .. }));
    }

    #[tokio::test]
    async fn close_without_start_is_a_noop() {
        let sink = BrokerSink::new(KafkaConfig {
            brokers: vec!["localhost:9092".to_string()],
            topic: "events".to_string(),
            acks: "all".to_string(),
            compression: "none".to_string(),
            sasl_mechanism: None,
            sasl_user: None,
            sasl_password: None,
            tls_ca: None,
            tls_skip_verify: false,
        });
        assert!(sink.close().await.is_ok());
    }
}
