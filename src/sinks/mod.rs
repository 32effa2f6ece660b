pub mod broker_sink;
pub mod log_sink;
pub mod relational_sink;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::Event;

/// The contract every output implements (spec §4.3). A sink owns whatever
/// background resources it needs (file handles, producers, connection
/// pools) and is responsible for flushing them on `close`.
///
/// Modeled on the port/adapter trait the teacher uses for its storage and
/// notification backends: a small async interface, boxed and stored behind
/// a trait object so the dispatcher can fan out across heterogeneous sinks
/// without knowing their concrete types.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Stable identifier used in logs and metrics labels.
    fn name(&self) -> &'static str;

    /// Acquire whatever resources the sink needs (open files, connect to
    /// brokers/databases). Called once during startup, in configuration
    /// order.
    async fn start(&self) -> Result<()>;

    /// Hand the sink a batch of already-enriched events. Implementations
    /// may buffer internally; callers should not assume the batch has
    /// reached durable storage when this returns.
    async fn enqueue(&self, events: &[Event]) -> Result<()>;

    /// Flush any buffered state and release resources. Called once during
    /// shutdown, in reverse configuration order.
    async fn close(&self) -> Result<()>;
}

pub use broker_sink::BrokerSink;
pub use log_sink::LogSink;
pub use relational_sink::RelationalSink;
