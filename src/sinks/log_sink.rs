use std::fs::{File, OpenOptions};
use std::io::Write;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{GatewayError, Result};
use crate::model::Event;
use crate::sinks::Sink;

/// Sentinel path value meaning "write to stdout instead of a file."
const STDOUT_SENTINEL: &str = "stdout";

enum Target {
    Stdout,
    File(Mutex<Option<File>>),
}

/// Append-only newline-delimited-JSON sink (spec §4.3.1). The simplest
/// output: every enqueued event is serialized and appended, one line per
/// event, with no batching or background task.
pub struct LogSink {
    path: String,
    target: Target,
}

impl LogSink {
    pub fn new(path: String) -> Self {
        let target = if path == STDOUT_SENTINEL {
            Target::Stdout
        } else {
            Target::File(Mutex::new(None))
        };
        Self { path, target }
    }
}

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn start(&self) -> Result<()> {
        if let Target::File(slot) = &self.target {
            let file = open_owner_only(&self.path)?;
            *slot.lock().await = Some(file);
        }
        Ok(())
    }

    async fn enqueue(&self, events: &[Event]) -> Result<()> {
        let mut buf = String::new();
        for event in events {
            buf.push_str(&serde_json::to_string(event)?);
            buf.push('\n');
        }

        match &self.target {
            Target::Stdout => {
                print!("{buf}");
                std::io::stdout().flush().ok();
            }
            Target::File(slot) => {
                let mut guard = slot.lock().await;
                let file = guard
                    .as_mut()
                    .ok_or_else(|| GatewayError::SinkEnqueue {
                        sink: self.name().to_string(),
                        message: "sink used before start()".to_string(),
                    })?;
                file.write_all(buf.as_bytes())?;
                file.flush()?;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Target::File(slot) = &self.target {
            if let Some(file) = slot.lock().await.as_mut() {
                file.flush()?;
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn open_owner_only(path: &str) -> Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
        .map_err(GatewayError::Io)
}

#[cfg(not(unix))]
fn open_owner_only(path: &str) -> Result<File> {
    OpenOptions::new().create(true).append(true).open(path).map_err(GatewayError::Io)
}
