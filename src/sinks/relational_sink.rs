use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::RelationalConfig;
use crate::error::{GatewayError, Result};
use crate::model::Event;
use crate::observability::metrics;
use crate::sinks::Sink;

/// Postgres identifiers the gateway will accept as a table name. Rejects
/// anything that could escape the format-string interpolation used to build
/// DDL/DML below, since the table name is operator-configured, not a SQL
/// literal `sqlx::query!` can bind.
static TABLE_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").unwrap());

struct State {
    pool: Pool<Postgres>,
    batch: Mutex<Vec<Event>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Batched Postgres sink (spec §4.3.3). Buffers enqueued events in memory
/// and flushes either when the batch reaches its configured size or when a
/// background ticker's flush deadline elapses, whichever comes first.
pub struct RelationalSink {
    config: RelationalConfig,
    state: OnceCell<Arc<State>>,
}

impl RelationalSink {
    pub fn new(config: RelationalConfig) -> Self {
        Self {
            config,
            state: OnceCell::new(),
        }
    }

    fn validate_table_name(&self) -> Result<()> {
        if TABLE_NAME_RE.is_match(&self.config.table) {
            Ok(())
        } else {
            Err(GatewayError::InvalidTableName(self.config.table.clone()))
        }
    }

    async fn bootstrap_schema(pool: &Pool<Postgres>, table: &str) -> Result<()> {
        let ddl = format!(
            "create table if not exists {table} (
                id bigserial primary key,
                event_id text unique not null,
                ts timestamptz not null,
                payload jsonb not null
            )"
        );
        sqlx::query(&ddl).execute(pool).await.map_err(to_gateway_error)?;

        let ts_index_ddl = format!("create index if not exists {table}_ts_idx on {table} (ts)");
        sqlx::query(&ts_index_ddl).execute(pool).await.map_err(to_gateway_error)?;

        let payload_index_ddl = format!("create index if not exists {table}_payload_gin on {table} using gin (payload)");
        sqlx::query(&payload_index_ddl).execute(pool).await.map_err(to_gateway_error)?;
        Ok(())
    }

    async fn flush(state: &Arc<State>, config: &RelationalConfig) -> Result<()> {
        let events = {
            let mut batch = state.batch.lock().await;
            if batch.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *batch)
        };

        let result = if config.copy_mode {
            copy_insert(&state.pool, &config.table, &events).await
        } else {
            values_upsert(&state.pool, &config.table, &events).await
        };

        match &result {
            Ok(()) => metrics::dispatch::sink_success("relational"),
            Err(_) => metrics::dispatch::sink_error("relational"),
        }
        result
    }
}

fn to_gateway_error(e: sqlx::Error) -> GatewayError {
    GatewayError::SinkEnqueue {
        sink: "relational".to_string(),
        message: e.to_string(),
    }
}

fn event_row(event: &Event) -> Result<(String, DateTime<Utc>, serde_json::Value)> {
    let event_id = event.event_id.clone().unwrap_or_default();
    let ts = event
        .ts
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let payload = serde_json::to_value(event)?;
    Ok((event_id, ts, payload))
}

async fn values_upsert(pool: &Pool<Postgres>, table: &str, events: &[Event]) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    let mut query = format!("insert into {table} (event_id, ts, payload) values ");
    let mut rows = Vec::with_capacity(events.len());
    for event in events {
        rows.push(event_row(event)?);
    }

    let placeholders: Vec<String> = (0..rows.len())
        .map(|i| format!("(${}, ${}, ${})", i * 3 + 1, i * 3 + 2, i * 3 + 3))
        .collect();
    query.push_str(&placeholders.join(", "));
    query.push_str(" on conflict (event_id) do nothing");

    let mut q = sqlx::query(&query);
    for (event_id, ts, payload) in &rows {
        q = q.bind(event_id).bind(ts).bind(payload);
    }
    q.execute(pool).await.map_err(to_gateway_error)?;
    Ok(())
}

/// `COPY FROM STDIN` path for high-throughput ingestion. Duplicate
/// `event_id`s would violate the unique constraint and abort the whole
/// copy, so this loads into a scratch table first and merges with
/// `ON CONFLICT DO NOTHING`, keeping the dedup guarantee the non-copy path
/// gets for free.
async fn copy_insert(pool: &Pool<Postgres>, table: &str, events: &[Event]) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    let scratch = format!("{table}_copy_staging");
    let mut conn = pool.acquire().await.map_err(to_gateway_error)?;

    sqlx::query(&format!(
        "create temporary table {scratch} (event_id text, ts timestamptz, payload jsonb) on commit drop"
    ))
    .execute(&mut *conn)
    .await
    .map_err(to_gateway_error)?;

    let mut csv = String::new();
    for event in events {
        let (event_id, ts, payload) = event_row(event)?;
        csv.push_str(&csv_escape(&event_id));
        csv.push('\t');
        csv.push_str(&ts.to_rfc3339());
        csv.push('\t');
        csv.push_str(&csv_escape(&payload.to_string()));
        csv.push('\n');
    }

    let mut copy = conn
        .copy_in_raw(&format!("copy {scratch} (event_id, ts, payload) from stdin"))
        .await
        .map_err(to_gateway_error)?;
    copy.send(csv.as_bytes()).await.map_err(to_gateway_error)?;
    copy.finish().await.map_err(to_gateway_error)?;

    sqlx::query(&format!(
        "insert into {table} (event_id, ts, payload)
         select event_id, ts, payload from {scratch}
         on conflict (event_id) do nothing"
    ))
    .execute(&mut *conn)
    .await
    .map_err(to_gateway_error)?;

    Ok(())
}

/// Escapes tabs, newlines, and backslashes for Postgres's default text
/// `COPY` format.
fn csv_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\t', "\\t").replace('\n', "\\n")
}

#[async_trait]
impl Sink for RelationalSink {
    fn name(&self) -> &'static str {
        "relational"
    }

    async fn start(&self) -> Result<()> {
        self.validate_table_name()?;
        if self.config.dsn.is_empty() {
            return Err(GatewayError::SinkStart {
                sink: self.name().to_string(),
                message: "PG_DSN not configured".to_string(),
            });
        }

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&self.config.dsn)
            .await
            .map_err(|e| GatewayError::SinkStart {
                sink: self.name().to_string(),
                message: e.to_string(),
            })?;

        Self::bootstrap_schema(&pool, &self.config.table).await?;

        let state = Arc::new(State {
            pool,
            batch: Mutex::new(Vec::new()),
            ticker: Mutex::new(None),
        });

        let ticker_state = state.clone();
        let flush_interval = Duration::from_millis(self.config.flush_interval_ms.max(1));
        let table = self.config.table.clone();
        let copy_mode = self.config.copy_mode;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            loop {
                interval.tick().await;
                let config = RelationalConfig {
                    dsn: String::new(),
                    table: table.clone(),
                    batch_size: 0,
                    flush_interval_ms: 0,
                    copy_mode,
                };
                if let Err(e) = RelationalSink::flush(&ticker_state, &config).await {
                    error!(sink = "relational", error = %e, "background flush failed");
                }
            }
        });
        *state.ticker.lock().await = Some(handle);

        self.state.set(state).map_err(|_| GatewayError::SinkStart {
            sink: self.name().to_string(),
            message: "started more than once".to_string(),
        })?;

        info!(table = %self.config.table, "relational sink ready");
        Ok(())
    }

    async fn enqueue(&self, events: &[Event]) -> Result<()> {
        let state = self.state.get().ok_or_else(|| GatewayError::SinkEnqueue {
            sink: self.name().to_string(),
            message: "sink used before start()".to_string(),
        })?;

        let should_flush = {
            let mut batch = state.batch.lock().await;
            batch.extend_from_slice(events);
            batch.len() >= self.config.batch_size.max(1)
        };
        if should_flush {
            Self::flush(state, &self.config).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let Some(state) = self.state.get() else {
            return Ok(());
        };
        if let Some(handle) = state.ticker.lock().await.take() {
            handle.abort();
        }
        Self::flush(state, &self.config).await?;
        state.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_identifiers() {
        assert!(TABLE_NAME_RE.is_match("events_json"));
        assert!(TABLE_NAME_RE.is_match("_events"));
    }

    #[test]
    fn rejects_identifiers_that_could_escape_interpolation() {
        assert!(!TABLE_NAME_RE.is_match("events; drop table users;--"));
        assert!(!TABLE_NAME_RE.is_match("events json"));
        assert!(!TABLE_NAME_RE.is_match("1events"));
        assert!(!TABLE_NAME_RE.is_match(""));
    }

    #[tokio::test]
    async fn start_rejects_invalid_table_name_before_connecting() {
        let sink = RelationalSink::new(RelationalConfig {
            dsn: "postgres://localhost/doesnotmatter".to_string(),
            table: "bad; name".to_string(),
            batch_size: 10,
            flush_interval_ms: 1000,
            copy_mode: true,
        });
        let err = sink.start().await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidTableName(_)));
    }

    #[test]
    fn csv_escape_handles_control_characters() {
        assert_eq!(csv_escape("a\tb\nc\\d"), "a\\tb\\nc\\\\d");
    }

    #[test]
    fn event_row_falls_back_to_now_on_unparseable_timestamp() {
        let mut event = Event::default();
        event.ts = Some("not-a-timestamp".to_string());
        let (_, ts, _) = event_row(&event).unwrap();
        assert!((Utc::now() - ts).num_seconds() < 5);
    }
}
