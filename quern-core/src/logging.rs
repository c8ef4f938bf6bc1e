use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use axum_client_ip::InsecureClientIp;
use log::*;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::field::Field;
use tracing::span::{Attributes, Id, Record, Span};
use tracing::Level;
use tracing_subscriber::layer::{Context, Layer};

use crate::config::LogConfig;
use crate::util::now_timestamp;
use quern_sqlite::Connection;

// There are three moving parts:
//
//  * A tracing layer on the axum router declares *what* goes into request
//    spans (method, uri, status, latency, client ip, ...).
//  * SqliteLogLayer receives closed spans and turns them into LogRecords.
//  * LogSink buffers records and batch-writes them to the logs database on a
//    dedicated task.

const LEVEL: Level = Level::INFO;
const NAME: &str = "quern::request";

#[derive(Clone, Debug)]
pub struct LogRecord {
  pub created: String,
  pub level: i64,
  pub message: String,
  pub json_data: String,
}

struct SinkState {
  buffer: Mutex<VecDeque<LogRecord>>,
  capacity: usize,
  flush_size: usize,
  dropped: AtomicU64,
  closed: AtomicBool,
  notify: tokio::sync::Notify,
}

/// Asynchronous batched writer of log records into the secondary SQLite
/// database.
///
/// The buffer is bounded: on overflow the oldest record is dropped and
/// counted. A single writer task drains batches on a count or time
/// threshold; multi-row batches run inside `BEGIN IMMEDIATE`.
#[derive(Clone)]
pub struct LogSink {
  state: Arc<SinkState>,
}

pub struct LogSinkHandle {
  sink: LogSink,
  writer: tokio::task::JoinHandle<()>,
}

impl LogSink {
  pub fn start(conn: Connection, config: &LogConfig) -> LogSinkHandle {
    let state = Arc::new(SinkState {
      buffer: Mutex::new(VecDeque::with_capacity(config.buffer_size)),
      capacity: config.buffer_size.max(1),
      flush_size: config.flush_size.max(1),
      dropped: AtomicU64::new(0),
      closed: AtomicBool::new(false),
      notify: tokio::sync::Notify::new(),
    });

    let flush_interval = Duration::from_millis(config.flush_interval_ms.max(1));
    let writer_state = state.clone();
    let writer = tokio::spawn(async move {
      run_writer(conn, writer_state, flush_interval).await;
    });

    return LogSinkHandle {
      sink: LogSink { state },
      writer,
    };
  }

  pub fn write(&self, record: LogRecord) {
    let state = &self.state;
    if state.closed.load(Ordering::Relaxed) {
      return;
    }

    let len = {
      let mut buffer = state.buffer.lock();
      if buffer.len() >= state.capacity {
        buffer.pop_front();
        state.dropped.fetch_add(1, Ordering::Relaxed);
      }
      buffer.push_back(record);
      buffer.len()
    };

    if len >= state.flush_size {
      state.notify.notify_one();
    }
  }

  pub fn dropped_records(&self) -> u64 {
    return self.state.dropped.load(Ordering::Relaxed);
  }
}

impl LogSinkHandle {
  pub fn sink(&self) -> LogSink {
    return LogSink {
      state: self.sink.state.clone(),
    };
  }

  /// Flushes buffered records and stops the writer.
  pub async fn shutdown(self) {
    self.sink.state.closed.store(true, Ordering::Relaxed);
    self.sink.state.notify.notify_one();
    if let Err(err) = self.writer.await {
      warn!("Log sink writer panicked: {err}");
    }
  }
}

async fn run_writer(conn: Connection, state: Arc<SinkState>, flush_interval: Duration) {
  loop {
    tokio::select! {
      _ = state.notify.notified() => {}
      _ = tokio::time::sleep(flush_interval) => {}
    }

    loop {
      let batch: Vec<LogRecord> = {
        let mut buffer = state.buffer.lock();
        let n = buffer.len().min(state.flush_size);
        buffer.drain(..n).collect()
      };

      if batch.is_empty() {
        break;
      }

      let dropped = state.dropped.swap(0, Ordering::Relaxed);
      if dropped > 0 {
        warn!("Log buffer overflow, dropped {dropped} records");
      }

      let result = conn
        .call(move |conn| {
          if batch.len() > 1 {
            let tx =
              conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            for record in &batch {
              insert_log(&tx, record)?;
            }
            tx.commit()?;
          } else {
            for record in &batch {
              insert_log(conn, record)?;
            }
          }
          return Ok(());
        })
        .await;

      if let Err(err) = result {
        warn!("Failed to write logs: {err}");
      }
    }

    if state.closed.load(Ordering::Relaxed) && state.buffer.lock().is_empty() {
      return;
    }
  }
}

fn insert_log(conn: &rusqlite::Connection, record: &LogRecord) -> Result<(), rusqlite::Error> {
  let mut stmt = conn.prepare_cached(
    "INSERT INTO logs (created, level, message, json_data) VALUES ($1, $2, $3, $4)",
  )?;
  stmt.execute(rusqlite::params![
    record.created,
    record.level,
    record.message,
    record.json_data,
  ])?;
  return Ok(());
}

/// Startup schema verification for the logs database.
pub async fn ping(conn: &Connection, table: &str) -> Result<(), quern_sqlite::Error> {
  let sql = format!("SELECT COUNT(*) FROM {table} LIMIT 1");
  conn
    .read_query_row_f(sql, (), |row| row.get::<_, i64>(0))
    .await?;
  return Ok(());
}

pub(crate) fn sqlite_logger_make_span(request: &Request<Body>) -> Span {
  let headers = request.headers();

  let get = |name: &str| -> &str {
    return headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("");
  };

  let host = get("host");
  let user_agent = get("user-agent");
  let referer = get("referer");
  let client_ip = InsecureClientIp::from(headers, request.extensions())
    .map(|ip| ip.0.to_string())
    .ok();

  // NOTE: "%" means print using fmt::Display, and "?" means fmt::Debug.
  return tracing::span!(
      LEVEL,
      NAME,
      method = %request.method(),
      uri = %request.uri(),
      host,
      client_ip,
      user_agent,
      referer,
      latency_ms = tracing::field::Empty,
      status = tracing::field::Empty,
  );
}

pub(crate) fn sqlite_logger_on_request(_req: &Request<Body>, _span: &Span) {
  // Everything interesting was captured at span creation.
}

pub(crate) fn sqlite_logger_on_response(response: &Response<Body>, latency: Duration, span: &Span) {
  span.record("latency_ms", latency.as_secs_f64() * 1000.0);
  span.record("status", response.status().as_u16());
}

/// Routes closed request spans into the [`LogSink`].
pub struct SqliteLogLayer {
  sink: LogSink,
}

impl SqliteLogLayer {
  pub fn new(sink: LogSink) -> Self {
    return SqliteLogLayer { sink };
  }
}

impl<S> Layer<S> for SqliteLogLayer
where
  S: tracing::Subscriber,
  S: for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
  fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
    let span = ctx.span(id).expect("span must exist in on_new_span");
    if span.metadata().name() != NAME {
      return;
    }

    let mut storage = LogFieldStorage::default();
    attrs.record(&mut LogFieldVisitor(&mut storage));
    span.extensions_mut().insert(storage);
  }

  fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
    let Some(span) = ctx.span(id) else {
      return;
    };

    if !values.is_empty() {
      let mut extensions = span.extensions_mut();
      if let Some(storage) = extensions.get_mut::<LogFieldStorage>() {
        values.record(&mut LogFieldVisitor(storage));
      }
    }
  }

  fn on_close(&self, id: Id, ctx: Context<'_, S>) {
    let Some(span) = ctx.span(&id) else {
      return;
    };
    if span.metadata().name() != NAME {
      return;
    }

    let mut extensions = span.extensions_mut();
    if let Some(storage) = extensions.remove::<LogFieldStorage>() {
      self.sink.write(LogRecord {
        created: now_timestamp(),
        level: level_to_int(span.metadata().level()),
        message: format!(
          "{} {} -> {}",
          storage.method, storage.uri, storage.status
        ),
        json_data: serde_json::json!({
          "method": storage.method,
          "uri": storage.uri,
          "status": storage.status,
          "latency_ms": storage.latency_ms,
          "client_ip": storage.client_ip,
          "host": storage.host,
          "referer": storage.referer,
          "user_agent": storage.user_agent,
        })
        .to_string(),
      });
    }
  }
}

#[derive(Debug, Default, Clone)]
struct LogFieldStorage {
  method: String,
  uri: String,
  client_ip: String,
  host: String,
  referer: String,
  user_agent: String,
  status: u64,
  latency_ms: f64,
}

struct LogFieldVisitor<'a>(&'a mut LogFieldStorage);

impl tracing::field::Visit for LogFieldVisitor<'_> {
  fn record_f64(&mut self, field: &Field, double: f64) {
    if field.name() == "latency_ms" {
      self.0.latency_ms = double;
    }
  }

  fn record_u64(&mut self, field: &Field, uint: u64) {
    if field.name() == "status" {
      self.0.status = uint;
    }
  }

  fn record_i64(&mut self, _field: &Field, _int: i64) {}

  fn record_bool(&mut self, _field: &Field, _b: bool) {}

  fn record_str(&mut self, field: &Field, s: &str) {
    match field.name() {
      "client_ip" => self.0.client_ip = s.to_string(),
      "host" => self.0.host = s.to_string(),
      "referer" => self.0.referer = s.to_string(),
      "user_agent" => self.0.user_agent = s.to_string(),
      _ => {}
    };
  }

  fn record_debug(&mut self, field: &Field, dbg: &dyn std::fmt::Debug) {
    match field.name() {
      "method" => self.0.method = format!("{:?}", dbg),
      "uri" => self.0.uri = format!("{:?}", dbg),
      _ => {}
    };
  }
}

#[inline]
fn level_to_int(level: &tracing::Level) -> i64 {
  return match *level {
    tracing::Level::TRACE => 4,
    tracing::Level::DEBUG => 3,
    tracing::Level::INFO => 2,
    tracing::Level::WARN => 1,
    tracing::Level::ERROR => 0,
  };
}
