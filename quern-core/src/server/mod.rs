mod init;
mod tls;

pub use init::InitError;

use axum::http::{HeaderValue, StatusCode};
use axum::middleware;
use axum::routing::get;
use axum::Router;
use log::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::{cors, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{filter, prelude::*};

use crate::app_state::AppState;
use crate::auth;
use crate::filter::request_filter_middleware;
use crate::jobs::{self, Dns01Provisioner, HandlerDeps, NullProvisioner};
use crate::logging::{
  sqlite_logger_make_span, sqlite_logger_on_request, sqlite_logger_on_response, LogSink,
  SqliteLogLayer,
};
use crate::queue::{Job, RetryBackoff, Scheduler, SchedulerOptions, WorkerPool};
use crate::response::Envelope;

/// Restart-scoped serving options. Everything else lives in the encrypted
/// in-database configuration; the process reads exactly the database path
/// and the age key path from its environment.
#[derive(Debug, Clone)]
pub struct ServerOptions {
  pub db_path: PathBuf,
  pub age_key_path: PathBuf,
  /// Defaults to a `-logs.db` sibling of `db_path`.
  pub logs_db_path: Option<PathBuf>,

  /// Authority (`host:port`) the HTTP server binds to.
  pub address: String,
  /// Optional TLS authority, served with the stored ACME certificate.
  pub tls_address: Option<String>,

  /// Limit the set of allowed origins the HTTP server will answer to.
  pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerOptions {
  fn default() -> Self {
    return ServerOptions {
      db_path: PathBuf::from("./quern.db"),
      age_key_path: PathBuf::from("./quern.age.key"),
      logs_db_path: None,
      address: "localhost:4000".to_string(),
      tls_address: None,
      cors_allowed_origins: vec![],
    };
  }
}

#[derive(Debug, Error)]
pub enum ServeError {
  #[error("Init error: {0}")]
  Init(#[from] InitError),
  #[error("IO error: {0}")]
  IO(#[from] std::io::Error),
  #[error("TLS error: {0}")]
  Tls(String),
  #[error("Shutdown deadline exceeded")]
  ShutdownTimeout,
}

pub struct Server {
  state: AppState,
  options: ServerOptions,
  provisioner: Arc<dyn Dns01Provisioner>,
}

impl Server {
  /// Initializes the server: opens/migrates the databases, loads the age
  /// identity and publishes the configuration snapshot. No tasks run yet.
  pub async fn init(options: ServerOptions) -> Result<Self, InitError> {
    return Self::init_with_provisioner(options, Arc::new(NullProvisioner)).await;
  }

  /// Like [`Server::init`] with an injected ACME DNS-01 provisioner.
  pub async fn init_with_provisioner(
    options: ServerOptions,
    provisioner: Arc<dyn Dns01Provisioner>,
  ) -> Result<Self, InitError> {
    let state = init::init_app_state(&options).await?;

    return Ok(Server {
      state,
      options,
      provisioner,
    });
  }

  pub fn state(&self) -> &AppState {
    return &self.state;
  }

  /// Runs the whole component graph until SIGINT/SIGTERM, then tears it down
  /// in dependency-reverse order bounded by the configured deadline:
  /// listeners drain, the scheduler stops claiming, workers finish their
  /// in-flight handlers, the log sink flushes, the pools close.
  pub async fn serve(self) -> Result<(), ServeError> {
    let state = self.state;
    let config = state.get_config();

    // Log sink first so the request layer has somewhere to write.
    let sink_handle = LogSink::start(state.logs_conn().clone(), &config.log);

    // It's fine for this to fail when the embedding application already
    // installed a subscriber.
    let _ = tracing_subscriber::registry()
      .with(
        SqliteLogLayer::new(sink_handle.sink())
          .with_filter(filter::Targets::new().with_default(filter::LevelFilter::INFO)),
      )
      .try_init();

    // Handler registry and recurrent system jobs.
    let deps = HandlerDeps {
      storage: state.storage().clone(),
      config: state.config_provider(),
      mailer: state.mailer_computed(),
      minter: state.minter_computed(),
      db_path: state.db_path().cloned(),
      provisioner: self.provisioner.clone(),
    };
    let registry = Arc::new(jobs::build_registry(&deps, &config));

    if let Err(err) = jobs::seed_system_jobs(state.storage(), &config).await {
      warn!("Failed to seed system jobs: {err}");
    }

    let shutdown = CancellationToken::new();
    let queue_shutdown = CancellationToken::new();

    // Worker pool, then the scheduler which feeds it.
    let workers = match config.scheduler.workers {
      0 => std::thread::available_parallelism().map_or(4, |n| n.get()),
      n => n,
    };
    let (sender, receiver) = async_channel::bounded::<Job>(workers * 4);

    let pool = WorkerPool::spawn(
      workers,
      receiver,
      registry,
      state.storage().clone(),
      RetryBackoff {
        base: chrono::Duration::seconds(config.scheduler.retry_backoff_base_sec.max(1)),
        cap: chrono::Duration::seconds(config.scheduler.retry_backoff_cap_sec.max(1)),
      },
      queue_shutdown.clone(),
    );

    let scheduler = Scheduler::spawn(
      state.storage().clone(),
      sender,
      SchedulerOptions {
        tick_interval: Duration::from_secs(config.scheduler.tick_interval_sec),
        batch_size: config.scheduler.batch_size,
      },
      queue_shutdown.clone(),
    );

    // Listeners last.
    let router = build_router(&state, &self.options);

    let mut listeners = JoinSet::new();
    {
      let listener = tokio::net::TcpListener::bind(&self.options.address)
        .await
        .map_err(|err| InitError::Bind(self.options.address.clone(), err))?;
      info!("Listening on http://{}", self.options.address);

      let router = router.clone();
      let token = shutdown.clone();
      listeners.spawn(async move {
        if let Err(err) = axum::serve(listener, router)
          .with_graceful_shutdown(token.cancelled_owned())
          .await
        {
          error!("HTTP server error: {err}");
        }
      });
    }

    if let Some(ref tls_address) = self.options.tls_address {
      match tls::bind_tls_listener(&state, tls_address).await? {
        Some((listener, acceptor)) => {
          info!("Listening on https://{tls_address}");
          let router = router.clone();
          let token = shutdown.clone();
          listeners.spawn(async move {
            tls::serve_tls(listener, acceptor, router, token).await;
          });
        }
        None => {
          warn!("TLS address configured but no certificate stored; not serving TLS");
        }
      }
    }

    // Park until SIGINT/SIGTERM.
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
      shutdown_signal().await;
      signal_token.cancel();
    });
    shutdown.cancelled().await;

    let deadline = Duration::from_secs(config.server.shutdown_timeout_sec.max(1));
    let teardown = async move {
      // 1. Drain in-flight HTTP connections.
      while listeners.join_next().await.is_some() {}

      // 2. Stop claiming; workers drain and finish their in-flight handler.
      queue_shutdown.cancel();
      if let Err(err) = scheduler.await {
        error!("Scheduler task panicked: {err}");
      }
      pool.join().await;

      // 3. Flush the log sink.
      sink_handle.shutdown().await;

      // 4. Close the pools.
      if let Err(err) = state.logs_conn().clone().close().await {
        warn!("Failed to close logs DB: {err}");
      }
      if let Err(err) = state.conn().clone().close().await {
        warn!("Failed to close main DB: {err}");
      }
    };

    if tokio::time::timeout(deadline, teardown).await.is_err() {
      error!("Shutdown deadline exceeded, abandoning remaining tasks");
      return Err(ServeError::ShutdownTimeout);
    }

    info!("Shut down cleanly");
    return Ok(());
  }
}

fn build_router(state: &AppState, options: &ServerOptions) -> Router<()> {
  let router = Router::new()
    .nest("/api", auth::api::router())
    .route("/api/healthcheck", get(healthcheck_handler))
    .fallback(not_found_handler);

  return router
    .layer(middleware::from_fn_with_state(
      state.clone(),
      request_filter_middleware,
    ))
    .layer(build_cors(options))
    .layer(
      TraceLayer::new_for_http()
        .make_span_with(sqlite_logger_make_span)
        .on_request(sqlite_logger_on_request)
        .on_response(sqlite_logger_on_response),
    )
    .layer(RequestBodyLimitLayer::new(10 * 1024 * 1024))
    .with_state(state.clone());
}

async fn healthcheck_handler() -> Envelope {
  return Envelope::ok(None);
}

fn build_cors(options: &ServerOptions) -> cors::CorsLayer {
  let origin_strs = &options.cors_allowed_origins;
  if origin_strs.is_empty() {
    return cors::CorsLayer::new();
  }

  let wildcard = origin_strs.iter().any(|s| s == "*");
  let origins = if wildcard {
    cors::AllowOrigin::mirror_request()
  } else {
    cors::AllowOrigin::list(origin_strs.iter().filter_map(|o| {
      match HeaderValue::from_str(o.as_str()) {
        Ok(value) => Some(value),
        Err(err) => {
          error!("Invalid CORS origin {o}: {err}");
          None
        }
      }
    }))
  };

  return cors::CorsLayer::new()
    .allow_methods(cors::Any)
    .allow_origin(origins);
}

async fn shutdown_signal() {
  let ctrl_c = async {
    signal::ctrl_c()
      .await
      .expect("failed to install Ctrl+C handler");
  };

  #[cfg(unix)]
  let terminate = async {
    signal::unix::signal(signal::unix::SignalKind::terminate())
      .expect("failed to install signal handler")
      .recv()
      .await;
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {
      info!("Received Ctrl+C. Shutting down gracefully.");
    },
    _ = terminate => {
      info!("Received termination. Shutting down gracefully.");
    },
  }
}

async fn not_found_handler() -> Envelope {
  return Envelope::error(StatusCode::NOT_FOUND, "not_found", "not found");
}
