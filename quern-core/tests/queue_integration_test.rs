use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use quern::queue::{
  HandlerError, HandlerRegistry, Job, JobHandler, JobStatus, NewJob, RetryBackoff, Scheduler,
  SchedulerOptions, WorkerPool,
};
use quern::storage::Storage;
use quern::{Server, ServerOptions};

struct CountingHandler {
  completed: AtomicUsize,
  delay: Duration,
}

#[async_trait::async_trait]
impl JobHandler for CountingHandler {
  async fn handle(&self, _job: &Job) -> Result<(), HandlerError> {
    tokio::time::sleep(self.delay).await;
    self.completed.fetch_add(1, Ordering::SeqCst);
    return Ok(());
  }
}

fn spawn_pipeline(
  storage: &Storage,
  handler: Arc<CountingHandler>,
  shutdown: &CancellationToken,
) -> (tokio::task::JoinHandle<()>, WorkerPool) {
  let mut registry = HandlerRegistry::new();
  registry.register("t", handler, Duration::from_secs(5), 3);

  let (sender, receiver) = async_channel::bounded::<Job>(8);
  let scheduler = Scheduler::spawn(
    storage.clone(),
    sender,
    SchedulerOptions {
      tick_interval: Duration::from_millis(5),
      batch_size: 8,
    },
    shutdown.clone(),
  );
  let pool = WorkerPool::spawn(
    4,
    receiver,
    Arc::new(registry),
    storage.clone(),
    RetryBackoff::default(),
    shutdown.clone(),
  );

  return (scheduler, pool);
}

async fn status_counts(storage: &Storage) -> (usize, usize, usize, usize) {
  let jobs = storage.list_jobs(None, 1000, 0).await.unwrap();
  let count = |status: JobStatus| jobs.iter().filter(|j| j.status == status).count();
  return (
    count(JobStatus::Pending),
    count(JobStatus::Processing),
    count(JobStatus::Completed),
    count(JobStatus::Failed),
  );
}

// With a backlog of jobs in flight, a graceful shutdown stops claiming,
// finishes in-flight handlers and loses nothing: every job is either still
// pending, claimed-but-unfinished (processing) or completed. The recovery
// sweep then returns the orphans and a fresh pipeline drains the rest.
#[tokio::test]
async fn test_graceful_shutdown_loses_no_jobs() {
  let dir = temp_dir::TempDir::new().unwrap();
  let server = Server::init(ServerOptions {
    db_path: dir.path().join("main.db"),
    age_key_path: dir.path().join("age.key"),
    ..Default::default()
  })
  .await
  .unwrap();

  let storage = server.state().storage().clone();
  for i in 0..100 {
    storage
      .insert_job(&NewJob::new("t", format!(r#"{{"i":{i}}}"#)))
      .await
      .unwrap();
  }

  let handler = Arc::new(CountingHandler {
    completed: AtomicUsize::new(0),
    delay: Duration::from_millis(2),
  });
  let shutdown = CancellationToken::new();
  let (scheduler, pool) = spawn_pipeline(&storage, handler.clone(), &shutdown);

  // Let part of the backlog complete, then pull the plug.
  while handler.completed.load(Ordering::SeqCst) < 20 {
    tokio::time::sleep(Duration::from_millis(2)).await;
  }
  shutdown.cancel();
  scheduler.await.unwrap();
  pool.join().await;

  let (pending, processing, completed, failed) = status_counts(&storage).await;
  assert_eq!(pending + processing + completed + failed, 100);
  assert_eq!(failed, 0);
  assert!(completed >= 20);

  // Claimed-but-undelivered jobs become failed (and re-claimable) via the
  // stale sweep.
  tokio::time::sleep(Duration::from_millis(1100)).await;
  storage
    .recover_stale_jobs(chrono::Duration::seconds(1))
    .await
    .unwrap();

  let shutdown = CancellationToken::new();
  let (scheduler, pool) = spawn_pipeline(&storage, handler.clone(), &shutdown);

  for _ in 0..2000 {
    let (_, _, completed, _) = status_counts(&storage).await;
    if completed == 100 {
      break;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }

  let (pending, processing, completed, failed) = status_counts(&storage).await;
  assert_eq!(
    (pending, processing, completed, failed),
    (0, 0, 100, 0)
  );

  shutdown.cancel();
  scheduler.await.unwrap();
  pool.join().await;
}

// Config rollback through the public store: latest advances forward and
// history keeps every generation.
#[tokio::test]
async fn test_config_rollback_keeps_history() {
  use quern::config::ConfigFormat;

  let dir = temp_dir::TempDir::new().unwrap();
  let server = Server::init(ServerOptions {
    db_path: dir.path().join("main.db"),
    age_key_path: dir.path().join("age.key"),
    ..Default::default()
  })
  .await
  .unwrap();

  let store = server.state().config_store();
  store
    .save("plugin", b"v1", ConfigFormat::Json, "first")
    .await
    .unwrap();
  store
    .save("plugin", b"v2", ConfigFormat::Json, "second")
    .await
    .unwrap();

  let (latest, _) = store.latest("plugin").await.unwrap();
  assert_eq!(latest, b"v2");

  store.rollback("plugin", 1).await.unwrap();
  let (latest, _) = store.latest("plugin").await.unwrap();
  assert_eq!(latest, b"v1");

  let history = store.list("plugin").await.unwrap();
  assert_eq!(history.len(), 3);
}
