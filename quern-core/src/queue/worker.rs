use chrono::{Duration, Utc};
use log::*;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::queue::{HandlerRegistry, Job};
use crate::storage::Storage;

/// Exponential backoff for retryable failures, expressed by advancing the
/// job's `scheduled_for`: `min(base * 2^(attempts - 1), cap)`.
#[derive(Clone, Copy, Debug)]
pub struct RetryBackoff {
  pub base: Duration,
  pub cap: Duration,
}

impl Default for RetryBackoff {
  fn default() -> Self {
    return RetryBackoff {
      base: Duration::seconds(15),
      cap: Duration::hours(1),
    };
  }
}

impl RetryBackoff {
  pub fn delay(&self, attempts: i64) -> Duration {
    let shift = (attempts - 1).clamp(0, 20) as u32;
    let factor = 1i64 << shift;
    return std::cmp::min(self.base * (factor as i32), self.cap);
  }
}

/// `N` concurrent executors pulling from the dispatch channel.
///
/// On cancellation workers stop pulling immediately; an in-flight handler
/// runs to completion bounded by its own timeout. Jobs still sitting in the
/// channel stay `processing` and are returned by the recovery sweep.
pub struct WorkerPool {
  handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
  pub fn spawn(
    count: usize,
    receiver: async_channel::Receiver<Job>,
    registry: Arc<HandlerRegistry>,
    storage: Storage,
    backoff: RetryBackoff,
    shutdown: CancellationToken,
  ) -> Self {
    let handles = (0..count.max(1))
      .map(|i| {
        let receiver = receiver.clone();
        let registry = registry.clone();
        let storage = storage.clone();
        let shutdown = shutdown.clone();

        return tokio::spawn(async move {
          run_worker(i, receiver, registry, storage, backoff, shutdown).await;
        });
      })
      .collect();

    return WorkerPool { handles };
  }

  /// Waits for all workers to drain and exit.
  pub async fn join(self) {
    for handle in self.handles {
      if let Err(err) = handle.await {
        error!("Worker task panicked: {err}");
      }
    }
  }
}

async fn run_worker(
  id: usize,
  receiver: async_channel::Receiver<Job>,
  registry: Arc<HandlerRegistry>,
  storage: Storage,
  backoff: RetryBackoff,
  shutdown: CancellationToken,
) {
  loop {
    let job = tokio::select! {
      _ = shutdown.cancelled() => break,
      job = receiver.recv() => match job {
        Ok(job) => job,
        Err(_) => break,
      },
    };

    process_job(job, &registry, &storage, backoff).await;
  }

  debug!("Worker {id} exited");
}

async fn process_job(job: Job, registry: &HandlerRegistry, storage: &Storage, backoff: RetryBackoff) {
  let Some(entry) = registry.get(&job.job_type) else {
    // Terminal regardless of the remaining attempt budget.
    let msg = format!("no handler registered for '{}'", job.job_type);
    warn!("Job {}: {msg}", job.id);
    fail_job(storage, job.id, &msg).await;
    return;
  };

  // The terminal-failure policy lives here, not in the store: claiming has
  // already incremented `attempts`, so a job past its budget arrives with
  // `attempts > max_attempts`.
  if job.attempts > job.max_attempts {
    fail_job(storage, job.id, "retry budget exhausted").await;
    return;
  }

  let result = match tokio::time::timeout(entry.timeout, entry.handler.handle(&job)).await {
    Ok(Ok(())) => Ok(()),
    Ok(Err(err)) => Err(err.to_string()),
    Err(_) => Err(format!(
      "handler timed out after {}s",
      entry.timeout.as_secs()
    )),
  };

  match result {
    Ok(()) if job.recurrent => {
      let next = job.next_occurrence(Utc::now());
      if let Err(err) = storage.mark_recurrent_job_completed(job.id, &next).await {
        error!(
          "Failed to complete recurrent job {} ('{}'): {err}",
          job.id, job.job_type
        );
      }
    }
    Ok(()) => {
      if let Err(err) = storage.mark_job_completed(job.id).await {
        error!("Failed to complete job {}: {err}", job.id);
      }
    }
    Err(msg) => {
      debug!("Job {} ('{}') failed: {msg}", job.id, job.job_type);
      fail_job(storage, job.id, &msg).await;

      if job.attempts < job.max_attempts {
        let due = Utc::now() + backoff.delay(job.attempts);
        if let Err(err) = storage.reschedule_job(job.id, due).await {
          error!("Failed to reschedule job {}: {err}", job.id);
        }
      }
    }
  }
}

async fn fail_job(storage: &Storage, job_id: i64, msg: &str) {
  if let Err(err) = storage.mark_job_failed(job_id, msg).await {
    error!("Failed to mark job {job_id} failed: {err}");
  }
}
