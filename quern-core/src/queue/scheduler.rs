use log::*;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::queue::Job;
use crate::storage::Storage;

#[derive(Clone, Debug)]
pub struct SchedulerOptions {
  pub tick_interval: Duration,
  pub batch_size: usize,
}

impl Default for SchedulerOptions {
  fn default() -> Self {
    return SchedulerOptions {
      tick_interval: crate::constants::DEFAULT_TICK_INTERVAL,
      batch_size: 32,
    };
  }
}

/// The single claimer.
///
/// Every tick it claims a batch of due jobs and pushes them, in id order,
/// onto the bounded dispatch channel. A full batch with spare channel
/// capacity re-ticks immediately; otherwise the next claim waits for the
/// tick interval, which also bounds how often a failed job can be retried.
///
/// Running more than one scheduler against the same database is not
/// supported: claims would stay atomic but batches would fragment.
pub struct Scheduler;

impl Scheduler {
  pub fn spawn(
    storage: Storage,
    sender: async_channel::Sender<Job>,
    options: SchedulerOptions,
    shutdown: CancellationToken,
  ) -> JoinHandle<()> {
    return tokio::spawn(async move {
      run(storage, sender, options, shutdown).await;
    });
  }
}

async fn run(
  storage: Storage,
  sender: async_channel::Sender<Job>,
  options: SchedulerOptions,
  shutdown: CancellationToken,
) {
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      _ = tokio::time::sleep(options.tick_interval) => {}
    }

    loop {
      let jobs = match storage.claim_jobs(options.batch_size).await {
        Ok(jobs) => jobs,
        Err(err) => {
          error!("Failed to claim jobs: {err}");
          break;
        }
      };

      let claimed = jobs.len();
      for job in jobs {
        // Already-claimed jobs are dispatched even while shutting down;
        // whatever cannot be handed off stays `processing` for the
        // recovery sweep.
        tokio::select! {
          result = sender.send(job) => {
            if result.is_err() {
              info!("Dispatch channel closed, scheduler exiting");
              return;
            }
          }
          _ = shutdown.cancelled() => {
            return;
          }
        }
      }

      // Backpressure: only keep claiming while workers keep up.
      if claimed < options.batch_size || sender.is_full() {
        break;
      }
    }
  }

  debug!("Scheduler exited");
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::NewJob;
  use crate::storage::testing::test_storage;

  #[tokio::test]
  async fn test_dispatches_in_id_order_and_stops_on_cancel() {
    let storage = test_storage().await;
    for i in 0..5 {
      storage
        .insert_job(&NewJob::new("t", format!("{i}")))
        .await
        .unwrap();
    }

    let (sender, receiver) = async_channel::bounded::<Job>(16);
    let shutdown = CancellationToken::new();

    let handle = Scheduler::spawn(
      storage.clone(),
      sender,
      SchedulerOptions {
        tick_interval: Duration::from_millis(5),
        batch_size: 2,
      },
      shutdown.clone(),
    );

    let mut ids = vec![];
    for _ in 0..5 {
      ids.push(receiver.recv().await.unwrap().id);
    }
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);

    shutdown.cancel();
    handle.await.unwrap();

    // The sender side is gone once the scheduler exits.
    assert!(receiver.recv().await.is_err());
  }

  #[tokio::test]
  async fn test_cancelled_scheduler_claims_nothing_further() {
    let storage = test_storage().await;
    let (sender, _receiver) = async_channel::bounded::<Job>(1);
    let shutdown = CancellationToken::new();

    let handle = Scheduler::spawn(
      storage.clone(),
      sender,
      SchedulerOptions {
        tick_interval: Duration::from_millis(5),
        batch_size: 2,
      },
      shutdown.clone(),
    );

    shutdown.cancel();
    handle.await.unwrap();

    storage.insert_job(&NewJob::new("t", "p")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Still pending: nobody claims after cancellation.
    let job = storage.list_jobs(None, 10, 0).await.unwrap();
    assert_eq!(job[0].status, crate::queue::JobStatus::Pending);
  }
}
