use log::*;
use std::sync::Arc;

use crate::config::Config;
use crate::queue::{HandlerError, Job, JobHandler};
use crate::storage::Storage;
use crate::value_notifier::ValueNotifier;

/// Recurrent sweep returning `processing` rows with a stale `locked_at` to
/// `failed`. Covers jobs orphaned by a crash or an unclean shutdown; the
/// scheduler then re-claims them like any other failed job.
pub struct StuckJobRecoveryHandler {
  pub storage: Storage,
  pub config: Arc<ValueNotifier<Config>>,
}

#[async_trait::async_trait]
impl JobHandler for StuckJobRecoveryHandler {
  async fn handle(&self, _job: &Job) -> Result<(), HandlerError> {
    let threshold = chrono::Duration::seconds(
      self
        .config
        .load()
        .maintenance
        .stale_job_threshold_sec
        .max(1),
    );

    let recovered = self.storage.recover_stale_jobs(threshold).await?;
    if recovered > 0 {
      info!("Recovered {recovered} stuck jobs");
    }
    return Ok(());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::{JobStatus, NewJob};
  use crate::storage::testing::test_storage;
  use quern_sqlite::params;

  #[tokio::test]
  async fn test_sweep_recovers_stale_processing_rows() {
    let storage = test_storage().await;

    let stale = storage.insert_job(&NewJob::new("t", "stale")).await.unwrap();
    let fresh = storage.insert_job(&NewJob::new("t", "fresh")).await.unwrap();
    storage.claim_jobs(10).await.unwrap();

    storage
      .conn()
      .execute(
        "UPDATE job_queue SET locked_at = '2020-01-01T00:00:00Z' WHERE id = $1",
        params!(stale.id),
      )
      .await
      .unwrap();

    let mut config = Config::new_with_defaults();
    config.maintenance.stale_job_threshold_sec = 3600;

    let handler = StuckJobRecoveryHandler {
      storage: storage.clone(),
      config: Arc::new(ValueNotifier::new(config)),
    };
    handler.handle(&stale).await.unwrap();

    assert_eq!(
      storage.get_job(stale.id).await.unwrap().status,
      JobStatus::Failed
    );
    assert_eq!(
      storage.get_job(fresh.id).await.unwrap().status,
      JobStatus::Processing
    );
  }
}
