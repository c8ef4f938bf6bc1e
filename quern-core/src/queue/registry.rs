use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::queue::Job;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Business logic attached to a `job_type`.
///
/// Handlers must be idempotent: at-least-once delivery means a handler can
/// run again for a job it already completed if the process crashed before
/// completion bookkeeping. Transient failures are plain `Err` returns; the
/// worker owns retry and terminal-failure policy.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
  async fn handle(&self, job: &Job) -> Result<(), HandlerError>;
}

#[derive(Clone)]
pub struct RegisteredHandler {
  pub handler: Arc<dyn JobHandler>,
  /// Per-invocation deadline enforced by the worker.
  pub timeout: Duration,
  /// Default retry budget for jobs of this type.
  pub max_attempts: i64,
}

/// Immutable `job_type -> handler` mapping assembled at bootstrap. Changing
/// the set of handlers requires a restart, which keeps the worker hot path
/// a plain map lookup.
#[derive(Default)]
pub struct HandlerRegistry {
  entries: HashMap<String, RegisteredHandler>,
}

impl HandlerRegistry {
  pub fn new() -> Self {
    return HandlerRegistry {
      entries: HashMap::new(),
    };
  }

  pub fn register(
    &mut self,
    job_type: impl Into<String>,
    handler: Arc<dyn JobHandler>,
    timeout: Duration,
    max_attempts: i64,
  ) {
    let job_type = job_type.into();
    let previous = self.entries.insert(
      job_type.clone(),
      RegisteredHandler {
        handler,
        timeout,
        max_attempts,
      },
    );

    if previous.is_some() {
      log::error!("Duplicate handler registration for '{job_type}'");
    }
  }

  pub fn get(&self, job_type: &str) -> Option<&RegisteredHandler> {
    return self.entries.get(job_type);
  }

  pub fn job_types(&self) -> Vec<&str> {
    return self.entries.keys().map(String::as_str).collect();
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use parking_lot::Mutex;

  /// Records handled jobs and fails a configurable number of times first.
  pub(crate) struct RecordingHandler {
    pub handled: Mutex<Vec<i64>>,
    pub failures_left: Mutex<i64>,
  }

  impl RecordingHandler {
    pub(crate) fn new(failures: i64) -> Arc<Self> {
      return Arc::new(RecordingHandler {
        handled: Mutex::new(vec![]),
        failures_left: Mutex::new(failures),
      });
    }
  }

  #[async_trait::async_trait]
  impl JobHandler for RecordingHandler {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
      self.handled.lock().push(job.id);

      let mut failures = self.failures_left.lock();
      if *failures > 0 {
        *failures -= 1;
        return Err("induced failure".into());
      }
      return Ok(());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_register_and_lookup() {
    let mut registry = HandlerRegistry::new();
    registry.register(
      "t",
      testing::RecordingHandler::new(0),
      Duration::from_secs(1),
      3,
    );

    assert!(registry.get("t").is_some());
    assert!(registry.get("unknown").is_none());
    assert_eq!(registry.job_types(), vec!["t"]);
  }
}
