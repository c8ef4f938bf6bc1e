use chrono::{DateTime, Duration, Utc};

use crate::util::format_timestamp;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
  Pending,
  Processing,
  Completed,
  Failed,
}

impl JobStatus {
  pub fn as_str(&self) -> &'static str {
    return match self {
      JobStatus::Pending => "pending",
      JobStatus::Processing => "processing",
      JobStatus::Completed => "completed",
      JobStatus::Failed => "failed",
    };
  }

  pub fn from_str(s: &str) -> Option<JobStatus> {
    return match s {
      "pending" => Some(JobStatus::Pending),
      "processing" => Some(JobStatus::Processing),
      "completed" => Some(JobStatus::Completed),
      "failed" => Some(JobStatus::Failed),
      _ => None,
    };
  }
}

/// A persisted queue entry.
///
/// `(job_type, payload)` is the job's unique identity; callers exploit the
/// unique constraint for dedup and cooldowns. All timestamps are RFC3339 UTC
/// strings, the empty string meaning "immediately"/"never" depending on the
/// column.
#[derive(Clone, Debug)]
pub struct Job {
  pub id: i64,
  pub job_type: String,
  pub payload: String,
  pub payload_extra: String,
  pub status: JobStatus,
  pub attempts: i64,
  pub max_attempts: i64,
  pub scheduled_for: String,
  pub locked_at: String,
  pub completed_at: String,
  pub last_error: String,
  pub recurrent: bool,
  pub interval: Duration,
  pub created_at: String,
  pub updated_at: String,
}

impl Job {
  /// Builds the next occurrence of a recurrent job.
  ///
  /// The payload carries the new `scheduled_for` so consecutive occurrences
  /// never collide on the `(job_type, payload)` unique constraint.
  pub fn next_occurrence(&self, now: DateTime<Utc>) -> NewJob {
    let scheduled_for = format_timestamp(now + self.interval);

    let payload = match serde_json::from_str::<serde_json::Value>(&self.payload) {
      Ok(serde_json::Value::Object(mut map)) => {
        map.insert(
          "scheduled_for".to_string(),
          serde_json::Value::String(scheduled_for.clone()),
        );
        serde_json::Value::Object(map).to_string()
      }
      _ => serde_json::json!({ "scheduled_for": scheduled_for }).to_string(),
    };

    return NewJob {
      job_type: self.job_type.clone(),
      payload,
      payload_extra: self.payload_extra.clone(),
      max_attempts: self.max_attempts,
      scheduled_for,
      recurrent: true,
      interval: self.interval,
    };
  }
}

/// A job record to insert. Construct via [`NewJob::new`] and the chainable
/// setters.
#[derive(Clone, Debug)]
pub struct NewJob {
  pub job_type: String,
  pub payload: String,
  pub payload_extra: String,
  pub max_attempts: i64,
  pub scheduled_for: String,
  pub recurrent: bool,
  pub interval: Duration,
}

impl NewJob {
  pub fn new(job_type: impl Into<String>, payload: impl Into<String>) -> Self {
    return NewJob {
      job_type: job_type.into(),
      payload: payload.into(),
      payload_extra: String::new(),
      max_attempts: 3,
      scheduled_for: String::new(),
      recurrent: false,
      interval: Duration::zero(),
    };
  }

  pub fn with_extra(mut self, payload_extra: impl Into<String>) -> Self {
    self.payload_extra = payload_extra.into();
    return self;
  }

  pub fn with_max_attempts(mut self, max_attempts: i64) -> Self {
    self.max_attempts = max_attempts;
    return self;
  }

  pub fn scheduled_at(mut self, t: DateTime<Utc>) -> Self {
    self.scheduled_for = format_timestamp(t);
    return self;
  }

  pub fn recurrent_every(mut self, interval: Duration) -> Self {
    self.recurrent = true;
    self.interval = interval;
    return self;
  }
}
