use chrono::Duration;

use crate::queue::{Job, JobStatus, NewJob};
use crate::storage::{Storage, StorageError};
use crate::util::{format_timestamp, now_timestamp};
use quern_sqlite::params;

type Result<T> = std::result::Result<T, StorageError>;

const JOB_COLUMNS: &str = "id, job_type, payload, payload_extra, status, attempts, max_attempts, \
   scheduled_for, locked_at, completed_at, last_error, recurrent, interval_sec, created_at, \
   updated_at";

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
  let status: String = row.get(4)?;
  return Ok(Job {
    id: row.get(0)?,
    job_type: row.get(1)?,
    payload: row.get(2)?,
    payload_extra: row.get(3)?,
    status: JobStatus::from_str(&status).unwrap_or(JobStatus::Failed),
    attempts: row.get(5)?,
    max_attempts: row.get(6)?,
    scheduled_for: row.get(7)?,
    locked_at: row.get(8)?,
    completed_at: row.get(9)?,
    last_error: row.get(10)?,
    recurrent: row.get(11)?,
    interval: Duration::seconds(row.get(12)?),
    created_at: row.get(13)?,
    updated_at: row.get(14)?,
  });
}

fn insert_job_sql() -> String {
  return format!(
    "INSERT INTO job_queue
        (job_type, payload, payload_extra, status, max_attempts, scheduled_for, recurrent,
         interval_sec, created_at, updated_at)
      VALUES
        ($1, $2, $3, 'pending', $4, $5, $6, $7, $8, $8)
      RETURNING {JOB_COLUMNS}"
  );
}

impl Storage {
  /// Inserts a new `pending` job.
  ///
  /// Fails with [`StorageError::ConstraintUnique`] when `(job_type, payload)`
  /// collides with an existing row; callers rely on that for cooldowns and
  /// idempotent enqueueing.
  pub async fn insert_job(&self, job: &NewJob) -> Result<Job> {
    if job.job_type.is_empty() {
      return Err(StorageError::Invalid("empty job_type"));
    }

    let inserted = self
      .conn()
      .query_row_f(
        insert_job_sql(),
        params!(
          job.job_type.clone(),
          job.payload.clone(),
          job.payload_extra.clone(),
          job.max_attempts,
          job.scheduled_for.clone(),
          job.recurrent,
          job.interval.num_seconds(),
          now_timestamp(),
        ),
        job_from_row,
      )
      .await
      .map_err(StorageError::wrap("insert job"))?;

    return inserted.ok_or(StorageError::Sql {
      context: "insert job",
      source: quern_sqlite::Error::Other("INSERT RETURNING produced no row".into()),
    });
  }

  /// Atomically claims up to `limit` due jobs: flips `pending`/`failed` rows
  /// with `scheduled_for <= now` to `processing`, stamps `locked_at` and
  /// increments `attempts`. Single statement, so concurrent claimers never
  /// see the same row twice.
  ///
  /// Deliberately does not filter on `attempts` vs `max_attempts`; the
  /// terminal-failure policy lives in the worker.
  pub async fn claim_jobs(&self, limit: usize) -> Result<Vec<Job>> {
    let sql = format!(
      "UPDATE job_queue SET
          status = 'processing',
          locked_at = $1,
          updated_at = $1,
          attempts = attempts + 1
        WHERE id IN (
          SELECT id FROM job_queue
          WHERE status IN ('pending', 'failed') AND scheduled_for <= $1
          ORDER BY id ASC
          LIMIT $2
        )
        RETURNING {JOB_COLUMNS}"
    );

    let mut jobs = self
      .conn()
      .query_rows_f(sql, params!(now_timestamp(), limit), job_from_row)
      .await
      .map_err(StorageError::wrap("claim jobs"))?;

    // RETURNING row order is unspecified; dispatch order is by id.
    jobs.sort_by_key(|job| job.id);
    return Ok(jobs);
  }

  pub async fn mark_job_completed(&self, job_id: i64) -> Result<()> {
    let n = self
      .conn()
      .execute(
        "UPDATE job_queue SET
            status = 'completed', locked_at = '', last_error = '',
            completed_at = $2, updated_at = $2
          WHERE id = $1",
        params!(job_id, now_timestamp()),
      )
      .await
      .map_err(StorageError::wrap("mark job completed"))?;

    if n == 0 {
      return Err(StorageError::NotFound);
    }
    return Ok(());
  }

  /// Returns a job to `failed`. Does not compare `attempts` against
  /// `max_attempts` and does not touch `scheduled_for`; retry and backoff
  /// policy belong to the layer above.
  pub async fn mark_job_failed(&self, job_id: i64, error: &str) -> Result<()> {
    let n = self
      .conn()
      .execute(
        "UPDATE job_queue SET
            status = 'failed', locked_at = '', last_error = $2, updated_at = $3
          WHERE id = $1",
        params!(job_id, error.to_string(), now_timestamp()),
      )
      .await
      .map_err(StorageError::wrap("mark job failed"))?;

    if n == 0 {
      return Err(StorageError::NotFound);
    }
    return Ok(());
  }

  /// Pushes a job's due time into the future, used for retry backoff.
  pub async fn reschedule_job(
    &self,
    job_id: i64,
    scheduled_for: chrono::DateTime<chrono::Utc>,
  ) -> Result<()> {
    let n = self
      .conn()
      .execute(
        "UPDATE job_queue SET scheduled_for = $2, updated_at = $3 WHERE id = $1",
        params!(job_id, format_timestamp(scheduled_for), now_timestamp()),
      )
      .await
      .map_err(StorageError::wrap("reschedule job"))?;

    if n == 0 {
      return Err(StorageError::NotFound);
    }
    return Ok(());
  }

  /// Completes `job_id` and inserts its next occurrence in one `BEGIN
  /// IMMEDIATE` transaction: either both take effect or neither does.
  pub async fn mark_recurrent_job_completed(&self, job_id: i64, next: &NewJob) -> Result<Job> {
    let next = next.clone();
    let insert_sql = insert_job_sql();

    let inserted = self
      .conn()
      .call(move |conn| {
        let tx =
          conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let now = now_timestamp();

        let n = tx.execute(
          "UPDATE job_queue SET
              status = 'completed', locked_at = '', last_error = '',
              completed_at = $2, updated_at = $2
            WHERE id = $1",
          rusqlite::params![job_id, now],
        )?;
        if n == 0 {
          return Err(quern_sqlite::Error::Rusqlite(
            rusqlite::Error::QueryReturnedNoRows,
          ));
        }

        let job = tx.query_row(
          &insert_sql,
          rusqlite::params![
            next.job_type,
            next.payload,
            next.payload_extra,
            next.max_attempts,
            next.scheduled_for,
            next.recurrent,
            next.interval.num_seconds(),
            now,
          ],
          job_from_row,
        )?;

        tx.commit()?;
        return Ok(job);
      })
      .await
      .map_err(StorageError::wrap("mark recurrent job completed"))?;

    return Ok(inserted);
  }

  /// Lists jobs for operational tooling, newest first.
  pub async fn list_jobs(
    &self,
    status: Option<JobStatus>,
    limit: usize,
    offset: usize,
  ) -> Result<Vec<Job>> {
    let jobs = match status {
      Some(status) => {
        let sql = format!(
          "SELECT {JOB_COLUMNS} FROM job_queue WHERE status = $1
            ORDER BY id DESC LIMIT $2 OFFSET $3"
        );
        self
          .conn()
          .read_query_rows_f(sql, params!(status.as_str(), limit, offset), job_from_row)
          .await
      }
      None => {
        let sql =
          format!("SELECT {JOB_COLUMNS} FROM job_queue ORDER BY id DESC LIMIT $1 OFFSET $2");
        self
          .conn()
          .read_query_rows_f(sql, params!(limit, offset), job_from_row)
          .await
      }
    };

    return jobs.map_err(StorageError::wrap("list jobs"));
  }

  /// Returns `processing` rows whose `locked_at` is older than `threshold` to
  /// `failed` so they become claimable again. Run periodically as the
  /// stuck-job recovery sweep; covers workers that died between handler
  /// return and completion bookkeeping.
  pub async fn recover_stale_jobs(&self, threshold: Duration) -> Result<usize> {
    let cutoff = format_timestamp(chrono::Utc::now() - threshold);

    let n = self
      .conn()
      .execute(
        "UPDATE job_queue SET
            status = 'failed', locked_at = '',
            last_error = 'recovered after worker interruption', updated_at = $2
          WHERE status = 'processing' AND locked_at <> '' AND locked_at < $1",
        params!(cutoff, now_timestamp()),
      )
      .await
      .map_err(StorageError::wrap("recover stale jobs"))?;

    return Ok(n);
  }

  /// True if a `pending` or `processing` row of this type exists. Used to
  /// seed recurrent system jobs exactly once.
  pub async fn has_open_job(&self, job_type: &str) -> Result<bool> {
    let exists: Option<bool> = self
      .conn()
      .read_query_row_f(
        "SELECT EXISTS(
            SELECT 1 FROM job_queue
            WHERE job_type = $1 AND status IN ('pending', 'processing'))",
        params!(job_type.to_string()),
        |row| row.get(0),
      )
      .await
      .map_err(StorageError::wrap("has open job"))?;

    return Ok(exists.unwrap_or(false));
  }

  pub async fn get_job(&self, job_id: i64) -> Result<Job> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE id = $1");
    let job = self
      .conn()
      .read_query_row_f(sql, params!(job_id), job_from_row)
      .await
      .map_err(StorageError::wrap("get job"))?;

    return job.ok_or(StorageError::NotFound);
  }
}
