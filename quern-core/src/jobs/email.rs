use std::sync::Arc;

use crate::auth::tokens::{TokenMinter, TokenPurpose};
use crate::config::Config;
use crate::email::{Email, Mailer};
use crate::queue::{HandlerError, Job, JobHandler};
use crate::storage::Storage;
use crate::value_notifier::{Computed, ValueNotifier};

// Transactional email handlers. Payloads are produced by the HTTP layer with
// a cooldown bucket baked in, so re-requests within the window never reach
// the queue. Handlers capture one config snapshot at entry and use it
// throughout the invocation.

#[derive(serde::Deserialize)]
struct VerificationPayload {
  email: String,
  #[allow(unused)]
  cooldown_bucket: i64,
}

pub struct EmailVerificationHandler {
  pub storage: Storage,
  pub config: Arc<ValueNotifier<Config>>,
  pub mailer: Arc<Computed<Mailer, Config>>,
  pub minter: Arc<Computed<TokenMinter, Config>>,
}

#[async_trait::async_trait]
impl JobHandler for EmailVerificationHandler {
  async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
    let payload: VerificationPayload = serde_json::from_str(&job.payload)?;
    let config = self.config.load_full();

    let user = self.storage.get_user_by_email(&payload.email).await?;
    if user.verified {
      // Redelivery after a crash or a stale queue entry.
      return Ok(());
    }

    let token = self
      .minter
      .load()
      .mint(TokenPurpose::Verification, &user, None)?;

    Email::verification_email(self.mailer.load_full().as_ref().clone(), &config, &user.email, &token)?
      .send()
      .await?;
    return Ok(());
  }
}

#[derive(serde::Deserialize)]
struct PasswordResetPayload {
  user_id: String,
  #[allow(unused)]
  cooldown_bucket: i64,
}

#[derive(serde::Deserialize)]
struct PasswordResetExtra {
  email: String,
}

pub struct PasswordResetHandler {
  pub storage: Storage,
  pub config: Arc<ValueNotifier<Config>>,
  pub mailer: Arc<Computed<Mailer, Config>>,
  pub minter: Arc<Computed<TokenMinter, Config>>,
}

#[async_trait::async_trait]
impl JobHandler for PasswordResetHandler {
  async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
    let payload: PasswordResetPayload = serde_json::from_str(&job.payload)?;
    let config = self.config.load_full();

    let user = self.storage.get_user_by_id(&payload.user_id).await?;

    // The destination address travels in the non-unique extra column.
    let to = serde_json::from_str::<PasswordResetExtra>(&job.payload_extra)
      .map(|e| e.email)
      .unwrap_or_else(|_| user.email.clone());

    let token = self
      .minter
      .load()
      .mint(TokenPurpose::PasswordReset, &user, None)?;

    Email::password_reset_email(self.mailer.load_full().as_ref().clone(), &config, &to, &token)?
      .send()
      .await?;
    return Ok(());
  }
}

#[derive(serde::Deserialize)]
struct EmailChangePayload {
  user_id: String,
  new_email: String,
  #[allow(unused)]
  cooldown_bucket: i64,
}

pub struct EmailChangeHandler {
  pub storage: Storage,
  pub config: Arc<ValueNotifier<Config>>,
  pub mailer: Arc<Computed<Mailer, Config>>,
  pub minter: Arc<Computed<TokenMinter, Config>>,
}

#[async_trait::async_trait]
impl JobHandler for EmailChangeHandler {
  async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
    let payload: EmailChangePayload = serde_json::from_str(&job.payload)?;
    let config = self.config.load_full();

    let user = self.storage.get_user_by_id(&payload.user_id).await?;

    let token = self.minter.load().mint(
      TokenPurpose::EmailChange,
      &user,
      Some(payload.new_email.clone()),
    )?;

    Email::change_email_address_email(
      self.mailer.load_full().as_ref().clone(),
      &config,
      &payload.new_email,
      &token,
    )?
    .send()
    .await?;
    return Ok(());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::email::testing::TestAsyncSmtpTransport;
  use crate::queue::JobStatus;
  use crate::storage::testing::test_storage;

  fn test_job(job_type: &str, payload: String, extra: String) -> Job {
    return Job {
      id: 1,
      job_type: job_type.to_string(),
      payload,
      payload_extra: extra,
      status: JobStatus::Processing,
      attempts: 1,
      max_attempts: 3,
      scheduled_for: String::new(),
      locked_at: String::new(),
      completed_at: String::new(),
      last_error: String::new(),
      recurrent: false,
      interval: chrono::Duration::zero(),
      created_at: String::new(),
      updated_at: String::new(),
    };
  }

  struct Fixture {
    storage: Storage,
    config: Arc<ValueNotifier<Config>>,
    mailer: Arc<Computed<Mailer, Config>>,
    minter: Arc<Computed<TokenMinter, Config>>,
    transport: TestAsyncSmtpTransport,
  }

  async fn fixture() -> Fixture {
    let storage = test_storage().await;

    let mut config = Config::new_with_defaults();
    config.server.site_url = "https://test.org".to_string();
    config.smtp.sender_address = Some("sender@test.org".to_string());
    let config = Arc::new(ValueNotifier::new(config));

    let transport = TestAsyncSmtpTransport::new();
    let mailer = {
      let transport = transport.clone();
      Arc::new(Computed::new(&config, move |_c| {
        return transport.clone().into_mailer();
      }))
    };
    let minter = Arc::new(Computed::new(&config, TokenMinter::new_from_config));

    return Fixture {
      storage,
      config,
      mailer,
      minter,
      transport,
    };
  }

  #[tokio::test]
  async fn test_verification_email_sent() {
    let f = fixture().await;
    let user = f
      .storage
      .create_user_with_password("foo@test.org", "hash", "Foo")
      .await
      .unwrap();

    let handler = EmailVerificationHandler {
      storage: f.storage.clone(),
      config: f.config.clone(),
      mailer: f.mailer.clone(),
      minter: f.minter.clone(),
    };

    let job = test_job(
      "job_type_email_verification",
      r#"{"email":"foo@test.org","cooldown_bucket":42}"#.to_string(),
      String::new(),
    );
    handler.handle(&job).await.unwrap();

    let logs = f.transport.get_logs();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].1.contains("confirm-verification"));

    // Already verified: nothing further is sent.
    f.storage.verify_email(&user.id).await.unwrap();
    handler.handle(&job).await.unwrap();
    assert_eq!(f.transport.get_logs().len(), 1);
  }

  #[tokio::test]
  async fn test_password_reset_uses_extra_address() {
    let f = fixture().await;
    let user = f
      .storage
      .create_user_with_password("foo@test.org", "hash", "Foo")
      .await
      .unwrap();

    let handler = PasswordResetHandler {
      storage: f.storage.clone(),
      config: f.config.clone(),
      mailer: f.mailer.clone(),
      minter: f.minter.clone(),
    };

    let job = test_job(
      "job_type_password_reset",
      format!(r#"{{"user_id":"{}","cooldown_bucket":42}}"#, user.id),
      r#"{"email":"foo@test.org"}"#.to_string(),
    );
    handler.handle(&job).await.unwrap();

    let logs = f.transport.get_logs();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].1.contains("confirm-password-reset"));
  }

  #[tokio::test]
  async fn test_missing_user_errors() {
    let f = fixture().await;

    let handler = EmailChangeHandler {
      storage: f.storage.clone(),
      config: f.config.clone(),
      mailer: f.mailer.clone(),
      minter: f.minter.clone(),
    };

    let job = test_job(
      "job_type_email_change",
      r#"{"user_id":"missing","new_email":"new@test.org","cooldown_bucket":1}"#.to_string(),
      String::new(),
    );
    assert!(handler.handle(&job).await.is_err());
    assert!(f.transport.get_logs().is_empty());
  }
}
