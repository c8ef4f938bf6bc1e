mod backup;
mod cert;
mod email;
mod maintenance;

pub use backup::BackupHandler;
pub use cert::{CertRenewalHandler, Dns01Provisioner, IssuedCert, NullProvisioner};
pub use email::{EmailChangeHandler, EmailVerificationHandler, PasswordResetHandler};
pub use maintenance::StuckJobRecoveryHandler;

use chrono::{Duration, Utc};
use log::*;
use std::path::PathBuf;
use std::sync::Arc;

use crate::auth::tokens::TokenMinter;
use crate::config::Config;
use crate::constants::{
  JOB_TYPE_BACKUP_LOCAL, JOB_TYPE_EMAIL_CHANGE, JOB_TYPE_EMAIL_VERIFICATION,
  JOB_TYPE_PASSWORD_RESET, JOB_TYPE_STUCK_JOB_RECOVERY, JOB_TYPE_TLS_CERT_RENEWAL,
};
use crate::email::Mailer;
use crate::queue::{HandlerRegistry, NewJob};
use crate::storage::{Storage, StorageError};
use crate::value_notifier::{Computed, ValueNotifier};

/// Everything the built-in handlers depend on. Handlers get the config
/// *provider* rather than the app itself; no handler holds a reference back
/// to the server.
pub struct HandlerDeps {
  pub storage: Storage,
  pub config: Arc<ValueNotifier<Config>>,
  pub mailer: Arc<Computed<Mailer, Config>>,
  pub minter: Arc<Computed<TokenMinter, Config>>,
  pub db_path: Option<PathBuf>,
  pub provisioner: Arc<dyn Dns01Provisioner>,
}

/// Assembles the immutable handler registry. Timeouts come from the boot
/// config; changing them requires a restart.
pub fn build_registry(deps: &HandlerDeps, boot_config: &Config) -> HandlerRegistry {
  let mut registry = HandlerRegistry::new();

  let email_timeout =
    std::time::Duration::from_secs(boot_config.scheduler.email_handler_timeout_sec);

  registry.register(
    JOB_TYPE_EMAIL_VERIFICATION,
    Arc::new(EmailVerificationHandler {
      storage: deps.storage.clone(),
      config: deps.config.clone(),
      mailer: deps.mailer.clone(),
      minter: deps.minter.clone(),
    }),
    email_timeout,
    3,
  );

  registry.register(
    JOB_TYPE_PASSWORD_RESET,
    Arc::new(PasswordResetHandler {
      storage: deps.storage.clone(),
      config: deps.config.clone(),
      mailer: deps.mailer.clone(),
      minter: deps.minter.clone(),
    }),
    email_timeout,
    3,
  );

  registry.register(
    JOB_TYPE_EMAIL_CHANGE,
    Arc::new(EmailChangeHandler {
      storage: deps.storage.clone(),
      config: deps.config.clone(),
      mailer: deps.mailer.clone(),
      minter: deps.minter.clone(),
    }),
    email_timeout,
    3,
  );

  registry.register(
    JOB_TYPE_TLS_CERT_RENEWAL,
    Arc::new(CertRenewalHandler {
      storage: deps.storage.clone(),
      config: deps.config.clone(),
      provisioner: deps.provisioner.clone(),
    }),
    std::time::Duration::from_secs(boot_config.acme.handler_timeout_sec),
    3,
  );

  registry.register(
    JOB_TYPE_BACKUP_LOCAL,
    Arc::new(BackupHandler {
      config: deps.config.clone(),
      db_path: deps.db_path.clone(),
    }),
    std::time::Duration::from_secs(boot_config.backup_local.handler_timeout_sec),
    3,
  );

  registry.register(
    JOB_TYPE_STUCK_JOB_RECOVERY,
    Arc::new(StuckJobRecoveryHandler {
      storage: deps.storage.clone(),
      config: deps.config.clone(),
    }),
    std::time::Duration::from_secs(60),
    3,
  );

  return registry;
}

/// Seeds the recurrent system jobs. Existence-checked so restarts do not
/// pile up occurrences.
pub async fn seed_system_jobs(storage: &Storage, config: &Config) -> Result<(), StorageError> {
  let now = Utc::now();

  let mut seeds: Vec<(&str, Duration)> = vec![(
    JOB_TYPE_STUCK_JOB_RECOVERY,
    Duration::seconds(config.maintenance.sweep_interval_sec.max(1)),
  )];

  if config.acme.enabled {
    seeds.push((
      JOB_TYPE_TLS_CERT_RENEWAL,
      Duration::seconds(config.acme.check_interval_sec.max(1)),
    ));
  }
  if config.backup_local.enabled {
    seeds.push((
      JOB_TYPE_BACKUP_LOCAL,
      Duration::seconds(config.backup_local.interval_sec.max(1)),
    ));
  }

  for (job_type, interval) in seeds {
    if storage.has_open_job(job_type).await? {
      continue;
    }

    let scheduled_for = crate::util::format_timestamp(now);
    let payload = serde_json::json!({ "scheduled_for": scheduled_for }).to_string();

    match storage
      .insert_job(
        &NewJob::new(job_type, payload)
          .scheduled_at(now)
          .recurrent_every(interval),
      )
      .await
    {
      Ok(job) => debug!("Seeded system job '{job_type}' as #{}", job.id),
      // Lost a race against a concurrent seeder; the job exists.
      Err(StorageError::ConstraintUnique) => {}
      Err(err) => return Err(err),
    }
  }

  return Ok(());
}
