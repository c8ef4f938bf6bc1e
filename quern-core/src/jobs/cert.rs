use chrono::Utc;
use log::*;
use std::sync::Arc;

use crate::config::Config;
use crate::queue::{HandlerError, Job, JobHandler};
use crate::storage::{AcmeCert, Storage};
use crate::util::parse_timestamp;
use crate::value_notifier::ValueNotifier;

/// Outcome of a successful DNS-01 order.
#[derive(Clone, Debug)]
pub struct IssuedCert {
  pub cert_chain_pem: String,
  pub private_key_pem: String,
  pub issued_at: String,
  pub expires_at: String,
}

/// Seam for the ACME client. The framework orchestrates *when* to renew and
/// where the result lands; the actual order/challenge dance (and the DNS
/// provider credentials it needs) is injected by the embedding application.
#[async_trait::async_trait]
pub trait Dns01Provisioner: Send + Sync {
  async fn provision(&self, identifier: &str, domains: &[String])
    -> Result<IssuedCert, HandlerError>;
}

/// Default provisioner: renewal attempts fail until a real one is injected.
pub struct NullProvisioner;

#[async_trait::async_trait]
impl Dns01Provisioner for NullProvisioner {
  async fn provision(
    &self,
    _identifier: &str,
    _domains: &[String],
  ) -> Result<IssuedCert, HandlerError> {
    return Err("no ACME provisioner configured".into());
  }
}

/// Recurrent certificate renewal: reads the stored certificate, renews via
/// DNS-01 when it is within the configured expiry window, and upserts the
/// result.
pub struct CertRenewalHandler {
  pub storage: Storage,
  pub config: Arc<ValueNotifier<Config>>,
  pub provisioner: Arc<dyn Dns01Provisioner>,
}

#[async_trait::async_trait]
impl JobHandler for CertRenewalHandler {
  async fn handle(&self, _job: &Job) -> Result<(), HandlerError> {
    let config = self.config.load_full();
    let acme = &config.acme;
    if !acme.enabled {
      return Ok(());
    }

    let current = self.storage.get_latest_cert().await?;
    if let Some(ref cert) = current {
      if let Some(expires_at) = parse_timestamp(&cert.expires_at) {
        let days_left = (expires_at - Utc::now()).num_days();
        if days_left >= acme.renewal_threshold_days {
          debug!(
            "Certificate for '{}' valid for {days_left} more days, skipping renewal",
            cert.identifier
          );
          return Ok(());
        }
      }
      // An unparseable expiry is treated as expired.
    }

    info!("Renewing certificate for '{}'", acme.identifier);
    let issued = self
      .provisioner
      .provision(&acme.identifier, &acme.domains)
      .await?;

    self
      .storage
      .save_cert(&AcmeCert {
        identifier: acme.identifier.clone(),
        domains: serde_json::to_string(&acme.domains)?,
        cert_chain_pem: issued.cert_chain_pem,
        private_key_pem: issued.private_key_pem,
        issued_at: issued.issued_at,
        expires_at: issued.expires_at,
        ..Default::default()
      })
      .await?;

    return Ok(());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::testing::test_storage;
  use crate::util::format_timestamp;
  use parking_lot::Mutex;

  struct FakeProvisioner {
    calls: Mutex<usize>,
    expires_at: String,
  }

  #[async_trait::async_trait]
  impl Dns01Provisioner for FakeProvisioner {
    async fn provision(
      &self,
      _identifier: &str,
      _domains: &[String],
    ) -> Result<IssuedCert, HandlerError> {
      *self.calls.lock() += 1;
      return Ok(IssuedCert {
        cert_chain_pem: "chain".to_string(),
        private_key_pem: "key".to_string(),
        issued_at: format_timestamp(Utc::now()),
        expires_at: self.expires_at.clone(),
      });
    }
  }

  fn acme_config() -> Config {
    let mut config = Config::new_with_defaults();
    config.acme.enabled = true;
    config.acme.identifier = "example.org".to_string();
    config.acme.domains = vec!["example.org".to_string()];
    config.acme.renewal_threshold_days = 30;
    return config;
  }

  fn test_job() -> Job {
    return Job {
      id: 1,
      job_type: "job_type_tls_cert_renewal".to_string(),
      payload: String::new(),
      payload_extra: String::new(),
      status: crate::queue::JobStatus::Processing,
      attempts: 1,
      max_attempts: 3,
      scheduled_for: String::new(),
      locked_at: String::new(),
      completed_at: String::new(),
      last_error: String::new(),
      recurrent: true,
      interval: chrono::Duration::hours(24),
      created_at: String::new(),
      updated_at: String::new(),
    };
  }

  #[tokio::test]
  async fn test_renews_when_missing_and_skips_when_fresh() {
    let storage = test_storage().await;
    let provisioner = Arc::new(FakeProvisioner {
      calls: Mutex::new(0),
      expires_at: format_timestamp(Utc::now() + chrono::Duration::days(90)),
    });

    let handler = CertRenewalHandler {
      storage: storage.clone(),
      config: Arc::new(ValueNotifier::new(acme_config())),
      provisioner: provisioner.clone(),
    };

    // No stored cert: provision.
    handler.handle(&test_job()).await.unwrap();
    assert_eq!(*provisioner.calls.lock(), 1);
    let cert = storage.get_latest_cert().await.unwrap().unwrap();
    assert_eq!(cert.identifier, "example.org");

    // 90 days left: nothing to do.
    handler.handle(&test_job()).await.unwrap();
    assert_eq!(*provisioner.calls.lock(), 1);
  }

  #[tokio::test]
  async fn test_renews_within_threshold() {
    let storage = test_storage().await;
    storage
      .save_cert(&AcmeCert {
        identifier: "example.org".to_string(),
        cert_chain_pem: "old".to_string(),
        private_key_pem: "old".to_string(),
        expires_at: format_timestamp(Utc::now() + chrono::Duration::days(5)),
        ..Default::default()
      })
      .await
      .unwrap();

    let provisioner = Arc::new(FakeProvisioner {
      calls: Mutex::new(0),
      expires_at: format_timestamp(Utc::now() + chrono::Duration::days(90)),
    });
    let handler = CertRenewalHandler {
      storage: storage.clone(),
      config: Arc::new(ValueNotifier::new(acme_config())),
      provisioner: provisioner.clone(),
    };

    handler.handle(&test_job()).await.unwrap();
    assert_eq!(*provisioner.calls.lock(), 1);

    let cert = storage.get_latest_cert().await.unwrap().unwrap();
    assert_eq!(cert.cert_chain_pem, "chain");
  }

  #[tokio::test]
  async fn test_disabled_is_noop() {
    let storage = test_storage().await;
    let provisioner = Arc::new(FakeProvisioner {
      calls: Mutex::new(0),
      expires_at: String::new(),
    });

    let handler = CertRenewalHandler {
      storage,
      config: Arc::new(ValueNotifier::new(Config::new_with_defaults())),
      provisioner: provisioner.clone(),
    };

    handler.handle(&test_job()).await.unwrap();
    assert_eq!(*provisioner.calls.lock(), 0);
  }

  #[tokio::test]
  async fn test_null_provisioner_fails_renewal() {
    let storage = test_storage().await;
    let handler = CertRenewalHandler {
      storage,
      config: Arc::new(ValueNotifier::new(acme_config())),
      provisioner: Arc::new(NullProvisioner),
    };

    assert!(handler.handle(&test_job()).await.is_err());
  }
}
