pub mod store;

pub use store::ConfigStore;

use std::collections::HashMap;
use thiserror::Error;

use crate::constants::{
  DEFAULT_AUTH_TOKEN_TTL, DEFAULT_LONG_HANDLER_TIMEOUT, DEFAULT_PURPOSE_TOKEN_TTL,
  DEFAULT_SHORT_HANDLER_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_TICK_INTERVAL,
  SITE_URL_DEFAULT,
};
use crate::storage::StorageError;
use crate::util::generate_random_string;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("TOML decode error: {0}")]
  DecodeToml(#[from] toml::de::Error),
  #[error("TOML encode error: {0}")]
  EncodeToml(#[from] toml::ser::Error),
  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
  #[error("Encrypt error: {0}")]
  Encrypt(#[from] age::EncryptError),
  #[error("Decrypt error: {0}")]
  Decrypt(#[from] age::DecryptError),
  #[error("Validation error: {0}")]
  Invalid(String),
  #[error("Storage error: {0}")]
  Storage(#[from] StorageError),
  #[error("IO error: {0}")]
  IO(#[from] std::io::Error),
  #[error("Missing config for scope: {0}")]
  Missing(String),
}

/// Wire format of a configuration document; recorded per generation in the
/// `format` column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
  Toml,
  Json,
}

impl ConfigFormat {
  pub fn as_str(&self) -> &'static str {
    return match self {
      ConfigFormat::Toml => "toml",
      ConfigFormat::Json => "json",
    };
  }

  pub fn from_str(s: &str) -> Option<ConfigFormat> {
    return match s {
      "toml" => Some(ConfigFormat::Toml),
      "json" => Some(ConfigFormat::Json),
      _ => None,
    };
  }
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
  pub server: ServerConfig,
  pub jwt: JwtConfig,
  pub smtp: SmtpConfig,
  pub oauth2_providers: HashMap<String, Oauth2ProviderConfig>,
  pub endpoints: EndpointsConfig,
  pub acme: AcmeConfig,
  pub backup_local: BackupConfig,
  pub log: LogConfig,
  pub proxy: ProxyConfig,
  pub maintenance: MaintenanceConfig,
  pub scheduler: SchedulerConfig,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  pub application_name: String,
  /// Public URL used to compose callback links in outgoing emails.
  pub site_url: String,
  pub shutdown_timeout_sec: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    return ServerConfig {
      application_name: "Quern".to_string(),
      site_url: SITE_URL_DEFAULT.to_string(),
      shutdown_timeout_sec: DEFAULT_SHUTDOWN_TIMEOUT.as_secs(),
    };
  }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct JwtConfig {
  /// Per-purpose server secrets. Token signing keys are derived from these
  /// together with the user's email and password hash.
  pub auth_secret: String,
  pub verification_secret: String,
  pub password_reset_secret: String,
  pub email_change_secret: String,

  pub auth_token_ttl_sec: i64,
  pub purpose_token_ttl_sec: i64,

  /// Cooldown window for re-requesting verification/reset emails.
  pub cooldown_sec: i64,
}

impl Default for JwtConfig {
  fn default() -> Self {
    return JwtConfig {
      auth_secret: String::new(),
      verification_secret: String::new(),
      password_reset_secret: String::new(),
      email_change_secret: String::new(),
      auth_token_ttl_sec: DEFAULT_AUTH_TOKEN_TTL.num_seconds(),
      purpose_token_ttl_sec: DEFAULT_PURPOSE_TOKEN_TTL.num_seconds(),
      cooldown_sec: 300,
    };
  }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
  pub host: Option<String>,
  pub port: u16,
  pub username: Option<String>,
  pub password: Option<String>,
  pub sender_address: Option<String>,
  pub sender_name: Option<String>,
}

impl Default for SmtpConfig {
  fn default() -> Self {
    return SmtpConfig {
      host: None,
      port: 587,
      username: None,
      password: None,
      sender_address: None,
      sender_name: None,
    };
  }
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Oauth2ProviderConfig {
  pub client_id: String,
  pub client_secret: String,
  pub auth_url: String,
  pub token_url: String,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
  pub verification_path: String,
  pub password_reset_path: String,
  pub email_change_path: String,
}

impl Default for EndpointsConfig {
  fn default() -> Self {
    return EndpointsConfig {
      verification_path: "/api/confirm-verification".to_string(),
      password_reset_path: "/api/confirm-password-reset".to_string(),
      email_change_path: "/api/confirm-email-change".to_string(),
    };
  }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AcmeConfig {
  pub enabled: bool,
  pub identifier: String,
  pub domains: Vec<String>,
  pub renewal_threshold_days: i64,
  pub check_interval_sec: i64,
  pub handler_timeout_sec: u64,
}

impl Default for AcmeConfig {
  fn default() -> Self {
    return AcmeConfig {
      enabled: false,
      identifier: String::new(),
      domains: vec![],
      renewal_threshold_days: 30,
      check_interval_sec: 24 * 3600,
      handler_timeout_sec: DEFAULT_LONG_HANDLER_TIMEOUT.as_secs(),
    };
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStrategy {
  /// `VACUUM INTO` a temp file: simplest, takes a read transaction for the
  /// whole copy.
  Vacuum,
  /// SQLite online backup API in increments, yielding between steps to
  /// avoid starving writers.
  Online,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BackupConfig {
  pub enabled: bool,
  pub strategy: BackupStrategy,
  pub backup_dir: String,
  pub interval_sec: i64,
  pub pages_per_step: usize,
  pub sleep_between_steps_ms: u64,
  pub handler_timeout_sec: u64,
}

impl Default for BackupConfig {
  fn default() -> Self {
    return BackupConfig {
      enabled: false,
      strategy: BackupStrategy::Vacuum,
      backup_dir: "./backups".to_string(),
      interval_sec: 24 * 3600,
      pages_per_step: 512,
      sleep_between_steps_ms: 10,
      handler_timeout_sec: DEFAULT_LONG_HANDLER_TIMEOUT.as_secs(),
    };
  }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LogConfig {
  pub buffer_size: usize,
  pub flush_size: usize,
  pub flush_interval_ms: u64,
}

impl Default for LogConfig {
  fn default() -> Self {
    return LogConfig {
      buffer_size: 1024,
      flush_size: 128,
      flush_interval_ms: 250,
    };
  }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  pub ip_blocking_enabled: bool,
  /// Requests per bucket after which an IP gets blocked.
  pub block_threshold: u32,
  pub bucket_sec: i64,
  pub mimetype_filtering_enabled: bool,
  /// Lowercase exact-match Content-Type allow list.
  pub mimetype_whitelist: Vec<String>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    return ProxyConfig {
      ip_blocking_enabled: false,
      block_threshold: 300,
      bucket_sec: 60,
      mimetype_filtering_enabled: false,
      mimetype_whitelist: vec![
        "application/json".to_string(),
        "application/x-www-form-urlencoded".to_string(),
        "multipart/form-data".to_string(),
      ],
    };
  }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
  pub stale_job_threshold_sec: i64,
  pub sweep_interval_sec: i64,
}

impl Default for MaintenanceConfig {
  fn default() -> Self {
    return MaintenanceConfig {
      stale_job_threshold_sec: 3600,
      sweep_interval_sec: 600,
    };
  }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
  pub tick_interval_sec: u64,
  pub batch_size: usize,
  /// Worker count; 0 means available parallelism.
  pub workers: usize,
  pub email_handler_timeout_sec: u64,
  pub retry_backoff_base_sec: i64,
  pub retry_backoff_cap_sec: i64,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    return SchedulerConfig {
      tick_interval_sec: DEFAULT_TICK_INTERVAL.as_secs(),
      batch_size: 32,
      workers: 0,
      email_handler_timeout_sec: DEFAULT_SHORT_HANDLER_TIMEOUT.as_secs(),
      retry_backoff_base_sec: 15,
      retry_backoff_cap_sec: 3600,
    };
  }
}

impl Config {
  /// Default configuration for a fresh deployment: random per-purpose token
  /// secrets, everything optional disabled.
  pub fn new_with_defaults() -> Self {
    return Config {
      jwt: JwtConfig {
        auth_secret: generate_random_string(40),
        verification_secret: generate_random_string(40),
        password_reset_secret: generate_random_string(40),
        email_change_secret: generate_random_string(40),
        ..Default::default()
      },
      ..Default::default()
    };
  }

  pub fn from_slice(bytes: &[u8], format: ConfigFormat) -> Result<Self, ConfigError> {
    let config: Config = match format {
      ConfigFormat::Toml => toml::from_str(&String::from_utf8_lossy(bytes))?,
      ConfigFormat::Json => serde_json::from_slice(bytes)?,
    };

    config.validate()?;
    return Ok(config);
  }

  pub fn to_bytes(&self, format: ConfigFormat) -> Result<Vec<u8>, ConfigError> {
    return Ok(match format {
      ConfigFormat::Toml => toml::to_string_pretty(self)?.into_bytes(),
      ConfigFormat::Json => serde_json::to_vec_pretty(self)?,
    });
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    let ierr = |msg: String| Err(ConfigError::Invalid(msg));

    if self.server.application_name.is_empty() {
      return ierr("application name must not be empty".to_string());
    }

    for (name, secret) in [
      ("auth_secret", &self.jwt.auth_secret),
      ("verification_secret", &self.jwt.verification_secret),
      ("password_reset_secret", &self.jwt.password_reset_secret),
      ("email_change_secret", &self.jwt.email_change_secret),
    ] {
      if secret.is_empty() {
        return ierr(format!("jwt.{name} must not be empty"));
      }
    }

    if self.jwt.cooldown_sec <= 0 {
      return ierr("jwt.cooldown_sec must be positive".to_string());
    }

    if self.acme.enabled {
      if self.acme.identifier.is_empty() {
        return ierr("acme.identifier required when acme is enabled".to_string());
      }
      if self.acme.domains.is_empty() {
        return ierr("acme.domains required when acme is enabled".to_string());
      }
    }

    if self.backup_local.enabled && self.backup_local.backup_dir.is_empty() {
      return ierr("backup_local.backup_dir must not be empty".to_string());
    }

    if self.scheduler.tick_interval_sec == 0 || self.scheduler.batch_size == 0 {
      return ierr("scheduler tick interval and batch size must be positive".to_string());
    }

    for (name, provider) in &self.oauth2_providers {
      if provider.client_id.is_empty() || provider.client_secret.is_empty() {
        return ierr(format!("oauth2 provider '{name}' missing client id/secret"));
      }
    }

    for mimetype in &self.proxy.mimetype_whitelist {
      if *mimetype != mimetype.to_lowercase() {
        return ierr(format!("mimetype whitelist entry not lowercase: {mimetype}"));
      }
    }

    return Ok(());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_config_is_valid() {
    Config::new_with_defaults().validate().unwrap();
  }

  #[test]
  fn test_missing_secrets_rejected() {
    let config = Config::default();
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
  }

  #[test]
  fn test_toml_round_trip() {
    let config = Config::new_with_defaults();
    let bytes = config.to_bytes(ConfigFormat::Toml).unwrap();
    let parsed = Config::from_slice(&bytes, ConfigFormat::Toml).unwrap();
    assert_eq!(config, parsed);
  }

  #[test]
  fn test_json_round_trip() {
    let mut config = Config::new_with_defaults();
    config.backup_local.enabled = true;
    config.backup_local.strategy = BackupStrategy::Online;

    let bytes = config.to_bytes(ConfigFormat::Json).unwrap();
    let parsed = Config::from_slice(&bytes, ConfigFormat::Json).unwrap();
    assert_eq!(config, parsed);
  }

  #[test]
  fn test_partial_toml_uses_defaults() {
    let text = r#"
      [server]
      application_name = "Test"

      [jwt]
      auth_secret = "a"
      verification_secret = "b"
      password_reset_secret = "c"
      email_change_secret = "d"
    "#;

    let config = Config::from_slice(text.as_bytes(), ConfigFormat::Toml).unwrap();
    assert_eq!(config.server.application_name, "Test");
    assert_eq!(config.scheduler.tick_interval_sec, 15);
    assert!(!config.acme.enabled);
  }

  #[test]
  fn test_acme_requires_identifier() {
    let mut config = Config::new_with_defaults();
    config.acme.enabled = true;
    assert!(config.validate().is_err());

    config.acme.identifier = "example.org".to_string();
    config.acme.domains = vec!["example.org".to_string()];
    config.validate().unwrap();
  }
}
