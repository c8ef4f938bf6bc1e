use age::secrecy::ExposeSecret;
use age::x25519;
use log::*;
use std::path::Path;
use std::str::FromStr;

use crate::config::{Config, ConfigError, ConfigFormat};
use crate::constants::APPLICATION_CONFIG_SCOPE;
use crate::storage::{ConfigRecord, Storage};

/// Encrypted-at-rest, versioned configuration store over the `app_config`
/// table.
///
/// Content is age-encrypted to the X25519 recipient derived from the process
/// identity; only ciphertext ever touches the database. History is
/// append-only: "latest" is the newest record within a scope and rollback
/// re-inserts an older generation so that latest always advances forward.
#[derive(Clone)]
pub struct ConfigStore {
  storage: Storage,
  identity: x25519::Identity,
  recipient: x25519::Recipient,
}

impl ConfigStore {
  pub fn new(storage: Storage, identity: x25519::Identity) -> Self {
    let recipient = identity.to_public();
    return ConfigStore {
      storage,
      identity,
      recipient,
    };
  }

  /// Latest plaintext for `scope`.
  pub async fn latest(&self, scope: &str) -> Result<(Vec<u8>, ConfigFormat), ConfigError> {
    return self.get(scope, 0).await;
  }

  /// Plaintext at `generation` offset from latest (0 = newest).
  pub async fn get(
    &self,
    scope: &str,
    generation: usize,
  ) -> Result<(Vec<u8>, ConfigFormat), ConfigError> {
    let Some(record) = self.storage.get_config(scope, generation).await? else {
      return Err(ConfigError::Missing(scope.to_string()));
    };

    return Ok((self.decrypt(&record)?, record_format(&record)));
  }

  /// Encrypts and appends a new generation for `scope`.
  pub async fn save(
    &self,
    scope: &str,
    plaintext: &[u8],
    format: ConfigFormat,
    description: &str,
  ) -> Result<ConfigRecord, ConfigError> {
    let ciphertext = age::encrypt(&self.recipient, plaintext)?;

    let record = self
      .storage
      .insert_config(scope, ciphertext, format.as_str(), description)
      .await?;
    return Ok(record);
  }

  /// History metadata for `scope`, newest first. Content stays encrypted.
  pub async fn list(&self, scope: &str) -> Result<Vec<ConfigRecord>, ConfigError> {
    return Ok(self.storage.list_configs(scope).await?);
  }

  /// Re-inserts the configuration `generation` steps back as the new latest.
  pub async fn rollback(&self, scope: &str, generation: usize) -> Result<ConfigRecord, ConfigError> {
    if generation == 0 {
      return Err(ConfigError::Invalid(
        "rollback generation must be at least 1".to_string(),
      ));
    }

    let (plaintext, format) = self.get(scope, generation).await?;
    return self
      .save(
        scope,
        &plaintext,
        format,
        &format!("rollback to generation -{generation}"),
      )
      .await;
  }

  /// Reads the latest `application` config, or writes and returns the
  /// defaults on a fresh database.
  pub async fn load_or_init_application_config(&self) -> Result<Config, ConfigError> {
    match self.latest(APPLICATION_CONFIG_SCOPE).await {
      Ok((plaintext, format)) => {
        return Config::from_slice(&plaintext, format);
      }
      Err(ConfigError::Missing(_)) => {
        warn!("No application config found, initializing defaults");

        let config = Config::new_with_defaults();
        let plaintext = config.to_bytes(ConfigFormat::Toml)?;
        self
          .save(
            APPLICATION_CONFIG_SCOPE,
            &plaintext,
            ConfigFormat::Toml,
            "initial default config",
          )
          .await?;
        return Ok(config);
      }
      Err(err) => {
        return Err(err);
      }
    }
  }

  fn decrypt(&self, record: &ConfigRecord) -> Result<Vec<u8>, ConfigError> {
    return Ok(age::decrypt(&self.identity, &record.content)?);
  }
}

fn record_format(record: &ConfigRecord) -> ConfigFormat {
  return ConfigFormat::from_str(&record.format).unwrap_or(ConfigFormat::Toml);
}

/// Loads the process identity from `path`, generating a fresh key on first
/// start.
pub async fn load_or_init_identity(path: &Path) -> Result<x25519::Identity, ConfigError> {
  match tokio::fs::read_to_string(path).await {
    Ok(contents) => {
      let line = contents
        .lines()
        .find(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .unwrap_or_default();

      return x25519::Identity::from_str(line.trim())
        .map_err(|err| ConfigError::Invalid(format!("invalid age identity: {err}")));
    }
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
      let identity = x25519::Identity::generate();

      if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
      }
      tokio::fs::write(path, identity.to_string().expose_secret()).await?;
      info!("Generated new age identity: {path:?}");

      return Ok(identity);
    }
    Err(err) => {
      return Err(err.into());
    }
  }
}
