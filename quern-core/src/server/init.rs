use log::*;
use std::path::PathBuf;
use thiserror::Error;

use crate::app_state::{AppState, AppStateArgs};
use crate::config::store::load_or_init_identity;
use crate::config::{ConfigError, ConfigStore};
use crate::connection::{connect_logs_sqlite, connect_sqlite};
use crate::constants::LOGS_TABLE;
use crate::logging::ping;
use crate::migrations::{apply_logs_migrations, apply_main_migrations};
use crate::server::ServerOptions;
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum InitError {
  #[error("SQLite error: {0}")]
  Sqlite(#[from] quern_sqlite::Error),
  #[error("Storage error: {0}")]
  Storage(#[from] StorageError),
  #[error("Config error: {0}")]
  Config(#[from] ConfigError),
  #[error("IO error: {0}")]
  IO(#[from] std::io::Error),
  #[error("Listener bind error on {0}: {1}")]
  Bind(String, std::io::Error),
}

/// Bootstrap, in dependency order: database pool and schema, process
/// identity and config snapshot, then the logs database. Fatal errors here
/// surface as a nonzero exit before any listener binds.
pub(crate) async fn init_app_state(options: &ServerOptions) -> Result<AppState, InitError> {
  let conn = connect_sqlite(Some(options.db_path.clone()), None)?;
  let new_db = apply_main_migrations(&conn).await?;
  if new_db {
    info!("Initialized fresh database: {:?}", options.db_path);
  }

  let identity = load_or_init_identity(&options.age_key_path).await?;
  let config_store = ConfigStore::new(Storage::new(conn.clone()), identity);
  let config = config_store.load_or_init_application_config().await?;

  let logs_conn = connect_logs_sqlite(Some(logs_db_path(options))).map_err(|err| {
    error!("Failed to open logs DB: {err}");
    return err;
  })?;
  apply_logs_migrations(&logs_conn).await?;
  ping(&logs_conn, LOGS_TABLE).await?;

  return Ok(AppState::new(AppStateArgs {
    conn,
    logs_conn,
    db_path: Some(options.db_path.clone()),
    config,
    config_store,
    mailer_override: None,
  }));
}

pub(crate) fn logs_db_path(options: &ServerOptions) -> PathBuf {
  if let Some(ref path) = options.logs_db_path {
    return path.clone();
  }

  // Sibling of the main database: `main.db` -> `main-logs.db`.
  let stem = options
    .db_path
    .file_stem()
    .and_then(|s| s.to_str())
    .unwrap_or("quern");
  return options.db_path.with_file_name(format!("{stem}-logs.db"));
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_init_creates_databases_and_identity() {
    let dir = temp_dir::TempDir::new().unwrap();
    let options = ServerOptions {
      db_path: dir.path().join("main.db"),
      age_key_path: dir.path().join("age.key"),
      ..Default::default()
    };

    let state = init_app_state(&options).await.unwrap();
    assert!(options.db_path.exists());
    assert!(options.age_key_path.exists());
    assert!(dir.path().join("main-logs.db").exists());

    // Config was initialized with generated secrets and persists.
    let config = state.get_config();
    assert!(!config.jwt.auth_secret.is_empty());

    drop(state);

    let state = init_app_state(&options).await.unwrap();
    assert_eq!(state.get_config().jwt.auth_secret, config.jwt.auth_secret);
  }

  #[test]
  fn test_logs_db_path_derivation() {
    let options = ServerOptions {
      db_path: PathBuf::from("/data/app.db"),
      ..Default::default()
    };
    assert_eq!(logs_db_path(&options), PathBuf::from("/data/app-logs.db"));
  }
}
