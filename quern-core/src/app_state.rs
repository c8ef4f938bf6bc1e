use std::path::PathBuf;
use std::sync::Arc;

use crate::auth::tokens::TokenMinter;
use crate::config::{Config, ConfigError, ConfigFormat, ConfigStore};
use crate::constants::APPLICATION_CONFIG_SCOPE;
use crate::email::Mailer;
use crate::filter::RequestFilter;
use crate::storage::Storage;
use crate::value_notifier::{Computed, ValueNotifier};
use quern_sqlite::Connection;

/// The app's internal state. AppState needs to be clonable which puts
/// unnecessary constraints on the internals, thus rather arc once than many
/// times.
struct InternalState {
  conn: Connection,
  logs_conn: Connection,
  db_path: Option<PathBuf>,

  storage: Storage,
  config_store: ConfigStore,

  // The provider: subsystems derive their live views off this notifier.
  config: Arc<ValueNotifier<Config>>,
  mailer: Arc<Computed<Mailer, Config>>,
  minter: Arc<Computed<TokenMinter, Config>>,
  filter: Arc<Computed<RequestFilter, Config>>,
}

pub(crate) struct AppStateArgs {
  pub conn: Connection,
  pub logs_conn: Connection,
  pub db_path: Option<PathBuf>,
  pub config: Config,
  pub config_store: ConfigStore,
  pub mailer_override: Option<Mailer>,
}

#[derive(Clone)]
pub struct AppState {
  state: Arc<InternalState>,
}

impl AppState {
  pub(crate) fn new(args: AppStateArgs) -> Self {
    let config = Arc::new(ValueNotifier::new(args.config));

    let mailer = build_mailer(&config, args.mailer_override);
    let minter = Arc::new(Computed::new(&config, TokenMinter::new_from_config));
    let filter = Arc::new(Computed::new(&config, RequestFilter::new_from_config));

    return AppState {
      state: Arc::new(InternalState {
        storage: Storage::new(args.conn.clone()),
        conn: args.conn,
        logs_conn: args.logs_conn,
        db_path: args.db_path,
        config_store: args.config_store,
        config,
        mailer,
        minter,
        filter,
      }),
    };
  }

  pub fn conn(&self) -> &Connection {
    return &self.state.conn;
  }

  pub fn logs_conn(&self) -> &Connection {
    return &self.state.logs_conn;
  }

  pub fn storage(&self) -> &Storage {
    return &self.state.storage;
  }

  pub fn config_store(&self) -> &ConfigStore {
    return &self.state.config_store;
  }

  pub fn db_path(&self) -> Option<&PathBuf> {
    return self.state.db_path.as_ref();
  }

  pub fn get_config(&self) -> Config {
    return (*self.state.config.load_full()).clone();
  }

  pub fn access_config<F, T>(&self, f: F) -> T
  where
    F: Fn(&Config) -> T,
  {
    return f(&self.state.config.load());
  }

  pub(crate) fn config_provider(&self) -> Arc<ValueNotifier<Config>> {
    return self.state.config.clone();
  }

  pub(crate) fn mailer_computed(&self) -> Arc<Computed<Mailer, Config>> {
    return self.state.mailer.clone();
  }

  pub(crate) fn minter(&self) -> Arc<TokenMinter> {
    return self.state.minter.load_full();
  }

  pub(crate) fn minter_computed(&self) -> Arc<Computed<TokenMinter, Config>> {
    return self.state.minter.clone();
  }

  pub(crate) fn request_filter(&self) -> Arc<RequestFilter> {
    return self.state.filter.load_full();
  }

  /// Validates, persists (encrypted) and atomically publishes a new
  /// configuration. Derived subsystems refresh through their `Computed`
  /// bindings.
  pub async fn validate_and_update_config(
    &self,
    config: Config,
    description: &str,
  ) -> Result<(), ConfigError> {
    config.validate()?;

    let plaintext = config.to_bytes(ConfigFormat::Toml)?;
    self
      .state
      .config_store
      .save(
        APPLICATION_CONFIG_SCOPE,
        &plaintext,
        ConfigFormat::Toml,
        description,
      )
      .await?;

    self.state.config.store(config);
    return Ok(());
  }

  /// Re-reads the latest persisted config and publishes it, e.g. after an
  /// out-of-band rotation through the CLI.
  pub async fn reload_config(&self) -> Result<(), ConfigError> {
    let (plaintext, format) = self.state.config_store.latest(APPLICATION_CONFIG_SCOPE).await?;
    let config = Config::from_slice(&plaintext, format)?;

    self.state.config.store(config);
    return Ok(());
  }
}

fn build_mailer(
  config: &ValueNotifier<Config>,
  mailer_override: Option<Mailer>,
) -> Arc<Computed<Mailer, Config>> {
  return Arc::new(Computed::new(config, move |c| {
    if let Some(ref mailer) = mailer_override {
      return mailer.clone();
    }
    return Mailer::new_from_config(c);
  }));
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use crate::email::testing::TestAsyncSmtpTransport;
  use crate::migrations::{apply_logs_migrations, apply_main_migrations};

  pub(crate) struct TestStateOptions {
    pub config: Option<Config>,
    pub transport: TestAsyncSmtpTransport,
  }

  impl Default for TestStateOptions {
    fn default() -> Self {
      return TestStateOptions {
        config: None,
        transport: TestAsyncSmtpTransport::new(),
      };
    }
  }

  pub(crate) async fn test_state(options: Option<TestStateOptions>) -> AppState {
    let options = options.unwrap_or_default();

    let conn = Connection::open_in_memory().unwrap();
    apply_main_migrations(&conn).await.unwrap();

    let logs_conn = Connection::open_in_memory().unwrap();
    apply_logs_migrations(&logs_conn).await.unwrap();

    let config = options.config.unwrap_or_else(|| {
      let mut config = Config::new_with_defaults();
      config.server.site_url = "https://test.org".to_string();
      config.smtp.sender_address = Some("sender@test.org".to_string());
      config
    });
    config.validate().unwrap();

    let storage = Storage::new(conn.clone());
    let config_store = ConfigStore::new(storage, age::x25519::Identity::generate());

    return AppState::new(AppStateArgs {
      conn,
      logs_conn,
      db_path: None,
      config,
      config_store,
      mailer_override: Some(options.transport.into_mailer()),
    });
  }
}
