use clap::{Args, Parser, Subcommand};

/// Command line arguments for the Quern server binary.
///
/// Rule of thumb: options requiring a server restart live here; everything
/// else belongs in the encrypted in-database configuration.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct DefaultCommandLineArgs {
  /// Path to the SQLite database file. Created on first start.
  #[arg(long, env, default_value = "./quern.db")]
  pub db_path: std::path::PathBuf,

  /// Path to the age X25519 identity used to decrypt configuration.
  /// Generated on first start if missing.
  #[arg(long, env, default_value = "./quern.age.key")]
  pub age_key_path: std::path::PathBuf,

  #[command(subcommand)]
  pub cmd: Option<SubCommands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommands {
  /// Starts the HTTP server (default).
  Run(ServerArgs),
  /// Inspect the job queue.
  Jobs {
    #[command(subcommand)]
    cmd: JobSubCommands,
  },
  /// Inspect and roll back encrypted configuration generations.
  Config {
    #[command(subcommand)]
    cmd: ConfigSubCommands,
  },
}

#[derive(Args, Clone, Debug, Default)]
pub struct ServerArgs {
  /// Authority (<host>:<port>) the HTTP server binds to.
  #[arg(short, long, env, default_value = "localhost:4000")]
  pub address: String,

  /// Optional TLS authority served with the stored ACME certificate.
  #[arg(long, env)]
  pub tls_address: Option<String>,

  /// Optional path for the secondary log database.
  #[arg(long, env)]
  pub logs_db_path: Option<std::path::PathBuf>,

  /// Limit the set of allowed origins the HTTP server will answer to.
  #[arg(long)]
  pub cors_allowed_origins: Vec<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum JobSubCommands {
  /// List jobs, newest first.
  List {
    /// Filter by status: pending, processing, completed or failed.
    #[arg(long)]
    status: Option<String>,

    #[arg(long, default_value_t = 50)]
    limit: usize,
  },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubCommands {
  /// List configuration generations for a scope.
  List {
    #[arg(long, default_value = "application")]
    scope: String,
  },
  /// Re-insert an older generation as the new latest.
  Rollback {
    #[arg(long, default_value = "application")]
    scope: String,

    /// Generations to walk back from latest (1 = previous).
    generation: usize,
  },
}
