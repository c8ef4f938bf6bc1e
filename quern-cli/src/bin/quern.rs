use clap::Parser;
use log::*;

use quern::config::store::load_or_init_identity;
use quern::config::ConfigStore;
use quern::queue::JobStatus;
use quern::storage::Storage;
use quern::{connect_sqlite, Server, ServerOptions};
use quern_cli::args::{ConfigSubCommands, DefaultCommandLineArgs, JobSubCommands, ServerArgs, SubCommands};

#[tokio::main]
async fn main() {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

  let args = DefaultCommandLineArgs::parse();
  let cmd = args.cmd.clone().unwrap_or(SubCommands::Run(ServerArgs {
    address: "localhost:4000".to_string(),
    ..Default::default()
  }));

  let exit_code = match cmd {
    SubCommands::Run(server_args) => run_server(&args, server_args).await,
    SubCommands::Jobs { cmd } => jobs_command(&args, cmd).await,
    SubCommands::Config { cmd } => config_command(&args, cmd).await,
  };

  std::process::exit(exit_code);
}

async fn run_server(args: &DefaultCommandLineArgs, server_args: ServerArgs) -> i32 {
  let options = ServerOptions {
    db_path: args.db_path.clone(),
    age_key_path: args.age_key_path.clone(),
    logs_db_path: server_args.logs_db_path,
    address: server_args.address,
    tls_address: server_args.tls_address,
    cors_allowed_origins: server_args.cors_allowed_origins,
  };

  let server = match Server::init(options).await {
    Ok(server) => server,
    Err(err) => {
      error!("Failed to initialize: {err}");
      return 1;
    }
  };

  if let Err(err) = server.serve().await {
    error!("{err}");
    return 1;
  }
  return 0;
}

async fn jobs_command(args: &DefaultCommandLineArgs, cmd: JobSubCommands) -> i32 {
  let storage = match open_storage(args) {
    Ok(storage) => storage,
    Err(code) => return code,
  };

  match cmd {
    JobSubCommands::List { status, limit } => {
      let status = match status.as_deref() {
        None => None,
        Some(s) => match JobStatus::from_str(s) {
          Some(status) => Some(status),
          None => {
            error!("Unknown status: {s}");
            return 1;
          }
        },
      };

      let jobs = match storage.list_jobs(status, limit, 0).await {
        Ok(jobs) => jobs,
        Err(err) => {
          error!("Failed to list jobs: {err}");
          return 1;
        }
      };

      for job in jobs {
        println!(
          "{}",
          serde_json::json!({
            "id": job.id,
            "job_type": job.job_type,
            "status": job.status.as_str(),
            "attempts": job.attempts,
            "max_attempts": job.max_attempts,
            "scheduled_for": job.scheduled_for,
            "last_error": job.last_error,
            "recurrent": job.recurrent,
            "updated_at": job.updated_at,
          })
        );
      }
    }
  }

  return 0;
}

async fn config_command(args: &DefaultCommandLineArgs, cmd: ConfigSubCommands) -> i32 {
  let storage = match open_storage(args) {
    Ok(storage) => storage,
    Err(code) => return code,
  };

  let identity = match load_or_init_identity(&args.age_key_path).await {
    Ok(identity) => identity,
    Err(err) => {
      error!("Failed to load age identity: {err}");
      return 1;
    }
  };
  let store = ConfigStore::new(storage, identity);

  match cmd {
    ConfigSubCommands::List { scope } => {
      let records = match store.list(&scope).await {
        Ok(records) => records,
        Err(err) => {
          error!("Failed to list configs: {err}");
          return 1;
        }
      };

      for (generation, record) in records.iter().enumerate() {
        println!(
          "{}",
          serde_json::json!({
            "generation": generation,
            "id": record.id,
            "scope": record.scope,
            "format": record.format,
            "description": record.description,
            "created_at": record.created_at,
          })
        );
      }
    }
    ConfigSubCommands::Rollback { scope, generation } => {
      match store.rollback(&scope, generation).await {
        Ok(record) => {
          info!(
            "Rolled '{scope}' back {generation} generation(s); new latest is record {}",
            record.id
          );
        }
        Err(err) => {
          error!("Rollback failed: {err}");
          return 1;
        }
      }
    }
  }

  return 0;
}

fn open_storage(args: &DefaultCommandLineArgs) -> Result<Storage, i32> {
  if !args.db_path.exists() {
    error!("Database does not exist: {:?}", args.db_path);
    return Err(1);
  }

  let conn = connect_sqlite(Some(args.db_path.clone()), Some(0)).map_err(|err| {
    error!("Failed to open database: {err}");
    return 1;
  })?;
  return Ok(Storage::new(conn));
}
