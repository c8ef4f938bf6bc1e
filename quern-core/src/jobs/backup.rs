use flate2::write::GzEncoder;
use flate2::Compression;
use log::*;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{BackupConfig, BackupStrategy, Config};
use crate::queue::{HandlerError, Job, JobHandler};
use crate::util::{generate_random_string, now_timestamp};
use crate::value_notifier::ValueNotifier;

/// Recurrent local database backup.
///
/// Copies the database to a temp file using the configured strategy, then
/// gzips it to `<base>-<timestamp>-<strategy>.bck.gz` in the backup
/// directory. The temp file is removed on every exit path. Both strategies
/// run on dedicated connections off the shared pool so application traffic
/// keeps flowing.
pub struct BackupHandler {
  pub config: Arc<ValueNotifier<Config>>,
  pub db_path: Option<PathBuf>,
}

#[async_trait::async_trait]
impl JobHandler for BackupHandler {
  async fn handle(&self, _job: &Job) -> Result<(), HandlerError> {
    let config = self.config.load_full();
    let backup = config.backup_local.clone();
    if !backup.enabled {
      return Ok(());
    }

    let Some(db_path) = self.db_path.clone() else {
      return Err("backup requires a file-backed database".into());
    };

    return tokio::task::spawn_blocking(move || run_backup(&db_path, &backup)).await?;
  }
}

fn run_backup(db_path: &Path, config: &BackupConfig) -> Result<(), HandlerError> {
  let backup_dir = PathBuf::from(&config.backup_dir);
  std::fs::create_dir_all(&backup_dir)?;

  let base = db_path
    .file_stem()
    .and_then(|s| s.to_str())
    .unwrap_or("backup");

  let strategy = match config.strategy {
    BackupStrategy::Vacuum => "vacuum",
    BackupStrategy::Online => "online",
  };

  // RFC3339 made filename-safe.
  let timestamp = now_timestamp().replace(':', "-");
  let target = backup_dir.join(format!("{base}-{timestamp}-{strategy}.bck.gz"));
  let tmp = backup_dir.join(format!(".{base}-{}.tmp", generate_random_string(8)));

  let result = copy_and_compress(db_path, &tmp, &target, config);

  if tmp.exists() {
    if let Err(err) = std::fs::remove_file(&tmp) {
      warn!("Failed to remove backup temp file {tmp:?}: {err}");
    }
  }

  result?;
  info!("Wrote backup: {target:?}");
  return Ok(());
}

fn copy_and_compress(
  db_path: &Path,
  tmp: &Path,
  target: &Path,
  config: &BackupConfig,
) -> Result<(), HandlerError> {
  match config.strategy {
    BackupStrategy::Vacuum => vacuum_into(db_path, tmp)?,
    BackupStrategy::Online => online_backup(db_path, tmp, config)?,
  };

  let mut input = std::fs::File::open(tmp)?;
  let output = std::fs::File::create(target)?;
  let mut encoder = GzEncoder::new(output, Compression::default());

  let mut buffer = vec![0u8; 64 * 1024];
  loop {
    let n = input.read(&mut buffer)?;
    if n == 0 {
      break;
    }
    encoder.write_all(&buffer[..n])?;
  }
  encoder.finish()?;

  return Ok(());
}

fn vacuum_into(db_path: &Path, tmp: &Path) -> Result<(), HandlerError> {
  let src = rusqlite::Connection::open(db_path)?;
  let tmp_str = tmp
    .to_str()
    .ok_or("backup temp path is not valid UTF-8")?
    .to_string();

  src.execute("VACUUM INTO $1", rusqlite::params![tmp_str])?;
  return Ok(());
}

/// SQLite online backup API in `pages_per_step` increments, sleeping between
/// steps so a concurrent writer is not starved. Progress is logged at
/// roughly 10% granularity.
fn online_backup(db_path: &Path, tmp: &Path, config: &BackupConfig) -> Result<(), HandlerError> {
  let src = rusqlite::Connection::open_with_flags(
    db_path,
    rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
  )?;
  let mut dst = rusqlite::Connection::open(tmp)?;

  let backup = rusqlite::backup::Backup::new(&src, &mut dst)?;
  let pages_per_step = i32::try_from(config.pages_per_step.max(1)).unwrap_or(i32::MAX);
  let sleep = std::time::Duration::from_millis(config.sleep_between_steps_ms);

  let mut last_logged_decile = 0;
  loop {
    let step = backup.step(pages_per_step)?;

    let progress = backup.progress();
    if progress.pagecount > 0 {
      let decile = 10 * (progress.pagecount - progress.remaining) / progress.pagecount;
      if decile > last_logged_decile {
        last_logged_decile = decile;
        debug!("Backup progress: {}%", decile * 10);
      }
    }

    match step {
      rusqlite::backup::StepResult::Done => break,
      rusqlite::backup::StepResult::More
      | rusqlite::backup::StepResult::Busy
      | rusqlite::backup::StepResult::Locked => {
        std::thread::sleep(sleep);
      }
      _ => {
        std::thread::sleep(sleep);
      }
    }
  }

  return Ok(());
}
