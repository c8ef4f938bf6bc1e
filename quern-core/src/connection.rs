use std::path::PathBuf;

use quern_sqlite::{Connection, Options};

/// Opens the shared application database.
///
/// This is the one constructor both the framework and embedding applications
/// are expected to use: a second pool against the same file would contend on
/// the writer at the OS level without either pool knowing.
pub fn connect_sqlite(path: Option<PathBuf>, n_read_threads: Option<usize>) -> Result<Connection, quern_sqlite::Error> {
  let n_read_threads = n_read_threads.unwrap_or_else(|| {
    return std::thread::available_parallelism().map_or(4, |n| n.get());
  });

  let conn = Connection::new(
    move || -> Result<rusqlite::Connection, rusqlite::Error> {
      let conn = match path {
        Some(ref path) => rusqlite::Connection::open(path)?,
        None => rusqlite::Connection::open_in_memory()?,
      };

      conn.execute_batch(
        r#"
          PRAGMA journal_mode = WAL;
          PRAGMA synchronous = NORMAL;
          PRAGMA foreign_keys = ON;
          PRAGMA temp_store = MEMORY;
        "#,
      )?;

      return Ok(conn);
    },
    Some(Options {
      n_read_threads,
      ..Default::default()
    }),
  )?;

  return Ok(conn);
}

/// Opens the secondary log database. Tuned for write throughput over
/// durability; log records are expendable.
pub(crate) fn connect_logs_sqlite(path: Option<PathBuf>) -> Result<Connection, quern_sqlite::Error> {
  let conn = Connection::new(
    move || -> Result<rusqlite::Connection, rusqlite::Error> {
      let conn = match path {
        Some(ref path) => rusqlite::Connection::open(path)?,
        None => rusqlite::Connection::open_in_memory()?,
      };

      conn.execute_batch(
        r#"
          PRAGMA journal_mode = WAL;
          PRAGMA synchronous = NORMAL;
          PRAGMA foreign_keys = OFF;
          PRAGMA secure_delete = OFF;
        "#,
      )?;

      return Ok(conn);
    },
    None,
  )?;

  return Ok(conn);
}
