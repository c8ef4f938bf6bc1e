mod certs;
mod configs;
mod jobs;
mod users;

pub use certs::AcmeCert;
pub use configs::ConfigRecord;
pub use users::DbUser;

use quern_sqlite::Connection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
  /// A `UNIQUE`/primary-key constraint fired. Callers use this for
  /// dedup/cooldown decisions, so it must stay recognizable.
  #[error("unique constraint violation")]
  ConstraintUnique,

  #[error("not found")]
  NotFound,

  #[error("invalid argument: {0}")]
  Invalid(&'static str),

  #[error("{context}: {source}")]
  Sql {
    context: &'static str,
    source: quern_sqlite::Error,
  },
}

impl StorageError {
  /// Wraps a driver error with operation context, surfacing unique-constraint
  /// failures as the distinguished variant.
  pub(crate) fn wrap(context: &'static str) -> impl Fn(quern_sqlite::Error) -> StorageError {
    return move |err: quern_sqlite::Error| {
      if let quern_sqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(sqlite_err, _)) = &err {
        // https://www.sqlite.org/rescode.html: 2067 = SQLITE_CONSTRAINT_UNIQUE,
        // 1555 = SQLITE_CONSTRAINT_PRIMARYKEY.
        if sqlite_err.extended_code == 2067 || sqlite_err.extended_code == 1555 {
          return StorageError::ConstraintUnique;
        }
      }

      return StorageError::Sql {
        context,
        source: err,
      };
    };
  }
}

/// Typed operations over the application tables. Cheap to clone; all clones
/// share the underlying connection pool.
#[derive(Clone)]
pub struct Storage {
  conn: Connection,
}

impl Storage {
  pub fn new(conn: Connection) -> Self {
    return Storage { conn };
  }

  pub fn conn(&self) -> &Connection {
    return &self.conn;
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use crate::migrations::apply_main_migrations;

  pub(crate) async fn test_storage() -> Storage {
    let conn = Connection::open_in_memory().unwrap();
    apply_main_migrations(&conn).await.unwrap();
    return Storage::new(conn);
  }
}
