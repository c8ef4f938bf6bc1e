use log::*;
use quern_sqlite::Connection;

/// Embedded schema migrations, versioned through `PRAGMA user_version`.
///
/// Versions must be contiguous and ascending; each entry runs in one
/// transaction together with the version bump.
type Migration = (i64, &'static str);

const MAIN_MIGRATIONS: &[Migration] = &[(1, include_str!("../migrations/main/V1__initial.sql"))];

const LOGS_MIGRATIONS: &[Migration] = &[(1, include_str!("../migrations/logs/V1__logs.sql"))];

/// Applies pending migrations to the main database. Returns true if the
/// database was newly initialized, i.e. migration V1 ran.
pub(crate) async fn apply_main_migrations(conn: &Connection) -> Result<bool, quern_sqlite::Error> {
  return apply_migrations(conn, "main", MAIN_MIGRATIONS).await;
}

pub(crate) async fn apply_logs_migrations(conn: &Connection) -> Result<bool, quern_sqlite::Error> {
  return apply_migrations(conn, "logs", LOGS_MIGRATIONS).await;
}

async fn apply_migrations(
  conn: &Connection,
  db_name: &'static str,
  migrations: &'static [Migration],
) -> Result<bool, quern_sqlite::Error> {
  return conn
    .call(move |conn| {
      let tx = conn.transaction()?;

      let current: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;

      let mut new_db = false;
      let mut applied = current;
      for (version, sql) in migrations {
        if *version <= current {
          continue;
        }

        tx.execute_batch(sql)?;
        applied = *version;
        if *version == 1 {
          new_db = true;
        }
      }

      if applied > current {
        tx.pragma_update(None, "user_version", applied)?;
        if !cfg!(test) {
          info!("Applied migrations for '{db_name}' DB: v{current} -> v{applied}");
        }
      }

      tx.commit()?;
      return Ok(new_db);
    })
    .await;
}
