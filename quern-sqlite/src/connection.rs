use crossbeam_channel::{Receiver, Sender};
use log::*;
use std::fmt::{self, Debug};
use std::path::PathBuf;
use tokio::sync::oneshot;

use crate::error::Error;
pub use crate::params::Params;

#[macro_export]
macro_rules! params {
    () => {
        ()
    };
    ($($param:expr),+ $(,)?) => {
        [$(Into::<$crate::params::ToSqlType>::into($param)),+]
    };
}

type Result<T> = std::result::Result<T, Error>;

enum Message {
  RunMut(Box<dyn FnOnce(&mut rusqlite::Connection) + Send + 'static>),
  RunConst(Box<dyn FnOnce(&rusqlite::Connection) + Send + 'static>),
  Close(oneshot::Sender<std::result::Result<(), rusqlite::Error>>),
  Terminate,
}

#[derive(Clone)]
pub struct Options {
  pub busy_timeout: std::time::Duration,
  pub n_read_threads: usize,
}

impl Default for Options {
  fn default() -> Self {
    return Self {
      busy_timeout: std::time::Duration::from_secs(5),
      n_read_threads: 0,
    };
  }
}

/// Handle to a set of SQLite connections running on dedicated threads: one
/// writer plus `n_read_threads` readers against the same database file.
///
/// All writes funnel through the single writer thread, which serializes them
/// without blocking readers (WAL). Every thread exclusively owns its
/// `rusqlite::Connection`; work arrives over a channel and results return via
/// oneshot.
#[derive(Clone)]
pub struct Connection {
  writer: Sender<Message>,
  reader: Sender<Message>,
  n_read_threads: usize,
}

impl Connection {
  pub fn new<E>(
    builder: impl Fn() -> std::result::Result<rusqlite::Connection, E>,
    options: Option<Options>,
  ) -> std::result::Result<Self, E> {
    let options = options.unwrap_or_default();

    let new_conn = || -> std::result::Result<rusqlite::Connection, E> {
      let conn = builder()?;
      conn
        .busy_timeout(options.busy_timeout)
        .expect("busy timeout");
      return Ok(conn);
    };

    let write_conn = new_conn()?;
    let in_memory = write_conn.path().is_none_or(|p| p.is_empty());

    let n_read_threads = match (in_memory, options.n_read_threads) {
      // In-memory databases are per-connection; extra readers would each see
      // their own empty database.
      (true, _) => 0,
      (false, n) => n,
    };

    let (write_sender, write_receiver) = crossbeam_channel::unbounded::<Message>();
    std::thread::Builder::new()
      .name("quern-sqlite-writer".to_string())
      .spawn(move || event_loop(write_conn, write_receiver))
      .expect("spawn writer thread");

    let read_sender = if n_read_threads > 0 {
      let (read_sender, read_receiver) = crossbeam_channel::unbounded::<Message>();
      for i in 0..n_read_threads {
        let conn = new_conn()?;
        let receiver = read_receiver.clone();
        std::thread::Builder::new()
          .name(format!("quern-sqlite-reader-{i}"))
          .spawn(move || event_loop(conn, receiver))
          .expect("spawn reader thread");
      }
      read_sender
    } else {
      write_sender.clone()
    };

    debug!("Opened SQLite DB with {n_read_threads} reader threads");

    return Ok(Self {
      writer: write_sender,
      reader: read_sender,
      n_read_threads,
    });
  }

  /// Open the database at `path` with the given options.
  pub fn open(path: impl Into<PathBuf>, options: Option<Options>) -> Result<Self> {
    let path: PathBuf = path.into();
    return Self::new(move || rusqlite::Connection::open(&path), options).map_err(Error::from);
  }

  /// Open a new connection to an in-memory SQLite database.
  pub fn open_in_memory() -> Result<Self> {
    return Self::new(rusqlite::Connection::open_in_memory, None).map_err(Error::from);
  }

  /// Call a function on the writer thread and get the result asynchronously.
  ///
  /// # Failure
  ///
  /// Will return `Err` if the database connection has been closed.
  pub async fn call<F, R>(&self, function: F) -> Result<R>
  where
    F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
    R: Send + 'static,
  {
    let (sender, receiver) = oneshot::channel::<Result<R>>();

    self
      .writer
      .send(Message::RunMut(Box::new(move |conn| {
        let _ = sender.send(function(conn));
      })))
      .map_err(|_| Error::ConnectionClosed)?;

    receiver.await.map_err(|_| Error::ConnectionClosed)?
  }

  /// Call a read-only function on one of the reader threads.
  pub async fn call_reader<F, R>(&self, function: F) -> Result<R>
  where
    F: FnOnce(&rusqlite::Connection) -> Result<R> + Send + 'static,
    R: Send + 'static,
  {
    let (sender, receiver) = oneshot::channel::<Result<R>>();

    self
      .reader
      .send(Message::RunConst(Box::new(move |conn| {
        let _ = sender.send(function(conn));
      })))
      .map_err(|_| Error::ConnectionClosed)?;

    receiver.await.map_err(|_| Error::ConnectionClosed)?
  }

  /// Execute a SQL statement returning the number of affected rows.
  pub async fn execute(
    &self,
    sql: impl AsRef<str> + Send + 'static,
    params: impl Params + Send + 'static,
  ) -> Result<usize> {
    return self
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(sql.as_ref())?;
        params.bind(&mut stmt)?;
        return Ok(stmt.raw_execute()?);
      })
      .await;
  }

  /// Batch execute SQL statements.
  pub async fn execute_batch(&self, sql: impl AsRef<str> + Send + 'static) -> Result<()> {
    return self
      .call(move |conn| {
        conn.execute_batch(sql.as_ref())?;
        return Ok(());
      })
      .await;
  }

  /// Run a statement on the writer thread and map the first returned row.
  ///
  /// Goes through the writer so that `INSERT/UPDATE ... RETURNING` works.
  pub async fn query_row_f<T>(
    &self,
    sql: impl AsRef<str> + Send + 'static,
    params: impl Params + Send + 'static,
    f: impl FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T> + Send + 'static,
  ) -> Result<Option<T>>
  where
    T: Send + 'static,
  {
    return self
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(sql.as_ref())?;
        params.bind(&mut stmt)?;
        let mut rows = stmt.raw_query();
        if let Some(row) = rows.next()? {
          return Ok(Some(f(row)?));
        }
        return Ok(None);
      })
      .await;
  }

  /// Run a statement on the writer thread and map all returned rows.
  pub async fn query_rows_f<T>(
    &self,
    sql: impl AsRef<str> + Send + 'static,
    params: impl Params + Send + 'static,
    f: impl Fn(&rusqlite::Row<'_>) -> rusqlite::Result<T> + Send + 'static,
  ) -> Result<Vec<T>>
  where
    T: Send + 'static,
  {
    return self
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(sql.as_ref())?;
        params.bind(&mut stmt)?;
        let mut rows = stmt.raw_query();

        let mut values = vec![];
        while let Some(row) = rows.next()? {
          values.push(f(row)?);
        }
        return Ok(values);
      })
      .await;
  }

  /// Run a read-only query and map the first returned row.
  pub async fn read_query_row_f<T>(
    &self,
    sql: impl AsRef<str> + Send + 'static,
    params: impl Params + Send + 'static,
    f: impl FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T> + Send + 'static,
  ) -> Result<Option<T>>
  where
    T: Send + 'static,
  {
    return self
      .call_reader(move |conn| {
        let mut stmt = conn.prepare_cached(sql.as_ref())?;
        assert!(stmt.readonly());

        params.bind(&mut stmt)?;
        let mut rows = stmt.raw_query();
        if let Some(row) = rows.next()? {
          return Ok(Some(f(row)?));
        }
        return Ok(None);
      })
      .await;
  }

  /// Run a read-only query and map all returned rows.
  pub async fn read_query_rows_f<T>(
    &self,
    sql: impl AsRef<str> + Send + 'static,
    params: impl Params + Send + 'static,
    f: impl Fn(&rusqlite::Row<'_>) -> rusqlite::Result<T> + Send + 'static,
  ) -> Result<Vec<T>>
  where
    T: Send + 'static,
  {
    return self
      .call_reader(move |conn| {
        let mut stmt = conn.prepare_cached(sql.as_ref())?;
        assert!(stmt.readonly());

        params.bind(&mut stmt)?;
        let mut rows = stmt.raw_query();

        let mut values = vec![];
        while let Some(row) = rows.next()? {
          values.push(f(row)?);
        }
        return Ok(values);
      })
      .await;
  }

  /// Close the database connections.
  ///
  /// Functionally equivalent to dropping the last clone, but surfaces the
  /// writer's close error. Subsequent calls on any clone return
  /// [`Error::ConnectionClosed`].
  pub async fn close(self) -> Result<()> {
    for _ in 0..self.n_read_threads {
      let _ = self.reader.send(Message::Terminate);
    }

    let (sender, receiver) = oneshot::channel();
    if self.writer.send(Message::Close(sender)).is_err() {
      // Channel already gone: some other clone closed the connection.
      return Ok(());
    }

    return match receiver.await {
      Ok(Ok(())) => Ok(()),
      Ok(Err(err)) => Err(Error::Close(err)),
      // Writer thread exited before acking, connection is closed regardless.
      Err(_) => Ok(()),
    };
  }
}

impl Debug for Connection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Connection").finish()
  }
}

fn event_loop(mut conn: rusqlite::Connection, receiver: Receiver<Message>) {
  while let Ok(message) = receiver.recv() {
    match message {
      Message::RunMut(f) => f(&mut conn),
      Message::RunConst(f) => f(&conn),
      Message::Close(ack) => {
        let result = conn.close().map_err(|(_conn, err)| err);
        let _ = ack.send(result);
        return;
      }
      Message::Terminate => {
        return;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_execute_and_query() {
    let conn = Connection::open_in_memory().unwrap();
    conn
      .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
      .await
      .unwrap();

    let n = conn
      .execute(
        "INSERT INTO t (name) VALUES ($1)",
        crate::params!("alice".to_string()),
      )
      .await
      .unwrap();
    assert_eq!(n, 1);

    let name: Option<String> = conn
      .query_row_f("SELECT name FROM t WHERE id = $1", (1,), |row| row.get(0))
      .await
      .unwrap();
    assert_eq!(name.as_deref(), Some("alice"));

    let all: Vec<(i64, String)> = conn
      .query_rows_f("SELECT id, name FROM t ORDER BY id", (), |row| {
        Ok((row.get(0)?, row.get(1)?))
      })
      .await
      .unwrap();
    assert_eq!(all, vec![(1, "alice".to_string())]);
  }

  #[tokio::test]
  async fn test_readers_share_on_disk_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    let conn = Connection::open(
      path,
      Some(Options {
        n_read_threads: 2,
        ..Default::default()
      }),
    )
    .unwrap();

    conn
      .execute_batch("PRAGMA journal_mode = WAL; CREATE TABLE t (v INTEGER)")
      .await
      .unwrap();
    conn
      .execute("INSERT INTO t (v) VALUES (42)", ())
      .await
      .unwrap();

    let v: Option<i64> = conn
      .read_query_row_f("SELECT v FROM t", (), |row| row.get(0))
      .await
      .unwrap();
    assert_eq!(v, Some(42));
  }

  #[tokio::test]
  async fn test_close() {
    let conn = Connection::open_in_memory().unwrap();
    let clone = conn.clone();
    conn.close().await.unwrap();

    assert!(matches!(
      clone.execute("SELECT 1", ()).await,
      Err(Error::ConnectionClosed)
    ));
  }
}
