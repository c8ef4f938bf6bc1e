use crate::storage::{Storage, StorageError};
use crate::util::now_timestamp;
use quern_sqlite::params;

type Result<T> = std::result::Result<T, StorageError>;

/// One generation of a scoped configuration. `content` is encrypted at rest;
/// decryption is the config store's business, not the storage layer's.
#[derive(Clone, Debug)]
pub struct ConfigRecord {
  pub id: i64,
  pub scope: String,
  pub content: Vec<u8>,
  pub format: String,
  pub description: String,
  pub created_at: String,
}

const CONFIG_COLUMNS: &str = "id, scope, content, format, description, created_at";

fn config_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConfigRecord> {
  return Ok(ConfigRecord {
    id: row.get(0)?,
    scope: row.get(1)?,
    content: row.get(2)?,
    format: row.get(3)?,
    description: row.get(4)?,
    created_at: row.get(5)?,
  });
}

impl Storage {
  pub async fn insert_config(
    &self,
    scope: &str,
    content: Vec<u8>,
    format: &str,
    description: &str,
  ) -> Result<ConfigRecord> {
    if scope.is_empty() {
      return Err(StorageError::Invalid("empty config scope"));
    }

    let sql = format!(
      "INSERT INTO app_config (scope, content, format, description, created_at)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING {CONFIG_COLUMNS}"
    );

    let record = self
      .conn()
      .query_row_f(
        sql,
        params!(
          scope.to_string(),
          content,
          format.to_string(),
          description.to_string(),
          now_timestamp(),
        ),
        config_from_row,
      )
      .await
      .map_err(StorageError::wrap("insert config"))?;

    return record.ok_or(StorageError::NotFound);
  }

  pub async fn latest_config(&self, scope: &str) -> Result<Option<ConfigRecord>> {
    return self.get_config(scope, 0).await;
  }

  /// `generation = 0` is the newest record; higher offsets walk back through
  /// history. "Latest" is the highest `created_at` within the scope, ties
  /// broken by insertion order.
  pub async fn get_config(&self, scope: &str, generation: usize) -> Result<Option<ConfigRecord>> {
    let sql = format!(
      "SELECT {CONFIG_COLUMNS} FROM app_config WHERE scope = $1
        ORDER BY created_at DESC, id DESC LIMIT 1 OFFSET $2"
    );

    return self
      .conn()
      .read_query_row_f(sql, params!(scope.to_string(), generation), config_from_row)
      .await
      .map_err(StorageError::wrap("get config"));
  }

  /// Full history for a scope, newest first.
  pub async fn list_configs(&self, scope: &str) -> Result<Vec<ConfigRecord>> {
    let sql = format!(
      "SELECT {CONFIG_COLUMNS} FROM app_config WHERE scope = $1
        ORDER BY created_at DESC, id DESC"
    );

    return self
      .conn()
      .read_query_rows_f(sql, params!(scope.to_string()), config_from_row)
      .await
      .map_err(StorageError::wrap("list configs"));
  }
}
