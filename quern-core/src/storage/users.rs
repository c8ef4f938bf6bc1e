use crate::storage::{Storage, StorageError};
use crate::util::now_timestamp;
use quern_sqlite::params;

type Result<T> = std::result::Result<T, StorageError>;

/// A `users` row.
///
/// `password_hash` is empty for OAuth-only accounts. It participates in the
/// token signing-key derivation, so changing either the password or the email
/// invalidates every outstanding token for the user.
#[derive(Clone, Debug, Default)]
pub struct DbUser {
  pub id: String,
  pub email: String,
  pub password_hash: String,
  pub name: String,
  pub verified: bool,
  pub oauth2: bool,
  pub avatar: String,
  pub email_visibility: bool,
  pub created: String,
  pub updated: String,
}

const USER_COLUMNS: &str =
  "id, email, password_hash, name, verified, oauth2, avatar, email_visibility, created, updated";

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbUser> {
  return Ok(DbUser {
    id: row.get(0)?,
    email: row.get(1)?,
    password_hash: row.get(2)?,
    name: row.get(3)?,
    verified: row.get(4)?,
    oauth2: row.get(5)?,
    avatar: row.get(6)?,
    email_visibility: row.get(7)?,
    created: row.get(8)?,
    updated: row.get(9)?,
  });
}

impl Storage {
  pub async fn get_user_by_email(&self, email: &str) -> Result<DbUser> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
    let user = self
      .conn()
      .read_query_row_f(sql, params!(email.to_string()), user_from_row)
      .await
      .map_err(StorageError::wrap("get user by email"))?;

    return user.ok_or(StorageError::NotFound);
  }

  pub async fn get_user_by_id(&self, user_id: &str) -> Result<DbUser> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
    let user = self
      .conn()
      .read_query_row_f(sql, params!(user_id.to_string()), user_from_row)
      .await
      .map_err(StorageError::wrap("get user by id"))?;

    return user.ok_or(StorageError::NotFound);
  }

  /// Creates a password user, or sets the password on an existing OAuth-only
  /// account. The `IIF` guard lets an empty hash be filled exactly once and
  /// never overwrites an established password.
  pub async fn create_user_with_password(
    &self,
    email: &str,
    password_hash: &str,
    name: &str,
  ) -> Result<DbUser> {
    let sql = format!(
      "INSERT INTO users (id, email, password_hash, name, created, updated)
        VALUES ($1, $2, $3, $4, $5, $5)
        ON CONFLICT(email) DO UPDATE SET
          password_hash = IIF(password_hash = '', excluded.password_hash, password_hash),
          updated = excluded.updated
        RETURNING {USER_COLUMNS}"
    );

    let user = self
      .conn()
      .query_row_f(
        sql,
        params!(
          uuid::Uuid::now_v7().to_string(),
          email.to_string(),
          password_hash.to_string(),
          name.to_string(),
          now_timestamp(),
        ),
        user_from_row,
      )
      .await
      .map_err(StorageError::wrap("create user with password"))?;

    return user.ok_or(StorageError::NotFound);
  }

  /// Upserts an OAuth user: creates the account verified, or flags an
  /// existing password account as also-OAuth.
  pub async fn create_user_with_oauth2(
    &self,
    email: &str,
    name: &str,
    avatar: &str,
  ) -> Result<DbUser> {
    let sql = format!(
      "INSERT INTO users (id, email, name, avatar, verified, oauth2, created, updated)
        VALUES ($1, $2, $3, $4, TRUE, TRUE, $5, $5)
        ON CONFLICT(email) DO UPDATE SET
          oauth2 = TRUE,
          updated = excluded.updated
        RETURNING {USER_COLUMNS}"
    );

    let user = self
      .conn()
      .query_row_f(
        sql,
        params!(
          uuid::Uuid::now_v7().to_string(),
          email.to_string(),
          name.to_string(),
          avatar.to_string(),
          now_timestamp(),
        ),
        user_from_row,
      )
      .await
      .map_err(StorageError::wrap("create user with oauth2"))?;

    return user.ok_or(StorageError::NotFound);
  }

  pub async fn update_password(&self, user_id: &str, password_hash: &str) -> Result<()> {
    let n = self
      .conn()
      .execute(
        "UPDATE users SET password_hash = $2, updated = $3 WHERE id = $1",
        params!(
          user_id.to_string(),
          password_hash.to_string(),
          now_timestamp()
        ),
      )
      .await
      .map_err(StorageError::wrap("update password"))?;

    if n == 0 {
      return Err(StorageError::NotFound);
    }
    return Ok(());
  }

  pub async fn update_email(&self, user_id: &str, email: &str) -> Result<()> {
    let n = self
      .conn()
      .execute(
        "UPDATE users SET email = $2, updated = $3 WHERE id = $1",
        params!(user_id.to_string(), email.to_string(), now_timestamp()),
      )
      .await
      .map_err(StorageError::wrap("update email"))?;

    if n == 0 {
      return Err(StorageError::NotFound);
    }
    return Ok(());
  }

  pub async fn verify_email(&self, user_id: &str) -> Result<()> {
    let n = self
      .conn()
      .execute(
        "UPDATE users SET verified = TRUE, updated = $2 WHERE id = $1",
        params!(user_id.to_string(), now_timestamp()),
      )
      .await
      .map_err(StorageError::wrap("verify email"))?;

    if n == 0 {
      return Err(StorageError::NotFound);
    }
    return Ok(());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::testing::test_storage;

  #[tokio::test]
  async fn test_create_and_lookup() {
    let storage = test_storage().await;

    let user = storage
      .create_user_with_password("foo@test.org", "$argon2$hash", "Foo")
      .await
      .unwrap();
    assert!(!user.verified);
    assert!(!user.oauth2);

    let by_email = storage.get_user_by_email("foo@test.org").await.unwrap();
    assert_eq!(by_email.id, user.id);

    let by_id = storage.get_user_by_id(&user.id).await.unwrap();
    assert_eq!(by_id.email, "foo@test.org");

    assert!(matches!(
      storage.get_user_by_email("missing@test.org").await,
      Err(StorageError::NotFound)
    ));
  }

  #[tokio::test]
  async fn test_oauth_account_can_set_password_exactly_once() {
    let storage = test_storage().await;

    let user = storage
      .create_user_with_oauth2("foo@test.org", "Foo", "")
      .await
      .unwrap();
    assert!(user.oauth2);
    assert!(user.verified);
    assert_eq!(user.password_hash, "");

    // First password set fills the empty hash.
    let user = storage
      .create_user_with_password("foo@test.org", "hash-1", "Foo")
      .await
      .unwrap();
    assert_eq!(user.password_hash, "hash-1");
    assert!(user.oauth2);

    // A second create does not overwrite an established password.
    let user = storage
      .create_user_with_password("foo@test.org", "hash-2", "Foo")
      .await
      .unwrap();
    assert_eq!(user.password_hash, "hash-1");
  }

  #[tokio::test]
  async fn test_password_account_gains_oauth_flag() {
    let storage = test_storage().await;

    storage
      .create_user_with_password("foo@test.org", "hash", "Foo")
      .await
      .unwrap();
    let user = storage
      .create_user_with_oauth2("foo@test.org", "Foo", "")
      .await
      .unwrap();

    assert!(user.oauth2);
    assert_eq!(user.password_hash, "hash");
  }

  #[tokio::test]
  async fn test_updates() {
    let storage = test_storage().await;
    let user = storage
      .create_user_with_password("foo@test.org", "hash", "Foo")
      .await
      .unwrap();

    storage.verify_email(&user.id).await.unwrap();
    storage.update_password(&user.id, "hash-2").await.unwrap();
    storage
      .update_email(&user.id, "bar@test.org")
      .await
      .unwrap();

    let user = storage.get_user_by_id(&user.id).await.unwrap();
    assert!(user.verified);
    assert_eq!(user.password_hash, "hash-2");
    assert_eq!(user.email, "bar@test.org");

    assert!(matches!(
      storage.update_password("missing", "x").await,
      Err(StorageError::NotFound)
    ));
  }
}
