use crate::storage::{Storage, StorageError};
use crate::util::now_timestamp;
use quern_sqlite::params;

type Result<T> = std::result::Result<T, StorageError>;

#[derive(Clone, Debug, Default)]
pub struct AcmeCert {
  pub identifier: String,
  /// JSON array of covered domain names.
  pub domains: String,
  pub cert_chain_pem: String,
  pub private_key_pem: String,
  pub issued_at: String,
  pub expires_at: String,
  pub created_at: String,
  pub updated_at: String,
}

const CERT_COLUMNS: &str = "identifier, domains, cert_chain_pem, private_key_pem, issued_at, \
   expires_at, created_at, updated_at";

fn cert_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AcmeCert> {
  return Ok(AcmeCert {
    identifier: row.get(0)?,
    domains: row.get(1)?,
    cert_chain_pem: row.get(2)?,
    private_key_pem: row.get(3)?,
    issued_at: row.get(4)?,
    expires_at: row.get(5)?,
    created_at: row.get(6)?,
    updated_at: row.get(7)?,
  });
}

impl Storage {
  pub async fn get_latest_cert(&self) -> Result<Option<AcmeCert>> {
    let sql =
      format!("SELECT {CERT_COLUMNS} FROM acme_certificates ORDER BY updated_at DESC LIMIT 1");
    return self
      .conn()
      .read_query_row_f(sql, (), cert_from_row)
      .await
      .map_err(StorageError::wrap("get latest cert"));
  }

  /// Upsert by `identifier`: `created_at` is preserved across renewals,
  /// `updated_at` refreshed.
  pub async fn save_cert(&self, cert: &AcmeCert) -> Result<()> {
    self
      .conn()
      .execute(
        "INSERT INTO acme_certificates
            (identifier, domains, cert_chain_pem, private_key_pem, issued_at, expires_at,
             created_at, updated_at)
          VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
          ON CONFLICT(identifier) DO UPDATE SET
            domains = excluded.domains,
            cert_chain_pem = excluded.cert_chain_pem,
            private_key_pem = excluded.private_key_pem,
            issued_at = excluded.issued_at,
            expires_at = excluded.expires_at,
            updated_at = excluded.updated_at",
        params!(
          cert.identifier.clone(),
          cert.domains.clone(),
          cert.cert_chain_pem.clone(),
          cert.private_key_pem.clone(),
          cert.issued_at.clone(),
          cert.expires_at.clone(),
          now_timestamp(),
        ),
      )
      .await
      .map_err(StorageError::wrap("save cert"))?;

    return Ok(());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::testing::test_storage;

  #[tokio::test]
  async fn test_save_is_upsert_preserving_created_at() {
    let storage = test_storage().await;
    assert!(storage.get_latest_cert().await.unwrap().is_none());

    let cert = AcmeCert {
      identifier: "example.org".to_string(),
      domains: r#"["example.org"]"#.to_string(),
      cert_chain_pem: "chain-1".to_string(),
      private_key_pem: "key-1".to_string(),
      issued_at: "2025-01-01T00:00:00Z".to_string(),
      expires_at: "2025-04-01T00:00:00Z".to_string(),
      ..Default::default()
    };
    storage.save_cert(&cert).await.unwrap();

    let stored = storage.get_latest_cert().await.unwrap().unwrap();
    let created_at = stored.created_at.clone();
    assert_eq!(stored.cert_chain_pem, "chain-1");

    let renewed = AcmeCert {
      cert_chain_pem: "chain-2".to_string(),
      expires_at: "2025-07-01T00:00:00Z".to_string(),
      ..cert
    };
    storage.save_cert(&renewed).await.unwrap();

    let stored = storage.get_latest_cert().await.unwrap().unwrap();
    assert_eq!(stored.cert_chain_pem, "chain-2");
    assert_eq!(stored.expires_at, "2025-07-01T00:00:00Z");
    assert_eq!(stored.created_at, created_at);
  }
}
