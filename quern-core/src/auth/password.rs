use argon2::{
  password_hash::{rand_core::OsRng, SaltString},
  Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use lazy_static::lazy_static;
use mini_moka::sync::Cache;

use crate::auth::AuthError;
use crate::storage::DbUser;

pub struct PasswordPolicy {
  pub min_length: usize,
  pub max_length: usize,
}

impl Default for PasswordPolicy {
  fn default() -> Self {
    return PasswordPolicy {
      min_length: 8,
      max_length: 128,
    };
  }
}

pub fn validate_password_policy(password: &str, policy: &PasswordPolicy) -> Result<(), AuthError> {
  if password.len() < policy.min_length {
    return Err(AuthError::BadRequest("password too short"));
  }
  if password.len() > policy.max_length {
    return Err(AuthError::BadRequest("password too long"));
  }
  return Ok(());
}

lazy_static! {
  static ref ARGON2: Argon2<'static> = Argon2::default();
  static ref FAILED_ATTEMPTS: Cache<String, usize> = Cache::builder()
    .time_to_live(std::time::Duration::from_secs(5 * 60))
    .max_capacity(1024)
    .build();
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
  let salt = SaltString::generate(&mut OsRng);
  return Ok(
    ARGON2
      .hash_password(password.as_bytes(), &salt)
      // Argon's error doesn't implement the error trait.
      .map_err(|err| AuthError::Internal(err.to_string().into()))?
      .to_string(),
  );
}

/// Checks the password against a known user. Requires a verified email and
/// rate limits failed attempts per account to slow brute forcing.
pub fn verify_password(db_user: &DbUser, password: &str) -> Result<(), AuthError> {
  if !db_user.verified {
    return Err(AuthError::Unauthorized);
  }
  if db_user.password_hash.is_empty() {
    // OAuth-only account.
    return Err(AuthError::Unauthorized);
  }

  let attempts = FAILED_ATTEMPTS.get(&db_user.email).unwrap_or(0);
  if attempts >= 3 {
    return Err(AuthError::TooManyRequests);
  }

  let parsed_hash = PasswordHash::new(&db_user.password_hash)
    .map_err(|err| AuthError::Internal(err.to_string().into()))?;

  ARGON2
    .verify_password(password.as_bytes(), &parsed_hash)
    .map_err(|err| {
      FAILED_ATTEMPTS.insert(db_user.email.clone(), attempts + 1);

      return match err {
        argon2::password_hash::Error::Password => AuthError::Unauthorized,
        err => AuthError::Internal(err.to_string().into()),
      };
    })?;

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  fn user_with_password(email: &str, password: &str) -> DbUser {
    return DbUser {
      id: "u".to_string(),
      email: email.to_string(),
      password_hash: hash_password(password).unwrap(),
      verified: true,
      ..Default::default()
    };
  }

  #[test]
  fn test_hash_and_verify() {
    let user = user_with_password("verify@test.org", "0123456789.");
    verify_password(&user, "0123456789.").unwrap();
    assert!(matches!(
      verify_password(&user, "wrong"),
      Err(AuthError::Unauthorized)
    ));
  }

  #[test]
  fn test_unverified_user_rejected() {
    let mut user = user_with_password("unverified@test.org", "0123456789.");
    user.verified = false;
    assert!(verify_password(&user, "0123456789.").is_err());
  }

  #[test]
  fn test_failed_attempts_rate_limited() {
    let user = user_with_password("limited@test.org", "0123456789.");

    for _ in 0..3 {
      let _ = verify_password(&user, "wrong");
    }
    // Even the correct password is refused once the budget is burnt.
    assert!(matches!(
      verify_password(&user, "0123456789."),
      Err(AuthError::TooManyRequests)
    ));
  }

  #[test]
  fn test_policy() {
    let policy = PasswordPolicy::default();
    assert!(validate_password_policy("short", &policy).is_err());
    assert!(validate_password_policy("long enough password", &policy).is_ok());
  }
}
