use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use sha2::Sha256;
use thiserror::Error;

use crate::config::Config;
use crate::storage::DbUser;

#[derive(Debug, Error)]
pub enum TokenError {
  #[error("Token expired")]
  Expired,
  #[error("Invalid token: {0}")]
  Invalid(jsonwebtoken::errors::Error),
  #[error("Token purpose mismatch")]
  PurposeMismatch,
}

impl From<jsonwebtoken::errors::Error> for TokenError {
  fn from(err: jsonwebtoken::errors::Error) -> Self {
    return match err.kind() {
      jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
      _ => TokenError::Invalid(err),
    };
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenPurpose {
  Auth,
  Verification,
  PasswordReset,
  EmailChange,
}

impl TokenPurpose {
  pub fn as_str(&self) -> &'static str {
    return match self {
      TokenPurpose::Auth => "auth",
      TokenPurpose::Verification => "verification",
      TokenPurpose::PasswordReset => "password_reset",
      TokenPurpose::EmailChange => "email_change",
    };
  }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TokenClaims {
  /// User id.
  pub sub: String,
  /// Email address the signing key was derived from.
  pub email: String,
  /// Token purpose tag; checked against the expected purpose on verify.
  pub r#type: String,
  pub iat: i64,
  pub exp: i64,
  /// Only present on email-change tokens.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub new_email: Option<String>,
}

/// Mints and verifies purpose-bound JWTs.
///
/// The HS256 signing key is HMAC-SHA256 over `email ‖ 0x00 ‖ password_hash`
/// keyed by the per-purpose server secret. Binding the key to the user's
/// credentials makes every outstanding token invalid the moment the password
/// or email changes; the null byte keeps `(ab, c)` and `(a, bc)` from
/// colliding. An empty password hash is fine: OAuth-only users get tokens
/// bound to email and server secret alone.
pub struct TokenMinter {
  auth_secret: String,
  verification_secret: String,
  password_reset_secret: String,
  email_change_secret: String,

  auth_token_ttl: chrono::Duration,
  purpose_token_ttl: chrono::Duration,
}

impl TokenMinter {
  pub fn new_from_config(config: &Config) -> Self {
    return TokenMinter {
      auth_secret: config.jwt.auth_secret.clone(),
      verification_secret: config.jwt.verification_secret.clone(),
      password_reset_secret: config.jwt.password_reset_secret.clone(),
      email_change_secret: config.jwt.email_change_secret.clone(),
      auth_token_ttl: chrono::Duration::seconds(config.jwt.auth_token_ttl_sec),
      purpose_token_ttl: chrono::Duration::seconds(config.jwt.purpose_token_ttl_sec),
    };
  }

  fn purpose_secret(&self, purpose: TokenPurpose) -> &str {
    return match purpose {
      TokenPurpose::Auth => &self.auth_secret,
      TokenPurpose::Verification => &self.verification_secret,
      TokenPurpose::PasswordReset => &self.password_reset_secret,
      TokenPurpose::EmailChange => &self.email_change_secret,
    };
  }

  fn signing_key(&self, purpose: TokenPurpose, email: &str, password_hash: &str) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(self.purpose_secret(purpose).as_bytes())
      .expect("HMAC accepts keys of any size");
    mac.update(email.as_bytes());
    mac.update(&[0u8]);
    mac.update(password_hash.as_bytes());
    return mac.finalize().into_bytes().to_vec();
  }

  pub fn mint(
    &self,
    purpose: TokenPurpose,
    user: &DbUser,
    new_email: Option<String>,
  ) -> Result<String, TokenError> {
    let ttl = match purpose {
      TokenPurpose::Auth => self.auth_token_ttl,
      _ => self.purpose_token_ttl,
    };

    let now = chrono::Utc::now();
    let claims = TokenClaims {
      sub: user.id.clone(),
      email: user.email.clone(),
      r#type: purpose.as_str().to_string(),
      iat: now.timestamp(),
      exp: (now + ttl).timestamp(),
      new_email,
    };

    let key = self.signing_key(purpose, &user.email, &user.password_hash);
    let token = jsonwebtoken::encode(
      &Header::new(Algorithm::HS256),
      &claims,
      &EncodingKey::from_secret(&key),
    )?;
    return Ok(token);
  }

  /// Full verification against the user's *current* credentials. Tokens
  /// minted before a password or email change fail here by construction.
  pub fn verify(
    &self,
    purpose: TokenPurpose,
    user: &DbUser,
    token: &str,
  ) -> Result<TokenClaims, TokenError> {
    let key = self.signing_key(purpose, &user.email, &user.password_hash);
    let claims = jsonwebtoken::decode::<TokenClaims>(
      token,
      &DecodingKey::from_secret(&key),
      &Validation::new(Algorithm::HS256),
    )?
    .claims;

    if claims.r#type != purpose.as_str() || claims.sub != user.id {
      return Err(TokenError::PurposeMismatch);
    }
    return Ok(claims);
  }

  /// Decodes claims *without* verifying the signature, to find out which
  /// user's credentials to verify against. Never trust the result beyond
  /// the lookup.
  pub fn peek_claims(token: &str) -> Result<TokenClaims, TokenError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    let claims =
      jsonwebtoken::decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)?
        .claims;
    return Ok(claims);
  }
}
