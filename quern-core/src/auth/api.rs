use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use validator::ValidateEmail;

use crate::app_state::AppState;
use crate::auth::password::{hash_password, validate_password_policy, verify_password, PasswordPolicy};
use crate::auth::tokens::{TokenError, TokenMinter, TokenPurpose};
use crate::auth::AuthError;
use crate::constants::{
  JOB_TYPE_EMAIL_CHANGE, JOB_TYPE_EMAIL_VERIFICATION, JOB_TYPE_PASSWORD_RESET,
};
use crate::queue::NewJob;
use crate::response::Envelope;
use crate::storage::DbUser;
use crate::util::cooldown_bucket;

impl From<TokenError> for AuthError {
  fn from(err: TokenError) -> Self {
    return match err {
      TokenError::Expired => AuthError::TokenExpired,
      _ => AuthError::Unauthorized,
    };
  }
}

pub(crate) fn router() -> Router<AppState> {
  return Router::new()
    .route("/auth-with-password", post(auth_with_password))
    .route("/auth-refresh", post(auth_refresh))
    .route("/request-verification", post(request_verification))
    .route("/confirm-verification/{token}", get(confirm_verification))
    .route("/request-password-reset", post(request_password_reset))
    .route("/confirm-password-reset", post(confirm_password_reset))
    .route("/request-email-change", post(request_email_change))
    .route("/confirm-email-change/{token}", get(confirm_email_change));
}

fn normalize_email(email: &str) -> Result<String, AuthError> {
  let email = email.trim().to_ascii_lowercase();
  if !email.validate_email() {
    return Err(AuthError::BadRequest("invalid email"));
  }
  return Ok(email);
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
  let value = headers
    .get(axum::http::header::AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .ok_or(AuthError::Unauthorized)?;

  return value
    .strip_prefix("Bearer ")
    .ok_or(AuthError::Unauthorized);
}

/// Decodes the token's claims, loads the referenced user and verifies the
/// token against the user's current credentials.
async fn authenticate(
  state: &AppState,
  purpose: TokenPurpose,
  token: &str,
) -> Result<(DbUser, crate::auth::tokens::TokenClaims), AuthError> {
  let peeked = TokenMinter::peek_claims(token)?;
  let user = state
    .storage()
    .get_user_by_id(&peeked.sub)
    .await
    .map_err(|_| AuthError::Unauthorized)?;

  let claims = state.minter().verify(purpose, &user, token)?;
  return Ok((user, claims));
}

#[derive(serde::Deserialize)]
struct PasswordLoginRequest {
  email: String,
  password: String,
}

async fn auth_with_password(
  State(state): State<AppState>,
  Json(request): Json<PasswordLoginRequest>,
) -> Result<Envelope, AuthError> {
  let email = normalize_email(&request.email)?;

  let user = state
    .storage()
    .get_user_by_email(&email)
    .await
    .map_err(|_| AuthError::Unauthorized)?;
  verify_password(&user, &request.password)?;

  let token = state.minter().mint(TokenPurpose::Auth, &user, None)?;
  let expires_in = state.access_config(|c| c.jwt.auth_token_ttl_sec);

  return Ok(Envelope::ok(Some(json!({
    "token": token,
    "token_type": "Bearer",
    "expires_in": expires_in,
  }))));
}

async fn auth_refresh(
  State(state): State<AppState>,
  headers: HeaderMap,
) -> Result<Envelope, AuthError> {
  let token = bearer_token(&headers)?;
  let (user, _claims) = authenticate(&state, TokenPurpose::Auth, token).await?;

  let token = state.minter().mint(TokenPurpose::Auth, &user, None)?;
  let expires_in = state.access_config(|c| c.jwt.auth_token_ttl_sec);

  return Ok(Envelope::ok(Some(json!({
    "token": token,
    "token_type": "Bearer",
    "expires_in": expires_in,
  }))));
}

#[derive(serde::Deserialize)]
struct EmailRequest {
  email: String,
}

async fn request_verification(
  State(state): State<AppState>,
  Json(request): Json<EmailRequest>,
) -> Result<Envelope, AuthError> {
  let email = normalize_email(&request.email)?;

  let user = match state.storage().get_user_by_email(&email).await {
    Ok(user) => user,
    // Do not reveal whether an account exists.
    Err(_) => return Ok(Envelope::ok(None)),
  };
  if user.verified {
    return Ok(Envelope::ok(None));
  }

  let bucket = state.access_config(|c| cooldown_bucket(Utc::now(), c.jwt.cooldown_sec));
  let payload = json!({ "email": email, "cooldown_bucket": bucket }).to_string();

  // A second request within the cooldown window collides on the unique
  // constraint and surfaces as 409.
  state
    .storage()
    .insert_job(&NewJob::new(JOB_TYPE_EMAIL_VERIFICATION, payload))
    .await?;
  return Ok(Envelope::ok(None));
}

async fn confirm_verification(
  State(state): State<AppState>,
  Path(token): Path<String>,
) -> Result<Envelope, AuthError> {
  let (user, _claims) = authenticate(&state, TokenPurpose::Verification, &token).await?;

  if !user.verified {
    state.storage().verify_email(&user.id).await?;
  }
  return Ok(Envelope::ok(None));
}

async fn request_password_reset(
  State(state): State<AppState>,
  Json(request): Json<EmailRequest>,
) -> Result<Envelope, AuthError> {
  let email = normalize_email(&request.email)?;

  let user = match state.storage().get_user_by_email(&email).await {
    Ok(user) => user,
    Err(_) => return Ok(Envelope::ok(None)),
  };

  let bucket = state.access_config(|c| cooldown_bucket(Utc::now(), c.jwt.cooldown_sec));
  let payload = json!({ "user_id": user.id, "cooldown_bucket": bucket }).to_string();
  let extra = json!({ "email": email }).to_string();

  state
    .storage()
    .insert_job(&NewJob::new(JOB_TYPE_PASSWORD_RESET, payload).with_extra(extra))
    .await?;
  return Ok(Envelope::ok(None));
}

#[derive(serde::Deserialize)]
struct ConfirmPasswordResetRequest {
  token: String,
  password: String,
}

async fn confirm_password_reset(
  State(state): State<AppState>,
  Json(request): Json<ConfirmPasswordResetRequest>,
) -> Result<Envelope, AuthError> {
  validate_password_policy(&request.password, &PasswordPolicy::default())?;

  let (user, _claims) =
    authenticate(&state, TokenPurpose::PasswordReset, &request.token).await?;

  let password_hash = hash_password(&request.password)?;
  state
    .storage()
    .update_password(&user.id, &password_hash)
    .await?;
  return Ok(Envelope::ok(None));
}

#[derive(serde::Deserialize)]
struct EmailChangeRequest {
  new_email: String,
}

async fn request_email_change(
  State(state): State<AppState>,
  headers: HeaderMap,
  Json(request): Json<EmailChangeRequest>,
) -> Result<Envelope, AuthError> {
  let token = bearer_token(&headers)?;
  let (user, _claims) = authenticate(&state, TokenPurpose::Auth, token).await?;

  let new_email = normalize_email(&request.new_email)?;
  if new_email == user.email {
    return Err(AuthError::BadRequest("email unchanged"));
  }

  let bucket = state.access_config(|c| cooldown_bucket(Utc::now(), c.jwt.cooldown_sec));
  let payload = json!({
    "user_id": user.id,
    "new_email": new_email,
    "cooldown_bucket": bucket,
  })
  .to_string();

  state
    .storage()
    .insert_job(&NewJob::new(JOB_TYPE_EMAIL_CHANGE, payload))
    .await?;
  return Ok(Envelope::ok(None));
}

async fn confirm_email_change(
  State(state): State<AppState>,
  Path(token): Path<String>,
) -> Result<Envelope, AuthError> {
  let (user, claims) = authenticate(&state, TokenPurpose::EmailChange, &token).await?;

  let Some(new_email) = claims.new_email else {
    return Err(AuthError::BadRequest("token carries no email change"));
  };

  state.storage().update_email(&user.id, &new_email).await?;
  return Ok(Envelope::ok(None));
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::app_state::testing::test_state;
  use crate::queue::JobStatus;

  async fn create_verified_user(state: &AppState, email: &str, password: &str) -> DbUser {
    let user = state
      .storage()
      .create_user_with_password(email, &hash_password(password).unwrap(), "Test")
      .await
      .unwrap();
    state.storage().verify_email(&user.id).await.unwrap();
    return state.storage().get_user_by_id(&user.id).await.unwrap();
  }

  fn bearer_headers(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
      axum::http::header::AUTHORIZATION,
      format!("Bearer {token}").parse().unwrap(),
    );
    return headers;
  }

  fn token_from(envelope: &Envelope) -> String {
    return envelope.data.as_ref().unwrap()["token"]
      .as_str()
      .unwrap()
      .to_string();
  }

  #[tokio::test]
  async fn test_password_login_and_refresh() {
    let state = test_state(None).await;
    create_verified_user(&state, "foo@test.org", "hunter2hunter2").await;

    let envelope = auth_with_password(
      State(state.clone()),
      Json(PasswordLoginRequest {
        email: "Foo@Test.org ".to_string(),
        password: "hunter2hunter2".to_string(),
      }),
    )
    .await
    .unwrap();
    let token = token_from(&envelope);

    auth_refresh(State(state.clone()), bearer_headers(&token))
      .await
      .unwrap();

    // Wrong password is unauthorized.
    let err = auth_with_password(
      State(state.clone()),
      Json(PasswordLoginRequest {
        email: "foo@test.org".to_string(),
        password: "wrong-password".to_string(),
      }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AuthError::Unauthorized));
  }

  #[tokio::test]
  async fn test_password_change_invalidates_outstanding_tokens() {
    let state = test_state(None).await;
    let user = create_verified_user(&state, "foo@test.org", "hunter2hunter2").await;

    let envelope = auth_with_password(
      State(state.clone()),
      Json(PasswordLoginRequest {
        email: "foo@test.org".to_string(),
        password: "hunter2hunter2".to_string(),
      }),
    )
    .await
    .unwrap();
    let token = token_from(&envelope);

    state
      .storage()
      .update_password(&user.id, &hash_password("changed-password").unwrap())
      .await
      .unwrap();

    // The signing key derives from the password hash: the old token is dead.
    let err = auth_refresh(State(state.clone()), bearer_headers(&token))
      .await
      .unwrap_err();
    assert!(matches!(err, AuthError::Unauthorized));
  }

  #[tokio::test]
  async fn test_request_verification_enqueues_with_cooldown() {
    let state = test_state(None).await;
    state
      .storage()
      .create_user_with_password("foo@test.org", "hash", "Test")
      .await
      .unwrap();

    request_verification(
      State(state.clone()),
      Json(EmailRequest {
        email: "foo@test.org".to_string(),
      }),
    )
    .await
    .unwrap();

    let jobs = state
      .storage()
      .list_jobs(Some(JobStatus::Pending), 10, 0)
      .await
      .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_type, JOB_TYPE_EMAIL_VERIFICATION);
    assert!(jobs[0].payload.contains("cooldown_bucket"));

    // Within the cooldown window the second request collides.
    let err = request_verification(
      State(state.clone()),
      Json(EmailRequest {
        email: "foo@test.org".to_string(),
      }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AuthError::Conflict));

    // Unknown accounts are indistinguishable from known ones.
    request_verification(
      State(state.clone()),
      Json(EmailRequest {
        email: "unknown@test.org".to_string(),
      }),
    )
    .await
    .unwrap();
  }

  #[tokio::test]
  async fn test_verification_confirm_flow() {
    let state = test_state(None).await;
    let user = state
      .storage()
      .create_user_with_password("foo@test.org", "hash", "Test")
      .await
      .unwrap();

    let token = state
      .minter()
      .mint(TokenPurpose::Verification, &user, None)
      .unwrap();

    confirm_verification(State(state.clone()), Path(token)).await.unwrap();
    assert!(state.storage().get_user_by_id(&user.id).await.unwrap().verified);

    // An auth token is not a verification token.
    let wrong = state.minter().mint(TokenPurpose::Auth, &user, None).unwrap();
    assert!(confirm_verification(State(state.clone()), Path(wrong))
      .await
      .is_err());
  }

  #[tokio::test]
  async fn test_password_reset_flow() {
    let state = test_state(None).await;
    let user = create_verified_user(&state, "foo@test.org", "old-password-1").await;

    request_password_reset(
      State(state.clone()),
      Json(EmailRequest {
        email: "foo@test.org".to_string(),
      }),
    )
    .await
    .unwrap();

    let jobs = state
      .storage()
      .list_jobs(Some(JobStatus::Pending), 10, 0)
      .await
      .unwrap();
    assert_eq!(jobs[0].job_type, JOB_TYPE_PASSWORD_RESET);
    assert!(jobs[0].payload_extra.contains("foo@test.org"));

    let token = state
      .minter()
      .mint(TokenPurpose::PasswordReset, &user, None)
      .unwrap();
    confirm_password_reset(
      State(state.clone()),
      Json(ConfirmPasswordResetRequest {
        token,
        password: "new-password-1".to_string(),
      }),
    )
    .await
    .unwrap();

    let updated = state.storage().get_user_by_id(&user.id).await.unwrap();
    verify_password(&updated, "new-password-1").unwrap();
  }

  #[tokio::test]
  async fn test_email_change_flow() {
    let state = test_state(None).await;
    let user = create_verified_user(&state, "foo@test.org", "hunter2hunter2").await;

    let auth = state.minter().mint(TokenPurpose::Auth, &user, None).unwrap();
    request_email_change(
      State(state.clone()),
      bearer_headers(&auth),
      Json(EmailChangeRequest {
        new_email: "bar@test.org".to_string(),
      }),
    )
    .await
    .unwrap();

    let jobs = state
      .storage()
      .list_jobs(Some(JobStatus::Pending), 10, 0)
      .await
      .unwrap();
    assert_eq!(jobs[0].job_type, JOB_TYPE_EMAIL_CHANGE);

    let token = state
      .minter()
      .mint(TokenPurpose::EmailChange, &user, Some("bar@test.org".to_string()))
      .unwrap();
    confirm_email_change(State(state.clone()), Path(token)).await.unwrap();

    let updated = state.storage().get_user_by_id(&user.id).await.unwrap();
    assert_eq!(updated.email, "bar@test.org");
  }
}
