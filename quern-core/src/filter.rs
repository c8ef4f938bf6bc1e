use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;
use axum_client_ip::InsecureClientIp;
use chrono::{DateTime, Utc};
use mini_moka::sync::Cache;
use std::collections::HashSet;

use crate::app_state::AppState;
use crate::auth::AuthError;
use crate::config::Config;

/// Pre-routing request filter: an IP block list over time-bucketed cache
/// entries and a Content-Type allow list.
///
/// Rebuilt from config at provider-reload time; a disabled feature is simply
/// absent, so the disabled path is a no-op.
pub struct RequestFilter {
  ip_blocker: Option<IpBlocker>,
  mimetype_whitelist: Option<HashSet<String>>,
}

impl RequestFilter {
  pub fn new_from_config(config: &Config) -> Self {
    let proxy = &config.proxy;

    return RequestFilter {
      ip_blocker: proxy
        .ip_blocking_enabled
        .then(|| IpBlocker::new(proxy.bucket_sec, proxy.block_threshold)),
      mimetype_whitelist: proxy
        .mimetype_filtering_enabled
        .then(|| proxy.mimetype_whitelist.iter().cloned().collect()),
    };
  }

  /// Records the request for offender tracking and reports whether the IP is
  /// blocked.
  pub fn process(&self, ip: &str) -> bool {
    let Some(ref blocker) = self.ip_blocker else {
      return false;
    };
    return blocker.process_at(ip, Utc::now());
  }

  pub fn block(&self, ip: &str) {
    if let Some(ref blocker) = self.ip_blocker {
      blocker.block_at(ip, Utc::now());
    }
  }

  /// Lowercase exact match against the configured whitelist. Requests with
  /// an empty or non-whitelisted Content-Type are rejected.
  pub fn mimetype_allowed(&self, content_type: Option<&str>) -> bool {
    let Some(ref whitelist) = self.mimetype_whitelist else {
      return true;
    };

    let Some(content_type) = content_type else {
      return false;
    };

    // Strip parameters: "application/json; charset=utf-8".
    let essence = content_type
      .split(';')
      .next()
      .unwrap_or_default()
      .trim()
      .to_lowercase();
    return whitelist.contains(&essence);
  }
}

/// IP block list keyed by `(ip, time_bucket)`.
///
/// Blocking writes the current and the next bucket so a block survives
/// bucket rollover. A per-bucket request counter doubles as a crude top-K
/// offender detector feeding block decisions.
struct IpBlocker {
  blocked: Cache<String, ()>,
  counts: Cache<String, u32>,
  bucket_sec: i64,
  threshold: u32,
}

impl IpBlocker {
  fn new(bucket_sec: i64, threshold: u32) -> Self {
    let bucket_sec = bucket_sec.max(1);
    let ttl = std::time::Duration::from_secs((bucket_sec * 2) as u64);

    return IpBlocker {
      blocked: Cache::builder()
        .time_to_live(ttl)
        .max_capacity(64 * 1024)
        .build(),
      counts: Cache::builder()
        .time_to_live(ttl)
        .max_capacity(64 * 1024)
        .build(),
      bucket_sec,
      threshold,
    };
  }

  fn bucket(&self, now: DateTime<Utc>) -> i64 {
    return now.timestamp() / self.bucket_sec;
  }

  fn key(ip: &str, bucket: i64) -> String {
    return format!("{ip}@{bucket}");
  }

  fn is_blocked_at(&self, ip: &str, now: DateTime<Utc>) -> bool {
    return self
      .blocked
      .get(&Self::key(ip, self.bucket(now)))
      .is_some();
  }

  fn block_at(&self, ip: &str, now: DateTime<Utc>) {
    let bucket = self.bucket(now);
    self.blocked.insert(Self::key(ip, bucket), ());
    self.blocked.insert(Self::key(ip, bucket + 1), ());
  }

  fn process_at(&self, ip: &str, now: DateTime<Utc>) -> bool {
    if self.is_blocked_at(ip, now) {
      return true;
    }

    let key = Self::key(ip, self.bucket(now));
    let count = self.counts.get(&key).unwrap_or(0) + 1;
    self.counts.insert(key, count);

    if count >= self.threshold {
      self.block_at(ip, now);
      return true;
    }
    return false;
  }
}

/// Axum middleware consulted before routing.
pub(crate) async fn request_filter_middleware(
  State(state): State<AppState>,
  request: Request,
  next: Next,
) -> Result<Response, AuthError> {
  let filter = state.request_filter();

  let client_ip = InsecureClientIp::from(request.headers(), request.extensions()).ok();
  if let Some(InsecureClientIp(ip)) = client_ip {
    if filter.process(&ip.to_string()) {
      return Err(AuthError::Forbidden);
    }
  }

  let has_body = matches!(
    *request.method(),
    Method::POST | Method::PUT | Method::PATCH
  );
  if has_body {
    let content_type = request
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok());
    if !filter.mimetype_allowed(content_type) {
      return Err(AuthError::UnsupportedMediaType);
    }
  }

  return Ok(next.run(request).await);
}
