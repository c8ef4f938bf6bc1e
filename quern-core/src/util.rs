use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;

/// Fixed-width RFC3339 UTC with second precision and `Z` suffix.
///
/// Every timestamp in the system goes through this formatter so that string
/// comparison equals chronological comparison; the scheduler's due-time
/// check relies on it. An empty string means "immediately" and sorts before
/// every formatted timestamp.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
  return t.to_rfc3339_opts(SecondsFormat::Secs, /* use_z= */ true);
}

pub fn now_timestamp() -> String {
  return format_timestamp(Utc::now());
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
  return DateTime::parse_from_rfc3339(s)
    .ok()
    .map(|t| t.with_timezone(&Utc));
}

/// `floor(unix_seconds / cooldown_secs)`. Baked into unique job payloads so
/// repeated requests within the same window collide on the unique constraint.
pub fn cooldown_bucket(now: DateTime<Utc>, cooldown_secs: i64) -> i64 {
  return now.timestamp() / cooldown_secs.max(1);
}

pub fn generate_random_string(length: usize) -> String {
  return rand::rng()
    .sample_iter(&Alphanumeric)
    .take(length)
    .map(char::from)
    .collect();
}

#[allow(unused)]
pub fn unix_to_timestamp(secs: i64) -> String {
  return format_timestamp(Utc.timestamp_opt(secs, 0).single().unwrap_or_default());
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  #[test]
  fn test_string_order_matches_chronological_order() {
    let base = Utc.with_ymd_and_hms(2025, 1, 31, 23, 59, 58).unwrap();

    let mut prev = format_timestamp(base);
    for i in 1..1000 {
      let next = format_timestamp(base + Duration::seconds(i));
      assert!(prev < next, "{prev} !< {next}");
      prev = next;
    }

    // The empty string ("immediately") sorts before everything.
    assert!("" < prev.as_str());
  }

  #[test]
  fn test_format_round_trips() {
    let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
    let s = format_timestamp(now);
    assert_eq!(s, "2025-06-01T12:00:00Z");
    assert_eq!(parse_timestamp(&s), Some(now));
  }

  #[test]
  fn test_cooldown_bucket() {
    let t0 = Utc.timestamp_opt(1000, 0).unwrap();
    assert_eq!(cooldown_bucket(t0, 60), 16);
    // Same bucket within the window, next bucket after it.
    assert_eq!(cooldown_bucket(t0 + Duration::seconds(19), 60), 16);
    assert_eq!(cooldown_bucket(t0 + Duration::seconds(20), 60), 17);
  }

  #[test]
  fn test_generate_random_string() {
    let a = generate_random_string(20);
    let b = generate_random_string(20);
    assert_eq!(a.len(), 20);
    assert_ne!(a, b);
  }
}
