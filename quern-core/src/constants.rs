use chrono::Duration;

pub const APPLICATION_CONFIG_SCOPE: &str = "application";

pub const JOB_TYPE_EMAIL_VERIFICATION: &str = "job_type_email_verification";
pub const JOB_TYPE_PASSWORD_RESET: &str = "job_type_password_reset";
pub const JOB_TYPE_EMAIL_CHANGE: &str = "job_type_email_change";
pub const JOB_TYPE_TLS_CERT_RENEWAL: &str = "job_type_tls_cert_renewal";
pub const JOB_TYPE_BACKUP_LOCAL: &str = "job_type_backup_local";
pub const JOB_TYPE_STUCK_JOB_RECOVERY: &str = "job_type_stuck_job_recovery";

pub const LOGS_TABLE: &str = "logs";

pub const DEFAULT_AUTH_TOKEN_TTL: Duration = Duration::hours(1);
pub const DEFAULT_PURPOSE_TOKEN_TTL: Duration = Duration::hours(24);

pub const DEFAULT_TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);
pub const DEFAULT_SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

// Handlers doing network round-trips with external latency (ACME DNS
// propagation, full database backups) get a generous budget; token-exchange
// style handlers do not.
pub const DEFAULT_LONG_HANDLER_TIMEOUT: std::time::Duration =
  std::time::Duration::from_secs(15 * 60);
pub const DEFAULT_SHORT_HANDLER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

pub const SITE_URL_DEFAULT: &str = "http://localhost:4000";
