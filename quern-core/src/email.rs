use lettre::address::AddressError;
use lettre::message::{header::ContentType, Body, Mailbox, Message};
use lettre::transport::smtp;
use lettre::{AsyncSendmailTransport, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use log::*;
use minijinja::{context, Environment};
use std::sync::Arc;
use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum EmailError {
  #[error("Email address error: {0}")]
  Address(#[from] AddressError),
  #[error("Missing: {0}")]
  Missing(&'static str),
  #[error("Send error: {0}")]
  Send(#[from] lettre::error::Error),
  #[error("SMTP error: {0}")]
  Smtp(#[from] lettre::transport::smtp::Error),
  #[error("Sendmail error: {0}")]
  Sendmail(#[from] lettre::transport::sendmail::Error),
  #[error("Template error: {0}")]
  Template(#[from] minijinja::Error),
}

#[derive(Clone)]
pub enum Mailer {
  Smtp(Arc<dyn AsyncTransport<Ok = smtp::response::Response, Error = smtp::Error> + Send + Sync>),
  Local(Arc<AsyncSendmailTransport<Tokio1Executor>>),
}

impl Mailer {
  fn new_smtp(host: &str, port: u16, user: String, pass: String) -> Result<Mailer, EmailError> {
    let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?
      .port(port)
      .credentials(smtp::authentication::Credentials::new(user, pass))
      .build();
    return Ok(Mailer::Smtp(Arc::new(mailer)));
  }

  fn new_local() -> Mailer {
    return Mailer::Local(Arc::new(AsyncSendmailTransport::<Tokio1Executor>::new()));
  }

  /// SMTP when fully configured, local sendmail otherwise.
  pub fn new_from_config(config: &Config) -> Mailer {
    let smtp_from_config = || -> Result<Mailer, EmailError> {
      let smtp = &config.smtp;
      let host = smtp.host.as_ref().ok_or(EmailError::Missing("SMTP host"))?;
      let user = smtp
        .username
        .clone()
        .ok_or(EmailError::Missing("SMTP username"))?;
      let pass = smtp
        .password
        .clone()
        .ok_or(EmailError::Missing("SMTP password"))?;

      return Self::new_smtp(host, smtp.port, user, pass);
    };

    if let Ok(mailer) = smtp_from_config() {
      return mailer;
    }

    return Self::new_local();
  }
}

pub struct Email {
  mailer: Mailer,

  from: Mailbox,
  to: Mailbox,

  pub subject: String,
  pub body: String,
}

impl Email {
  fn new(
    mailer: Mailer,
    config: &Config,
    to: Mailbox,
    subject: String,
    body: String,
  ) -> Result<Self, EmailError> {
    return Ok(Self {
      mailer,
      from: sender_mailbox(config)?,
      to,
      subject,
      body,
    });
  }

  pub async fn send(&self) -> Result<(), EmailError> {
    let email = Message::builder()
      .to(self.to.clone())
      .from(self.from.clone())
      .subject(self.subject.clone())
      .header(ContentType::TEXT_HTML)
      .body(Body::new(self.body.clone()))?;

    match self.mailer {
      Mailer::Smtp(ref mailer) => {
        mailer.send(email).await?;
      }
      Mailer::Local(ref mailer) => {
        mailer.send(email).await?;
      }
    };

    return Ok(());
  }

  pub fn verification_email(
    mailer: Mailer,
    config: &Config,
    email: &str,
    token: &str,
  ) -> Result<Self, EmailError> {
    let to: Mailbox = email.parse()?;
    let url = callback_url(config, &config.endpoints.verification_path, token);

    let env = Environment::empty();
    let subject = env
      .template_from_named_str("subject", defaults::EMAIL_VERIFICATION_SUBJECT)?
      .render(context! {
        APP_NAME => config.server.application_name,
        EMAIL => email,
      })?;
    let body = env
      .template_from_named_str("body", defaults::EMAIL_VERIFICATION_BODY)?
      .render(context! {
        APP_NAME => config.server.application_name,
        VERIFICATION_URL => url,
        EMAIL => email,
      })?;

    return Email::new(mailer, config, to, subject, body);
  }

  pub fn password_reset_email(
    mailer: Mailer,
    config: &Config,
    email: &str,
    token: &str,
  ) -> Result<Self, EmailError> {
    let to: Mailbox = email.parse()?;
    let url = callback_url(config, &config.endpoints.password_reset_path, token);

    let env = Environment::empty();
    let subject = env
      .template_from_named_str("subject", defaults::PASSWORD_RESET_SUBJECT)?
      .render(context! {
        APP_NAME => config.server.application_name,
      })?;
    let body = env
      .template_from_named_str("body", defaults::PASSWORD_RESET_BODY)?
      .render(context! {
        APP_NAME => config.server.application_name,
        VERIFICATION_URL => url,
        EMAIL => email,
      })?;

    return Email::new(mailer, config, to, subject, body);
  }

  pub fn change_email_address_email(
    mailer: Mailer,
    config: &Config,
    new_email: &str,
    token: &str,
  ) -> Result<Self, EmailError> {
    let to: Mailbox = new_email.parse()?;
    let url = callback_url(config, &config.endpoints.email_change_path, token);

    let env = Environment::empty();
    let subject = env
      .template_from_named_str("subject", defaults::CHANGE_EMAIL_SUBJECT)?
      .render(context! {
        APP_NAME => config.server.application_name,
      })?;
    let body = env
      .template_from_named_str("body", defaults::CHANGE_EMAIL_BODY)?
      .render(context! {
        APP_NAME => config.server.application_name,
        VERIFICATION_URL => url,
        EMAIL => new_email,
      })?;

    return Email::new(mailer, config, to, subject, body);
  }
}

fn callback_url(config: &Config, path: &str, token: &str) -> String {
  let base = config.server.site_url.trim_end_matches('/');
  return format!("{base}{path}/{token}");
}

fn sender_mailbox(config: &Config) -> Result<Mailbox, EmailError> {
  let address = match config.smtp.sender_address {
    Some(ref address) => address.clone(),
    None => fallback_sender(&config.server.site_url),
  };

  if let Some(ref name) = config.smtp.sender_name {
    return Ok(format!("{name} <{address}>").parse::<Mailbox>()?);
  }
  return Ok(address.parse::<Mailbox>()?);
}

fn fallback_sender(site_url: &str) -> String {
  if let Some(host) = url::Url::parse(site_url).ok().and_then(|u| u.host_str().map(str::to_string)) {
    return format!("noreply@{host}");
  }

  warn!("No usable 'site_url' configured, falling back to sender 'noreply@localhost'.");
  return "noreply@localhost".to_string();
}

mod defaults {
  use indoc::indoc;

  pub const EMAIL_VERIFICATION_SUBJECT: &str = "Verify your Email Address for {{ APP_NAME }}";
  pub const EMAIL_VERIFICATION_BODY: &str = indoc! {r#"
        <html>
          <body>
            <h1>Welcome {{ EMAIL }}</h1>

            <p>
              To be able to log in, first verify your email by clicking the link below.
            </p>

            <a class="btn" href="{{ VERIFICATION_URL }}">
              {{ VERIFICATION_URL }}
            </a>
          </body>
        </html>"#};

  pub const PASSWORD_RESET_SUBJECT: &str = "Reset your Password for {{ APP_NAME }}";
  pub const PASSWORD_RESET_BODY: &str = indoc! {r#"
        <html>
          <body>
            <h1>Password Reset</h1>

            <p>
              Click the link below to reset your password.
            </p>

            <a class="btn" href="{{ VERIFICATION_URL }}">
              {{ VERIFICATION_URL }}
            </a>
          </body>
        </html>"#};

  pub const CHANGE_EMAIL_SUBJECT: &str = "Change your Email Address for {{ APP_NAME }}";
  pub const CHANGE_EMAIL_BODY: &str = indoc! {r#"
        <html>
          <body>
            <h1>Change E-Mail Address</h1>

            <p>
              Click the link below to verify your new E-mail address:
            </p>

            <a class="btn" href="{{ VERIFICATION_URL }}">
              {{ VERIFICATION_URL }}
            </a>
          </body>
        </html>"#};
}

#[cfg(test)]
pub mod testing {
  use lettre::address::Envelope;
  use lettre::transport::smtp::response::{Category, Code, Detail, Response, Severity};
  use parking_lot::Mutex;
  use std::sync::Arc;

  use super::*;

  /// Captures outgoing mail instead of talking to a relay.
  #[derive(Clone)]
  pub struct TestAsyncSmtpTransport {
    response: Response,
    log: Arc<Mutex<Vec<(Envelope, String)>>>,
  }

  impl TestAsyncSmtpTransport {
    pub fn new() -> TestAsyncSmtpTransport {
      let code = Code::new(
        Severity::PositiveCompletion,
        Category::Information,
        Detail::Zero,
      );

      return TestAsyncSmtpTransport {
        response: Response::new(code, vec![]),
        log: Arc::new(Mutex::new(Vec::new())),
      };
    }

    pub fn get_logs(&self) -> Vec<(Envelope, String)> {
      return self.log.lock().clone();
    }

    pub fn into_mailer(self) -> Mailer {
      return Mailer::Smtp(Arc::new(self));
    }
  }

  #[async_trait::async_trait]
  impl AsyncTransport for TestAsyncSmtpTransport {
    type Ok = lettre::transport::smtp::response::Response;
    type Error = lettre::transport::smtp::Error;

    async fn send_raw(&self, envelope: &Envelope, email: &[u8]) -> Result<Self::Ok, Self::Error> {
      self
        .log
        .lock()
        .push((envelope.clone(), String::from_utf8_lossy(email).into()));

      return Ok(self.response.clone());
    }
  }

  #[test]
  fn test_template_rendering() {
    let mut config = Config::new_with_defaults();
    config.server.site_url = "https://test.org".to_string();
    config.smtp.sender_address = Some("sender@test.org".to_string());

    let mailer = TestAsyncSmtpTransport::new().into_mailer();

    let email =
      Email::verification_email(mailer.clone(), &config, "foo@bar.org", "token123").unwrap();
    assert_eq!(email.subject, "Verify your Email Address for Quern");
    assert!(email.body.contains("Welcome foo@bar.org"));
    assert!(email
      .body
      .contains("https://test.org/api/confirm-verification/token123"));

    let email =
      Email::password_reset_email(mailer.clone(), &config, "foo@bar.org", "token123").unwrap();
    assert!(email
      .body
      .contains("https://test.org/api/confirm-password-reset/token123"));

    let email =
      Email::change_email_address_email(mailer, &config, "new@bar.org", "token123").unwrap();
    assert!(email
      .body
      .contains("https://test.org/api/confirm-email-change/token123"));
  }

  #[test]
  fn test_fallback_sender() {
    assert_eq!(fallback_sender("https://test.org"), "noreply@test.org");
  }
}
