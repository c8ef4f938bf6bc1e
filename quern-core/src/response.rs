use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// The JSON envelope every endpoint answers with:
/// `{ status, code, message, data? }`.
#[derive(Debug, serde::Serialize)]
pub struct Envelope {
  pub status: u16,
  pub code: String,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<serde_json::Value>,
}

impl Envelope {
  pub fn ok(data: Option<serde_json::Value>) -> Envelope {
    return Envelope {
      status: StatusCode::OK.as_u16(),
      code: "ok".to_string(),
      message: String::new(),
      data,
    };
  }

  pub fn error(status: StatusCode, code: &str, message: impl Into<String>) -> Envelope {
    return Envelope {
      status: status.as_u16(),
      code: code.to_string(),
      message: message.into(),
      data: None,
    };
  }
}

impl IntoResponse for Envelope {
  fn into_response(self) -> Response {
    let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    return (status, Json(self)).into_response();
  }
}
