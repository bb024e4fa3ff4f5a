use thiserror::Error;

/// Errors raised while talking to the origin.
#[derive(Debug, Error)]
pub enum OriginError {
  #[error("request to {url} timed out")]
  Timeout { url: String },

  #[error("{url} returned status {status}")]
  Status { url: String, status: u16 },

  #[error("request failed: {0}")]
  Request(#[from] reqwest::Error),

  #[error("failed to parse {url}: {reason}")]
  Parse { url: String, reason: String },

  #[error("not found: {what}")]
  NotFound { what: String },

  #[error("invalid url {url}: {reason}")]
  InvalidUrl { url: String, reason: String },
}

impl OriginError {
  pub(crate) fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
    if err.is_timeout() {
      Self::Timeout { url: url.to_string() }
    } else if let Some(status) = err.status() {
      Self::Status {
        url: url.to_string(),
        status: status.as_u16(),
      }
    } else {
      Self::Request(err)
    }
  }
}
