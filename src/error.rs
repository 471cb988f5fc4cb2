//! Error types for the AeroDB client SDK.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
  #[error("Configuration error: {0}")]
  Config(String),

  #[error("Connection error: {0}")]
  Connection(String),

  #[error("HTTP error: {0}")]
  Http(String),

  #[error("WebSocket error: {0}")]
  WebSocket(String),

  #[error("Serialization error: {0}")]
  Serialization(String),

  #[error("Malformed response: {0}")]
  MalformedResponse(String),

  #[error("Timeout")]
  Timeout,

  #[error("Channel closed")]
  ChannelClosed,
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Self::Serialization(e.to_string())
  }
}

impl From<reqwest::Error> for Error {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      Self::Timeout
    } else if e.is_connect() {
      Self::Connection(e.to_string())
    } else if e.is_decode() {
      Self::MalformedResponse(e.to_string())
    } else {
      Self::Http(e.to_string())
    }
  }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
  fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match e {
      WsError::ConnectionClosed | WsError::AlreadyClosed => Self::ChannelClosed,
      WsError::Io(io) => Self::Connection(io.to_string()),
      other => Self::WebSocket(other.to_string()),
    }
  }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Invalid builder state, detected locally before anything reaches the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
  #[error("`in` filter on column '{column}' needs at least one value")]
  EmptyInList { column: String },

  #[error("operator '{operator}' on column '{column}' expects a list of values")]
  ExpectedList { column: String, operator: String },

  #[error("operator '{operator}' on column '{column}' expects a single value")]
  ExpectedScalar { column: String, operator: String },

  #[error("column '{0}' collides with a reserved query parameter")]
  ReservedColumn(String),

  #[error("{mode} without filters would touch every row of '{table}'")]
  UnconditionalMutation { mode: String, table: String },

  #[error("limit must be non-negative, got {0}")]
  NegativeLimit(i64),

  #[error("offset must be non-negative, got {0}")]
  NegativeOffset(i64),

  #[error("invalid payload: {0}")]
  InvalidPayload(String),

  #[error("malformed filter parameter: {0}")]
  MalformedFilter(String),
}
