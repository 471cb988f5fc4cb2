//! Uniform result envelope returned by every data and realtime operation.
//!
//! Operations never return `Err` or panic across the SDK boundary. Compile
//! errors, transport faults and backend rejections all resolve into
//! [`Response::Error`], so callers only ever inspect one shape.

use crate::error::{CompileError, Error};
use crate::http::HttpResponse;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Where a failure originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Invalid builder state. Never reached the network.
    Compile,
    /// Connection refused, timeout, malformed payload.
    Transport,
    /// The backend answered with a status >= 400 or rejected a subscription.
    Backend,
}

/// Error half of the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorInfo {
    pub fn compile(err: &CompileError) -> Self {
        Self {
            kind: ErrorKind::Compile,
            message: err.to_string(),
            status: None,
            code: None,
            details: None,
        }
    }

    pub fn transport(err: &Error) -> Self {
        Self {
            kind: ErrorKind::Transport,
            message: err.to_string(),
            status: None,
            code: None,
            details: None,
        }
    }

    pub fn backend(message: impl Into<String>, status: Option<u16>, code: Option<String>) -> Self {
        Self {
            kind: ErrorKind::Backend,
            message: message.into(),
            status,
            code,
            details: None,
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, &self.code) {
            (Some(status), Some(code)) => write!(f, "{} (status {}, code {})", self.message, status, code),
            (Some(status), None) => write!(f, "{} (status {})", self.message, status),
            (None, Some(code)) => write!(f, "{} (code {})", self.message, code),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ErrorInfo {}

/// Result of a terminal operation: exactly one of data or error.
#[derive(Debug, Clone, PartialEq)]
pub enum Response<T> {
    Data(T),
    Error(ErrorInfo),
}

impl<T> Response<T> {
    pub fn data(&self) -> Option<&T> {
        match self {
            Response::Data(data) => Some(data),
            Response::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        match self {
            Response::Data(_) => None,
            Response::Error(err) => Some(err),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Data(_))
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            Response::Data(data) => Some(data),
            Response::Error(_) => None,
        }
    }

    pub fn into_result(self) -> Result<T, ErrorInfo> {
        match self {
            Response::Data(data) => Ok(data),
            Response::Error(err) => Err(err),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Response<U> {
        match self {
            Response::Data(data) => Response::Data(f(data)),
            Response::Error(err) => Response::Error(err),
        }
    }
}

impl<T> From<CompileError> for Response<T> {
    fn from(err: CompileError) -> Self {
        Response::Error(ErrorInfo::compile(&err))
    }
}

impl<T> From<Error> for Response<T> {
    fn from(err: Error) -> Self {
        Response::Error(ErrorInfo::transport(&err))
    }
}

impl<T> From<Result<T, Error>> for Response<T> {
    fn from(result: Result<T, Error>) -> Self {
        match result {
            Ok(data) => Response::Data(data),
            Err(err) => err.into(),
        }
    }
}

/// Rows returned by the REST backend.
pub type Rows = Vec<Value>;

/// Map a raw transport outcome into an envelope of rows.
///
/// `action` names the operation for the fallback failure message ("Query",
/// "Insert", ...).
pub(crate) fn rows_from_http(action: &str, outcome: Result<HttpResponse, Error>) -> Response<Rows> {
    let response = match outcome {
        Ok(response) => response,
        Err(err) => return err.into(),
    };

    if (200..400).contains(&response.status) {
        return parse_rows(&response.body).into();
    }

    let body: Option<Value> = serde_json::from_slice(&response.body).ok();
    let field = |name: &str| {
        body.as_ref()
            .and_then(|b| b.get(name))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let message = field("message")
        .or_else(|| field("error"))
        .unwrap_or_else(|| format!("{} failed", action));

    let mut info = ErrorInfo::backend(message, Some(response.status), field("code"));
    info.details = body.as_ref().and_then(|b| b.get("details")).cloned();
    Response::Error(info)
}

fn parse_rows(body: &[u8]) -> Result<Rows, Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let value: Value =
        serde_json::from_slice(body).map_err(|e| Error::MalformedResponse(e.to_string()))?;

    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(rows) => Ok(rows),
        row @ Value::Object(_) => Ok(vec![row]),
        other => Err(Error::MalformedResponse(format!(
            "expected rows, got {}",
            other
        ))),
    }
}
