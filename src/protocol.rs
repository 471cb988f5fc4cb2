//! Wire protocol types for AeroDB realtime channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// REST API mount point, relative to the base URL
pub const REST_PATH: &str = "/rest/v1";

/// Realtime WebSocket endpoint, relative to the base URL
pub const REALTIME_PATH: &str = "/realtime/v1/websocket";

/// Kind of row change carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
  Insert,
  Update,
  Delete,
}

impl EventKind {
  pub const ALL: [EventKind; 3] = [EventKind::Insert, EventKind::Update, EventKind::Delete];
}

impl fmt::Display for EventKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EventKind::Insert => write!(f, "INSERT"),
      EventKind::Update => write!(f, "UPDATE"),
      EventKind::Delete => write!(f, "DELETE"),
    }
  }
}

/// Record as sent by the backend
pub type Record = Map<String, Value>;

/// Payload handed to channel handlers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimePayload {
  #[serde(rename = "type")]
  pub kind: EventKind,
  #[serde(default)]
  pub table: String,
  #[serde(default)]
  pub schema: String,
  /// `None` when absent, empty or in a format we do not recognise
  #[serde(
    default,
    deserialize_with = "lenient_timestamp",
    skip_serializing_if = "Option::is_none"
  )]
  pub commit_timestamp: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub new: Option<Record>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub old: Option<Record>,
}

/// Parse a commit timestamp in RFC 3339 or the Postgres text form
/// (`2024-01-15 10:30:00.123+00`).
pub fn parse_commit_timestamp(raw: &str) -> Option<DateTime<Utc>> {
  let raw = raw.trim();
  if raw.is_empty() {
    return None;
  }
  DateTime::parse_from_rfc3339(raw)
    .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z"))
    .map(|t| t.with_timezone(&Utc))
    .ok()
}

// Unreadable values decode as `None` so the surrounding frame still decodes.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
  D: Deserializer<'de>,
{
  let raw = Option::<Value>::deserialize(deserializer)?;
  Ok(raw.as_ref().and_then(Value::as_str).and_then(parse_commit_timestamp))
}

/// Client-to-server control frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
  Subscribe { channel: String },
  Unsubscribe { channel: String },
}

impl ClientFrame {
  pub fn channel(&self) -> &str {
    match self {
      ClientFrame::Subscribe { channel } | ClientFrame::Unsubscribe { channel } => channel,
    }
  }
}

/// Server-to-client frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
  Event {
    channel: String,
    payload: RealtimePayload,
  },
  Subscribed {
    channel: String,
  },
  Error {
    #[serde(default)]
    channel: Option<String>,
    message: String,
  },
  #[serde(other)]
  Unknown,
}
