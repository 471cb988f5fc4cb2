//! AeroDB client: configuration, credentials and the entry point tying the
//! query compiler and the realtime multiplexer to their transports.

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::http::{HttpTransport, ReqwestTransport};
use crate::protocol::REALTIME_PATH;
use crate::query::QueryBuilder;
use crate::realtime::RealtimeClient;
use crate::response::Response;
use crate::socket::{Connector, TungsteniteConnector};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Supplies the current access token. Token storage and refresh live outside the SDK.
pub trait TokenSource: Send + Sync {
  fn access_token(&self) -> Option<String>;
}

impl<F> TokenSource for F
where
  F: Fn() -> Option<String> + Send + Sync,
{
  fn access_token(&self) -> Option<String> {
    self()
  }
}

/// A token that never changes
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenSource for StaticToken {
  fn access_token(&self) -> Option<String> {
    Some(self.0.clone())
  }
}

/// API key plus optional bearer token source
#[derive(Clone, Default)]
pub struct Credentials {
  pub api_key: Option<String>,
  pub tokens: Option<Arc<dyn TokenSource>>,
}

impl Credentials {
  pub fn access_token(&self) -> Option<String> {
    self.tokens.as_ref().and_then(|t| t.access_token())
  }
}

impl fmt::Debug for Credentials {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Credentials")
      .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
      .field("tokens", &self.tokens.is_some())
      .finish()
  }
}

/// Client configuration
#[derive(Clone)]
pub struct ClientOptions {
  pub url: String,
  pub api_key: Option<String>,
  pub schema: String,
  pub headers: Vec<(String, String)>,
  pub timeout: Option<Duration>,
  pub tokens: Option<Arc<dyn TokenSource>>,
}

impl fmt::Debug for ClientOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ClientOptions")
      .field("url", &self.url)
      .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
      .field("schema", &self.schema)
      .field("headers", &self.headers)
      .field("timeout", &self.timeout)
      .field("tokens", &self.tokens.is_some())
      .finish()
  }
}

impl ClientOptions {
  pub fn new(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      api_key: None,
      schema: "public".to_string(),
      headers: Vec::new(),
      timeout: None,
      tokens: None,
    }
  }

  /// Read `AERODB_URL` (required), `AERODB_KEY` and `AERODB_SCHEMA`.
  pub fn from_env() -> Result<Self> {
    let url = std::env::var("AERODB_URL")
      .map_err(|_| Error::Config("AERODB_URL is not set".to_string()))?;
    let mut opts = Self::new(url);
    if let Ok(key) = std::env::var("AERODB_KEY") {
      opts = opts.with_key(key);
    }
    if let Ok(schema) = std::env::var("AERODB_SCHEMA") {
      opts = opts.with_schema(schema);
    }
    Ok(opts)
  }

  pub fn with_key(mut self, key: impl Into<String>) -> Self {
    self.api_key = Some(key.into());
    self
  }

  pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
    self.schema = schema.into();
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn with_token_source(mut self, tokens: impl TokenSource + 'static) -> Self {
    self.tokens = Some(Arc::new(tokens));
    self
  }

  pub fn with_access_token(self, token: impl Into<String>) -> Self {
    self.with_token_source(StaticToken(token.into()))
  }

  pub fn credentials(&self) -> Credentials {
    Credentials {
      api_key: self.api_key.clone(),
      tokens: self.tokens.clone(),
    }
  }

  /// Base URL without trailing slashes, validated
  pub fn base_url(&self) -> Result<String> {
    let trimmed = self.url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
      return Err(Error::Config("url is required".to_string()));
    }
    reqwest::Url::parse(trimmed)
      .map_err(|e| Error::Config(format!("invalid url '{}': {}", trimmed, e)))?;
    Ok(trimmed.to_string())
  }

  /// Realtime endpoint derived from the base URL: `https` maps to `wss`, anything else to `ws`.
  pub fn realtime_url(&self) -> Result<String> {
    let base = self.base_url()?;
    let parsed = reqwest::Url::parse(&base)
      .map_err(|e| Error::Config(format!("invalid url '{}': {}", base, e)))?;
    let scheme = match parsed.scheme() {
      "https" | "wss" => "wss",
      _ => "ws",
    };
    let host = parsed
      .host_str()
      .ok_or_else(|| Error::Config(format!("url '{}' has no host", base)))?;
    let authority = match parsed.port() {
      Some(port) => format!("{}:{}", host, port),
      None => host.to_string(),
    };
    Ok(format!("{}://{}{}", scheme, authority, REALTIME_PATH))
  }
}

/// AeroDB client
///
/// Cheap to clone; clones share the HTTP transport and the realtime connection.
#[derive(Clone)]
pub struct AeroDB {
  options: ClientOptions,
  http: Arc<dyn HttpTransport>,
  realtime: RealtimeClient,
}

impl fmt::Debug for AeroDB {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AeroDB")
      .field("options", &self.options)
      .field("realtime", &self.realtime)
      .finish()
  }
}

impl AeroDB {
  /// Build a client with the default reqwest and tungstenite transports.
  pub fn new(options: ClientOptions) -> Result<Self> {
    let base = options.base_url()?;
    let http = ReqwestTransport::new(
      &base,
      options.credentials(),
      options.headers.clone(),
      options.timeout,
    )?;
    Self::with_transports(options, Arc::new(http), Arc::new(TungsteniteConnector))
  }

  /// Build a client over caller-supplied transports.
  pub fn with_transports(
    options: ClientOptions,
    http: Arc<dyn HttpTransport>,
    connector: Arc<dyn Connector>,
  ) -> Result<Self> {
    let realtime = RealtimeClient::new(options.realtime_url()?, options.credentials(), connector);
    Ok(Self {
      options,
      http,
      realtime,
    })
  }

  pub fn options(&self) -> &ClientOptions {
    &self.options
  }

  /// Start a query against `table`
  pub fn from(&self, table: impl Into<String>) -> QueryBuilder {
    QueryBuilder::bound(table, self.options.schema.clone(), self.http.clone())
  }

  /// Get or create a realtime channel
  pub fn channel(&self, name: impl Into<String>) -> Channel {
    self.realtime.channel(name)
  }

  pub fn realtime(&self) -> &RealtimeClient {
    &self.realtime
  }

  /// Close the realtime connection and every channel
  pub async fn close(&self) -> Response<()> {
    self.realtime.disconnect().await
  }
}
