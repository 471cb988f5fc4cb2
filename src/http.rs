//! HTTP collaborator for the REST data API.
//!
//! The query compiler produces an [`HttpRequest`]; anything implementing
//! [`HttpTransport`] can carry it. [`ReqwestTransport`] is the default.

use crate::client::Credentials;
use crate::error::{Error, Result};
use crate::protocol::REST_PATH;
use crate::query::{HttpRequest, Method};
use futures::future::BoxFuture;
use log::debug;
use std::time::{Duration, Instant};

/// Raw backend answer before it is wrapped in an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Sends compiled requests. Must tolerate concurrent in-flight requests.
pub trait HttpTransport: Send + Sync {
    fn send<'a>(&'a self, request: &'a HttpRequest) -> BoxFuture<'a, Result<HttpResponse>>;
}

/// [`HttpTransport`] backed by a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: reqwest::Client,
    rest_url: String,
    credentials: Credentials,
    headers: Vec<(String, String)>,
}

impl ReqwestTransport {
    pub fn new(
        base_url: &str,
        credentials: Credentials,
        headers: Vec<(String, String)>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            rest_url: format!("{}{}", base_url.trim_end_matches('/'), REST_PATH),
            credentials,
            headers,
        })
    }

    fn url_for(&self, request: &HttpRequest) -> String {
        let query = request.query_string();
        if query.is_empty() {
            format!("{}{}", self.rest_url, request.path)
        } else {
            format!("{}{}?{}", self.rest_url, request.path, query)
        }
    }

    async fn dispatch(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let url = self.url_for(request);
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, &url);
        for (name, value) in self.headers.iter().chain(request.headers.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(key) = &self.credentials.api_key {
            builder = builder.header("apikey", key.as_str());
        }
        if let Some(token) = self.credentials.access_token() {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let start = Instant::now();
        debug!("[QUERY] {} {}", request.method, url);
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        debug!(
            "[QUERY] {} {} -> {} ({} bytes) in {:?}",
            request.method,
            request.path,
            status,
            body.len(),
            start.elapsed()
        );

        Ok(HttpResponse { status, body })
    }
}

impl HttpTransport for ReqwestTransport {
    fn send<'a>(&'a self, request: &'a HttpRequest) -> BoxFuture<'a, Result<HttpResponse>> {
        Box::pin(self.dispatch(request))
    }
}
