//! HTTP boundary
//!
//! Every remote call the launcher makes resolves to a [`ServerResponse`],
//! never to an error. Flows classify responses with plain predicates, so a
//! network failure is just another value on their `failure` channel.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::registry::Payload;

/// Status and JSON body of a remote call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerResponse {
    /// HTTP status code, or a synthetic one for client-side failures
    pub status: u16,
    /// Parsed body, `{}` when there was none
    #[serde(default)]
    pub json: Value,
}

impl ServerResponse {
    /// Build a response
    #[must_use]
    pub fn new(status: u16, json: Value) -> Self {
        Self { status, json }
    }

    /// Response used when the request never produced a JSON body
    #[must_use]
    pub fn transport_failure() -> Self {
        Self::new(500, json!({}))
    }

    /// Response used when a client-side deadline elapsed
    #[must_use]
    pub fn timed_out() -> Self {
        Self::new(504, json!({"error": "TIMEOUT"}))
    }

    /// 2xx status
    #[must_use]
    pub fn is_success_status(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Non-empty string field of the body
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.json
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Convert into a trigger payload
    #[must_use]
    pub fn into_payload(self) -> Payload {
        json!({"status": self.status, "json": self.json})
    }

    /// Read a response back out of a trigger payload
    #[must_use]
    pub fn from_payload(payload: &Payload) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }
}

/// Race `request` against `deadline`
///
/// The request is dropped if the deadline wins.
pub async fn with_deadline<F>(deadline: Duration, request: F) -> ServerResponse
where
    F: Future<Output = ServerResponse>,
{
    match tokio::time::timeout(deadline, request).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!(?deadline, "Request deadline elapsed");
            ServerResponse::timed_out()
        }
    }
}

/// JSON-over-HTTP client rooted at a base URL
#[derive(Clone, Debug)]
pub struct HttpClient {
    base_url: String,
    client: Client,
}

impl HttpClient {
    /// Client for a trusted HTTPS or local endpoint
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Client for a host service presenting a self-signed certificate
    #[must_use]
    pub fn insecure(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                Client::new()
            });
        Self::with_client(base_url, client)
    }

    fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Base URL without trailing slash
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GET `path`
    pub async fn get(&self, path: &str, access_token: Option<&str>) -> ServerResponse {
        let request = authorize(self.client.get(self.url(path)), access_token);
        self.send("GET", path, request).await
    }

    /// POST a JSON body to `path`
    pub async fn post(&self, path: &str, body: &Value, access_token: Option<&str>) -> ServerResponse {
        let request = authorize(self.client.post(self.url(path)), access_token).json(body);
        self.send("POST", path, request).await
    }

    /// PUT a JSON body to `path`
    pub async fn put(&self, path: &str, body: &Value, access_token: Option<&str>) -> ServerResponse {
        let request = authorize(self.client.put(self.url(path)), access_token).json(body);
        self.send("PUT", path, request).await
    }

    async fn send(&self, method: &str, path: &str, request: RequestBuilder) -> ServerResponse {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(method, path, error = %e, "HTTP transport failure");
                return ServerResponse::transport_failure();
            }
        };

        let status = response.status().as_u16();
        match response.json::<Value>().await {
            Ok(json) => {
                tracing::debug!(method, path, status, "HTTP response");
                ServerResponse::new(status, json)
            }
            Err(e) => {
                tracing::warn!(method, path, status, error = %e, "HTTP response body is not JSON");
                ServerResponse::transport_failure()
            }
        }
    }
}

fn authorize(request: RequestBuilder, access_token: Option<&str>) -> RequestBuilder {
    match access_token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}
