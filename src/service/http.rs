//! JSON-over-HTTP services.
//!
//! Each call is a `POST` of the payload to the configured URL with these
//! headers:
//!
//! - `x-run-id`, `x-step-id`, `x-attempt`
//! - `authorization: Bearer ...` when the caller carries a token
//!
//! Non-2xx responses are remote failures of kind `http_<status>`; transport
//! errors (refused connections, DNS, timeouts) are unreachable failures.

use std::collections::BTreeMap;

use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde_json::Value;

use super::{Service, ServiceError, ServiceRequest};

/// Longest response body kept in an error detail.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpService {
    url: String,
    headers: BTreeMap<String, String>,
    client: Client,
}

impl HttpService {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(url, Client::new())
    }

    /// Uses a shared client, so connection pools can be reused across
    /// services.
    pub fn with_client(url: impl Into<String>, client: Client) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            client,
        }
    }

    /// Static headers sent with every request.
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

#[async_trait]
impl Service for HttpService {
    async fn call(&self, request: ServiceRequest) -> Result<Value, ServiceError> {
        let mut req = self
            .client
            .post(&self.url)
            .timeout(request.timeout)
            .header("x-run-id", request.run_id.to_string())
            .header("x-step-id", &request.step_id)
            .header("x-attempt", request.attempt.to_string())
            .json(&request.payload);

        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(ref token) = request.caller.bearer_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ServiceError::unreachable(format!("request to {} timed out", self.url))
            } else {
                ServiceError::unreachable(format!("request to {} failed: {}", self.url, e))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            debug!(
                "Step '{}' got HTTP {} from {}",
                request.step_id, status, self.url
            );
            return Err(ServiceError::remote(
                format!("http_{}", status.as_u16()),
                truncate(body),
            ));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ServiceError::unreachable(format!("failed to read response: {}", e)))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| ServiceError::remote("invalid_response", e.to_string()))
    }
}
