//! HTTP transport abstraction.
//!
//! Adapters and the cluster sink speak to their APIs through [`ApiTransport`]
//! so tests can script upstream responses (status codes, bodies, outages)
//! without a network. The real implementation wraps a shared
//! [`reqwest::Client`].

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::WardenError;

const TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

/// Request body payloads the upstream APIs require: JSON for the decision
/// engines, form encoding for the Proxmox control plane.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub basic_auth: Option<(String, String)>,
    pub body: Option<RequestBody>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            basic_auth: None,
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn basic_auth(mut self, user: &str, password: &str) -> Self {
        self.basic_auth = Some((user.to_string(), password.to_string()));
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Some(RequestBody::Json(value));
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = Some(RequestBody::Form(fields));
        self
    }
}

/// Status and body of a completed exchange. Transport-level failures
/// (connect, TLS, timeout) never produce a response; they surface as
/// [`WardenError::Network`].
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, WardenError>;
}

/// Production transport backed by reqwest with rustls.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// `verify_tls: false` accepts self-signed certificates, which Proxmox
    /// clusters ship with out of the box.
    pub fn new(verify_tls: bool) -> Result<Self, WardenError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .user_agent(format!("ghostwarden/{}", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| WardenError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ApiTransport for ReqwestTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, WardenError> {
        debug!("{} {}", request.method.as_str(), request.url);

        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, &request.url);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some((user, password)) = &request.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }

        match &request.body {
            Some(RequestBody::Json(value)) => builder = builder.json(value),
            Some(RequestBody::Form(fields)) => builder = builder.form(fields),
            None => {}
        }

        let response = builder
            .send()
            .await
            .map_err(|e| WardenError::Network(format!("{}: {}", request.url, e)))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| WardenError::Network(format!("reading body from {}: {}", request.url, e)))?;

        Ok(ApiResponse { status, body })
    }
}

/// Scripted transport for tests: hands out canned results in order and
/// records every request it saw.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<ApiResponse, WardenError>>>,
        requests: Mutex<Vec<ApiRequest>>,
    }

    impl ScriptedTransport {
        pub fn new(responses: Vec<Result<ApiResponse, WardenError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn ok(status: u16, body: &str) -> Result<ApiResponse, WardenError> {
            Ok(ApiResponse {
                status,
                body: body.to_string(),
            })
        }

        pub fn requests(&self) -> Vec<ApiRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ApiTransport for ScriptedTransport {
        async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, WardenError> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected request: {}", request.url))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let req = ApiRequest::post("https://lapi.local/v1/heartbeat")
            .header("X-Api-Key", "secret")
            .json(serde_json::json!({"machine_id": "abc"}));

        assert_eq!(req.method, Method::Post);
        assert_eq!(req.headers.len(), 1);
        assert!(matches!(req.body, Some(RequestBody::Json(_))));
    }

    #[test]
    fn test_response_success_range() {
        let ok = ApiResponse {
            status: 204,
            body: String::new(),
        };
        let not_found = ApiResponse {
            status: 404,
            body: String::new(),
        };
        assert!(ok.is_success());
        assert!(!not_found.is_success());
    }

    #[tokio::test]
    async fn test_transport_reports_invalid_url_as_network() {
        let transport = ReqwestTransport::new(true).unwrap();
        let result = transport.execute(ApiRequest::get("not-a-url")).await;
        assert!(matches!(result, Err(WardenError::Network(_))));
    }
}
