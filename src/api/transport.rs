//! HTTP transport seam.
//!
//! Every REST call made by a reconciler goes through [`HttpTransport`]. This
//! abstracts the wire so that:
//! - Reconcilers can be tested against scripted responses
//! - Status codes and headers (continuation tokens, `Location`) stay visible
//! - Authentication is configured once, when the transport is built

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::TransportError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(100);

/// HTTP methods used against the Azure DevOps REST API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
        };
        f.write_str(name)
    }
}

/// A serialized request body with its content type.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestBody {
    pub content_type: &'static str,
    pub payload: String,
}

/// A single REST request.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<RequestBody>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::Put, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::Patch, url)
    }

    /// Attaches a JSON body.
    pub fn json<T: Serialize + ?Sized>(self, body: &T) -> Result<Self, serde_json::Error> {
        self.with_body("application/json", serde_json::to_string(body)?)
    }

    /// Attaches a JSON-patch document body.
    pub fn json_patch<T: Serialize + ?Sized>(self, body: &T) -> Result<Self, serde_json::Error> {
        self.with_body("application/json-patch+json", serde_json::to_string(body)?)
    }

    fn with_body(
        mut self,
        content_type: &'static str,
        payload: String,
    ) -> Result<Self, serde_json::Error> {
        self.body = Some(RequestBody {
            content_type,
            payload,
        });
        Ok(self)
    }
}

/// A fully-read REST response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub reason: String,
    /// Header names are stored lowercased.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl ApiResponse {
    /// Builds a response with the canonical reason phrase for `status`.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        let reason = reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or_default()
            .to_string();
        Self {
            status,
            reason,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Builds a response carrying a JSON body.
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self::new(status, body.to_string())
    }

    /// Adds a header, returning the modified response.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header access.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Deserializes the body.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Trait for sending REST requests.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends a request and reads the whole response.
    ///
    /// Non-success statuses are returned as responses, not errors.
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// Real implementation backed by a `reqwest::Client` with a preset
/// `Authorization` header.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport that sends `authorization` with every request.
    pub fn new(authorization: &SecretString) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        let mut auth_value = HeaderValue::from_str(authorization.expose_secret())
            .map_err(|e| TransportError::Build(format!("invalid authorization header: {e}")))?;
        auth_value.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Build(e.to_string()))?;

        Ok(Self { client })
    }
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("authorization", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let request_error = |e: reqwest::Error| TransportError::Request {
            url: request.url.clone(),
            message: e.to_string(),
        };

        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
            Method::Put => self.client.put(&request.url),
            Method::Patch => self.client.patch(&request.url),
        };
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, body.content_type)
                .body(body.payload.clone());
        }

        let response = builder.send().await.map_err(request_error)?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(request_error)?;

        Ok(ApiResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::mocks::MockTransport;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_helpers() {
        let response = ApiResponse::json(200, json!({"id": "abc"}))
            .with_header("X-MS-ContinuationToken", "tok");
        assert!(response.is_success());
        assert_eq!(response.reason, "OK");
        assert_eq!(response.header("x-ms-continuationtoken"), Some("tok"));

        #[derive(serde::Deserialize)]
        struct Body {
            id: String,
        }
        assert_eq!(response.parse::<Body>().unwrap().id, "abc");
    }

    #[test]
    fn test_request_json_body() {
        let request = ApiRequest::post("https://x/y").json(&json!({"a": 1})).unwrap();
        let body = request.body.unwrap();
        assert_eq!(body.content_type, "application/json");
        assert_eq!(body.payload, "{\"a\":1}");

        let patch = ApiRequest::patch("https://x/y").json_patch(&json!([])).unwrap();
        assert_eq!(
            patch.body.unwrap().content_type,
            "application/json-patch+json"
        );
    }

    /// # Mock Transport Replay
    ///
    /// Tests queued responses and the sticky last response.
    ///
    /// ## Test Scenario
    /// - Queues 404 then 200 for one route
    /// - Sends three matching requests and one unmatched request
    ///
    /// ## Expected Outcome
    /// - 404, 200, 200 for the route; 404 for the unmatched request; all recorded
    #[tokio::test]
    async fn test_mock_transport_replay() {
        let mock = MockTransport::new();
        mock.on(Method::Get, "/items/1", ApiResponse::new(404, ""))
            .on(Method::Get, "/items/1", ApiResponse::new(200, "{}"));

        let statuses = [
            mock.send(ApiRequest::get("https://h/items/1")).await.unwrap().status,
            mock.send(ApiRequest::get("https://h/items/1")).await.unwrap().status,
            mock.send(ApiRequest::get("https://h/items/1")).await.unwrap().status,
            mock.send(ApiRequest::post("https://h/items/1")).await.unwrap().status,
        ];
        assert_eq!(statuses, [404, 200, 200, 404]);
        assert_eq!(mock.count(Method::Get, "/items/1"), 3);
        assert_eq!(mock.calls().len(), 4);
    }

    #[test]
    fn test_reqwest_transport_debug_redacts() {
        let transport = ReqwestTransport::new(&SecretString::from("Basic abc".to_string())).unwrap();
        assert!(format!("{transport:?}").contains("[REDACTED]"));
    }
}
