//! HTTP transport for the RentNest API

use super::token;
use super::types::AuthError;
use crate::settings::SessionConfig;
use async_trait::async_trait;
use log::{debug, error};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const DEVICE_ID_HEADER: &str = "X-Device-Id";

/// An outgoing API call. Cloneable so the middleware can replay it.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base, e.g. `/bookings?page=2`
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Path without the query string
    pub fn route(&self) -> &str {
        self.path.split('?').next().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AuthError> {
        serde_json::from_str(&self.body).map_err(|e| AuthError::ApiError {
            status: self.status,
            message: format!("Failed to parse response: {}", e),
        })
    }

    /// Session token carried by a login/signup/refresh response. The body may
    /// be the raw token, a JSON string, or an object with a `token` field.
    pub fn token(&self) -> Result<String, AuthError> {
        let trimmed = self.body.trim();
        let candidate = match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(serde_json::Value::String(token)) => token,
            Ok(serde_json::Value::Object(fields)) => ["token", "accessToken", "access_token"]
                .iter()
                .find_map(|key| fields.get(*key).and_then(|v| v.as_str()))
                .map(str::to_string)
                .ok_or(AuthError::MalformedCredential)?,
            _ => trimmed.to_string(),
        };

        if token::is_well_formed(&candidate) {
            Ok(candidate)
        } else {
            Err(AuthError::MalformedCredential)
        }
    }
}

/// Sends a request and returns whatever status came back. Only failures to
/// get any response at all are errors.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, AuthError>;
}

/// reqwest-backed transport.
///
/// The cookie jar is enabled: the persistent refresh credential arrives as an
/// HTTP-only cookie and rides along on `/refresh` without this crate ever
/// reading it.
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &SessionConfig) -> Result<Self, AuthError> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.request_timeout())
            .cookie_store(true)
            .build()
            .map_err(|e| AuthError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, AuthError> {
        debug!("{} {}", request.method, request.route());

        let mut builder = self
            .client
            .request(request.method.clone(), self.url(&request.path));
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            error!("{} {} failed: {}", request.method, request.route(), e);
            AuthError::NetworkError(e.to_string())
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::NetworkError(format!("Failed to read body: {}", e)))?;

        debug!("{} {} -> {}", request.method, request.route(), status);
        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport_for(server: &MockServer) -> HttpTransport {
        let config = SessionConfig {
            api_base_url: format!("{}/", server.uri()),
            ..SessionConfig::default()
        };
        HttpTransport::new(&config).unwrap()
    }

    #[test]
    fn test_route_strips_query() {
        let request = ApiRequest::get("/bookings?page=2");
        assert_eq!(request.route(), "/bookings");
    }

    #[test]
    fn test_response_json() {
        let response = ApiResponse::new(200, r#"{"id": 7}"#);
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["id"], 7);
        assert!(ApiResponse::new(500, "oops").json::<serde_json::Value>().is_err());
    }

    #[test]
    fn test_token_body_shapes() {
        let token = token::encode_for_test(&serde_json::json!({"sub": "u1", "exp": 1}));
        assert_eq!(ApiResponse::new(200, token.clone()).token().unwrap(), token);
        assert_eq!(
            ApiResponse::new(200, format!("\"{}\"", token)).token().unwrap(),
            token
        );
        assert_eq!(
            ApiResponse::new(200, serde_json::json!({"accessToken": token}).to_string())
                .token()
                .unwrap(),
            token
        );
        assert!(matches!(
            ApiResponse::new(200, r#"{"ok": true}"#).token(),
            Err(AuthError::MalformedCredential)
        ));
        assert!(ApiResponse::new(200, "not-a-token").token().is_err());
    }

    #[tokio::test]
    async fn test_sends_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bookings"))
            .and(header(AUTHORIZATION_HEADER, "Bearer abc"))
            .and(body_json(serde_json::json!({"listing": 12})))
            .respond_with(ResponseTemplate::new(201).set_body_string("created"))
            .expect(1)
            .mount(&server)
            .await;

        let request = ApiRequest::post("/bookings")
            .with_header(AUTHORIZATION_HEADER, "Bearer abc")
            .with_json(serde_json::json!({"listing": 12}));
        let response = transport_for(&server).send(&request).await.unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.body, "created");
    }

    #[tokio::test]
    async fn test_error_statuses_are_responses_not_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/refresh"))
            .respond_with(ResponseTemplate::new(449))
            .mount(&server)
            .await;

        let response = transport_for(&server)
            .send(&ApiRequest::post("/refresh"))
            .await
            .unwrap();
        assert_eq!(response.status, 449);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_cookie_from_login_rides_on_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Set-Cookie", "refresh=opaque; Path=/; HttpOnly")
                    .set_body_string("token"),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/refresh"))
            .and(header("cookie", "refresh=opaque"))
            .respond_with(ResponseTemplate::new(200).set_body_string("renewed"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport_for(&server);
        transport.send(&ApiRequest::post("/login")).await.unwrap();
        let refreshed = transport.send(&ApiRequest::post("/refresh")).await.unwrap();
        assert_eq!(refreshed.body, "renewed");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let config = SessionConfig {
            api_base_url: "http://127.0.0.1:1".to_string(),
            request_timeout_secs: 2,
            ..SessionConfig::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        let result = transport.send(&ApiRequest::get("/health")).await;
        assert!(matches!(result, Err(AuthError::NetworkError(_))));
    }
}
