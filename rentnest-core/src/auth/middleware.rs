//! Request middleware
//!
//! Every API call passes through [`SessionMiddleware::wrap`]. The call is
//! classified by route, credentials are attached for protected routes, and
//! failures are dispatched through [`classify_failure`], one exhaustive
//! table keyed by endpoint class and status code.

use super::device::DeviceIdManager;
use super::http_client::{
    ApiRequest, ApiResponse, Transport, AUTHORIZATION_HEADER, DEVICE_ID_HEADER,
};
use super::refresh::RefreshCoordinator;
use super::storage::TokenStore;
use super::token;
use super::types::{AuthError, RefreshFailure};
use crate::settings::SessionConfig;
use log::{debug, info, warn};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    /// No credential, passed through untouched
    Public,
    /// Login and signup: carry the device id, return a token
    SessionIssuing,
    /// The renewal endpoint itself
    Refresh,
    /// Everything else: needs the bearer credential
    Protected,
}

/// What a failed response means for the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Bearer credential may be stale: refresh, then replay once
    AccessExpired,
    /// Device identifier refused: regenerate it, then replay once
    DeviceRejected,
    /// Refresh failed for a reason another attempt will not fix
    RefreshFailed(RefreshFailure),
    /// Refresh failed for a reason that may clear up on its own
    Transient,
    /// Not a session problem; the caller gets the response as-is
    PassThrough,
}

/// Map a non-success status to its handling.
///
/// A 401 from the refresh endpoint is terminal and never triggers another
/// refresh.
pub fn classify_failure(class: EndpointClass, status: u16) -> FailureKind {
    use EndpointClass::*;

    match (class, status) {
        (Public, _) => FailureKind::PassThrough,
        (Refresh, 419 | 401) => {
            FailureKind::RefreshFailed(RefreshFailure::SessionExpired { status })
        }
        (Refresh, 449) => FailureKind::RefreshFailed(RefreshFailure::CredentialAbsent),
        (Refresh, 498) => FailureKind::RefreshFailed(RefreshFailure::CredentialInvalid),
        (Refresh, 499) => FailureKind::RefreshFailed(RefreshFailure::CredentialRevoked),
        (SessionIssuing | Refresh | Protected, 428) => FailureKind::DeviceRejected,
        (Refresh, 408 | 429 | 500..=599) => FailureKind::Transient,
        (Refresh, _) => FailureKind::RefreshFailed(RefreshFailure::Unavailable {
            status: Some(status),
            message: format!("unexpected refresh status {}", status),
        }),
        (Protected, 401) => FailureKind::AccessExpired,
        (SessionIssuing | Protected, _) => FailureKind::PassThrough,
    }
}

/// Route table deciding each request's [`EndpointClass`]
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    public: Vec<String>,
    session_issuing: Vec<String>,
    refresh: String,
    device_scoped: Vec<String>,
}

impl RoutePolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            public: config.public_paths.clone(),
            session_issuing: vec![
                config.endpoints.login.clone(),
                config.endpoints.signup.clone(),
            ],
            refresh: config.endpoints.refresh.clone(),
            device_scoped: config.device_scoped_paths.clone(),
        }
    }

    pub fn classify(&self, request: &ApiRequest) -> EndpointClass {
        let route = request.route();
        if route_matches(route, &self.refresh) {
            EndpointClass::Refresh
        } else if self.session_issuing.iter().any(|p| route_matches(route, p)) {
            EndpointClass::SessionIssuing
        } else if self.public.iter().any(|p| route_matches(route, p)) {
            EndpointClass::Public
        } else {
            EndpointClass::Protected
        }
    }

    /// Protected routes that also carry the device identifier
    pub fn is_device_scoped(&self, request: &ApiRequest) -> bool {
        let route = request.route();
        self.device_scoped.iter().any(|p| route_matches(route, p))
    }
}

/// `prefix` matches itself and anything below it, never a sibling that only
/// shares leading characters (`/public` does not match `/publications`)
fn route_matches(route: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match route.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// The single entry point for outgoing API calls
pub struct SessionMiddleware {
    transport: Arc<dyn Transport>,
    tokens: TokenStore,
    device: DeviceIdManager,
    coordinator: Arc<RefreshCoordinator>,
    policy: RoutePolicy,
}

impl SessionMiddleware {
    pub fn new(
        transport: Arc<dyn Transport>,
        tokens: TokenStore,
        device: DeviceIdManager,
        coordinator: Arc<RefreshCoordinator>,
        policy: RoutePolicy,
    ) -> Self {
        Self {
            transport,
            tokens,
            device,
            coordinator,
            policy,
        }
    }

    pub fn policy(&self) -> &RoutePolicy {
        &self.policy
    }

    /// Send `request` with whatever credentials its route needs.
    ///
    /// Statuses that are not session problems come back as `Ok`; only a
    /// transport failure or a failed refresh is an `Err`.
    pub async fn wrap(&self, request: ApiRequest) -> Result<ApiResponse, AuthError> {
        match self.policy.classify(&request) {
            EndpointClass::Public => self.transport.send(&request).await,
            class @ (EndpointClass::SessionIssuing | EndpointClass::Refresh) => {
                self.send_with_device(class, request).await
            }
            EndpointClass::Protected => self.send_protected(request).await,
        }
    }

    async fn send_with_device(
        &self,
        class: EndpointClass,
        request: ApiRequest,
    ) -> Result<ApiResponse, AuthError> {
        let first = request
            .clone()
            .with_header(DEVICE_ID_HEADER, self.device.get());
        let response = self.transport.send(&first).await?;

        match classify_failure(class, response.status) {
            FailureKind::DeviceRejected => {
                warn!("{} rejected the device id, regenerating", request.route());
                let retry = request.with_header(DEVICE_ID_HEADER, self.device.regenerate());
                self.transport.send(&retry).await
            }
            _ => Ok(response),
        }
    }

    async fn send_protected(&self, request: ApiRequest) -> Result<ApiResponse, AuthError> {
        let token = match self.usable_token() {
            Some(token) => token,
            None => {
                debug!(
                    "Token absent or expired, refreshing before {}",
                    request.route()
                );
                self.coordinator.refresh().await?
            }
        };

        let response = self.send_authorized(&request, &token).await?;

        match classify_failure(EndpointClass::Protected, response.status) {
            FailureKind::AccessExpired => {
                info!("{} returned 401, refreshing and replaying", request.route());
                let fresh = self.coordinator.refresh_after_rejection(&token).await?;
                self.send_authorized(&request, &fresh).await
            }
            FailureKind::DeviceRejected if self.policy.is_device_scoped(&request) => {
                warn!("{} rejected the device id, regenerating", request.route());
                self.device.regenerate();
                self.send_authorized(&request, &token).await
            }
            _ => Ok(response),
        }
    }

    /// Send `request` with the device identifier and no bearer credential.
    /// Never triggers a refresh.
    pub async fn send_device_only(&self, request: ApiRequest) -> Result<ApiResponse, AuthError> {
        self.send_with_device(EndpointClass::SessionIssuing, request).await
    }

    async fn send_authorized(
        &self,
        request: &ApiRequest,
        token: &str,
    ) -> Result<ApiResponse, AuthError> {
        let mut outgoing = request
            .clone()
            .with_header(AUTHORIZATION_HEADER, format!("Bearer {}", token));
        if self.policy.is_device_scoped(request) {
            outgoing = outgoing.with_header(DEVICE_ID_HEADER, self.device.get());
        }
        self.transport.send(&outgoing).await
    }

    fn usable_token(&self) -> Option<String> {
        let token = self.tokens.get()?;
        if self.tokens.is_expired() {
            debug!("Stored token {} is expired", token::redact(&token));
            return None;
        }
        Some(token)
    }
}
