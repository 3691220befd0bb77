//! Session manager - the surface the rest of the application talks to

use super::broadcast::{Broadcaster, ChannelBus, SessionBus, StorageBus};
use super::device::DeviceIdManager;
use super::http_client::{ApiRequest, ApiResponse, HttpTransport, Transport};
use super::middleware::{RoutePolicy, SessionMiddleware};
use super::refresh::RefreshCoordinator;
use super::state::{AuthSnapshot, SessionPublisher, SessionState};
use super::storage::{FileStore, KeyValueStore, MemoryStore, TokenStore};
use super::token;
use super::types::{AuthError, Credentials, Identity, SignupRequest};
use crate::settings::{BusBackend, SessionConfig};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;

const STORAGE_FILE: &str = "storage.json";
const EVENTS_FILE: &str = "events.json";

/// Wires the session components together from a [`SessionConfig`]
pub struct SessionManager {
    config: SessionConfig,
    tokens: TokenStore,
    device: DeviceIdManager,
    publisher: SessionPublisher,
    coordinator: Arc<RefreshCoordinator>,
    middleware: SessionMiddleware,
}

/// Overrides for the pieces [`SessionManager`] would otherwise build itself
pub struct SessionManagerBuilder {
    config: SessionConfig,
    transport: Option<Arc<dyn Transport>>,
    durable: Option<Arc<dyn KeyValueStore>>,
    volatile: Option<Arc<dyn KeyValueStore>>,
    bus: Option<Arc<dyn SessionBus>>,
    event_store: Option<Arc<dyn KeyValueStore>>,
}

impl SessionManagerBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Storage that survives restarts. Share it between managers to model
    /// several contexts of one installation.
    pub fn durable_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.durable = Some(store);
        self
    }

    pub fn volatile_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.volatile = Some(store);
        self
    }

    /// Primary cross-context bus
    pub fn bus(mut self, bus: Arc<dyn SessionBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Shared storage the fallback bus writes events into
    pub fn event_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.event_store = Some(store);
        self
    }

    pub fn build(self) -> Result<SessionManager, AuthError> {
        let config = self.config;
        config.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config)?),
        };

        let durable: Arc<dyn KeyValueStore> = match self.durable {
            Some(store) => store,
            None => {
                let path = config.storage_file(STORAGE_FILE).ok_or_else(|| {
                    AuthError::Config("Could not determine data directory".to_string())
                })?;
                Arc::new(FileStore::open(path)?)
            }
        };
        let volatile: Arc<dyn KeyValueStore> = match self.volatile {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };

        let primary: Option<Arc<dyn SessionBus>> = match (self.bus, config.broadcast.backend) {
            (Some(bus), _) => Some(bus),
            (None, BusBackend::Channel) => {
                let bus: Arc<dyn SessionBus> = Arc::new(ChannelBus::new());
                Some(bus)
            }
            (None, BusBackend::Storage) => None,
        };
        let event_store: Arc<dyn KeyValueStore> = match self.event_store {
            Some(store) => store,
            None => match config.storage_file(EVENTS_FILE) {
                Some(path) => Arc::new(FileStore::open(path)?),
                None => Arc::new(MemoryStore::new()),
            },
        };
        let fallback: Arc<dyn SessionBus> =
            Arc::new(StorageBus::new(event_store, config.poll_interval()));

        let tokens = TokenStore::new(durable.clone(), volatile, config.expiry_leeway());
        let device = DeviceIdManager::new(durable);
        let broadcaster = Broadcaster::new(primary, fallback, config.broadcast.channel.as_str());
        let publisher = SessionPublisher::new(
            SessionState::new(),
            tokens.clone(),
            device.clone(),
            broadcaster,
        );
        let coordinator = Arc::new(RefreshCoordinator::new(
            transport.clone(),
            tokens.clone(),
            device.clone(),
            publisher.clone(),
            config.endpoints.refresh.as_str(),
            config.refresh_retry.clone(),
        ));
        let middleware = SessionMiddleware::new(
            transport,
            tokens.clone(),
            device.clone(),
            coordinator.clone(),
            RoutePolicy::from_config(&config),
        );

        info!("Session manager ready for {}", config.api_base_url);
        Ok(SessionManager {
            config,
            tokens,
            device,
            publisher,
            coordinator,
            middleware,
        })
    }
}

impl SessionManager {
    pub fn builder(config: SessionConfig) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            transport: None,
            durable: None,
            volatile: None,
            bus: None,
            event_store: None,
        }
    }

    /// Manager with the HTTP transport and on-disk storage
    pub fn new(config: SessionConfig) -> Result<Self, AuthError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn get_token(&self) -> Option<String> {
        self.tokens.get()
    }

    pub fn get_decoded_identity(&self) -> Option<Identity> {
        self.tokens.decoded_identity()
    }

    pub fn is_token_expired(&self) -> bool {
        self.tokens.is_expired()
    }

    pub fn is_logged_in(&self) -> bool {
        self.publisher.state().is_logged_in()
    }

    pub fn is_auth_ready(&self) -> bool {
        self.publisher.state().is_auth_ready()
    }

    pub fn is_refreshing(&self) -> bool {
        self.publisher.state().is_refreshing()
    }

    pub fn state(&self) -> &SessionState {
        self.publisher.state()
    }

    pub async fn wait_for_auth_ready(&self) -> AuthSnapshot {
        self.publisher.state().wait_for_auth_ready().await
    }

    pub fn notify_login(&self, broadcast: bool) {
        self.publisher.notify_login(broadcast);
    }

    pub fn notify_logout(&self) {
        self.publisher.notify_logout();
    }

    /// Send an API call through the session middleware
    pub async fn wrap(&self, request: ApiRequest) -> Result<ApiResponse, AuthError> {
        self.middleware.wrap(request).await
    }

    /// Renew the token now, sharing any refresh already running
    pub async fn refresh(&self) -> Result<String, AuthError> {
        Ok(self.coordinator.refresh().await?)
    }

    pub fn device_id(&self) -> String {
        self.device.get()
    }

    pub fn regenerate_device_id(&self) -> String {
        self.device.regenerate()
    }

    /// Remove the device identifier; a new one is minted on next use
    pub fn forget_device(&self) {
        self.device.clear();
    }

    /// Silent startup probe. A usable stored token means authenticated;
    /// otherwise one refresh decides between authenticated and anonymous.
    pub async fn initialize(&self) -> AuthSnapshot {
        if self.is_auth_ready() {
            return self.state().snapshot();
        }

        match self.tokens.get() {
            Some(stored) if !self.tokens.is_expired() => {
                debug!("Found stored token {}", token::redact(&stored));
                self.publisher.notify_login(false);
            }
            _ => {
                debug!("No usable stored token, probing with a silent refresh");
                if let Err(e) = self.coordinator.refresh().await {
                    debug!("Startup probe ended anonymous: {}", e);
                }
            }
        }

        self.state().snapshot()
    }

    /// Sign in with email and password. `remember` keeps the token across
    /// restarts.
    pub async fn login(
        &self,
        credentials: &Credentials,
        remember: bool,
    ) -> Result<Identity, AuthError> {
        info!("Signing in user: {}", credentials.email);
        let body = serde_json::to_value(credentials)
            .map_err(|e| AuthError::Config(format!("Failed to encode credentials: {}", e)))?;
        let request = ApiRequest::post(self.config.endpoints.login.as_str()).with_json(body);
        self.establish(request, remember).await
    }

    pub async fn signup(
        &self,
        signup: &SignupRequest,
        remember: bool,
    ) -> Result<Identity, AuthError> {
        info!("Creating account for {}", signup.email);
        let body = serde_json::to_value(signup)
            .map_err(|e| AuthError::Config(format!("Failed to encode signup: {}", e)))?;
        let request = ApiRequest::post(self.config.endpoints.signup.as_str()).with_json(body);
        self.establish(request, remember).await
    }

    async fn establish(&self, request: ApiRequest, remember: bool) -> Result<Identity, AuthError> {
        let route = request.route().to_string();
        let response = self.middleware.wrap(request).await?;
        if !response.is_success() {
            let message = error_message(&response);
            error!("{} failed ({}): {}", route, response.status, message);
            return Err(AuthError::ApiError {
                status: response.status,
                message,
            });
        }

        let token = response.token()?;
        let identity = token::decode_identity(&token).ok_or(AuthError::MalformedCredential)?;
        self.tokens.set(&token, remember)?;
        self.publisher.notify_login(true);

        info!("Signed in as {}", identity.subject_id);
        Ok(identity)
    }

    /// End the session here and in every other context. The server call is
    /// best-effort; local teardown always happens.
    ///
    /// Without a local token the call still goes out carrying only the
    /// device id, so the server can drop its persistent credential.
    pub async fn logout(&self) {
        let request = ApiRequest::post(self.config.endpoints.logout.as_str());
        let sent = if self.tokens.get().is_some() {
            self.middleware.wrap(request).await
        } else {
            debug!("No local token, closing server session by device id");
            self.middleware.send_device_only(request).await
        };
        match sent {
            Ok(response) if response.is_success() => debug!("Server session closed"),
            Ok(response) => warn!("Server logout returned {}", response.status),
            Err(e) => warn!("Server logout failed: {}", e),
        }
        self.publisher.notify_logout();
    }

    /// Start applying LOGIN/LOGOUT messages from other contexts. Events flow
    /// until the returned guard is stopped or dropped. Must be called inside
    /// a Tokio runtime.
    pub fn listen(&self) -> CrossContextListener {
        let mut events = self.publisher.broadcaster().subscribe();
        let publisher = self.publisher.clone();
        let task = tokio::spawn(async move {
            while let Some(message) = events.recv().await {
                publisher.apply_remote(&message);
            }
            debug!("Session event stream closed");
        });
        CrossContextListener { task }
    }
}

/// Subscription to other contexts' session events
pub struct CrossContextListener {
    task: JoinHandle<()>,
}

impl CrossContextListener {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Unsubscribe
    pub fn stop(self) {}
}

impl Drop for CrossContextListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Human-readable error from a failed response body
fn error_message(response: &ApiResponse) -> String {
    let parsed = serde_json::from_str::<serde_json::Value>(&response.body)
        .ok()
        .and_then(|value| {
            ["message", "error", "msg"]
                .iter()
                .find_map(|key| value.get(*key).and_then(|v| v.as_str()).map(str::to_string))
        });
    match parsed {
        Some(message) => message,
        None if response.body.trim().is_empty() => format!("HTTP {}", response.status),
        None => response.body.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::http_client::AUTHORIZATION_HEADER;
    use crate::auth::storage::TOKEN_KEY;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Fixed reply per route
    #[derive(Default)]
    struct Routes {
        replies: Mutex<HashMap<String, ApiResponse>>,
        sent: Mutex<Vec<ApiRequest>>,
    }

    impl Routes {
        fn reply(&self, route: &str, status: u16, body: impl Into<String>) {
            self.replies
                .lock()
                .insert(route.to_string(), ApiResponse::new(status, body));
        }

        fn count(&self, route: &str) -> usize {
            self.sent.lock().iter().filter(|r| r.route() == route).count()
        }
    }

    #[async_trait]
    impl Transport for Routes {
        async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, AuthError> {
            self.sent.lock().push(request.clone());
            Ok(self
                .replies
                .lock()
                .get(request.route())
                .cloned()
                .unwrap_or_else(|| ApiResponse::new(404, "")))
        }
    }

    fn token_for(sub: &str, ttl: i64) -> String {
        token::encode_for_test(&serde_json::json!({
            "sub": sub,
            "username": "sam",
            "role": "guest",
            "exp": chrono::Utc::now().timestamp() + ttl,
        }))
    }

    fn manager(routes: Arc<Routes>) -> (SessionManager, Arc<MemoryStore>, Arc<MemoryStore>) {
        let durable = Arc::new(MemoryStore::new());
        let volatile = Arc::new(MemoryStore::new());
        let mut config = SessionConfig::default();
        config.refresh_retry.base_delay_ms = 1;
        let manager = SessionManager::builder(config)
            .transport(routes)
            .durable_store(durable.clone())
            .volatile_store(volatile.clone())
            .event_store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap();
        (manager, durable, volatile)
    }

    fn credentials() -> Credentials {
        Credentials {
            email: "sam@example.com".to_string(),
            password: "hunter2".to_string(),
        }
    }

    #[tokio::test]
    async fn test_initialize_with_valid_token_skips_network() {
        let routes = Arc::new(Routes::default());
        let (manager, durable, _) = manager(routes.clone());
        durable.set(TOKEN_KEY, &token_for("u-1", 3600)).unwrap();

        let snapshot = manager.initialize().await;
        assert!(snapshot.logged_in && snapshot.auth_ready);
        assert!(routes.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_without_session_is_anonymous() {
        let routes = Arc::new(Routes::default());
        routes.reply("/refresh", 449, "");
        let (manager, _, _) = manager(routes.clone());

        let snapshot = manager.initialize().await;
        assert!(snapshot.auth_ready);
        assert!(!snapshot.logged_in);
        assert_eq!(routes.count("/refresh"), 1);
    }

    #[tokio::test]
    async fn test_login_without_remember_uses_volatile_tier() {
        let routes = Arc::new(Routes::default());
        routes.reply("/login", 200, token_for("u-7", 3600));
        let (manager, durable, volatile) = manager(routes.clone());

        let identity = manager.login(&credentials(), false).await.unwrap();
        assert_eq!(identity.subject_id, "u-7");
        assert!(durable.get(TOKEN_KEY).is_none());
        assert!(volatile.get(TOKEN_KEY).is_some());
        assert!(manager.is_logged_in());

        let sent = routes.sent.lock().clone();
        assert!(sent[0].header(AUTHORIZATION_HEADER).is_none());
        assert!(sent[0]
            .header(crate::auth::http_client::DEVICE_ID_HEADER)
            .is_some());
    }

    #[tokio::test]
    async fn test_login_rejection_is_api_error() {
        let routes = Arc::new(Routes::default());
        routes.reply("/login", 400, r#"{"message": "Invalid credentials"}"#);
        let (manager, _, _) = manager(routes);

        match manager.login(&credentials(), true).await {
            Err(AuthError::ApiError { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "Invalid credentials");
            }
            other => panic!("expected ApiError, got {:?}", other),
        }
        assert!(!manager.is_logged_in());
        assert!(manager.get_token().is_none());
    }

    #[tokio::test]
    async fn test_logout_calls_server_then_tears_down() {
        let routes = Arc::new(Routes::default());
        routes.reply("/login", 200, token_for("u-1", 3600));
        routes.reply("/logout", 204, "");
        let (manager, _, _) = manager(routes.clone());
        manager.login(&credentials(), true).await.unwrap();
        let device_id = manager.device_id();

        manager.logout().await;

        assert_eq!(routes.count("/logout"), 1);
        assert!(manager.get_token().is_none());
        assert!(!manager.is_logged_in());
        assert_eq!(manager.device_id(), device_id);
    }

    #[tokio::test]
    async fn test_logout_survives_server_failure() {
        let routes = Arc::new(Routes::default());
        routes.reply("/login", 200, token_for("u-1", 3600));
        routes.reply("/logout", 500, "");
        let (manager, _, _) = manager(routes);
        manager.login(&credentials(), true).await.unwrap();

        manager.logout().await;
        assert!(manager.get_token().is_none());
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(&ApiResponse::new(409, r#"{"error": "Email taken"}"#)),
            "Email taken"
        );
        assert_eq!(error_message(&ApiResponse::new(502, "  ")), "HTTP 502");
        assert_eq!(error_message(&ApiResponse::new(400, "bad")), "bad");
    }
}
