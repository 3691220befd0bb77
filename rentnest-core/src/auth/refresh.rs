//! Single-flight credential renewal
//!
//! At most one `POST /refresh` is on the wire at a time. Callers that ask for
//! a refresh while one is running are queued and all receive the outcome of
//! the running call.

use super::device::DeviceIdManager;
use super::http_client::{ApiRequest, Transport, DEVICE_ID_HEADER};
use super::middleware::{classify_failure, EndpointClass, FailureKind};
use super::state::SessionPublisher;
use super::storage::TokenStore;
use super::token;
use super::types::RefreshFailure;
use crate::settings::RefreshRetry;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

pub type RefreshOutcome = Result<String, RefreshFailure>;

#[derive(Default)]
struct RefreshSlot {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

pub struct RefreshCoordinator {
    transport: Arc<dyn Transport>,
    tokens: TokenStore,
    device: DeviceIdManager,
    publisher: SessionPublisher,
    endpoint: String,
    retry: RefreshRetry,
    slot: Mutex<RefreshSlot>,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        tokens: TokenStore,
        device: DeviceIdManager,
        publisher: SessionPublisher,
        endpoint: impl Into<String>,
        retry: RefreshRetry,
    ) -> Self {
        Self {
            transport,
            tokens,
            device,
            publisher,
            endpoint: endpoint.into(),
            retry,
            slot: Mutex::new(RefreshSlot::default()),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.slot.lock().in_flight
    }

    /// Obtain a new token, joining the running refresh if there is one.
    ///
    /// On success the token is stored with the recorded durability
    /// preference and the session becomes authenticated. On failure the
    /// token is purged and the session becomes anonymous.
    pub async fn refresh(&self) -> RefreshOutcome {
        let waiter = {
            let mut slot = self.slot.lock();
            if slot.in_flight {
                let (tx, rx) = oneshot::channel();
                slot.waiters.push(tx);
                Some(rx)
            } else {
                slot.in_flight = true;
                None
            }
        };

        if let Some(rx) = waiter {
            debug!("Refresh already in flight, waiting for its outcome");
            return rx.await.unwrap_or_else(|_| {
                Err(RefreshFailure::Unavailable {
                    status: None,
                    message: "refresh abandoned".to_string(),
                })
            });
        }

        let flight = Flight {
            coordinator: self,
            outcome: None,
        };
        self.publisher.state().set_refreshing(true);

        let outcome = self.run().await;
        match &outcome {
            Ok(token) => self.on_success(token),
            Err(failure) => self.on_failure(failure),
        }

        flight.release(&outcome);
        outcome
    }

    /// Refresh after the server rejected `rejected`. When another caller has
    /// already stored a newer, unexpired token, that one is used instead.
    pub async fn refresh_after_rejection(&self, rejected: &str) -> RefreshOutcome {
        if let Some(current) = self.tokens.get() {
            if current != rejected && !self.tokens.is_expired() {
                debug!("Token already renewed by another call");
                return Ok(current);
            }
        }
        self.refresh().await
    }

    /// The refresh call itself. Goes straight to the transport so a failure
    /// here can never trigger another refresh.
    async fn run(&self) -> RefreshOutcome {
        let attempts = self.retry.attempts();
        let mut attempt = 1;
        let mut device_id = self.device.get();
        let mut device_retried = false;

        loop {
            let request = ApiRequest::post(self.endpoint.as_str())
                .with_header(DEVICE_ID_HEADER, device_id.as_str());

            let failure = match self.transport.send(&request).await {
                Ok(response) if response.is_success() => {
                    return response.token().map_err(|_| RefreshFailure::MalformedCredential);
                }
                Ok(response) => match classify_failure(EndpointClass::Refresh, response.status) {
                    FailureKind::DeviceRejected if !device_retried => {
                        warn!("Refresh rejected the device id, regenerating and retrying once");
                        device_retried = true;
                        device_id = self.device.regenerate();
                        continue;
                    }
                    FailureKind::DeviceRejected => return Err(RefreshFailure::DeviceRejected),
                    FailureKind::RefreshFailed(failure) => return Err(failure),
                    FailureKind::Transient
                    | FailureKind::AccessExpired
                    | FailureKind::PassThrough => RefreshFailure::Unavailable {
                        status: Some(response.status),
                        message: format!("refresh returned {}", response.status),
                    },
                },
                Err(e) => RefreshFailure::Unavailable {
                    status: None,
                    message: e.to_string(),
                },
            };

            if attempt >= attempts {
                error!("Refresh failed after {} attempts: {}", attempt, failure);
                return Err(failure);
            }

            // Exponential backoff: 1s, 2s, 4s with the default policy
            let delay = self.retry.delay(attempt);
            warn!(
                "Refresh attempt {} failed ({}), retrying in {:?}",
                attempt, failure, delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn on_success(&self, token: &str) {
        let durable = self.tokens.durable_preference();
        if let Err(e) = self.tokens.set(token, durable) {
            // Waiters still get the token for their replay
            warn!("Failed to store refreshed token: {}", e);
        }
        info!("Token refreshed ({})", token::redact(token));
        self.publisher.notify_login(false);
    }

    fn on_failure(&self, failure: &RefreshFailure) {
        match failure {
            RefreshFailure::CredentialInvalid => {
                warn!("[monitor] refresh credential invalid (498)");
            }
            RefreshFailure::CredentialRevoked => {
                warn!("[monitor] refresh credential revoked (499), possible replay");
            }
            RefreshFailure::CredentialAbsent => {
                debug!("No persistent credential, continuing anonymously");
            }
            other if other.is_user_visible() => {
                warn!("Session ended: {}", other);
            }
            other => {
                info!("Refresh failed, continuing anonymously: {}", other);
            }
        }
        self.publisher.notify_anonymous();
    }
}

/// Leadership of the running refresh. Dropping it without `release` (the
/// leader's future was cancelled) frees the slot and wakes every waiter with
/// an abandoned outcome.
struct Flight<'a> {
    coordinator: &'a RefreshCoordinator,
    outcome: Option<RefreshOutcome>,
}

impl Flight<'_> {
    fn release(mut self, outcome: &RefreshOutcome) {
        self.outcome = Some(outcome.clone());
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.coordinator.publisher.state().set_refreshing(false);
        let waiters = {
            let mut slot = self.coordinator.slot.lock();
            slot.in_flight = false;
            std::mem::take(&mut slot.waiters)
        };

        match self.outcome.take() {
            Some(outcome) => {
                if !waiters.is_empty() {
                    debug!("Releasing {} queued refresh callers", waiters.len());
                }
                for waiter in waiters {
                    // Receiver gone means that caller was cancelled
                    let _ = waiter.send(outcome.clone());
                }
            }
            None if !waiters.is_empty() => {
                warn!("Refresh cancelled with {} callers waiting", waiters.len());
            }
            None => {}
        }
    }
}
