//! Observable session state
//!
//! Consumers read three independent flags (`logged_in`, `auth_ready`,
//! `refreshing`) so "not checked yet" stays distinguishable from "checked,
//! not logged in". The flags are owned by a single `watch` channel; only the
//! session layer writes them.

use super::broadcast::{Broadcaster, SessionEventKind, SessionMessage};
use super::device::DeviceIdManager;
use super::storage::TokenStore;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AuthSnapshot {
    pub logged_in: bool,
    pub auth_ready: bool,
    pub refreshing: bool,
}

impl AuthSnapshot {
    pub fn phase(&self) -> AuthPhase {
        match (self.auth_ready, self.logged_in) {
            (false, _) => AuthPhase::Undetermined,
            (true, false) => AuthPhase::Anonymous,
            (true, true) => AuthPhase::Authenticated,
        }
    }
}

/// Auth lifecycle phase. A refresh in progress is the `refreshing` flag
/// layered on top of the phase, not a phase of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Undetermined,
    Anonymous,
    Authenticated,
}

impl AuthPhase {
    /// Once determined, the state never goes back to undetermined
    pub fn can_transition_to(self, next: AuthPhase) -> bool {
        match (self, next) {
            (current, next) if current == next => true,
            (_, AuthPhase::Undetermined) => false,
            (AuthPhase::Undetermined, _)
            | (AuthPhase::Anonymous, AuthPhase::Authenticated)
            | (AuthPhase::Authenticated, AuthPhase::Anonymous) => true,
            _ => false,
        }
    }
}

/// Shared handle to the session flags
#[derive(Clone)]
pub struct SessionState {
    tx: Arc<watch::Sender<AuthSnapshot>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(AuthSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        *self.tx.borrow()
    }

    pub fn phase(&self) -> AuthPhase {
        self.snapshot().phase()
    }

    pub fn is_logged_in(&self) -> bool {
        self.snapshot().logged_in
    }

    pub fn is_auth_ready(&self) -> bool {
        self.snapshot().auth_ready
    }

    pub fn is_refreshing(&self) -> bool {
        self.snapshot().refreshing
    }

    /// Receiver that observes every change. Dropping it unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.tx.subscribe()
    }

    /// Resolves as soon as the state leaves `Undetermined`
    pub async fn wait_for_auth_ready(&self) -> AuthSnapshot {
        let mut rx = self.tx.subscribe();
        let ready = rx
            .wait_for(|snapshot| snapshot.auth_ready)
            .await
            .map(|snapshot| *snapshot);
        ready.unwrap_or_else(|_| self.snapshot())
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow.
    /// Returns whether the state now reflects `next`.
    pub(crate) fn set_phase(&self, next: AuthPhase) -> bool {
        let mut accepted = true;
        self.tx.send_if_modified(|snapshot| {
            let current = snapshot.phase();
            if !current.can_transition_to(next) {
                warn!("Refusing auth transition {:?} -> {:?}", current, next);
                accepted = false;
                return false;
            }
            if current == next {
                return false;
            }
            debug!("Auth transition {:?} -> {:?}", current, next);
            snapshot.auth_ready = next != AuthPhase::Undetermined;
            snapshot.logged_in = next == AuthPhase::Authenticated;
            true
        });
        accepted
    }

    pub(crate) fn set_refreshing(&self, refreshing: bool) {
        self.tx.send_if_modified(|snapshot| {
            if snapshot.refreshing == refreshing {
                return false;
            }
            snapshot.refreshing = refreshing;
            true
        });
    }
}

/// Applies login/logout to local state, storage and other contexts
#[derive(Clone)]
pub struct SessionPublisher {
    state: SessionState,
    tokens: TokenStore,
    device: DeviceIdManager,
    broadcaster: Broadcaster,
}

impl SessionPublisher {
    pub fn new(
        state: SessionState,
        tokens: TokenStore,
        device: DeviceIdManager,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            state,
            tokens,
            device,
            broadcaster,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Mark the session authenticated. Background paths (refresh, remote
    /// LOGIN) pass `broadcast = false` so contexts do not echo each other.
    pub fn notify_login(&self, broadcast: bool) {
        self.state.set_phase(AuthPhase::Authenticated);
        if broadcast {
            if let Err(e) = self.broadcaster.publish(SessionEventKind::Login) {
                warn!("Failed to broadcast LOGIN: {}", e);
            }
        }
    }

    /// Tell other contexts first, then tear down locally
    pub fn notify_logout(&self) {
        if let Err(e) = self.broadcaster.publish(SessionEventKind::Logout) {
            warn!("Failed to broadcast LOGOUT: {}", e);
        }
        self.teardown();
    }

    /// Drop to anonymous after a failed refresh. Other contexts are not told;
    /// each discovers the dead session on its own next call.
    pub fn notify_anonymous(&self) {
        if let Err(e) = self.tokens.remove() {
            warn!("Failed to purge token: {}", e);
        }
        self.state.set_phase(AuthPhase::Anonymous);
    }

    /// Wipe both storage tiers, keeping only the device identifier
    pub fn teardown(&self) {
        let device_id = self.device.peek();

        for (tier, store) in [
            ("durable", self.tokens.durable_tier()),
            ("volatile", self.tokens.volatile_tier()),
        ] {
            if let Err(e) = store.clear() {
                warn!("Failed to clear {} storage: {}", tier, e);
            }
        }

        if let Some(id) = device_id {
            self.device.restore(&id);
        }

        self.state.set_refreshing(false);
        self.state.set_phase(AuthPhase::Anonymous);
        info!("Local session torn down");
    }

    /// React to a message from another context. Never re-broadcasts.
    pub fn apply_remote(&self, message: &SessionMessage) {
        info!(
            "Received {:?} from context {}",
            message.kind,
            message.origin.chars().take(8).collect::<String>()
        );
        match message.kind {
            SessionEventKind::Logout => self.teardown(),
            SessionEventKind::Login => self.notify_login(false),
        }
    }
}
