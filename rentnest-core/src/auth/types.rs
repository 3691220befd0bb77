//! Authentication types

use serde::{Deserialize, Serialize};

/// Identity claims carried in the payload segment of a session token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(alias = "sub", alias = "id", alias = "userId")]
    pub subject_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Expiry as seconds since the Unix epoch
    #[serde(rename = "exp", default)]
    pub expiry: Option<i64>,
}

/// Body of `POST /login`
#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// Body of `POST /signup`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// What a failed refresh does to the local session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Drop to anonymous mode without bothering the user
    SilentAnonymous,
    /// Drop to anonymous mode and ask the user to sign in again
    SessionExpired,
}

/// Why a credential renewal failed.
///
/// Cloned into every caller that was waiting on the same refresh, so each of
/// them observes the identical outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshFailure {
    /// 419 from `/refresh`, or 401 from the refresh call itself
    #[error("Session expired, please sign in again")]
    SessionExpired { status: u16 },

    /// 449: no persistent credential, the visitor is anonymous
    #[error("No session to restore")]
    CredentialAbsent,

    /// 498: persistent credential unknown to the server
    #[error("Session credential is invalid")]
    CredentialInvalid,

    /// 499: persistent credential revoked
    #[error("Session credential was revoked")]
    CredentialRevoked,

    /// 428 again after the identifier was regenerated
    #[error("Device identifier rejected by the server")]
    DeviceRejected,

    /// The server answered with something that is not a session token
    #[error("Refresh returned a malformed credential")]
    MalformedCredential,

    /// Network errors or unexpected statuses outlasted the retry budget
    #[error("Session service unavailable: {message}")]
    Unavailable { status: Option<u16>, message: String },
}

impl RefreshFailure {
    /// Status code that produced this failure, when there was one
    pub fn status(&self) -> Option<u16> {
        match self {
            RefreshFailure::SessionExpired { status } => Some(*status),
            RefreshFailure::CredentialAbsent => Some(449),
            RefreshFailure::CredentialInvalid => Some(498),
            RefreshFailure::CredentialRevoked => Some(499),
            RefreshFailure::DeviceRejected => Some(428),
            RefreshFailure::MalformedCredential => None,
            RefreshFailure::Unavailable { status, .. } => *status,
        }
    }

    pub fn outcome(&self) -> FailureOutcome {
        match self {
            RefreshFailure::SessionExpired { .. } | RefreshFailure::DeviceRejected => {
                FailureOutcome::SessionExpired
            }
            RefreshFailure::CredentialAbsent
            | RefreshFailure::CredentialInvalid
            | RefreshFailure::CredentialRevoked
            | RefreshFailure::MalformedCredential
            | RefreshFailure::Unavailable { .. } => FailureOutcome::SilentAnonymous,
        }
    }

    /// Whether the UI should tell the user their session ended
    pub fn is_user_visible(&self) -> bool {
        self.outcome() == FailureOutcome::SessionExpired
    }
}

/// Error types for authentication
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("Malformed session token")]
    MalformedCredential,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error(transparent)]
    Session(#[from] RefreshFailure),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    /// The refresh failure behind this error, if the session layer gave up
    pub fn refresh_failure(&self) -> Option<&RefreshFailure> {
        match self {
            AuthError::Session(failure) => Some(failure),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_accepts_standard_claim_names() {
        let json = r#"{
            "sub": "u-42",
            "username": "maria",
            "role": "host",
            "email": "maria@example.com",
            "exp": 1900000000
        }"#;
        let identity: Identity = serde_json::from_str(json).unwrap();
        assert_eq!(identity.subject_id, "u-42");
        assert_eq!(identity.username.as_deref(), Some("maria"));
        assert_eq!(identity.role.as_deref(), Some("host"));
        assert_eq!(identity.expiry, Some(1_900_000_000));
    }

    #[test]
    fn test_identity_accepts_camel_case_subject() {
        let json = r#"{"subjectId": "u-7"}"#;
        let identity: Identity = serde_json::from_str(json).unwrap();
        assert_eq!(identity.subject_id, "u-7");
        assert!(identity.expiry.is_none());
    }

    #[test]
    fn test_exactly_one_fatal_status() {
        let fatal: Vec<u16> = [
            RefreshFailure::SessionExpired { status: 419 },
            RefreshFailure::CredentialAbsent,
            RefreshFailure::CredentialInvalid,
            RefreshFailure::CredentialRevoked,
        ]
        .iter()
        .filter(|f| f.is_user_visible())
        .filter_map(|f| f.status())
        .collect();
        assert_eq!(fatal, vec![419]);
    }

    #[test]
    fn test_unavailable_keeps_original_status() {
        let failure = RefreshFailure::Unavailable {
            status: Some(503),
            message: "maintenance".to_string(),
        };
        assert_eq!(failure.status(), Some(503));
        assert_eq!(failure.outcome(), FailureOutcome::SilentAnonymous);
    }

    #[test]
    fn test_auth_error_display() {
        assert_eq!(
            AuthError::NetworkError("timeout".to_string()).to_string(),
            "Network error: timeout"
        );
        assert_eq!(
            AuthError::ApiError {
                status: 500,
                message: "boom".to_string()
            }
            .to_string(),
            "API error 500: boom"
        );
        assert_eq!(
            AuthError::from(RefreshFailure::SessionExpired { status: 419 }).to_string(),
            "Session expired, please sign in again"
        );
    }

    #[test]
    fn test_refresh_failure_is_reachable_from_auth_error() {
        let err = AuthError::from(RefreshFailure::CredentialRevoked);
        assert_eq!(err.refresh_failure(), Some(&RefreshFailure::CredentialRevoked));
        assert!(AuthError::MalformedCredential.refresh_failure().is_none());
    }
}
