//! Two-tier credential storage
//!
//! The durable tier survives restarts (a JSON file on disk for the desktop
//! client); the volatile tier lives only as long as the session. Exactly one
//! tier holds the live token at any time, chosen by the "remember me"
//! preference recorded at login.

use super::token;
use super::types::{AuthError, Identity};
use chrono::Duration;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const TOKEN_KEY: &str = "rentnest.auth_token";
pub const REMEMBER_KEY: &str = "rentnest.remember_me";
pub const DEVICE_ID_KEY: &str = "rentnest.device_id";
pub const SESSION_EVENT_KEY: &str = "rentnest.session_event";

/// String key/value storage with browser-storage semantics
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), AuthError>;
    fn remove(&self, key: &str) -> Result<(), AuthError>;
    /// Remove every key
    fn clear(&self) -> Result<(), AuthError>;
}

/// In-memory store. Used as the volatile tier, and as a shared durable tier
/// when several contexts live in one process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), AuthError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), AuthError> {
        self.entries.lock().clear();
        Ok(())
    }
}

/// Durable store backed by a single JSON object file.
///
/// Every access goes to disk, so separate processes sharing the file see each
/// other's writes (last writer wins). A file that cannot be parsed is
/// discarded and the store starts empty.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuthError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AuthError::StorageError(format!("Failed to create data directory: {}", e))
            })?;
        }

        info!(
            "FileStore opened at {} ({} keys)",
            path.display(),
            Self::load(&path).len()
        );

        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Default location: `<data dir>/RentNest/<file_name>`
    pub fn default_path(file_name: &str) -> Option<PathBuf> {
        dirs::data_local_dir().map(|d| d.join("RentNest").join(file_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> BTreeMap<String, String> {
        if !path.exists() {
            debug!("Storage file {} does not exist yet", path.display());
            return BTreeMap::new();
        }

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                error!("Failed to read storage file: {}", e);
                return BTreeMap::new();
            }
        };

        match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Storage file is corrupt ({}), starting empty", e);
                let _ = std::fs::remove_file(path);
                BTreeMap::new()
            }
        }
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), AuthError> {
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| AuthError::StorageError(format!("Failed to serialize storage: {}", e)))?;
        std::fs::write(&self.path, json).map_err(|e| {
            error!("Failed to write storage file: {}", e);
            AuthError::StorageError(format!("Failed to write storage file: {}", e))
        })
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock();
        Self::load(&self.path).remove(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
        let _guard = self.lock.lock();
        let mut entries = Self::load(&self.path);
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), AuthError> {
        let _guard = self.lock.lock();
        let mut entries = Self::load(&self.path);
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), AuthError> {
        let _guard = self.lock.lock();
        self.persist(&BTreeMap::new())
    }
}

/// Bearer token persistence across the durable and volatile tiers
#[derive(Clone)]
pub struct TokenStore {
    durable: Arc<dyn KeyValueStore>,
    volatile: Arc<dyn KeyValueStore>,
    leeway: Duration,
}

impl TokenStore {
    pub fn new(
        durable: Arc<dyn KeyValueStore>,
        volatile: Arc<dyn KeyValueStore>,
        leeway: Duration,
    ) -> Self {
        Self {
            durable,
            volatile,
            leeway,
        }
    }

    /// Live token, durable tier first. A stored value that fails the shape
    /// check is purged from both tiers and reported as absent.
    pub fn get(&self) -> Option<String> {
        let stored = self
            .durable
            .get(TOKEN_KEY)
            .or_else(|| self.volatile.get(TOKEN_KEY))?;

        if token::is_well_formed(&stored) {
            return Some(stored);
        }

        warn!("Stored token failed the shape check, purging");
        if let Err(e) = self.remove() {
            warn!("Failed to purge malformed token: {}", e);
        }
        None
    }

    /// Store `token` in the tier selected by `durable` and clear the other.
    /// Empty or malformed input is rejected before anything is written.
    pub fn set(&self, token: &str, durable: bool) -> Result<(), AuthError> {
        if !token::is_well_formed(token) {
            error!("Refusing to store malformed token");
            return Err(AuthError::MalformedCredential);
        }

        let (target, other) = if durable {
            (&self.durable, &self.volatile)
        } else {
            (&self.volatile, &self.durable)
        };

        target.set(TOKEN_KEY, token)?;
        other.remove(TOKEN_KEY)?;
        self.durable
            .set(REMEMBER_KEY, if durable { "true" } else { "false" })?;

        debug!(
            "Stored token {} in {} tier",
            token::redact(token),
            if durable { "durable" } else { "volatile" }
        );
        Ok(())
    }

    /// Purge the token from both tiers and forget the preference
    pub fn remove(&self) -> Result<(), AuthError> {
        let durable = self.durable.remove(TOKEN_KEY);
        let volatile = self.volatile.remove(TOKEN_KEY);
        let preference = self.durable.remove(REMEMBER_KEY);
        durable.and(volatile).and(preference)
    }

    /// Expiry check against the stored token; absent or invalid is expired
    pub fn is_expired(&self) -> bool {
        token::is_expired(self.get().as_deref(), self.leeway)
    }

    /// Preference recorded by the last `set`. Without a record, a token
    /// sitting in the durable tier implies durable.
    pub fn durable_preference(&self) -> bool {
        match self.durable.get(REMEMBER_KEY).as_deref() {
            Some("true") => true,
            Some(_) => false,
            None => self.durable.get(TOKEN_KEY).is_some(),
        }
    }

    pub fn decoded_identity(&self) -> Option<Identity> {
        self.get().as_deref().and_then(token::decode_identity)
    }

    pub(crate) fn durable_tier(&self) -> &Arc<dyn KeyValueStore> {
        &self.durable
    }

    pub(crate) fn volatile_tier(&self) -> &Arc<dyn KeyValueStore> {
        &self.volatile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::encode_for_test;
    use chrono::Utc;
    use serde_json::json;

    fn valid_token() -> String {
        encode_for_test(&json!({"sub": "u-9", "exp": Utc::now().timestamp() + 3600}))
    }

    fn stores() -> (Arc<MemoryStore>, Arc<MemoryStore>, TokenStore) {
        let durable = Arc::new(MemoryStore::new());
        let volatile = Arc::new(MemoryStore::new());
        let tokens = TokenStore::new(durable.clone(), volatile.clone(), Duration::zero());
        (durable, volatile, tokens)
    }

    #[test]
    fn test_durable_round_trip_leaves_volatile_empty() {
        let (durable, volatile, tokens) = stores();
        let token = valid_token();

        tokens.set(&token, true).unwrap();

        assert_eq!(tokens.get(), Some(token.clone()));
        assert_eq!(durable.get(TOKEN_KEY), Some(token));
        assert!(volatile.get(TOKEN_KEY).is_none());
        assert!(tokens.durable_preference());
    }

    #[test]
    fn test_switching_tier_clears_the_other() {
        let (durable, volatile, tokens) = stores();
        let token = valid_token();

        tokens.set(&token, true).unwrap();
        tokens.set(&token, false).unwrap();

        assert!(durable.get(TOKEN_KEY).is_none());
        assert_eq!(volatile.get(TOKEN_KEY), Some(token));
        assert!(!tokens.durable_preference());
    }

    #[test]
    fn test_malformed_set_is_rejected_without_partial_write() {
        let (durable, volatile, tokens) = stores();

        let result = tokens.set("not-a-token", true);
        assert!(matches!(result, Err(AuthError::MalformedCredential)));
        assert!(tokens.set("", false).is_err());

        assert!(tokens.get().is_none());
        assert!(durable.is_empty());
        assert!(volatile.is_empty());
    }

    #[test]
    fn test_malformed_value_is_purged_on_read() {
        let (durable, volatile, tokens) = stores();
        durable.set(TOKEN_KEY, "garbage").unwrap();
        durable.set(REMEMBER_KEY, "true").unwrap();
        volatile.set(TOKEN_KEY, &valid_token()).unwrap();

        assert!(tokens.get().is_none());
        assert!(durable.get(TOKEN_KEY).is_none());
        assert!(durable.get(REMEMBER_KEY).is_none());
        assert!(volatile.get(TOKEN_KEY).is_none());
    }

    #[test]
    fn test_remove_purges_both_tiers_and_preference() {
        let (durable, volatile, tokens) = stores();
        tokens.set(&valid_token(), true).unwrap();
        volatile.set(TOKEN_KEY, &valid_token()).unwrap();

        tokens.remove().unwrap();

        assert!(durable.is_empty());
        assert!(volatile.is_empty());
    }

    #[test]
    fn test_is_expired_is_idempotent() {
        let (_, _, tokens) = stores();
        assert!(tokens.is_expired());
        assert!(tokens.is_expired());

        tokens.set(&valid_token(), false).unwrap();
        let first = tokens.is_expired();
        let second = tokens.is_expired();
        assert!(!first);
        assert_eq!(first, second);
    }

    #[test]
    fn test_decoded_identity() {
        let (_, _, tokens) = stores();
        assert!(tokens.decoded_identity().is_none());
        tokens.set(&valid_token(), true).unwrap();
        assert_eq!(tokens.decoded_identity().unwrap().subject_id, "u-9");
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("storage.json");

        let store = FileStore::open(&path).unwrap();
        store.set(DEVICE_ID_KEY, "abc").unwrap();
        store.set(TOKEN_KEY, "tok").unwrap();
        store.remove(TOKEN_KEY).unwrap();
        drop(store);

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get(DEVICE_ID_KEY).as_deref(), Some("abc"));
        assert!(reopened.get(TOKEN_KEY).is_none());
    }

    #[test]
    fn test_file_store_discards_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = FileStore::open(&path).unwrap();
        assert!(!path.exists());
        assert!(store.get(TOKEN_KEY).is_none());

        store.set(TOKEN_KEY, "x").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_file_store_sees_writes_from_another_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        let first = FileStore::open(&path).unwrap();
        let second = FileStore::open(&path).unwrap();

        first.set(SESSION_EVENT_KEY, "hello").unwrap();
        assert_eq!(second.get(SESSION_EVENT_KEY).as_deref(), Some("hello"));
    }

    #[test]
    fn test_file_store_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("storage.json")).unwrap();
        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();
        store.clear().unwrap();
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_none());
    }
}
