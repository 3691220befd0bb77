//! Per-installation device identifier
//!
//! Lives in the durable tier under its own key and outlives login and
//! logout. Only `clear()` (an explicit "forget this device") removes it.

use super::storage::{KeyValueStore, DEVICE_ID_KEY};
use log::{info, warn};
use std::sync::Arc;
use uuid::{Uuid, Variant};

pub fn is_valid_device_id(value: &str) -> bool {
    match Uuid::parse_str(value) {
        Ok(id) => id.get_version_num() == 4 && id.get_variant() == Variant::RFC4122,
        Err(_) => false,
    }
}

#[derive(Clone)]
pub struct DeviceIdManager {
    store: Arc<dyn KeyValueStore>,
}

impl DeviceIdManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Current identifier, minting a new one if it is missing or malformed
    pub fn get(&self) -> String {
        match self.store.get(DEVICE_ID_KEY) {
            Some(existing) if is_valid_device_id(&existing) => existing,
            Some(_) => {
                warn!("Stored device id is malformed, generating a new one");
                self.mint()
            }
            None => {
                info!("No device id yet, generating one");
                self.mint()
            }
        }
    }

    /// Replace the identifier after the server rejected it
    pub fn regenerate(&self) -> String {
        let id = self.mint();
        info!("Device id regenerated: {}", id);
        id
    }

    pub fn clear(&self) {
        if let Err(e) = self.store.remove(DEVICE_ID_KEY) {
            warn!("Failed to clear device id: {}", e);
        }
    }

    /// Stored value, without minting
    pub(crate) fn peek(&self) -> Option<String> {
        self.store.get(DEVICE_ID_KEY)
    }

    /// Write back a value read before a storage wipe
    pub(crate) fn restore(&self, id: &str) {
        if !is_valid_device_id(id) {
            return;
        }
        if let Err(e) = self.store.set(DEVICE_ID_KEY, id) {
            warn!("Failed to restore device id: {}", e);
        }
    }

    fn mint(&self) -> String {
        let id = Uuid::new_v4().to_string();
        // An unpersisted id is still usable for this run
        if let Err(e) = self.store.set(DEVICE_ID_KEY, &id) {
            warn!("Failed to persist device id: {}", e);
        }
        id
    }
}
