//! RentNest Core Library
//!
//! Client-side session management for the RentNest rental marketplace:
//! token storage, refresh, request middleware and cross-context sync.
//! Used by the command-line client and embeddable in other front ends.

pub mod auth;
pub mod settings;

// Re-export commonly used items
pub use auth::{AuthError, SessionManager};
pub use settings::{load_config, save_config, SessionConfig};
