//! Session and credential lifecycle for the RentNest client
//!
//! - Bearer token storage across a durable and a volatile tier
//! - Per-installation device identifier
//! - Single-flight token refresh behind the request middleware
//! - LOGIN/LOGOUT propagation between open contexts

pub mod broadcast;
pub mod device;
pub mod http_client;
mod manager;
pub mod middleware;
pub mod refresh;
pub mod state;
pub mod storage;
pub mod token;
pub mod types;

pub use broadcast::{
    Broadcaster, ChannelBus, SessionBus, SessionEventKind, SessionMessage, StorageBus,
};
pub use device::DeviceIdManager;
pub use http_client::{ApiRequest, ApiResponse, HttpTransport, Transport};
pub use manager::{CrossContextListener, SessionManager, SessionManagerBuilder};
pub use middleware::{classify_failure, EndpointClass, FailureKind};
pub use state::{AuthPhase, AuthSnapshot, SessionState};
pub use storage::{FileStore, KeyValueStore, MemoryStore, TokenStore};
pub use types::*;
