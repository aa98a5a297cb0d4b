//! # AstroYou Service Worker
//!
//! The offline caching and push notification agent behind the AstroYou
//! front-end.
//!
//! ## Features
//!
//! - **Precache**: the manifest (`/`, `/offline.html`) is fetched all-or-nothing on install
//! - **Generations**: activation deletes every cache generation but the current one
//! - **Navigation fallback**: network first, cached offline page when the network rejects
//! - **Push**: payload-driven notifications with `open`/`dismiss` actions
//! - **Notification clicks**: open a window at the URL carried by the notification
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (host, one per origin)
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing (OfflineCacheAgent)
//!     │       ├── waiting    (OfflineCacheAgent)
//!     │       └── active     (OfflineCacheAgent)
//!     │
//!     └── AgentContext (shared by every instance)
//!             ├── CacheStorage ── CacheGeneration ── url → CacheEntry
//!             ├── Network (ResourceLoader in production)
//!             ├── NotificationCenter
//!             └── WindowClients
//! ```

use astroyou_net::NetError;
use thiserror::Error;

pub mod agent;
pub mod cache;
pub mod clients;
pub mod config;
pub mod container;
pub mod notification;
pub mod push;

pub use agent::{
    ActivationReport, AgentContext, AgentState, FetchOutcome, OfflineCacheAgent, ServiceWorkerId,
};
pub use cache::{CacheEntry, CacheGeneration, CacheStorage};
pub use clients::{Client, ClientId, Clients, WindowClients};
pub use config::{AgentConfig, NotificationDefaults, CACHE_NAME, OFFLINE_URL, PRECACHE_ASSETS};
pub use container::{ServiceWorkerContainer, ServiceWorkerEvent, ServiceWorkerRegistration};
pub use notification::{
    Notification, NotificationAction, NotificationButton, NotificationCenter, NotificationClick,
    NotificationData, NotificationId, NotificationIntent, NotificationTray,
};
pub use push::{PushMessage, PushPayload};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    /// A precache manifest entry could not be retrieved.
    #[error("Install failed fetching {url}: {reason}")]
    InstallFetchFailure { url: String, reason: String },

    /// The network rejected and the offline document is not cached.
    #[error("Offline fallback missing from cache: {0}")]
    OfflineFallbackMissing(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Notification error: {0}")]
    NotificationError(String),

    #[error("Client error: {0}")]
    ClientError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ServiceWorkerError {
    /// Whether a later registration attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceWorkerError::InstallFetchFailure { .. } | ServiceWorkerError::NetworkError(_)
        )
    }
}

impl From<NetError> for ServiceWorkerError {
    fn from(err: NetError) -> Self {
        ServiceWorkerError::NetworkError(err.to_string())
    }
}

/// Result type alias for service worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;
