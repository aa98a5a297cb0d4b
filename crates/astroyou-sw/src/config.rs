//! Agent configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Result, ServiceWorkerError};

/// Name of the current cache generation.
pub const CACHE_NAME: &str = "astroyou-v1";

/// Document served to navigations while offline.
pub const OFFLINE_URL: &str = "/offline.html";

/// Assets stored on install.
pub const PRECACHE_ASSETS: &[&str] = &["/", OFFLINE_URL];

const DEFAULT_ORIGIN: &str = "https://astroyou.app/";
const DEFAULT_ICON: &str = "/icons/icon-192.png";

/// Configuration of one deployed agent version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Origin the agent is registered for; manifest paths resolve against it.
    pub origin: String,

    /// Version constant naming the cache generation.
    pub cache_name: String,

    /// Offline fallback document path.
    pub offline_url: String,

    /// Paths fetched and stored on install.
    pub precache: Vec<String>,

    /// Activate right after install instead of waiting for old pages to close.
    pub skip_waiting: bool,

    /// Take control of already open pages on activation.
    pub claim_clients: bool,

    /// Notification text and presentation.
    pub notification: NotificationDefaults,
}

/// Fallbacks and presentation for push notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
    pub default_title: String,
    pub default_body: String,
    pub default_url: String,
    pub icon: String,
    pub badge: String,
    /// Vibration pattern in milliseconds.
    pub vibrate: Vec<u32>,
    pub open_title: String,
    pub dismiss_title: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            cache_name: CACHE_NAME.to_string(),
            offline_url: OFFLINE_URL.to_string(),
            precache: PRECACHE_ASSETS.iter().map(|s| s.to_string()).collect(),
            skip_waiting: true,
            claim_clients: true,
            notification: NotificationDefaults::default(),
        }
    }
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            default_title: "✦ AstroYou".to_string(),
            default_body: "Your oracle has an update".to_string(),
            default_url: "/".to_string(),
            icon: DEFAULT_ICON.to_string(),
            badge: DEFAULT_ICON.to_string(),
            vibrate: vec![100, 50, 100],
            open_title: "Open Oracle".to_string(),
            dismiss_title: "Dismiss".to_string(),
        }
    }
}

impl AgentConfig {
    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ServiceWorkerError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ServiceWorkerError::ConfigError(format!("{}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Sets the origin.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Sets the cache generation name.
    #[must_use]
    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    /// Replaces the precache manifest.
    #[must_use]
    pub fn with_precache<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Sets whether the waiting phase is skipped.
    #[must_use]
    pub fn with_skip_waiting(mut self, skip: bool) -> Self {
        self.skip_waiting = skip;
        self
    }

    /// Parsed origin.
    pub fn origin_url(&self) -> Result<Url> {
        Url::parse(&self.origin)
            .map_err(|e| ServiceWorkerError::ConfigError(format!("origin {}: {}", self.origin, e)))
    }

    /// Resolve a manifest or notification path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        self.origin_url()?
            .join(path)
            .map_err(|e| ServiceWorkerError::ConfigError(format!("path {path}: {e}")))
    }

    /// Reject configurations the agent cannot run with.
    ///
    /// The manifest must contain the offline document, otherwise the only
    /// offline path ends in a cache miss.
    pub fn validate(&self) -> Result<()> {
        if self.cache_name.trim().is_empty() {
            return Err(ServiceWorkerError::ConfigError(
                "cache_name must not be empty".to_string(),
            ));
        }
        self.origin_url()?;
        let offline = self.resolve(&self.offline_url)?;
        let mut listed = false;
        for path in &self.precache {
            if self.resolve(path)? == offline {
                listed = true;
            }
        }
        if !listed {
            return Err(ServiceWorkerError::ConfigError(format!(
                "precache manifest does not include the offline document {}",
                self.offline_url
            )));
        }
        Ok(())
    }
}
