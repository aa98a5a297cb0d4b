//! Notifications shown by the agent and the clicks routed back to it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::NotificationDefaults;
use crate::push::PushPayload;
use crate::Result;

/// Unique identifier for a displayed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// The two actions a notification offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationAction {
    #[default]
    Open,
    Dismiss,
}

impl NotificationAction {
    /// Wire identifier.
    pub fn id(&self) -> &'static str {
        match self {
            NotificationAction::Open => "open",
            NotificationAction::Dismiss => "dismiss",
        }
    }

    /// Interpret the action reported by a click. Anything but `"dismiss"` opens.
    pub fn from_click(action: Option<&str>) -> Self {
        match action {
            Some("dismiss") => NotificationAction::Dismiss,
            _ => NotificationAction::Open,
        }
    }
}

impl fmt::Display for NotificationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// An action button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationButton {
    pub action: String,
    pub title: String,
}

/// Data attached to a notification and read back on click.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A notification as requested for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
    pub actions: Vec<NotificationButton>,
}

impl Notification {
    /// Build the notification for a push payload, substituting defaults.
    pub fn from_payload(payload: &PushPayload, defaults: &NotificationDefaults) -> Self {
        let pick = |value: &Option<String>, fallback: &str| {
            value.clone().unwrap_or_else(|| fallback.to_string())
        };

        Self {
            id: NotificationId::new(),
            title: pick(&payload.title, &defaults.default_title),
            body: pick(&payload.body, &defaults.default_body),
            icon: defaults.icon.clone(),
            badge: defaults.badge.clone(),
            vibrate: defaults.vibrate.clone(),
            data: NotificationData {
                url: Some(pick(&payload.url, &defaults.default_url)),
            },
            actions: vec![
                NotificationButton {
                    action: NotificationAction::Open.id().to_string(),
                    title: defaults.open_title.clone(),
                },
                NotificationButton {
                    action: NotificationAction::Dismiss.id().to_string(),
                    title: defaults.dismiss_title.clone(),
                },
            ],
        }
    }
}

// ==================== Clicks ====================

/// A user interaction with a displayed notification.
#[derive(Debug, Clone)]
pub struct NotificationClick {
    pub notification: Notification,
    /// Action id of the button pressed; `None` for a click on the body.
    pub action: Option<String>,
}

impl NotificationClick {
    pub fn new(notification: Notification, action: Option<&str>) -> Self {
        Self {
            notification,
            action: action.map(str::to_string),
        }
    }

    /// Resolve what the click asks for.
    pub fn intent(&self, default_url: &str) -> NotificationIntent {
        NotificationIntent {
            action: NotificationAction::from_click(self.action.as_deref()),
            url: self
                .notification
                .data
                .url
                .clone()
                .unwrap_or_else(|| default_url.to_string()),
        }
    }
}

/// What a click resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationIntent {
    pub action: NotificationAction,
    pub url: String,
}

// ==================== Center ====================

/// The platform notification subsystem.
#[async_trait]
pub trait NotificationCenter: Send + Sync {
    /// Display a notification. Resolves once it is shown.
    async fn show(&self, notification: Notification) -> Result<()>;

    /// Close a notification. Closing one that is no longer displayed is a no-op.
    async fn close(&self, id: NotificationId) -> Result<()>;
}

/// In-memory notification center that records what was shown and closed.
#[derive(Debug, Default)]
pub struct NotificationTray {
    visible: RwLock<Vec<Notification>>,
    history: RwLock<Vec<Notification>>,
}

impl NotificationTray {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications currently displayed.
    pub async fn visible(&self) -> Vec<Notification> {
        self.visible.read().await.clone()
    }

    /// Every notification ever shown, in display order.
    pub async fn history(&self) -> Vec<Notification> {
        self.history.read().await.clone()
    }
}

#[async_trait]
impl NotificationCenter for NotificationTray {
    async fn show(&self, notification: Notification) -> Result<()> {
        debug!(id = ?notification.id, title = %notification.title, "Showing notification");
        self.history.write().await.push(notification.clone());
        self.visible.write().await.push(notification);
        Ok(())
    }

    async fn close(&self, id: NotificationId) -> Result<()> {
        let mut visible = self.visible.write().await;
        let before = visible.len();
        visible.retain(|n| n.id != id);
        if visible.len() == before {
            debug!(id = ?id, "Notification already closed");
        }
        Ok(())
    }
}
