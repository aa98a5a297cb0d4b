//! Window clients: the pages an agent can control and open.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::agent::ServiceWorkerId;
use crate::Result;

/// Unique identifier for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A top-level window of the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    pub focused: bool,
    /// Agent instance serving this window's requests.
    pub controller: Option<ServiceWorkerId>,
}

/// Window operations the agent needs from its host.
#[async_trait]
pub trait WindowClients: Send + Sync {
    /// Open a new window at `url`. Resolves once the window exists.
    async fn open_window(&self, url: Url) -> Result<Client>;

    /// Make `controller` the controller of every open window. Returns how
    /// many windows changed controller.
    async fn claim(&self, controller: ServiceWorkerId) -> Result<usize>;
}

/// In-memory registry of the origin's windows.
#[derive(Debug)]
pub struct Clients {
    origin: Url,
    windows: RwLock<HashMap<ClientId, Client>>,
}

impl Clients {
    /// Only windows of `origin` are tracked and claimed.
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Track a page loaded by the user, not yet controlled by any agent.
    pub async fn attach(&self, url: Url) -> Client {
        let client = Client {
            id: ClientId::new(),
            url,
            focused: false,
            controller: None,
        };
        self.windows.write().await.insert(client.id, client.clone());
        client
    }

    pub async fn get(&self, id: ClientId) -> Option<Client> {
        self.windows.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: ClientId) -> Option<Client> {
        self.windows.write().await.remove(&id)
    }

    /// All windows, optionally only those controlled by `controller`.
    pub async fn match_all(&self, controller: Option<ServiceWorkerId>) -> Vec<Client> {
        self.windows
            .read()
            .await
            .values()
            .filter(|c| controller.is_none() || c.controller == controller)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl WindowClients for Clients {
    async fn open_window(&self, url: Url) -> Result<Client> {
        if url.origin() != self.origin.origin() {
            // Opened, but not one of the origin's clients.
            let client = Client {
                id: ClientId::new(),
                url,
                focused: true,
                controller: None,
            };
            info!(client = ?client.id, url = %client.url, "Opened cross-origin window");
            return Ok(client);
        }

        let mut windows = self.windows.write().await;
        for window in windows.values_mut() {
            window.focused = false;
        }
        let client = Client {
            id: ClientId::new(),
            url,
            focused: true,
            controller: None,
        };
        windows.insert(client.id, client.clone());

        info!(client = ?client.id, url = %client.url, "Opened window");
        Ok(client)
    }

    async fn claim(&self, controller: ServiceWorkerId) -> Result<usize> {
        let mut windows = self.windows.write().await;
        let mut claimed = 0;
        for window in windows.values_mut() {
            if window.controller != Some(controller) {
                window.controller = Some(controller);
                claimed += 1;
            }
        }
        debug!(?controller, claimed, "Claimed clients");
        Ok(claimed)
    }
}
