//! The offline cache agent.
//!
//! One instance exists per deployed version. The host drives it through
//! [`install`](OfflineCacheAgent::install) and
//! [`activate`](OfflineCacheAgent::activate), then dispatches fetch, push and
//! notification click events to it until a newer version supersedes it.
//!
//! Every handler awaits all of its work before returning. The instance keeps
//! no state between events apart from its lifecycle state; cache storage is
//! the only durable state.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use astroyou_net::{Method, Network, Request, Response};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStorage};
use crate::clients::{Client, WindowClients};
use crate::config::AgentConfig;
use crate::notification::{Notification, NotificationAction, NotificationCenter, NotificationClick};
use crate::push::{PushMessage, PushPayload};
use crate::{Result, ServiceWorkerError};

// ==================== Types ====================

/// Unique identifier for an agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle state of an agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AgentState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Precaching the manifest.
    Installing,
    /// Installed, waiting to take over.
    Installed,
    /// Evicting stale generations and claiming clients.
    Activating,
    /// Serving events.
    Activated,
    /// Install failed or superseded by a newer version.
    Redundant,
}

/// Collaborators shared by every agent instance of an origin.
#[derive(Clone)]
pub struct AgentContext {
    pub caches: Arc<RwLock<CacheStorage>>,
    pub network: Arc<dyn Network>,
    pub notifications: Arc<dyn NotificationCenter>,
    pub clients: Arc<dyn WindowClients>,
}

impl AgentContext {
    /// Context with fresh, empty cache storage.
    pub fn new(
        network: Arc<dyn Network>,
        notifications: Arc<dyn NotificationCenter>,
        clients: Arc<dyn WindowClients>,
    ) -> Self {
        Self {
            caches: Arc::new(RwLock::new(CacheStorage::new())),
            network,
            notifications,
            clients,
        }
    }
}

/// How a fetch event was answered.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Navigation answered by the network, whatever the status.
    Network(Response),
    /// Navigation answered from the current generation's offline document.
    OfflineFallback(Response),
    /// Not intercepted; the host performs the request itself.
    Passthrough(Request),
}

impl FetchOutcome {
    /// The response, if the agent produced one.
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchOutcome::Network(r) | FetchOutcome::OfflineFallback(r) => Some(r),
            FetchOutcome::Passthrough(_) => None,
        }
    }

    pub fn is_offline_fallback(&self) -> bool {
        matches!(self, FetchOutcome::OfflineFallback(_))
    }
}

/// Result of a completed activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    /// Stale generations deleted.
    pub deleted: Vec<String>,
    /// Windows that switched to this instance.
    pub claimed: usize,
}

// ==================== Agent ====================

/// An instance of the offline cache agent for one deployed version.
pub struct OfflineCacheAgent {
    id: ServiceWorkerId,
    config: AgentConfig,
    origin: Url,
    offline_url: Url,
    context: AgentContext,
    state: watch::Sender<AgentState>,
    in_flight: AtomicUsize,
}

impl std::fmt::Debug for OfflineCacheAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineCacheAgent")
            .field("id", &self.id)
            .field("cache_name", &self.config.cache_name)
            .field("state", &self.state())
            .finish()
    }
}

impl OfflineCacheAgent {
    /// Create an instance. Fails on an invalid configuration.
    pub fn new(config: AgentConfig, context: AgentContext) -> Result<Self> {
        config.validate()?;
        let origin = config.origin_url()?;
        let offline_url = config.resolve(&config.offline_url)?;
        let (state, _) = watch::channel(AgentState::Parsed);

        Ok(Self {
            id: ServiceWorkerId::next(),
            config,
            origin,
            offline_url,
            context,
            state,
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Name of the generation this version owns.
    pub fn cache_name(&self) -> &str {
        &self.config.cache_name
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Navigations currently being handled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Active and idle, as opposed to handling a navigation.
    pub fn is_idle(&self) -> bool {
        self.state() == AgentState::Activated && self.in_flight() == 0
    }

    /// Mark the instance as superseded. Terminal.
    pub fn mark_redundant(&self) {
        self.set_state(AgentState::Redundant);
    }

    /// Move to `next`. Redundant is terminal: returns false once there.
    fn set_state(&self, next: AgentState) -> bool {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if *state == AgentState::Redundant {
                return false;
            }
            previous = Some(*state);
            let changed = *state != next;
            *state = next;
            changed
        });

        match previous {
            Some(previous) => {
                if previous != next {
                    debug!(worker = ?self.id, from = ?previous, to = ?next, "State change");
                }
                true
            }
            None => false,
        }
    }

    fn expect_state(&self, expected: AgentState, operation: &str) -> Result<()> {
        let current = self.state();
        if current != expected {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot {operation} in state {current:?}"
            )));
        }
        Ok(())
    }

    // ==================== Install ====================

    /// Precache the manifest into this version's generation.
    ///
    /// All manifest entries are fetched before anything is written, so a
    /// failure leaves no partial generation behind. On failure the instance
    /// becomes redundant and the error is returned to the host. An instance
    /// superseded while its fetches were in flight stores nothing.
    pub async fn install(&self) -> Result<()> {
        self.expect_state(AgentState::Parsed, "install")?;
        self.set_state(AgentState::Installing);

        match self.precache().await {
            Ok(stored) => {
                info!(worker = ?self.id, cache = %self.config.cache_name, stored, "Installed");
                Ok(())
            }
            Err(e) => {
                warn!(worker = ?self.id, cache = %self.config.cache_name, error = %e, "Install failed");
                self.set_state(AgentState::Redundant);
                Err(e)
            }
        }
    }

    async fn precache(&self) -> Result<usize> {
        let urls = self
            .config
            .precache
            .iter()
            .map(|path| self.config.resolve(path))
            .collect::<Result<Vec<_>>>()?;

        let fetches = urls.into_iter().map(|url| self.fetch_manifest_entry(url));
        let entries = try_join_all(fetches).await?;

        let mut caches = self.context.caches.write().await;
        if !self.set_state(AgentState::Installed) {
            return Err(ServiceWorkerError::StateError(format!(
                "{:?} was superseded during install",
                self.id
            )));
        }
        let generation = caches.open(&self.config.cache_name);
        for entry in &entries {
            generation.put(entry.clone());
        }
        Ok(entries.len())
    }

    async fn fetch_manifest_entry(&self, url: Url) -> Result<CacheEntry> {
        let failure = |reason: String| ServiceWorkerError::InstallFetchFailure {
            url: url.to_string(),
            reason,
        };

        let response = self
            .context
            .network
            .fetch(Request::get(url.clone()))
            .await
            .map_err(|e| failure(e.to_string()))?;

        if !response.ok() {
            return Err(failure(format!("status {}", response.status)));
        }

        trace!(url = %url, bytes = response.body().len(), "Fetched manifest entry");
        let mut entry = CacheEntry::from_response(&Method::GET, &response);
        // Key by the requested URL even if the response was redirected.
        entry.url = url;
        Ok(entry)
    }

    // ==================== Activate ====================

    /// Claim open windows, then delete every generation except the current one.
    ///
    /// A failed claim leaves every generation in place, so the version still
    /// in control keeps its offline document.
    pub async fn activate(&self) -> Result<ActivationReport> {
        self.expect_state(AgentState::Installed, "activate")?;
        self.set_state(AgentState::Activating);

        let claimed = if self.config.claim_clients {
            match self.context.clients.claim(self.id).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    self.set_state(AgentState::Redundant);
                    return Err(e);
                }
            }
        } else {
            0
        };

        let deleted = {
            let mut caches = self.context.caches.write().await;
            let stale: Vec<String> = caches
                .keys()
                .into_iter()
                .filter(|name| name != &self.config.cache_name)
                .collect();
            for name in &stale {
                caches.delete(name);
            }
            stale
        };

        info!(
            worker = ?self.id,
            cache = %self.config.cache_name,
            deleted = ?deleted,
            claimed,
            "Activated"
        );
        self.set_state(AgentState::Activated);
        Ok(ActivationReport { deleted, claimed })
    }

    // ==================== Fetch ====================

    /// Handle a fetch event.
    ///
    /// Navigations go to the network first. Any response the network
    /// produces is returned as is, error statuses included. If the network
    /// rejects, the offline document from the current generation is served.
    /// Other requests are returned untouched for the host to perform.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome> {
        self.expect_state(AgentState::Activated, "handle fetch")?;

        if !request.is_navigation() {
            trace!(url = %request.url, "Passing through non-navigation request");
            return Ok(FetchOutcome::Passthrough(request));
        }

        let _guard = InFlight::enter(&self.in_flight);
        let url = request.url.clone();
        match self.context.network.fetch(request).await {
            Ok(response) => {
                trace!(url = %url, status = %response.status, "Navigation served from network");
                Ok(FetchOutcome::Network(response))
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Navigation failed, serving offline document");
                self.offline_document().await.map(FetchOutcome::OfflineFallback)
            }
        }
    }

    async fn offline_document(&self) -> Result<Response> {
        let caches = self.context.caches.read().await;
        caches
            .match_in(&self.config.cache_name, &self.offline_url)
            .map(CacheEntry::to_response)
            .ok_or_else(|| {
                warn!(cache = %self.config.cache_name, url = %self.offline_url, "Offline document missing");
                ServiceWorkerError::OfflineFallbackMissing(self.offline_url.to_string())
            })
    }

    // ==================== Push ====================

    /// Display the notification for a push message. Resolves once shown.
    pub async fn handle_push(&self, message: PushMessage) -> Result<Notification> {
        self.expect_state(AgentState::Activated, "handle push")?;

        let payload = PushPayload::parse(message.data());
        let notification = Notification::from_payload(&payload, &self.config.notification);
        self.context.notifications.show(notification.clone()).await?;

        info!(notification = ?notification.id, title = %notification.title, "Push notification shown");
        Ok(notification)
    }

    /// Handle a click on a displayed notification.
    ///
    /// The notification is always closed. A dismiss ends there; anything
    /// else opens a window at the notification's URL and resolves with it.
    pub async fn handle_notification_click(&self, click: NotificationClick) -> Result<Option<Client>> {
        self.expect_state(AgentState::Activated, "handle notification click")?;

        self.context.notifications.close(click.notification.id).await?;

        let intent = click.intent(&self.config.notification.default_url);
        match intent.action {
            NotificationAction::Dismiss => {
                debug!(notification = ?click.notification.id, "Notification dismissed");
                Ok(None)
            }
            NotificationAction::Open => {
                let url = self.config.resolve(&intent.url)?;
                let client = self.context.clients.open_window(url).await?;
                Ok(Some(client))
            }
        }
    }
}

/// Counts a navigation as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::Clients;
    use crate::notification::NotificationTray;
    use astroyou_net::{NetError, StatusCode};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    /// Serves `body of <path>` for every path.
    struct StaticSite {
        offline: AtomicBool,
        fetches: AtomicUsize,
        delay_ms: AtomicU64,
    }

    impl StaticSite {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                offline: AtomicBool::new(false),
                fetches: AtomicUsize::new(0),
                delay_ms: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl Network for StaticSite {
        async fn fetch(&self, request: Request) -> std::result::Result<Response, NetError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.offline.load(Ordering::SeqCst) {
                return Err(NetError::RequestFailed("offline".into()));
            }
            let body = format!("body of {}", request.url.path());
            Ok(Response::new(request.url, StatusCode::OK, body))
        }
    }

    fn setup() -> (Arc<StaticSite>, AgentContext, Arc<NotificationTray>) {
        let site = StaticSite::new();
        let tray = Arc::new(NotificationTray::new());
        let clients = Arc::new(Clients::new(Url::parse("https://astroyou.app/").unwrap()));
        let context = AgentContext::new(site.clone(), tray.clone(), clients);
        (site, context, tray)
    }

    async fn active_agent(context: &AgentContext) -> OfflineCacheAgent {
        let agent = OfflineCacheAgent::new(AgentConfig::default(), context.clone()).unwrap();
        agent.install().await.unwrap();
        agent.activate().await.unwrap();
        agent
    }

    #[tokio::test]
    async fn test_install_stores_manifest() {
        let (_, context, _) = setup();
        let agent = OfflineCacheAgent::new(AgentConfig::default(), context.clone()).unwrap();
        assert_eq!(agent.state(), AgentState::Parsed);

        agent.install().await.unwrap();
        assert_eq!(agent.state(), AgentState::Installed);

        let caches = context.caches.read().await;
        let generation = caches.get("astroyou-v1").unwrap();
        assert_eq!(
            generation.keys(),
            vec!["https://astroyou.app/", "https://astroyou.app/offline.html"]
        );
    }

    #[tokio::test]
    async fn test_install_failure_creates_no_generation() {
        let (site, context, _) = setup();
        site.offline.store(true, Ordering::SeqCst);

        let agent = OfflineCacheAgent::new(AgentConfig::default(), context.clone()).unwrap();
        let err = agent.install().await.unwrap_err();

        assert!(matches!(err, ServiceWorkerError::InstallFetchFailure { .. }));
        assert_eq!(agent.state(), AgentState::Redundant);
        assert!(!context.caches.read().await.has("astroyou-v1"));
    }

    #[tokio::test]
    async fn test_activate_requires_install() {
        let (_, context, _) = setup();
        let agent = OfflineCacheAgent::new(AgentConfig::default(), context).unwrap();
        assert!(matches!(
            agent.activate().await,
            Err(ServiceWorkerError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_activate_deletes_stale_generations() {
        let (_, context, _) = setup();
        context.caches.write().await.open("astroyou-v0");
        context.caches.write().await.open("other-app");

        let agent = OfflineCacheAgent::new(AgentConfig::default(), context.clone()).unwrap();
        agent.install().await.unwrap();
        let report = agent.activate().await.unwrap();

        assert_eq!(report.deleted, vec!["astroyou-v0", "other-app"]);
        assert_eq!(context.caches.read().await.keys(), vec!["astroyou-v1"]);
        assert!(agent.is_idle());
    }

    #[tokio::test]
    async fn test_superseded_during_install_stores_nothing() {
        let (site, context, _) = setup();
        site.delay_ms.store(50, Ordering::SeqCst);

        let agent = Arc::new(OfflineCacheAgent::new(AgentConfig::default(), context.clone()).unwrap());
        let installing = Arc::clone(&agent);
        let install = tokio::spawn(async move { installing.install().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        agent.mark_redundant();

        let err = install.await.unwrap().unwrap_err();
        assert!(matches!(err, ServiceWorkerError::StateError(_)));
        assert_eq!(agent.state(), AgentState::Redundant);
        assert!(!context.caches.read().await.has("astroyou-v1"));
    }

    #[tokio::test]
    async fn test_redundant_is_terminal() {
        let (_, context, _) = setup();
        let agent = OfflineCacheAgent::new(AgentConfig::default(), context).unwrap();
        agent.mark_redundant();

        assert!(!agent.set_state(AgentState::Installed));
        assert!(agent.install().await.is_err());
        assert_eq!(agent.state(), AgentState::Redundant);
    }

    /// A window host whose claim always fails.
    struct StuckWindows;

    #[async_trait]
    impl WindowClients for StuckWindows {
        async fn open_window(&self, url: Url) -> Result<Client> {
            Err(ServiceWorkerError::ClientError(format!("cannot open {url}")))
        }

        async fn claim(&self, _controller: ServiceWorkerId) -> Result<usize> {
            Err(ServiceWorkerError::ClientError("claim refused".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_claim_keeps_old_generations() {
        let site = StaticSite::new();
        let context = AgentContext::new(site, Arc::new(NotificationTray::new()), Arc::new(StuckWindows));
        context.caches.write().await.open("astroyou-v0");

        let agent = OfflineCacheAgent::new(AgentConfig::default(), context.clone()).unwrap();
        agent.install().await.unwrap();
        let err = agent.activate().await.unwrap_err();

        assert!(matches!(err, ServiceWorkerError::ClientError(_)));
        assert_eq!(agent.state(), AgentState::Redundant);
        assert_eq!(
            context.caches.read().await.keys(),
            vec!["astroyou-v0", "astroyou-v1"]
        );
    }

    #[tokio::test]
    async fn test_events_rejected_before_activation() {
        let (_, context, _) = setup();
        let agent = OfflineCacheAgent::new(AgentConfig::default(), context).unwrap();
        let request = Request::navigate(Url::parse("https://astroyou.app/").unwrap());
        assert!(agent.handle_fetch(request).await.is_err());
        assert!(agent.handle_push(PushMessage::empty()).await.is_err());
    }

    #[tokio::test]
    async fn test_navigation_online() {
        let (_, context, _) = setup();
        let agent = active_agent(&context).await;

        let outcome = agent
            .handle_fetch(Request::navigate(Url::parse("https://astroyou.app/es").unwrap()))
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Network(_)));
        assert_eq!(outcome.response().unwrap().text().unwrap(), "body of /es");
    }

    #[tokio::test]
    async fn test_navigation_offline_serves_fallback() {
        let (site, context, _) = setup();
        let agent = active_agent(&context).await;
        site.offline.store(true, Ordering::SeqCst);

        let outcome = agent
            .handle_fetch(Request::navigate(Url::parse("https://astroyou.app/careers").unwrap()))
            .await
            .unwrap();
        assert!(outcome.is_offline_fallback());
        assert_eq!(outcome.response().unwrap().text().unwrap(), "body of /offline.html");
        assert_eq!(agent.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_subresource_passthrough() {
        let (site, context, _) = setup();
        let agent = active_agent(&context).await;
        let before = site.fetches.load(Ordering::SeqCst);

        let request = Request::get(Url::parse("https://astroyou.app/icons/icon-192.png").unwrap());
        let outcome = agent.handle_fetch(request).await.unwrap();

        assert!(matches!(outcome, FetchOutcome::Passthrough(_)));
        assert_eq!(site.fetches.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_push_and_dismiss() {
        let (_, context, tray) = setup();
        let agent = active_agent(&context).await;

        let shown = agent.handle_push(PushMessage::empty()).await.unwrap();
        assert_eq!(shown.title, "✦ AstroYou");
        assert_eq!(tray.visible().await.len(), 1);

        let opened = agent
            .handle_notification_click(NotificationClick::new(shown, Some("dismiss")))
            .await
            .unwrap();
        assert!(opened.is_none());
        assert!(tray.visible().await.is_empty());
    }

    #[tokio::test]
    async fn test_state_subscription() {
        let (_, context, _) = setup();
        let agent = OfflineCacheAgent::new(AgentConfig::default(), context).unwrap();
        let mut rx = agent.subscribe();

        agent.install().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), AgentState::Installed);
    }
}
