//! Hosting side of the agent: registration and event dispatch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use astroyou_common::{retry_if, RetryConfig};
use astroyou_net::{Request, Response};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::agent::{
    ActivationReport, AgentContext, AgentState, FetchOutcome, OfflineCacheAgent, ServiceWorkerId,
};
use crate::cache::CacheStorage;
use crate::clients::Client;
use crate::config::AgentConfig;
use crate::notification::{Notification, NotificationClick};
use crate::push::PushMessage;
use crate::{Result, ServiceWorkerError};

// ==================== Registration ====================

/// The installing, waiting and active slots of an origin's registration.
#[derive(Debug, Default)]
pub struct ServiceWorkerRegistration {
    /// Scope URL, set by the first registration.
    pub scope: Option<Url>,

    /// Instance currently precaching.
    pub installing: Option<Arc<OfflineCacheAgent>>,

    /// Installed instance waiting to take over.
    pub waiting: Option<Arc<OfflineCacheAgent>>,

    /// Instance controlling the origin.
    pub active: Option<Arc<OfflineCacheAgent>>,

    /// Last registration attempt.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    /// Check if an update check is due.
    pub fn needs_update(&self, check_interval: Duration) -> bool {
        match self.last_update_check {
            Some(last) => last.elapsed() > check_interval,
            None => true,
        }
    }

    fn all(&self) -> impl Iterator<Item = &Arc<OfflineCacheAgent>> {
        self.installing
            .iter()
            .chain(self.waiting.iter())
            .chain(self.active.iter())
    }
}

// ==================== Events ====================

/// Registration lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A new version started installing.
    UpdateFound { worker_id: ServiceWorkerId },
    /// An instance changed state.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: AgentState,
    },
    /// A version failed to install; the previous one stays active.
    InstallFailed {
        worker_id: ServiceWorkerId,
        reason: String,
    },
    /// Open windows are now controlled by a different instance.
    ControllerChange { worker_id: ServiceWorkerId },
}

// ==================== Container ====================

/// Registers agent versions for one origin and routes events to the active one.
pub struct ServiceWorkerContainer {
    context: AgentContext,
    registration: RwLock<ServiceWorkerRegistration>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container and the receiver for its lifecycle events.
    pub fn new(context: AgentContext) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                context,
                registration: RwLock::new(ServiceWorkerRegistration::default()),
                event_tx,
            },
            event_rx,
        )
    }

    /// Cache storage shared by every instance.
    pub fn caches(&self) -> Arc<RwLock<CacheStorage>> {
        Arc::clone(&self.context.caches)
    }

    /// The active instance, if any.
    pub async fn controller(&self) -> Option<Arc<OfflineCacheAgent>> {
        self.registration.read().await.active.clone()
    }

    /// The waiting instance, if any.
    pub async fn waiting(&self) -> Option<Arc<OfflineCacheAgent>> {
        self.registration.read().await.waiting.clone()
    }

    pub async fn scope(&self) -> Option<Url> {
        self.registration.read().await.scope.clone()
    }

    /// Whether the last registration attempt is older than `interval`.
    pub async fn needs_update(&self, interval: Duration) -> bool {
        self.registration.read().await.needs_update(interval)
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker: &OfflineCacheAgent) {
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id: worker.id(),
            new_state: worker.state(),
        });
    }

    /// Register a version and run its install.
    ///
    /// A failed install leaves the active version in place and returns the
    /// error. With `skip_waiting` the new version activates immediately;
    /// otherwise it waits for [`activate_waiting`](Self::activate_waiting).
    pub async fn register(&self, config: AgentConfig) -> Result<ServiceWorkerId> {
        let agent = Arc::new(OfflineCacheAgent::new(config, self.context.clone())?);
        let worker_id = agent.id();

        {
            let mut registration = self.registration.write().await;
            if registration.scope.is_none() {
                registration.scope = Some(agent.origin().clone());
            }
            if let Some(previous) = registration.installing.replace(Arc::clone(&agent)) {
                previous.mark_redundant();
            }
            registration.last_update_check = Some(Instant::now());
        }
        self.emit(ServiceWorkerEvent::UpdateFound { worker_id });
        info!(worker = ?worker_id, cache = %agent.cache_name(), "Registering agent version");

        // The registration lock is not held while precaching, so the active
        // version keeps serving.
        let installed = agent.install().await;
        self.emit_state(&agent);

        {
            let mut registration = self.registration.write().await;
            let current = registration
                .installing
                .as_ref()
                .is_some_and(|w| w.id() == worker_id);
            if !current {
                // A newer registration replaced this one while it installed.
                agent.mark_redundant();
                debug!(worker = ?worker_id, "Superseded during install");
                return Err(ServiceWorkerError::StateError(format!(
                    "{worker_id:?} was superseded during install"
                )));
            }
            registration.installing = None;

            if let Err(e) = installed {
                self.emit(ServiceWorkerEvent::InstallFailed {
                    worker_id,
                    reason: e.to_string(),
                });
                return Err(e);
            }

            if let Some(previous) = registration.waiting.replace(Arc::clone(&agent)) {
                previous.mark_redundant();
                self.emit_state(&previous);
            }
        }

        if agent.config().skip_waiting {
            self.activate_waiting().await?;
        } else {
            debug!(worker = ?worker_id, "Installed, waiting for old pages to close");
        }
        Ok(worker_id)
    }

    /// Register, retrying failed installs the way the host's update checks would.
    ///
    /// Configuration errors are not retried.
    pub async fn register_with_retry(
        &self,
        config: AgentConfig,
        retry: &RetryConfig,
    ) -> Result<ServiceWorkerId> {
        retry_if(
            retry,
            || self.register(config.clone()),
            ServiceWorkerError::is_retryable,
        )
        .await
    }

    /// Promote the waiting version to active.
    ///
    /// The registration stays locked while the new version activates, so no
    /// event reaches it before activation completes.
    pub async fn activate_waiting(&self) -> Result<ActivationReport> {
        let mut registration = self.registration.write().await;
        let agent = registration
            .waiting
            .take()
            .ok_or_else(|| ServiceWorkerError::StateError("no waiting worker".to_string()))?;

        let report = match agent.activate().await {
            Ok(report) => report,
            Err(e) => {
                self.emit_state(&agent);
                return Err(e);
            }
        };

        if let Some(previous) = registration.active.replace(Arc::clone(&agent)) {
            previous.mark_redundant();
            self.emit_state(&previous);
        }
        self.emit_state(&agent);
        self.emit(ServiceWorkerEvent::ControllerChange {
            worker_id: agent.id(),
        });
        Ok(report)
    }

    /// Unregister every version. Returns whether anything was registered.
    pub async fn unregister(&self) -> bool {
        let mut registration = self.registration.write().await;
        let workers: Vec<_> = registration.all().cloned().collect();
        for worker in &workers {
            worker.mark_redundant();
            self.emit_state(worker);
        }
        *registration = ServiceWorkerRegistration::default();
        !workers.is_empty()
    }

    // ==================== Dispatch ====================

    /// Route a page request through the active version.
    ///
    /// Requests the agent passes through, and every request while no version
    /// is active, go straight to the network.
    pub async fn dispatch_fetch(&self, request: Request) -> Result<Response> {
        let outcome = match self.controller().await {
            Some(agent) => agent.handle_fetch(request).await?,
            None => FetchOutcome::Passthrough(request),
        };

        match outcome {
            FetchOutcome::Network(response) | FetchOutcome::OfflineFallback(response) => {
                Ok(response)
            }
            FetchOutcome::Passthrough(request) => Ok(self.context.network.fetch(request).await?),
        }
    }

    /// Deliver a push message to the active version.
    pub async fn dispatch_push(&self, message: PushMessage) -> Result<Notification> {
        self.require_controller().await?.handle_push(message).await
    }

    /// Deliver a notification click to the active version.
    pub async fn dispatch_notification_click(
        &self,
        click: NotificationClick,
    ) -> Result<Option<Client>> {
        self.require_controller()
            .await?
            .handle_notification_click(click)
            .await
    }

    async fn require_controller(&self) -> Result<Arc<OfflineCacheAgent>> {
        self.controller().await.ok_or_else(|| {
            warn!("Event dispatched with no active worker");
            ServiceWorkerError::StateError("no active worker".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::Clients;
    use crate::notification::NotificationTray;
    use astroyou_net::{NetError, Network, StatusCode};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Site {
        down: AtomicBool,
    }

    #[async_trait]
    impl Network for Site {
        async fn fetch(&self, request: Request) -> std::result::Result<Response, NetError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(NetError::RequestFailed("connection refused".into()));
            }
            Ok(Response::new(request.url, StatusCode::OK, "ok"))
        }
    }

    fn container() -> (
        Arc<Site>,
        ServiceWorkerContainer,
        mpsc::UnboundedReceiver<ServiceWorkerEvent>,
    ) {
        let site = Arc::new(Site {
            down: AtomicBool::new(false),
        });
        let clients = Arc::new(Clients::new(Url::parse("https://astroyou.app/").unwrap()));
        let context = AgentContext::new(site.clone(), Arc::new(NotificationTray::new()), clients);
        let (container, rx) = ServiceWorkerContainer::new(context);
        (site, container, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServiceWorkerEvent>) -> Vec<ServiceWorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_register_skips_waiting() {
        let (_, container, mut rx) = container();
        let id = container.register(AgentConfig::default()).await.unwrap();

        let active = container.controller().await.unwrap();
        assert_eq!(active.id(), id);
        assert_eq!(active.state(), AgentState::Activated);
        assert!(container.waiting().await.is_none());
        assert_eq!(
            container.scope().await.unwrap().as_str(),
            "https://astroyou.app/"
        );

        let events = drain(&mut rx);
        assert_eq!(events.first(), Some(&ServiceWorkerEvent::UpdateFound { worker_id: id }));
        assert_eq!(
            events.last(),
            Some(&ServiceWorkerEvent::ControllerChange { worker_id: id })
        );
    }

    #[tokio::test]
    async fn test_register_without_skip_waiting() {
        let (_, container, _rx) = container();
        container.register(AgentConfig::default()).await.unwrap();
        let first = container.controller().await.unwrap();

        let config = AgentConfig::default()
            .with_cache_name("astroyou-v2")
            .with_skip_waiting(false);
        let second = container.register(config).await.unwrap();

        assert_eq!(container.controller().await.unwrap().id(), first.id());
        assert_eq!(container.waiting().await.unwrap().id(), second);
        // Old generation survives until the new version activates.
        assert!(container.caches().read().await.has("astroyou-v1"));

        container.activate_waiting().await.unwrap();
        assert_eq!(container.controller().await.unwrap().id(), second);
        assert_eq!(first.state(), AgentState::Redundant);
        assert_eq!(container.caches().read().await.keys(), vec!["astroyou-v2"]);
    }

    #[tokio::test]
    async fn test_failed_install_keeps_previous_version() {
        let (site, container, mut rx) = container();
        let first = container.register(AgentConfig::default()).await.unwrap();
        drain(&mut rx);

        site.down.store(true, Ordering::SeqCst);
        let err = container
            .register(AgentConfig::default().with_cache_name("astroyou-v2"))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceWorkerError::InstallFetchFailure { .. }));
        assert_eq!(container.controller().await.unwrap().id(), first);
        assert_eq!(container.caches().read().await.keys(), vec!["astroyou-v1"]);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ServiceWorkerEvent::InstallFailed { .. })));
    }

    #[tokio::test]
    async fn test_activate_without_waiting_worker() {
        let (_, container, _rx) = container();
        assert!(matches!(
            container.activate_waiting().await,
            Err(ServiceWorkerError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_without_controller() {
        let (_, container, _rx) = container();

        let response = container
            .dispatch_fetch(Request::navigate(Url::parse("https://astroyou.app/").unwrap()))
            .await
            .unwrap();
        assert_eq!(response.text().unwrap(), "ok");

        assert!(container.dispatch_push(PushMessage::empty()).await.is_err());
    }

    #[tokio::test]
    async fn test_config_errors_not_retried() {
        let (_, container, _rx) = container();
        let retry = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        };

        let result = container
            .register_with_retry(AgentConfig::default().with_precache(["/"]), &retry)
            .await;
        assert!(matches!(result, Err(ServiceWorkerError::ConfigError(_))));
        assert!(container.needs_update(Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn test_unregister() {
        let (_, container, _rx) = container();
        container.register(AgentConfig::default()).await.unwrap();
        let active = container.controller().await.unwrap();

        assert!(container.unregister().await);
        assert!(container.controller().await.is_none());
        assert_eq!(active.state(), AgentState::Redundant);
        assert!(!container.unregister().await);
    }
}
