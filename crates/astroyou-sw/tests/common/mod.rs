//! Shared fixtures for the agent integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use astroyou_net::{header, HeaderValue, NetError, Network, Request, Response, StatusCode};
use astroyou_sw::{
    AgentContext, Clients, NotificationTray, ServiceWorkerContainer, ServiceWorkerEvent,
};
use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

pub const ORIGIN: &str = "https://astroyou.app/";

pub fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

/// A network with canned routes that can be switched offline.
#[derive(Default)]
pub struct ScriptedNetwork {
    routes: Mutex<HashMap<String, (StatusCode, String)>>,
    failing: Mutex<Vec<String>>,
    offline: AtomicBool,
    requests: Mutex<Vec<Url>>,
    calls: AtomicUsize,
    delay_ms: AtomicU64,
}

impl ScriptedNetwork {
    pub fn astroyou() -> Arc<Self> {
        let network = Self::default();
        network.route("/", StatusCode::OK, "<html>AstroYou home</html>");
        network.route("/offline.html", StatusCode::OK, "<html>You are offline ✦</html>");
        network.route("/dashboard", StatusCode::OK, "<html>dashboard</html>");
        Arc::new(network)
    }

    pub fn route(&self, path: &str, status: StatusCode, body: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(url(path).to_string(), (status, body.to_string()));
    }

    /// Make requests for `path` reject.
    pub fn fail(&self, path: &str) {
        self.failing.lock().unwrap().push(url(path).to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Hold every response started from now on for `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<Url> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Network for ScriptedNetwork {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.url.clone());

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed("network unreachable".into()));
        }
        if self.failing.lock().unwrap().contains(&request.url.to_string()) {
            return Err(NetError::Timeout(Duration::from_secs(30)));
        }

        let route = self.routes.lock().unwrap().get(request.url.as_str()).cloned();
        let (status, body) = route.unwrap_or((StatusCode::NOT_FOUND, "not found".to_string()));
        Ok(Response::new(request.url, status, body)
            .with_header(header::CONTENT_TYPE, HeaderValue::from_static("text/html")))
    }
}

pub struct Harness {
    pub network: Arc<ScriptedNetwork>,
    pub tray: Arc<NotificationTray>,
    pub clients: Arc<Clients>,
    pub container: Arc<ServiceWorkerContainer>,
    pub events: mpsc::UnboundedReceiver<ServiceWorkerEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_network(ScriptedNetwork::astroyou())
    }

    pub fn with_network(network: Arc<ScriptedNetwork>) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("astroyou_sw=debug")
            .with_test_writer()
            .try_init();

        let tray = Arc::new(NotificationTray::new());
        let clients = Arc::new(Clients::new(Url::parse(ORIGIN).unwrap()));
        let context = AgentContext::new(network.clone(), tray.clone(), clients.clone());
        let (container, events) = ServiceWorkerContainer::new(context);

        Self {
            network,
            tray,
            clients,
            container: Arc::new(container),
            events,
        }
    }

    pub fn drain_events(&mut self) -> Vec<ServiceWorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
