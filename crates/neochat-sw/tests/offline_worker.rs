//! End-to-end tests for the offline worker through its container.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, StatusCode};
use neochat_sw::{
    Cache, CacheStorage, CacheVersion, Client, ClientRegistry, Clients, Host, MemoryCacheStorage,
    Network, NetworkError, NotificationCenter, Request, Response, ResponseSource,
    SeedRetryPolicy, ServiceWorkerContainer, ServiceWorkerError, ServiceWorkerEvent, WorkerConfig,
    WorkerState, OFFLINE_BODY,
};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

const ROOT: &str = "http://localhost:3000/";

/// Network double answering from a fixed route table.
#[derive(Default)]
struct ScriptedNetwork {
    routes: Mutex<HashMap<String, (StatusCode, String)>>,
    offline: AtomicBool,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedNetwork {
    fn route(&self, path: &str, status: StatusCode, body: &str) {
        let url = url(path).to_string();
        self.routes
            .lock()
            .unwrap()
            .insert(url, (status, body.to_string()));
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Network for ScriptedNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetworkError::Offline);
        }
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(NetworkError::RequestFailed("connection reset".into()));
        }

        let routes = self.routes.lock().unwrap();
        Ok(match routes.get(request.url.as_str()) {
            Some((status, body)) => Response::new(*status, body.clone()),
            None => Response::new(StatusCode::NOT_FOUND, "not found"),
        })
    }
}

/// Network that never answers.
struct StalledNetwork;

#[async_trait]
impl Network for StalledNetwork {
    async fn fetch(&self, _request: &Request) -> Result<Response, NetworkError> {
        std::future::pending().await
    }
}

/// Storage whose buckets can never be opened.
struct BrokenStorage;

#[async_trait]
impl CacheStorage for BrokenStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, ServiceWorkerError> {
        Err(ServiceWorkerError::CacheError(format!("quota exceeded opening {name}")))
    }

    async fn has(&self, _name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(false)
    }

    async fn delete(&self, _name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(false)
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        Ok(Vec::new())
    }
}

struct Harness {
    container: ServiceWorkerContainer,
    events: UnboundedReceiver<ServiceWorkerEvent>,
    network: Arc<ScriptedNetwork>,
    storage: Arc<MemoryCacheStorage>,
    clients: Arc<ClientRegistry>,
    notifications: Arc<NotificationCenter>,
}

impl Harness {
    fn new() -> Self {
        let network = Arc::new(ScriptedNetwork::default());
        for path in ["/", "/index.html", "/manifest.json", "/icon-192.png", "/icon-512.png"] {
            network.route(path, StatusCode::OK, &format!("content of {path}"));
        }

        let storage = Arc::new(MemoryCacheStorage::new());
        let clients = Arc::new(ClientRegistry::new());
        let notifications = Arc::new(NotificationCenter::new());
        let host = Host::new(
            storage.clone(),
            network.clone(),
            clients.clone(),
            notifications.clone(),
        );
        let (container, events) = ServiceWorkerContainer::new(url("/"), host);

        Self {
            container,
            events,
            network,
            storage,
            clients,
            notifications,
        }
    }

    async fn cached(&self, bucket: &str, path: &str) -> Option<Response> {
        let cache = self.storage.get(bucket).await?;
        cache
            .match_request(&Request::get(url(path)).key())
            .await
            .unwrap()
    }

    fn drain_events(&mut self) -> Vec<ServiceWorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn url(path: &str) -> Url {
    Url::parse(ROOT).unwrap().join(path).unwrap()
}

fn version(n: u32) -> WorkerConfig {
    WorkerConfig {
        cache_version: CacheVersion::new("neochat", n),
        ..WorkerConfig::default()
    }
}

// ==================== Install ====================

#[tokio::test]
async fn test_install_seeds_current_bucket() {
    let h = Harness::new();
    h.container.register(version(1)).await.unwrap();

    let cache = h.storage.get("neochat-v1").await.unwrap();
    assert_eq!(cache.len().await, 5);

    let index = h.cached("neochat-v1", "/index.html").await.unwrap();
    assert_eq!(index.text(), "content of /index.html");
    assert_eq!(index.source, ResponseSource::Cache);
}

#[tokio::test]
async fn test_install_skips_missing_seed_files() {
    let h = Harness::new();
    h.network.route("/icon-512.png", StatusCode::NOT_FOUND, "gone");

    let id = h.container.register(version(1)).await.unwrap();

    assert_eq!(h.container.state_of(id).await, Some(WorkerState::Activated));
    assert!(h.cached("neochat-v1", "/icon-512.png").await.is_none());
    assert!(h.cached("neochat-v1", "/icon-192.png").await.is_some());
}

#[tokio::test]
async fn test_install_without_network_still_activates() {
    let h = Harness::new();
    h.network.set_offline(true);

    h.container.register(version(1)).await.unwrap();

    assert!(h.container.active().await.is_some());
    assert!(h.storage.get("neochat-v1").await.unwrap().is_empty().await);
}

#[tokio::test]
async fn test_install_retries_seed_when_configured() {
    let h = Harness::new();
    h.network.fail_next(1);

    let config = WorkerConfig {
        seed_files: vec!["/index.html".to_string()],
        seed_retry: SeedRetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
        },
        ..version(1)
    };
    h.container.register(config).await.unwrap();

    assert_eq!(h.network.calls(), 2);
    assert!(h.cached("neochat-v1", "/index.html").await.is_some());
}

#[tokio::test]
async fn test_install_does_not_retry_by_default() {
    let h = Harness::new();
    h.network.fail_next(1);

    let config = WorkerConfig {
        seed_files: vec!["/index.html".to_string()],
        ..version(1)
    };
    h.container.register(config).await.unwrap();

    assert_eq!(h.network.calls(), 1);
    assert!(h.cached("neochat-v1", "/index.html").await.is_none());
}

#[tokio::test]
async fn test_install_fails_when_bucket_cannot_open() {
    let host = Host::new(
        Arc::new(BrokenStorage),
        Arc::new(ScriptedNetwork::default()),
        Arc::new(ClientRegistry::new()),
        Arc::new(NotificationCenter::new()),
    );
    let (container, mut events) = ServiceWorkerContainer::new(url("/"), host);

    let result = container.register(version(1)).await;
    assert!(matches!(result, Err(ServiceWorkerError::InstallFailed(_))));
    assert!(container.active().await.is_none());
    assert!(container.installing().await.is_none());

    let Ok(ServiceWorkerEvent::UpdateFound { worker_id }) = events.try_recv() else {
        panic!("expected UpdateFound first");
    };
    assert_eq!(container.state_of(worker_id).await, Some(WorkerState::Redundant));
}

#[tokio::test]
async fn test_install_times_out() {
    let host = Host::new(
        Arc::new(MemoryCacheStorage::new()),
        Arc::new(StalledNetwork),
        Arc::new(ClientRegistry::new()),
        Arc::new(NotificationCenter::new()),
    );
    let (container, _events) = ServiceWorkerContainer::new(url("/"), host);
    let container = container.with_event_timeout(Duration::from_millis(50));

    let result = container.register(version(1)).await;
    assert!(matches!(result, Err(ServiceWorkerError::InstallFailed(_))));
    assert!(container.active().await.is_none());
}

#[tokio::test]
async fn test_rejects_invalid_config() {
    let h = Harness::new();
    let config = WorkerConfig {
        seed_files: vec!["http://[bad".to_string()],
        ..version(1)
    };
    assert!(h.container.register(config).await.is_err());
    assert!(h.container.installing().await.is_none());
}

// ==================== Activate ====================

#[tokio::test]
async fn test_activation_prunes_every_other_bucket() {
    let h = Harness::new();
    for stale in ["neochat-v0", "neochat-v7", "legacy-assets"] {
        h.storage.open(stale).await.unwrap();
    }

    h.container.register(version(1)).await.unwrap();
    h.container.register(version(2)).await.unwrap();

    assert_eq!(h.storage.keys().await.unwrap(), vec!["neochat-v2".to_string()]);
    assert!(h.cached("neochat-v2", "/").await.is_some());
}

#[tokio::test]
async fn test_activation_claims_open_pages() {
    let h = Harness::new();
    let page = h.clients.add(Client::window(url("/"))).await;

    let id = h.container.register(version(1)).await.unwrap();

    assert_eq!(h.clients.get(page).await.unwrap().controller, Some(id));
}

#[tokio::test]
async fn test_lifecycle_events_in_order() {
    let mut h = Harness::new();
    let id = h.container.register(version(1)).await.unwrap();

    assert_eq!(
        h.drain_events(),
        vec![
            ServiceWorkerEvent::UpdateFound { worker_id: id },
            ServiceWorkerEvent::StateChange {
                worker_id: id,
                new_state: WorkerState::Installing
            },
            ServiceWorkerEvent::StateChange {
                worker_id: id,
                new_state: WorkerState::Installed
            },
            ServiceWorkerEvent::StateChange {
                worker_id: id,
                new_state: WorkerState::Activating
            },
            ServiceWorkerEvent::StateChange {
                worker_id: id,
                new_state: WorkerState::Activated
            },
            ServiceWorkerEvent::ControllerChange { worker_id: id },
        ]
    );
}

// ==================== Skip waiting ====================

#[tokio::test]
async fn test_skip_waiting_message_promotes_waiting_version() {
    let mut h = Harness::new();
    let first = h.container.register(version(1)).await.unwrap();

    let patient = WorkerConfig {
        skip_waiting_on_install: false,
        ..version(2)
    };
    let second = h.container.register(patient).await.unwrap();

    assert_eq!(h.container.active().await.unwrap().id, first);
    assert_eq!(h.container.waiting().await.unwrap().id, second);
    assert!(h.storage.has("neochat-v1").await.unwrap());

    // A page is still open and nothing closes it
    h.clients.add(Client::window(url("/"))).await;
    h.drain_events();

    h.container
        .post_message(second, json!({ "type": "SKIP_WAITING" }))
        .await
        .unwrap();

    assert_eq!(h.container.active().await.unwrap().id, second);
    assert!(h.container.waiting().await.is_none());
    assert_eq!(h.container.state_of(first).await, Some(WorkerState::Redundant));
    assert_eq!(h.storage.keys().await.unwrap(), vec!["neochat-v2".to_string()]);
    assert!(h
        .drain_events()
        .contains(&ServiceWorkerEvent::ControllerChange { worker_id: second }));

    // Again, now that it is active
    h.container
        .post_message(second, json!({ "type": "SKIP_WAITING" }))
        .await
        .unwrap();

    assert_eq!(h.container.active().await.unwrap().id, second);
    assert_eq!(h.container.state_of(second).await, Some(WorkerState::Activated));
    assert!(h.drain_events().is_empty());
}

#[tokio::test]
async fn test_other_messages_leave_waiting_version_alone() {
    let h = Harness::new();
    h.container.register(version(1)).await.unwrap();
    let second = h
        .container
        .register(WorkerConfig {
            skip_waiting_on_install: false,
            ..version(2)
        })
        .await
        .unwrap();

    for message in [json!({ "type": "PING" }), json!("SKIP_WAITING"), json!(null)] {
        h.container.post_message(second, message).await.unwrap();
    }

    assert_eq!(h.container.waiting().await.unwrap().id, second);
}

#[tokio::test]
async fn test_message_to_redundant_version() {
    let h = Harness::new();
    let first = h.container.register(version(1)).await.unwrap();
    h.container.register(version(2)).await.unwrap();

    let result = h
        .container
        .post_message(first, json!({ "type": "SKIP_WAITING" }))
        .await;
    assert!(matches!(result, Err(ServiceWorkerError::StateError(_))));
}

// ==================== Fetch ====================

#[tokio::test]
async fn test_fetch_online_writes_through_to_cache() {
    let h = Harness::new();
    h.container.register(version(1)).await.unwrap();
    h.network.route("/api/rooms", StatusCode::OK, r#"["general"]"#);

    let response = h.container.fetch(Request::get(url("/api/rooms"))).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.source, ResponseSource::Network);

    let cached = h.cached("neochat-v1", "/api/rooms").await.unwrap();
    assert_eq!(cached.body, response.body);
}

#[tokio::test]
async fn test_fetch_refreshes_cached_copy() {
    let h = Harness::new();
    h.container.register(version(1)).await.unwrap();

    h.network.route("/index.html", StatusCode::OK, "new shell");
    h.container.fetch(Request::get(url("/index.html"))).await.unwrap();

    assert_eq!(h.cached("neochat-v1", "/index.html").await.unwrap().text(), "new shell");
}

#[tokio::test]
async fn test_fetch_offline_serves_cached_copy() {
    let h = Harness::new();
    h.container.register(version(1)).await.unwrap();
    h.network.set_offline(true);

    let response = h.container.fetch(Request::get(url("/manifest.json"))).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.text(), "content of /manifest.json");
}

#[tokio::test]
async fn test_fetch_offline_uncached_synthesizes_503() {
    let h = Harness::new();
    h.container.register(version(1)).await.unwrap();
    h.network.set_offline(true);

    let response = h.container.fetch(Request::get(url("/avatar/42.png"))).await.unwrap();
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.status_text, "Service Unavailable");
    assert_eq!(response.headers[header::CONTENT_TYPE], "text/plain");
    assert_eq!(response.text(), OFFLINE_BODY);
    assert!(response.text().contains("offline"));
    assert_eq!(response.source, ResponseSource::Fallback);
}

#[tokio::test]
async fn test_fetch_error_status_is_not_cached() {
    let h = Harness::new();
    h.container.register(version(1)).await.unwrap();
    h.network.route("/api/broken", StatusCode::INTERNAL_SERVER_ERROR, "boom");

    let response = h.container.fetch(Request::get(url("/api/broken"))).await.unwrap();
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(h.cached("neochat-v1", "/api/broken").await.is_none());

    let missing = h.container.fetch(Request::get(url("/nope"))).await.unwrap();
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert!(h.cached("neochat-v1", "/nope").await.is_none());
}

#[tokio::test]
async fn test_fetch_non_get_never_touches_cache() {
    let h = Harness::new();
    h.container.register(version(1)).await.unwrap();
    h.network.route("/api/messages", StatusCode::OK, "sent");

    let before = h.storage.stats().total();

    let response = h
        .container
        .fetch(Request::post(url("/api/messages"), Bytes::from_static(b"hi")))
        .await
        .unwrap();
    assert_eq!(response.text(), "sent");

    // Offline: the failure surfaces as-is, no fallback
    h.network.set_offline(true);
    let offline = h
        .container
        .fetch(Request::post(url("/api/messages"), Bytes::from_static(b"hi")))
        .await;
    assert!(matches!(offline, Err(NetworkError::Offline)));

    assert_eq!(h.storage.stats().total(), before);
}

#[tokio::test]
async fn test_fetch_on_stalled_network_answers_after_timeout() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let host = Host::new(
        storage.clone(),
        Arc::new(StalledNetwork),
        Arc::new(ClientRegistry::new()),
        Arc::new(NotificationCenter::new()),
    );
    let (container, _events) = ServiceWorkerContainer::new(url("/"), host);
    let container = container.with_event_timeout(Duration::from_millis(50));

    let config = WorkerConfig {
        seed_files: Vec::new(),
        ..version(1)
    };
    container.register(config).await.unwrap();

    let shell = Request::get(url("/index.html"));
    storage
        .open("neochat-v1")
        .await
        .unwrap()
        .put(shell.key(), &Response::new(StatusCode::OK, "cached shell"))
        .await
        .unwrap();

    let cached = tokio::time::timeout(Duration::from_secs(2), container.fetch(shell))
        .await
        .expect("fetch must not hang")
        .unwrap();
    assert_eq!(cached.source, ResponseSource::Cache);
    assert_eq!(cached.text(), "cached shell");

    let missing = tokio::time::timeout(
        Duration::from_secs(2),
        container.fetch(Request::get(url("/api/rooms"))),
    )
    .await
    .expect("fetch must not hang")
    .unwrap();
    assert_eq!(missing.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(missing.source, ResponseSource::Fallback);
}

#[tokio::test]
async fn test_fetch_without_active_worker_goes_to_network() {
    let h = Harness::new();
    h.network.set_offline(true);

    let result = h.container.fetch(Request::get(url("/"))).await;
    assert!(matches!(result, Err(NetworkError::Offline)));
}

// ==================== Notifications ====================

#[tokio::test]
async fn test_push_without_payload_uses_default_body() {
    let h = Harness::new();
    h.container.register(version(1)).await.unwrap();

    h.container.push(None).await.unwrap();

    let visible = h.notifications.visible().await;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].title, "NeoChat");
    assert_eq!(visible[0].descriptor.body, "You have a new message");
    assert_eq!(visible[0].descriptor.icon, "/icon-192.png");
    assert_eq!(visible[0].descriptor.tag, "neochat-message");
    assert!(!visible[0].descriptor.require_interaction);
}

#[tokio::test]
async fn test_push_payload_becomes_body_and_replaces_by_tag() {
    let h = Harness::new();
    h.container.register(version(1)).await.unwrap();

    h.container.push(None).await.unwrap();
    h.container.push(Some(Bytes::from_static(b"Hello"))).await.unwrap();

    let visible = h.notifications.visible().await;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].descriptor.body, "Hello");
}

#[tokio::test]
async fn test_click_focuses_existing_root_window() {
    let h = Harness::new();
    h.container.register(version(1)).await.unwrap();
    let other = h.clients.add(Client::window(url("/settings"))).await;
    let root = h.clients.add(Client::window(url("/#room-3"))).await;

    h.container.push(None).await.unwrap();
    let notification = h.notifications.visible().await.remove(0);
    h.container.notification_click(notification).await.unwrap();

    assert_eq!(h.clients.len().await, 2);
    assert!(h.clients.get(root).await.unwrap().focused);
    assert!(!h.clients.get(other).await.unwrap().focused);
    assert!(h.notifications.visible().await.is_empty());
}

#[tokio::test]
async fn test_click_opens_root_when_none_open() {
    let h = Harness::new();
    h.container.register(version(1)).await.unwrap();
    h.clients.add(Client::window(url("/settings"))).await;

    h.container.push(Some(Bytes::from_static(b"ping"))).await.unwrap();
    let notification = h.notifications.visible().await.remove(0);
    h.container.notification_click(notification).await.unwrap();

    let windows = h.clients.match_all().await;
    assert_eq!(windows.len(), 2);
    let opened: Vec<_> = windows.iter().filter(|c| c.url == url("/")).collect();
    assert_eq!(opened.len(), 1);
    assert!(opened[0].focused);
    assert!(h.notifications.visible().await.is_empty());
}
