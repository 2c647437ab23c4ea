//! The offline worker's event handlers.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use neochat_common::{retry_with_backoff, RetryConfig};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{Cache, CacheStorage};
use crate::clients::Clients;
use crate::config::WorkerConfig;
use crate::events::{ControlMessage, EventOutcome, ExtendableEvent, WorkerEvent};
use crate::network::Network;
use crate::notification::{Notification, NotificationDescriptor, NotificationSurface};
use crate::request::{Request, Response};
use crate::scope::WorkerScope;
use crate::version::CacheVersion;
use crate::ServiceWorkerError;

/// One version of the offline worker script.
#[derive(Debug, Clone)]
pub struct OfflineWorker {
    config: Arc<WorkerConfig>,
}

impl OfflineWorker {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn cache_version(&self) -> &CacheVersion {
        &self.config.cache_version
    }

    /// Run the handler for `event` and wait for all work it registered.
    pub async fn dispatch(
        &self,
        scope: &WorkerScope,
        event: WorkerEvent,
    ) -> Result<EventOutcome, ServiceWorkerError> {
        let name = event.name();
        let mut extendable = ExtendableEvent::new();

        let outcome = match event {
            WorkerEvent::Install => {
                self.on_install(scope, &mut extendable)?;
                EventOutcome::Handled
            }
            WorkerEvent::Activate => {
                self.on_activate(scope, &mut extendable);
                EventOutcome::Handled
            }
            WorkerEvent::Fetch(request) => self.on_fetch(scope, &mut extendable, request).await,
            WorkerEvent::Push(data) => {
                self.on_push(scope, &mut extendable, data);
                EventOutcome::Handled
            }
            WorkerEvent::NotificationClick(notification) => {
                self.on_notification_click(scope, &mut extendable, notification);
                EventOutcome::Handled
            }
            WorkerEvent::Message(data) => {
                self.on_message(scope, &data);
                EventOutcome::Handled
            }
        };

        debug!(event = name, pending = extendable.pending(), "Waiting for extended work");
        extendable.settle().await?;
        Ok(outcome)
    }

    /// Open the current bucket and seed it. Individual seed failures are
    /// logged and skipped.
    fn on_install(
        &self,
        scope: &WorkerScope,
        event: &mut ExtendableEvent,
    ) -> Result<(), ServiceWorkerError> {
        let cache_name = self.config.cache_version.cache_name();
        let seeds = self.config.seed_urls()?;
        let retry = self.config.seed_retry.to_retry_config();
        let caches = Arc::clone(scope.caches());
        let network = Arc::clone(scope.network());

        event.wait_until(async move {
            let cache = caches.open(&cache_name).await?;
            let total = seeds.len();

            let results = join_all(
                seeds
                    .into_iter()
                    .map(|url| seed_one(network.as_ref(), cache.as_ref(), url, &retry)),
            )
            .await;

            let mut seeded = 0;
            for (url, result) in results {
                match result {
                    Ok(()) => seeded += 1,
                    Err(e) => warn!(cache = %cache_name, url = %url, error = %e, "Failed to seed file"),
                }
            }

            info!(cache = %cache_name, seeded, total, "Install complete");
            Ok(())
        });

        if self.config.skip_waiting_on_install {
            scope.skip_waiting();
        }
        Ok(())
    }

    /// Delete every bucket that is not the current one, then claim pages.
    fn on_activate(&self, scope: &WorkerScope, event: &mut ExtendableEvent) {
        let current = self.config.cache_version.clone();
        let caches = Arc::clone(scope.caches());
        let clients = Arc::clone(scope.clients());
        let worker_id = scope.worker_id();

        event.wait_until(async move {
            prune_stale_caches(caches.as_ref(), &current).await?;

            let claimed = clients.claim(worker_id).await?;
            info!(cache = %current, claimed, "Activated and claimed clients");
            Ok(())
        });
    }

    /// Network first; on network failure the current bucket, then the
    /// offline fallback. Only GET requests are intercepted.
    async fn on_fetch(
        &self,
        scope: &WorkerScope,
        event: &mut ExtendableEvent,
        request: Request,
    ) -> EventOutcome {
        if !request.is_get() {
            debug!(method = %request.method, url = %request.url, "Not intercepting");
            return EventOutcome::Passthrough;
        }

        let cache_name = self.config.cache_version.cache_name();

        match scope.network().fetch(&request).await {
            Ok(response) if response.is_cacheable() => {
                let caches = Arc::clone(scope.caches());
                let key = request.key();
                let copy = response.clone();

                event.wait_until(async move {
                    let stored = match caches.open(&cache_name).await {
                        Ok(cache) => cache.put(key.clone(), &copy).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = stored {
                        warn!(%key, error = %e, "Failed to cache response");
                    }
                    Ok(())
                });

                EventOutcome::Respond(response)
            }
            Ok(response) => {
                debug!(url = %request.url, status = %response.status, "Not caching response");
                EventOutcome::Respond(response)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying cache");
                let response = self.offline_response(scope.caches().as_ref(), &request).await;
                EventOutcome::Respond(response)
            }
        }
    }

    /// The cached copy of `request` from the current bucket, or the offline
    /// fallback. Never creates the bucket.
    pub async fn offline_response(&self, caches: &dyn CacheStorage, request: &Request) -> Response {
        let cache_name = self.config.cache_version.cache_name();
        let key = request.key();

        let cached = match caches.has(&cache_name).await {
            Ok(true) => match caches.open(&cache_name).await {
                Ok(cache) => cache.match_request(&key).await,
                Err(e) => Err(e),
            },
            Ok(false) => Ok(None),
            Err(e) => Err(e),
        };

        match cached {
            Ok(Some(response)) => response,
            Ok(None) => {
                debug!(%key, "Cache miss while offline");
                Response::offline_fallback()
            }
            Err(e) => {
                warn!(%key, error = %e, "Cache lookup failed while offline");
                Response::offline_fallback()
            }
        }
    }

    fn on_push(&self, scope: &WorkerScope, event: &mut ExtendableEvent, data: Option<Bytes>) {
        let settings = &self.config.notifications;
        let body = match data {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => settings.default_body.clone(),
        };

        let descriptor = NotificationDescriptor {
            body,
            icon: settings.icon.clone(),
            badge: settings.badge.clone(),
            tag: settings.tag.clone(),
            require_interaction: settings.require_interaction,
        };
        let title = settings.title.clone();
        let notifications = Arc::clone(scope.notifications());

        event.wait_until(async move {
            let shown = notifications.show(&title, descriptor).await?;
            debug!(notification = ?shown.id, tag = %shown.descriptor.tag, "Notification shown");
            Ok(())
        });
    }

    /// Close the notification, then focus a window at the root URL or open one.
    fn on_notification_click(
        &self,
        scope: &WorkerScope,
        event: &mut ExtendableEvent,
        notification: Notification,
    ) {
        let root = self.config.root_url.clone();
        let notifications = Arc::clone(scope.notifications());
        let clients = Arc::clone(scope.clients());

        event.wait_until(async move {
            notifications.close(notification.id).await?;

            let windows = clients.match_all().await;
            match windows.iter().find(|c| same_document(&c.url, &root)) {
                Some(existing) => {
                    clients.focus(existing.id).await?;
                    debug!(client = ?existing.id, "Focused existing window");
                }
                None => {
                    let opened = clients.open_window(&root).await?;
                    debug!(client = ?opened.id, url = %root, "Opened new window");
                }
            }
            Ok(())
        });
    }

    fn on_message(&self, scope: &WorkerScope, data: &JsonValue) {
        match ControlMessage::parse(data) {
            Some(ControlMessage::SkipWaiting) => scope.skip_waiting(),
            None => debug!(payload = %data, "Ignoring unrecognised message"),
        }
    }
}

/// Fetch one seed URL and store it. Only 200 responses count as success.
async fn seed_one(
    network: &dyn Network,
    cache: &dyn Cache,
    url: Url,
    retry: &RetryConfig,
) -> (Url, Result<(), ServiceWorkerError>) {
    let request = Request::get(url.clone());
    let req = &request;

    let fetched = retry_with_backoff(retry, move || async move {
        let response = network.fetch(req).await?;
        if response.is_cacheable() {
            Ok::<Response, ServiceWorkerError>(response)
        } else {
            Err(ServiceWorkerError::NetworkError(format!(
                "unexpected status {}",
                response.status
            )))
        }
    })
    .await;

    let result = match fetched {
        Ok(response) => cache.put(request.key(), &response).await,
        Err(e) => Err(e),
    };
    (url, result)
}

/// Delete every bucket whose name is not `current`. Returns how many went.
async fn prune_stale_caches(
    caches: &dyn CacheStorage,
    current: &CacheVersion,
) -> Result<usize, ServiceWorkerError> {
    let mut deleted = 0;

    for name in caches.keys().await? {
        let is_current = name
            .parse::<CacheVersion>()
            .is_ok_and(|version| &version == current);

        if !is_current {
            info!(cache = %name, "Deleting stale cache");
            if caches.delete(&name).await? {
                deleted += 1;
            }
        }
    }

    Ok(deleted)
}

/// URLs equal once fragments are ignored.
fn same_document(a: &Url, b: &Url) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    a.set_fragment(None);
    b.set_fragment(None);
    a == b
}
