//! Clients API: the pages a worker can see, focus, open, and control.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::lifecycle::WorkerId;
use crate::ServiceWorkerError;

/// Unique identifier for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
}

/// Visibility state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityState {
    Hidden,
    Visible,
}

/// A client (page or worker) in the worker's origin.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    pub client_type: ClientType,
    pub visibility_state: VisibilityState,
    pub focused: bool,
    /// The worker version controlling this client, if any.
    pub controller: Option<WorkerId>,
}

impl Client {
    /// A visible, unfocused, uncontrolled window at `url`.
    pub fn window(url: Url) -> Self {
        Self {
            id: ClientId::new(),
            url,
            client_type: ClientType::Window,
            visibility_state: VisibilityState::Visible,
            focused: false,
            controller: None,
        }
    }
}

/// Access to the clients of the worker's origin.
#[async_trait]
pub trait Clients: Send + Sync {
    /// All window clients, controlled or not.
    async fn match_all(&self) -> Vec<Client>;

    /// Bring a window client to the foreground.
    async fn focus(&self, id: ClientId) -> Result<Client, ServiceWorkerError>;

    /// Open a new window at `url`.
    async fn open_window(&self, url: &Url) -> Result<Client, ServiceWorkerError>;

    /// Make `worker` the controller of every window client. Returns how many
    /// clients changed controller.
    async fn claim(&self, worker: WorkerId) -> Result<usize, ServiceWorkerError>;
}

/// In-memory clients registry.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, Client>>,
}

impl ClientRegistry {
    /// Create new clients registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client (a page the user opened).
    pub async fn add(&self, client: Client) -> ClientId {
        let id = client.id;
        self.clients.write().await.insert(id, client);
        id
    }

    /// Remove a client (page closed).
    pub async fn remove(&self, id: ClientId) -> Option<Client> {
        self.clients.write().await.remove(&id)
    }

    /// Get a client by ID.
    pub async fn get(&self, id: ClientId) -> Option<Client> {
        self.clients.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Clients for ClientRegistry {
    async fn match_all(&self) -> Vec<Client> {
        let mut windows: Vec<Client> = self
            .clients
            .read()
            .await
            .values()
            .filter(|c| c.client_type == ClientType::Window)
            .cloned()
            .collect();
        windows.sort_by_key(|c| c.id);
        windows
    }

    async fn focus(&self, id: ClientId) -> Result<Client, ServiceWorkerError> {
        let mut clients = self.clients.write().await;

        match clients.get(&id) {
            None => return Err(ServiceWorkerError::NotFound(format!("client {id:?}"))),
            Some(c) if c.client_type != ClientType::Window => {
                return Err(ServiceWorkerError::StateError(
                    "Can only focus window clients".to_string(),
                ));
            }
            Some(_) => {}
        }

        for client in clients.values_mut() {
            client.focused = client.id == id;
            if client.focused {
                client.visibility_state = VisibilityState::Visible;
            }
        }

        debug!(client = ?id, "Focused client");
        clients
            .get(&id)
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {id:?}")))
    }

    async fn open_window(&self, url: &Url) -> Result<Client, ServiceWorkerError> {
        let mut client = Client::window(url.clone());
        client.focused = true;

        let mut clients = self.clients.write().await;
        for other in clients.values_mut() {
            other.focused = false;
        }
        clients.insert(client.id, client.clone());

        debug!(client = ?client.id, url = %url, "Opened window");
        Ok(client)
    }

    async fn claim(&self, worker: WorkerId) -> Result<usize, ServiceWorkerError> {
        let mut claimed = 0;
        for client in self.clients.write().await.values_mut() {
            if client.client_type == ClientType::Window && client.controller != Some(worker) {
                client.controller = Some(worker);
                claimed += 1;
            }
        }
        Ok(claimed)
    }
}
