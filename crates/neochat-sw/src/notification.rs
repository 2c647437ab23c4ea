//! Notification descriptors and the surface that displays them.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::ServiceWorkerError;

/// Unique identifier for a displayed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Options for one notification, built fresh for each push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationDescriptor {
    pub body: String,
    pub icon: String,
    pub badge: String,
    /// Notifications sharing a tag replace each other.
    pub tag: String,
    pub require_interaction: bool,
}

/// A notification currently on screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub descriptor: NotificationDescriptor,
}

/// Where notifications are shown to the user.
#[async_trait]
pub trait NotificationSurface: Send + Sync {
    /// Show a notification, replacing any visible one with the same tag.
    async fn show(
        &self,
        title: &str,
        descriptor: NotificationDescriptor,
    ) -> Result<Notification, ServiceWorkerError>;

    /// Close a notification. Closing one that is gone is not an error.
    async fn close(&self, id: NotificationId) -> Result<(), ServiceWorkerError>;
}

/// In-memory notification surface.
#[derive(Debug, Default)]
pub struct NotificationCenter {
    visible: RwLock<Vec<Notification>>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications currently on screen, oldest first.
    pub async fn visible(&self) -> Vec<Notification> {
        self.visible.read().await.clone()
    }
}

#[async_trait]
impl NotificationSurface for NotificationCenter {
    async fn show(
        &self,
        title: &str,
        descriptor: NotificationDescriptor,
    ) -> Result<Notification, ServiceWorkerError> {
        let notification = Notification {
            id: NotificationId::new(),
            title: title.to_string(),
            descriptor,
        };

        let mut visible = self.visible.write().await;
        let before = visible.len();
        visible.retain(|n| n.descriptor.tag != notification.descriptor.tag);
        if visible.len() != before {
            debug!(tag = %notification.descriptor.tag, "Replacing notification with same tag");
        }
        visible.push(notification.clone());

        Ok(notification)
    }

    async fn close(&self, id: NotificationId) -> Result<(), ServiceWorkerError> {
        self.visible.write().await.retain(|n| n.id != id);
        Ok(())
    }
}
