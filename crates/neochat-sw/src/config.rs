//! Worker configuration.

use std::path::Path;
use std::time::Duration;

use neochat_common::RetryConfig;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::version::CacheVersion;
use crate::ServiceWorkerError;

/// Everything the offline worker needs to know about the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Root URL of the application. Seed paths resolve against it and
    /// notification clicks focus or open it.
    pub root_url: Url,

    /// The current cache bucket.
    pub cache_version: CacheVersion,

    /// Paths pre-cached at install time, in order.
    pub seed_files: Vec<String>,

    /// Ask to skip the waiting phase as soon as install succeeds.
    pub skip_waiting_on_install: bool,

    /// Retry policy for individual seed fetches.
    pub seed_retry: SeedRetryPolicy,

    /// Push notification settings.
    pub notifications: NotificationConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            root_url: Url::parse("http://localhost:3000/").expect("static URL is valid"),
            cache_version: CacheVersion::default(),
            seed_files: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
                "/icon-192.png".to_string(),
                "/icon-512.png".to_string(),
            ],
            skip_waiting_on_install: true,
            seed_retry: SeedRetryPolicy::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Config for an application served at `root_url`, everything else default.
    pub fn for_root(root_url: Url) -> Self {
        Self {
            root_url,
            ..Default::default()
        }
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ServiceWorkerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ServiceWorkerError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ServiceWorkerError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ServiceWorkerError::ConfigError(format!("{}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        if self.root_url.cannot_be_a_base() {
            return Err(ServiceWorkerError::ConfigError(format!(
                "root URL {} cannot be a base",
                self.root_url
            )));
        }
        self.seed_urls().map(|_| ())
    }

    /// Seed paths resolved against the root URL.
    pub fn seed_urls(&self) -> Result<Vec<Url>, ServiceWorkerError> {
        self.seed_files
            .iter()
            .map(|path| {
                self.root_url.join(path).map_err(|e| {
                    ServiceWorkerError::ConfigError(format!("invalid seed path '{path}': {e}"))
                })
            })
            .collect()
    }
}

/// How hard to try each seed file before giving up on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SeedRetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
}

impl Default for SeedRetryPolicy {
    fn default() -> Self {
        // Single attempt: a failed seed is skipped, never retried
        Self {
            max_attempts: 1,
            initial_delay_ms: 250,
        }
    }
}

impl SeedRetryPolicy {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            ..RetryConfig::default()
        }
    }
}

/// Fixed parts of every push notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NotificationConfig {
    pub title: String,
    /// Body used when a push carries no payload.
    pub default_body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    pub require_interaction: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            title: "NeoChat".to_string(),
            default_body: "You have a new message".to_string(),
            icon: "/icon-192.png".to_string(),
            badge: "/icon-192.png".to_string(),
            tag: "neochat-message".to_string(),
            require_interaction: false,
        }
    }
}
