//! Versioned cache bucket identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ServiceWorkerError;

/// Identifies one cache bucket: an application prefix plus a version number.
///
/// Rendered as `{prefix}-v{version}`, e.g. `neochat-v3`. Buckets are compared
/// structurally; a stored name that does not parse is never the current one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheVersion {
    pub prefix: String,
    pub version: u32,
}

impl CacheVersion {
    pub fn new(prefix: impl Into<String>, version: u32) -> Self {
        Self {
            prefix: prefix.into(),
            version,
        }
    }

    /// The bucket name used with cache storage.
    pub fn cache_name(&self) -> String {
        self.to_string()
    }

    /// The same prefix with the version bumped by one.
    pub fn next(&self) -> Self {
        Self::new(self.prefix.clone(), self.version.saturating_add(1))
    }
}

impl Default for CacheVersion {
    fn default() -> Self {
        Self::new("neochat", 1)
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-v{}", self.prefix, self.version)
    }
}

impl FromStr for CacheVersion {
    type Err = ServiceWorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ServiceWorkerError::InvalidCacheName(s.to_string());

        let (prefix, version) = s.rsplit_once("-v").ok_or_else(invalid)?;
        if prefix.is_empty() || version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        // One spelling per version: "v01" is not "v1"
        if version.len() > 1 && version.starts_with('0') {
            return Err(invalid());
        }
        let version = version.parse().map_err(|_| invalid())?;

        Ok(Self::new(prefix, version))
    }
}
