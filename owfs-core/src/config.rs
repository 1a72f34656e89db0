//! Session configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::OwfsResult;

/// Tunables of a [`Session`](crate::Session).
///
/// Every field has a default, so an empty JSON object is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Decoded pages kept in the page cache.
    pub cache_capacity: usize,
    /// Redirections followed by a single page read before giving up.
    /// One more lookup than this is made, so 256 allows 257 lookups.
    pub max_redirect_hops: usize,
    /// Page visits allowed during one program job commit.
    pub commit_iteration_cap: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 64,
            max_redirect_hops: 256,
            commit_iteration_cap: 20480,
        }
    }
}

impl SessionConfig {
    /// Load a config from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> OwfsResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.max_redirect_hops, 256);
    }

    #[test]
    fn test_partial_override() {
        let config: SessionConfig = serde_json::from_str(r#"{"cacheCapacity": 0}"#).unwrap();
        assert_eq!(config.cache_capacity, 0);
        assert_eq!(config.commit_iteration_cap, 20480);
    }
}
