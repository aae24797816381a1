//! Rate limit settings and limit resolution.
//!
//! Limits come from the service configuration (or a separate limits file that
//! can be reloaded at runtime). A consumer's effective limit is recomputed on
//! every window rotation and cached on its state row in between.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::scope::ConsumerScope;
use crate::error::{CostWindowError, Result};

/// Configured limits. An unset limit means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Maximum cost per window across all traffic
    #[serde(default)]
    pub site_rate_limit: Option<u64>,
    /// Default maximum cost per window for each API client
    #[serde(default)]
    pub client_rate_limit: Option<u64>,
    /// Per-client settings keyed by client id
    #[serde(default)]
    pub clients: HashMap<String, ClientSettings>,
}

/// Settings for an individual API client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// The client's own limit; capped by the per-client default when both are set
    #[serde(default)]
    pub rate_limit: Option<u64>,
}

impl LimitSettings {
    /// Settings with every limit unset.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Load settings from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit settings");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CostWindowError::Config(format!("Failed to parse rate limit settings: {}", e)))
    }

    /// Set the limit for a single client.
    pub fn with_client_limit(mut self, client_id: impl Into<String>, limit: Option<u64>) -> Self {
        self.clients
            .insert(client_id.into(), ClientSettings { rate_limit: limit });
        self
    }

    /// Resolve the limit that applies to a consumer.
    pub fn effective_limit(&self, scope: &ConsumerScope) -> Option<u64> {
        match scope {
            ConsumerScope::Global => self.site_rate_limit,
            ConsumerScope::Client(id) => {
                let own = self.clients.get(id).and_then(|c| c.rate_limit);
                match (own, self.client_rate_limit) {
                    (Some(own), Some(default)) => Some(own.min(default)),
                    (own, default) => own.or(default),
                }
            }
        }
    }
}
