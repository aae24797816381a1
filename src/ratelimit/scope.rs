//! Consumer scope identification.

use serde::{Deserialize, Serialize};

/// The entity a rate limit applies to.
///
/// There is exactly one site-wide consumer and one consumer per API client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerScope {
    /// The site-wide consumer shared by all traffic
    Global,
    /// A single API client, identified by its client id
    Client(String),
}

impl ConsumerScope {
    /// Create a client scope.
    pub fn client(id: impl Into<String>) -> Self {
        ConsumerScope::Client(id.into())
    }

    /// Map an optional (possibly empty) client id to a scope.
    ///
    /// Missing and empty ids select the site-wide consumer.
    pub fn from_client_id(id: Option<&str>) -> Self {
        match id {
            Some(id) if !id.is_empty() => ConsumerScope::client(id),
            _ => ConsumerScope::Global,
        }
    }

    /// The client id, if this is a client scope.
    pub fn client_id(&self) -> Option<&str> {
        match self {
            ConsumerScope::Global => None,
            ConsumerScope::Client(id) => Some(id),
        }
    }

    /// Short label used in logs and response metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsumerScope::Global => "global",
            ConsumerScope::Client(_) => "client",
        }
    }
}

impl std::fmt::Display for ConsumerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumerScope::Global => write!(f, "global"),
            ConsumerScope::Client(id) => write!(f, "client:{}", id),
        }
    }
}
