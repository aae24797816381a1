//! Backing stores for consumer window state.
//!
//! The store is the only state shared between request handlers, so every
//! mutation it offers is a single atomic operation: an in-place increment or a
//! rotation guarded by the previously observed window reset time.

mod memory;
mod sql;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;
use crate::ratelimit::{ConsumerScope, RateLimitState};

pub use memory::MemoryStore;
pub use sql::SqlStore;

/// Storage for per-consumer rate limit rows.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Fetch the row of a consumer, if it has one.
    async fn load(&self, scope: &ConsumerScope) -> Result<Option<RateLimitState>>;

    /// Create a zeroed row for a consumer.
    ///
    /// If another writer created the row first, that row is returned instead.
    async fn create(
        &self,
        scope: &ConsumerScope,
        limit: Option<u64>,
        now: i64,
    ) -> Result<RateLimitState>;

    /// Fetch the row of a consumer, creating it on first use.
    async fn load_or_create(
        &self,
        scope: &ConsumerScope,
        limit: Option<u64>,
        now: i64,
    ) -> Result<RateLimitState> {
        match self.load(scope).await? {
            Some(state) => Ok(state),
            None => self.create(scope, limit, now).await,
        }
    }

    /// Atomically add `cost` to the current window value.
    async fn increment(&self, scope: &ConsumerScope, cost: u64) -> Result<()>;

    /// Rotate windows if the row's reset time still equals `expected_reset`.
    ///
    /// Returns `true` if this call performed the rotation and `false` if the
    /// row had already moved on.
    async fn rotate(
        &self,
        scope: &ConsumerScope,
        expected_reset: Option<i64>,
        now: i64,
        limit: Option<u64>,
    ) -> Result<bool>;
}

/// Open the store selected by the configuration.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn RateLimitStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory rate limit store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Sqlite => {
            let store = SqlStore::connect(&config.database_url).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}
