//! In-process store for single-instance deployments and tests.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::RateLimitStore;
use crate::error::Result;
use crate::ratelimit::{ConsumerScope, RateLimitState};

/// A store holding every consumer row in memory.
///
/// Each row lives in a `DashMap` shard, so an increment or rotation holds the
/// shard lock for its whole read-compare-write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: DashMap<ConsumerScope, RateLimitState>,
    next_id: AtomicI64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of consumers with a row.
    pub fn consumer_count(&self) -> usize {
        self.rows.len()
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn load(&self, scope: &ConsumerScope) -> Result<Option<RateLimitState>> {
        Ok(self.rows.get(scope).map(|row| row.value().clone()))
    }

    async fn create(
        &self,
        scope: &ConsumerScope,
        limit: Option<u64>,
        now: i64,
    ) -> Result<RateLimitState> {
        let row = self.rows.entry(scope.clone()).or_insert_with(|| {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            RateLimitState::new(id, scope.clone(), limit, now)
        });
        Ok(row.value().clone())
    }

    async fn increment(&self, scope: &ConsumerScope, cost: u64) -> Result<()> {
        if let Some(mut row) = self.rows.get_mut(scope) {
            row.current_window_value = row.current_window_value.saturating_add(cost);
            trace!(scope = %scope, value = row.current_window_value, "Incremented window value");
        }
        Ok(())
    }

    async fn rotate(
        &self,
        scope: &ConsumerScope,
        expected_reset: Option<i64>,
        now: i64,
        limit: Option<u64>,
    ) -> Result<bool> {
        let Some(mut row) = self.rows.get_mut(scope) else {
            return Ok(false);
        };

        if row.current_window_reset_time != expected_reset {
            return Ok(false);
        }

        row.prev_window_value = row.current_window_value;
        row.current_window_value = 0;
        row.current_window_reset_time = Some(now);
        row.current_limit = limit;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = MemoryStore::new();
        let scope = ConsumerScope::client("abc");

        let first = store.create(&scope, Some(10), 1000).await.unwrap();
        let second = store.create(&scope, Some(99), 2000).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.current_limit, Some(10));
        assert_eq!(store.consumer_count(), 1);
    }

    #[tokio::test]
    async fn test_separate_scopes_get_separate_rows() {
        let store = MemoryStore::new();

        let global = store.load_or_create(&ConsumerScope::Global, None, 0).await.unwrap();
        let client = store
            .load_or_create(&ConsumerScope::client("abc"), None, 0)
            .await
            .unwrap();

        assert_ne!(global.id, client.id);
        assert_eq!(store.consumer_count(), 2);
    }

    #[tokio::test]
    async fn test_increment() {
        let store = MemoryStore::new();
        let scope = ConsumerScope::Global;
        store.create(&scope, None, 0).await.unwrap();

        store.increment(&scope, 5).await.unwrap();
        store.increment(&scope, 3).await.unwrap();

        let state = store.load(&scope).await.unwrap().unwrap();
        assert_eq!(state.current_window_value, 8);
    }

    #[tokio::test]
    async fn test_increment_missing_row_is_noop() {
        let store = MemoryStore::new();
        store.increment(&ConsumerScope::Global, 5).await.unwrap();
        assert!(store.load(&ConsumerScope::Global).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rotate_compares_reset_time() {
        let store = MemoryStore::new();
        let scope = ConsumerScope::Global;
        store.create(&scope, None, 0).await.unwrap();
        store.increment(&scope, 7).await.unwrap();

        assert!(store.rotate(&scope, None, 1000, Some(50)).await.unwrap());
        // Same stale guard loses
        assert!(!store.rotate(&scope, None, 1001, Some(60)).await.unwrap());

        let state = store.load(&scope).await.unwrap().unwrap();
        assert_eq!(state.prev_window_value, 7);
        assert_eq!(state.current_window_value, 0);
        assert_eq!(state.current_window_reset_time, Some(1000));
        assert_eq!(state.current_limit, Some(50));
    }
}
