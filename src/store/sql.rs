//! SQLite-backed store shared by every service instance pointing at the same
//! database.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use super::RateLimitStore;
use crate::error::Result;
use crate::ratelimit::{ConsumerScope, RateLimitState};

const CREATE_GLOBAL_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS global_rate_limit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    prev_window_value INTEGER NOT NULL DEFAULT 0,
    current_window_value INTEGER NOT NULL DEFAULT 0,
    current_window_reset_time INTEGER,
    current_limit INTEGER,
    time_created INTEGER NOT NULL
)
"#;

const CREATE_CLIENT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS client_rate_limit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id TEXT NOT NULL UNIQUE,
    prev_window_value INTEGER NOT NULL DEFAULT 0,
    current_window_value INTEGER NOT NULL DEFAULT 0,
    current_window_reset_time INTEGER,
    current_limit INTEGER,
    time_created INTEGER NOT NULL
)
"#;

/// A store persisting consumer rows in SQLite.
#[derive(Debug, Clone)]
pub struct SqlStore {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct StateRow {
    id: i64,
    prev_window_value: i64,
    current_window_value: i64,
    current_window_reset_time: Option<i64>,
    current_limit: Option<i64>,
    time_created: i64,
}

impl StateRow {
    fn into_state(self, scope: &ConsumerScope) -> RateLimitState {
        RateLimitState {
            id: self.id,
            scope: scope.clone(),
            prev_window_value: from_db(self.prev_window_value),
            current_window_value: from_db(self.current_window_value),
            current_window_reset_time: self.current_window_reset_time,
            current_limit: self.current_limit.map(from_db),
            time_created: self.time_created,
        }
    }
}

impl SqlStore {
    /// Wrap an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `url`, creating the file if needed.
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url = %url, "Connecting to rate limit database");

        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Every connection to an in-memory database sees a different database
        let max_connections = if url.contains(":memory:") { 1 } else { 8 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Create the rate limit tables if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_GLOBAL_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_CLIENT_TABLE).execute(&self.pool).await?;
        debug!("Rate limit tables ready");
        Ok(())
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Table holding the rows of a scope.
fn table(scope: &ConsumerScope) -> &'static str {
    match scope {
        ConsumerScope::Global => "global_rate_limit",
        ConsumerScope::Client(_) => "client_rate_limit",
    }
}

/// Row selector of a scope. The global consumer is the latest row by id.
fn row_filter(scope: &ConsumerScope) -> &'static str {
    match scope {
        ConsumerScope::Global => "id = (SELECT MAX(id) FROM global_rate_limit)",
        ConsumerScope::Client(_) => "client_id = ?",
    }
}

fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl RateLimitStore for SqlStore {
    async fn load(&self, scope: &ConsumerScope) -> Result<Option<RateLimitState>> {
        let sql = format!(
            "SELECT id, prev_window_value, current_window_value, current_window_reset_time, \
             current_limit, time_created FROM {} WHERE {}",
            table(scope),
            row_filter(scope)
        );

        let mut query = sqlx::query_as::<_, StateRow>(&sql);
        if let Some(client_id) = scope.client_id() {
            query = query.bind(client_id);
        }

        let row = query.fetch_optional(&self.pool).await?;
        Ok(row.map(|r| r.into_state(scope)))
    }

    async fn create(
        &self,
        scope: &ConsumerScope,
        limit: Option<u64>,
        now: i64,
    ) -> Result<RateLimitState> {
        let limit = limit.map(to_db);

        match scope {
            ConsumerScope::Global => {
                sqlx::query(
                    r#"
                    INSERT INTO global_rate_limit
                        (prev_window_value, current_window_value, current_window_reset_time,
                         current_limit, time_created)
                    SELECT 0, 0, NULL, ?, ?
                    WHERE NOT EXISTS (SELECT 1 FROM global_rate_limit)
                    "#,
                )
                .bind(limit)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
            ConsumerScope::Client(client_id) => {
                sqlx::query(
                    r#"
                    INSERT INTO client_rate_limit
                        (client_id, prev_window_value, current_window_value,
                         current_window_reset_time, current_limit, time_created)
                    VALUES (?, 0, 0, NULL, ?, ?)
                    ON CONFLICT(client_id) DO NOTHING
                    "#,
                )
                .bind(client_id.as_str())
                .bind(limit)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
        }

        debug!(scope = %scope, "Created rate limit row");
        self.load(scope).await?.ok_or_else(|| sqlx::Error::RowNotFound.into())
    }

    async fn increment(&self, scope: &ConsumerScope, cost: u64) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET current_window_value = current_window_value + ? WHERE {}",
            table(scope),
            row_filter(scope)
        );

        let mut query = sqlx::query(&sql).bind(to_db(cost));
        if let Some(client_id) = scope.client_id() {
            query = query.bind(client_id);
        }

        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn rotate(
        &self,
        scope: &ConsumerScope,
        expected_reset: Option<i64>,
        now: i64,
        limit: Option<u64>,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET prev_window_value = current_window_value, current_window_value = 0, \
             current_window_reset_time = ?, current_limit = ? \
             WHERE {} AND current_window_reset_time IS ?",
            table(scope),
            row_filter(scope)
        );

        let mut query = sqlx::query(&sql).bind(now).bind(limit.map(to_db));
        if let Some(client_id) = scope.client_id() {
            query = query.bind(client_id);
        }

        let result = query.bind(expected_reset).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqlStore {
        let store = SqlStore::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_create_and_load_client_row() {
        let store = memory_store().await;
        let scope = ConsumerScope::client("reporting");

        assert!(store.load(&scope).await.unwrap().is_none());

        let created = store.create(&scope, Some(500), 1_700_000_000).await.unwrap();
        assert_eq!(created.scope, scope);
        assert_eq!(created.prev_window_value, 0);
        assert_eq!(created.current_window_value, 0);
        assert_eq!(created.current_window_reset_time, None);
        assert_eq!(created.current_limit, Some(500));
        assert_eq!(created.time_created, 1_700_000_000);

        // A second create keeps the first row
        let again = store.create(&scope, Some(1), 1_800_000_000).await.unwrap();
        assert_eq!(again, created);
    }

    #[tokio::test]
    async fn test_create_global_row_once() {
        let store = memory_store().await;

        let first = store.create(&ConsumerScope::Global, None, 10).await.unwrap();
        let second = store.create(&ConsumerScope::Global, Some(5), 20).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.current_limit, None);
    }

    #[tokio::test]
    async fn test_global_row_is_latest_by_id() {
        let store = memory_store().await;

        for limit in [100_i64, 200] {
            sqlx::query(
                "INSERT INTO global_rate_limit (current_limit, time_created) VALUES (?, 0)",
            )
            .bind(limit)
            .execute(store.pool())
            .await
            .unwrap();
        }

        let state = store.load(&ConsumerScope::Global).await.unwrap().unwrap();
        assert_eq!(state.current_limit, Some(200));
    }

    #[tokio::test]
    async fn test_increment_is_applied_in_place() {
        let store = memory_store().await;
        let scope = ConsumerScope::client("abc");
        store.create(&scope, None, 0).await.unwrap();

        store.increment(&scope, 40).await.unwrap();
        store.increment(&scope, 2).await.unwrap();

        let state = store.load(&scope).await.unwrap().unwrap();
        assert_eq!(state.current_window_value, 42);
    }

    #[tokio::test]
    async fn test_increment_only_touches_own_client() {
        let store = memory_store().await;
        let a = ConsumerScope::client("a");
        let b = ConsumerScope::client("b");
        store.create(&a, None, 0).await.unwrap();
        store.create(&b, None, 0).await.unwrap();

        store.increment(&a, 9).await.unwrap();

        assert_eq!(store.load(&a).await.unwrap().unwrap().current_window_value, 9);
        assert_eq!(store.load(&b).await.unwrap().unwrap().current_window_value, 0);
    }

    #[tokio::test]
    async fn test_rotate_with_stale_guard_is_noop() {
        let store = memory_store().await;
        let scope = ConsumerScope::Global;
        store.create(&scope, None, 0).await.unwrap();
        store.increment(&scope, 30).await.unwrap();

        // First rotation from a fresh (NULL) reset time wins
        assert!(store.rotate(&scope, None, 1000, Some(100)).await.unwrap());
        store.increment(&scope, 5).await.unwrap();
        // A writer still holding the NULL guard loses
        assert!(!store.rotate(&scope, None, 1001, Some(1)).await.unwrap());

        let state = store.load(&scope).await.unwrap().unwrap();
        assert_eq!(state.prev_window_value, 30);
        assert_eq!(state.current_window_value, 5);
        assert_eq!(state.current_window_reset_time, Some(1000));
        assert_eq!(state.current_limit, Some(100));

        // The current guard wins
        assert!(store.rotate(&scope, Some(1000), 1061, None).await.unwrap());
        let state = store.load(&scope).await.unwrap().unwrap();
        assert_eq!(state.prev_window_value, 5);
        assert_eq!(state.current_window_value, 0);
        assert_eq!(state.current_window_reset_time, Some(1061));
        assert_eq!(state.current_limit, None);
    }
}
