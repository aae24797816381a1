//! Admission control across the site-wide and per-client consumers.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use super::accumulator::CostAccumulator;
use super::rules::LimitSettings;
use super::scope::ConsumerScope;
use super::state::{unix_now, RateLimitState, DEFAULT_WINDOW_SECS};
use super::window::SlidingWindow;
use crate::config::RateLimitingConfig;
use crate::error::Result;
use crate::store::RateLimitStore;

/// Default interval between writes of accumulated cost.
pub const DEFAULT_FLUSH_INTERVAL_SECS: i64 = 1;

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The consumer whose limit rejected the request
    pub denied_by: Option<ConsumerScope>,
    /// Seconds until the site-wide window rotates
    pub duration_until_reset: i64,
}

impl Decision {
    fn allow(duration_until_reset: i64) -> Self {
        Self {
            allowed: true,
            denied_by: None,
            duration_until_reset,
        }
    }
}

/// The caller-facing rate limiter.
///
/// Every request is subject to the site-wide limit and, when it comes from an
/// API client, to that client's limit as well. Callers check capacity before
/// doing the work and record the actual cost afterwards; recorded cost is
/// batched per consumer and written at most once per flush interval.
pub struct RateLimiter {
    /// Shared backing store
    store: Arc<dyn RateLimitStore>,
    /// Limits, replaceable at runtime
    settings: RwLock<LimitSettings>,
    /// Window length in seconds
    window_secs: i64,
    /// Minimum seconds between writes for one consumer
    flush_interval_secs: i64,
    /// Cost recorded but not yet written, per consumer
    pending: DashMap<ConsumerScope, CostAccumulator>,
}

impl RateLimiter {
    /// Create a rate limiter with the default window and flush interval.
    pub fn new(store: Arc<dyn RateLimitStore>, settings: LimitSettings) -> Self {
        Self {
            store,
            settings: RwLock::new(settings),
            window_secs: DEFAULT_WINDOW_SECS,
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            pending: DashMap::new(),
        }
    }

    /// Create a rate limiter from the service configuration.
    pub fn from_config(
        store: Arc<dyn RateLimitStore>,
        config: &RateLimitingConfig,
        settings: LimitSettings,
    ) -> Self {
        Self::new(store, settings)
            .with_window_secs(config.window_secs)
            .with_flush_interval_secs(config.flush_interval_secs)
    }

    /// Set the window length.
    pub fn with_window_secs(mut self, window_secs: i64) -> Self {
        self.window_secs = window_secs;
        self
    }

    /// Set the minimum time between cost writes for a consumer.
    pub fn with_flush_interval_secs(mut self, flush_interval_secs: i64) -> Self {
        self.flush_interval_secs = flush_interval_secs;
        self
    }

    /// Window length in seconds.
    pub fn window_secs(&self) -> i64 {
        self.window_secs
    }

    /// Get the current settings.
    pub fn settings(&self) -> LimitSettings {
        self.settings.read().clone()
    }

    /// Replace the settings. New limits take effect at each consumer's next rotation.
    pub fn set_settings(&self, settings: LimitSettings) {
        let mut current = self.settings.write();
        *current = settings;
    }

    /// Load the window of a consumer.
    pub async fn window(&self, scope: ConsumerScope) -> Result<SlidingWindow> {
        SlidingWindow::load(self.store.clone(), scope, self.settings()).await
    }

    /// Read the stored state of a consumer, creating its row on first use.
    pub async fn state(&self, scope: ConsumerScope) -> Result<RateLimitState> {
        Ok(self.window(scope).await?.state().clone())
    }

    /// Decide whether a request of `cost` may proceed.
    pub async fn check(&self, client_id: Option<&str>, cost: u64, now: Option<i64>) -> Result<Decision> {
        let now = now.unwrap_or_else(unix_now);
        let mut duration_until_reset = 0;

        for scope in scopes(client_id) {
            let mut window = self.window(scope).await?;
            let allowed = window.has_capacity(cost, self.window_secs, Some(now)).await?;

            if *window.scope() == ConsumerScope::Global {
                duration_until_reset = window.state().seconds_until_reset(self.window_secs, now);
            }

            if !allowed {
                debug!(scope = %window.scope(), cost = cost, "Rate limit exceeded");
                return Ok(Decision {
                    allowed: false,
                    denied_by: Some(window.scope().clone()),
                    duration_until_reset,
                });
            }
        }

        trace!(client_id = ?client_id, cost = cost, "Request admitted");
        Ok(Decision::allow(duration_until_reset))
    }

    /// Charge `cost` to every consumer the request counts against.
    ///
    /// The cost is written once the consumer's flush interval has passed.
    /// Returns whether anything was written.
    pub async fn record(&self, client_id: Option<&str>, cost: u64, now: Option<i64>) -> Result<bool> {
        let now = now.unwrap_or_else(unix_now);

        // Every consumer is charged before any write can fail
        let due: Vec<(ConsumerScope, u64)> = scopes(client_id)
            .into_iter()
            .filter_map(|scope| {
                let mut acc = self.pending.entry(scope.clone()).or_default();
                acc.add(cost);
                let amount = acc.take_if_due(now, self.flush_interval_secs);
                drop(acc);
                amount.map(|amount| (scope, amount))
            })
            .collect();

        Ok(self.write_all(due).await? > 0)
    }

    /// Charge `cost` and write everything pending for the request's consumers now.
    ///
    /// Used when the work aborted, so that its cost is accounted for before
    /// the error reaches the client. Returns whether anything was written.
    pub async fn record_now(&self, client_id: Option<&str>, cost: u64) -> Result<bool> {
        let now = unix_now();

        let due: Vec<(ConsumerScope, u64)> = scopes(client_id)
            .into_iter()
            .map(|scope| {
                let mut acc = self.pending.entry(scope.clone()).or_default();
                acc.add(cost);
                let amount = acc.take(now);
                drop(acc);
                (scope, amount)
            })
            .filter(|(_, amount)| *amount > 0)
            .collect();

        Ok(self.write_all(due).await? > 0)
    }

    /// Write all pending cost. Returns the number of consumers written.
    pub async fn flush_all(&self) -> Result<usize> {
        let now = unix_now();
        let drained: Vec<(ConsumerScope, u64)> = self
            .pending
            .iter_mut()
            .filter(|acc| acc.pending() > 0)
            .map(|mut acc| {
                let amount = acc.take(now);
                (acc.key().clone(), amount)
            })
            .collect();

        self.write_all(drained).await
    }

    /// Cost recorded for a consumer but not yet written.
    pub fn pending_cost(&self, scope: &ConsumerScope) -> u64 {
        self.pending.get(scope).map(|acc| acc.pending()).unwrap_or(0)
    }

    /// Attempt every write, then report the first failure.
    async fn write_all(&self, due: Vec<(ConsumerScope, u64)>) -> Result<usize> {
        let count = due.len();
        let results = futures::future::join_all(
            due.into_iter()
                .map(|(scope, amount)| self.write(scope, amount)),
        )
        .await;

        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(count)
    }

    async fn write(&self, scope: ConsumerScope, amount: u64) -> Result<()> {
        let result = match self.window(scope.clone()).await {
            Ok(mut window) => window.add_value(amount).await,
            Err(e) => Err(e),
        };

        if let Err(ref e) = result {
            warn!(scope = %scope, cost = amount, error = %e, "Failed to write cost; keeping it pending");
            self.pending.entry(scope).or_default().add(amount);
        }

        result
    }
}

/// Consumers a request counts against, site-wide first.
fn scopes(client_id: Option<&str>) -> Vec<ConsumerScope> {
    match ConsumerScope::from_client_id(client_id) {
        ConsumerScope::Global => vec![ConsumerScope::Global],
        client => vec![ConsumerScope::Global, client],
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("window_secs", &self.window_secs)
            .field("flush_interval_secs", &self.flush_interval_secs)
            .field("pending_consumers", &self.pending.len())
            .finish()
    }
}
