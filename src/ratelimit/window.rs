//! Sliding-window admission for a single consumer.
//!
//! A true sliding window would need every request timestamp. Instead the
//! previous fixed window's total is weighted by how much of it still overlaps
//! the sliding window and added to the current window's total:
//!
//! ```text
//! blended = round(prev * (window - elapsed) / window) + current
//! ```
//!
//! Admission (`has_capacity`) and charging (`add_value`) are independent
//! store operations, so concurrent requests may each see capacity and
//! together overshoot the limit by up to one batch of in-flight cost.

use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::rules::LimitSettings;
use super::scope::ConsumerScope;
use super::state::{unix_now, RateLimitState, CLOCK_SKEW_TOLERANCE_SECS};
use crate::error::{CostWindowError, Result};
use crate::store::RateLimitStore;

/// A consumer's window state together with the store it lives in.
pub struct SlidingWindow {
    store: Arc<dyn RateLimitStore>,
    settings: LimitSettings,
    state: RateLimitState,
}

impl SlidingWindow {
    /// Load the window of a consumer, creating its row on first use.
    pub async fn load(
        store: Arc<dyn RateLimitStore>,
        scope: ConsumerScope,
        settings: LimitSettings,
    ) -> Result<Self> {
        let limit = settings.effective_limit(&scope);
        let state = store.load_or_create(&scope, limit, unix_now()).await?;

        Ok(Self {
            store,
            settings,
            state,
        })
    }

    /// The cached state as of the last store read.
    pub fn state(&self) -> &RateLimitState {
        &self.state
    }

    /// The consumer this window belongs to.
    pub fn scope(&self) -> &ConsumerScope {
        &self.state.scope
    }

    /// Decide whether a request of `cost` fits in the window.
    ///
    /// Rotates the windows first if the current one has expired. The cost is
    /// not recorded; call [`SlidingWindow::add_value`] once the work is done.
    ///
    /// Clock anomalies fail open: a reset time more than
    /// [`CLOCK_SKEW_TOLERANCE_SECS`] in the future admits the request.
    pub async fn has_capacity(&mut self, cost: u64, window_secs: i64, now: Option<i64>) -> Result<bool> {
        if window_secs <= 0 {
            return Err(CostWindowError::InvalidWindow(window_secs));
        }

        let now = now.unwrap_or_else(unix_now);
        let mut elapsed = match self.state.current_window_reset_time {
            Some(reset) => now - reset,
            None => window_secs + 1,
        };

        if elapsed < 0 {
            if elapsed > -CLOCK_SKEW_TOLERANCE_SECS {
                elapsed = 0;
            } else {
                warn!(
                    scope = %self.state.scope,
                    reset_time = ?self.state.current_window_reset_time,
                    now = now,
                    "Window reset time is in the future; check clock sync between hosts"
                );
                return Ok(true);
            }
        }

        if elapsed > window_secs {
            self.rotate_values(Some(now)).await?;
            elapsed = 0;
        }

        let Some(limit) = self.state.current_limit else {
            return Ok(true);
        };

        if cost > limit {
            debug!(scope = %self.state.scope, cost = cost, limit = limit, "Cost exceeds the whole limit");
            return Ok(false);
        }

        if elapsed < window_secs {
            let blended = self.blended_rate(window_secs, elapsed);
            let allowed = blended.saturating_add(cost) <= limit;
            trace!(
                scope = %self.state.scope,
                elapsed = elapsed,
                blended = blended,
                cost = cost,
                limit = limit,
                allowed = allowed,
                "Checked window capacity"
            );
            return Ok(allowed);
        }

        // Exactly on the boundary: a concurrent rotation raced ours
        Ok(true)
    }

    /// Atomically add `cost` to the current window and refresh the cached state.
    pub async fn add_value(&mut self, cost: u64) -> Result<()> {
        self.store.increment(&self.state.scope, cost).await?;
        self.refresh().await
    }

    /// Shift the current window into the previous one and start a new window at `now`.
    ///
    /// The limit is re-resolved from the settings. The update only applies if
    /// the row still has the reset time this window last read; either way the
    /// cached state is re-read afterwards. Returns whether this call rotated.
    pub async fn rotate_values(&mut self, now: Option<i64>) -> Result<bool> {
        let now = now.unwrap_or_else(unix_now);
        let limit = self.settings.effective_limit(&self.state.scope);

        let rotated = self
            .store
            .rotate(
                &self.state.scope,
                self.state.current_window_reset_time,
                now,
                limit,
            )
            .await?;

        debug!(
            scope = %self.state.scope,
            rotated = rotated,
            prev_window_value = self.state.current_window_value,
            limit = ?limit,
            "Rotated rate limit window"
        );

        self.refresh().await?;
        Ok(rotated)
    }

    /// Re-read the cached state from the store.
    pub async fn refresh(&mut self) -> Result<()> {
        let limit = self.settings.effective_limit(&self.state.scope);
        self.state = self
            .store
            .load_or_create(&self.state.scope, limit, unix_now())
            .await?;
        Ok(())
    }

    fn blended_rate(&self, window_secs: i64, elapsed: i64) -> u64 {
        let remaining = (window_secs - elapsed) as f64 / window_secs as f64;
        let weighted = (self.state.prev_window_value as f64 * remaining).round() as u64;
        weighted.saturating_add(self.state.current_window_value)
    }
}

impl std::fmt::Debug for SlidingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindow")
            .field("state", &self.state)
            .field("settings", &self.settings)
            .finish()
    }
}
