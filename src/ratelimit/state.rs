//! Persisted window state of a single consumer.

use serde::{Deserialize, Serialize};

use super::scope::ConsumerScope;

/// Number of seconds a window reset time may lie in the future before it is
/// considered clock desync rather than skew.
pub const CLOCK_SKEW_TOLERANCE_SECS: i64 = 5;

/// Default window length.
pub const DEFAULT_WINDOW_SECS: i64 = 60;

/// Two windows' accumulated cost for one consumer, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    /// Store row id
    pub id: i64,
    /// The consumer this row belongs to
    pub scope: ConsumerScope,
    /// Cost accumulated in the window preceding the current one
    pub prev_window_value: u64,
    /// Cost accumulated since `current_window_reset_time`
    pub current_window_value: u64,
    /// Start of the current window; `None` until the first rotation
    pub current_window_reset_time: Option<i64>,
    /// Maximum cost per window; `None` means unlimited
    pub current_limit: Option<u64>,
    /// When the row was created
    pub time_created: i64,
}

impl RateLimitState {
    /// A fresh row with zeroed counters.
    pub fn new(id: i64, scope: ConsumerScope, current_limit: Option<u64>, time_created: i64) -> Self {
        Self {
            id,
            scope,
            prev_window_value: 0,
            current_window_value: 0,
            current_window_reset_time: None,
            current_limit,
            time_created,
        }
    }

    /// Seconds until the current window ends, relative to `now`.
    pub fn seconds_until_reset(&self, window_secs: i64, now: i64) -> i64 {
        match self.current_window_reset_time {
            Some(reset) => (reset + window_secs - now).clamp(0, window_secs),
            None => 0,
        }
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_zeroed() {
        let state = RateLimitState::new(1, ConsumerScope::Global, Some(100), 1_700_000_000);
        assert_eq!(state.prev_window_value, 0);
        assert_eq!(state.current_window_value, 0);
        assert_eq!(state.current_window_reset_time, None);
        assert_eq!(state.current_limit, Some(100));
    }

    #[test]
    fn test_seconds_until_reset() {
        let mut state = RateLimitState::new(1, ConsumerScope::Global, None, 0);
        assert_eq!(state.seconds_until_reset(60, 1000), 0);

        state.current_window_reset_time = Some(1000);
        assert_eq!(state.seconds_until_reset(60, 1015), 45);
        assert_eq!(state.seconds_until_reset(60, 1200), 0);
        // Reset time in the future never reports more than a full window
        assert_eq!(state.seconds_until_reset(60, 990), 60);
    }
}
