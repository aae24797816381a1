//! Sliding-window rate limiting logic and state.

mod accumulator;
mod limiter;
mod rules;
mod scope;
mod state;
mod window;

pub use accumulator::CostAccumulator;
pub use limiter::{Decision, RateLimiter, DEFAULT_FLUSH_INTERVAL_SECS};
pub use rules::{ClientSettings, LimitSettings};
pub use scope::ConsumerScope;
pub use state::{unix_now, RateLimitState, CLOCK_SKEW_TOLERANCE_SECS, DEFAULT_WINDOW_SECS};
pub use window::SlidingWindow;
