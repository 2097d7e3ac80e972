//! Rate limiting strategies and the contract they share.

pub mod clock;
mod context;
mod fixed_window;
mod request;
mod sliding_window;
mod strategy;
mod token_bucket;

pub use clock::{system_clock, Clock, ManualClock};
pub use context::{CancelHandle, Context};
pub use fixed_window::FixedWindowLimiter;
pub use request::{Decision, Outcome, Request};
pub use sliding_window::SlidingWindowLimiter;
pub use strategy::{build_strategy, Strategy, StrategyKind};
pub use token_bucket::{TokenBucketLimiter, TokenBucketSettings};
