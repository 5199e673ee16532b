#![cfg_attr(feature = "strict", deny(warnings))]

pub mod async_throttled_reader;
pub use async_throttled_reader::AsyncThrottledReader;

pub mod config;
pub use config::BandwidthLimitConfig;

mod read_close;
pub use read_close::{BoxReadClose, ReadClose};

pub mod registry;
pub use registry::{BoxAsyncRead, LimitDomain, LimiterRegistry};

pub mod throttled_reader;
pub use throttled_reader::{ThrottledRead, ThrottledReader};

// Re-export so callers don't need a direct dependency to build limiters and contexts.
pub use rate_limiter::{RateLimitError, RateLimiter, WaitContext};

#[cfg(test)]
pub(crate) mod test_utils;
