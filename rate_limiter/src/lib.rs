#![cfg_attr(feature = "strict", deny(warnings))]

mod bucket;
pub use bucket::Reservation;

pub mod context;
pub use context::WaitContext;

pub mod error;
pub use error::{RateLimitError, Result};

mod limiter;
pub use limiter::RateLimiter;
