use std::io;

use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Requested {requested} tokens exceeds limiter burst of {burst}")]
    ExceedsBurst { requested: u64, burst: u64 },

    #[error("Wait for {requested} tokens would exceed context deadline")]
    WouldExceedDeadline { requested: u64 },

    #[error("Context deadline exceeded")]
    DeadlineExceeded,

    #[error("Wait cancelled: {context}")]
    Cancelled { context: String },
}

pub type Result<T> = std::result::Result<T, RateLimitError>;

// Never map to Interrupted; std::io helpers retry those reads in a loop.
impl From<RateLimitError> for io::Error {
    fn from(value: RateLimitError) -> Self {
        let kind = match value {
            RateLimitError::WouldExceedDeadline { .. } | RateLimitError::DeadlineExceeded => io::ErrorKind::TimedOut,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, value)
    }
}
