//! Cancellation context handed to limiter waits.
//!
//! A [`WaitContext`] built with [`WaitContext::background`] is never cancelled,
//! has no deadline and carries no values; waits made under it can block for as
//! long as the limiter requires. Callers that need to bound or abort a wait
//! attach a [`CancellationToken`] and/or a deadline.

use std::borrow::Cow;
use std::fmt;

use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::RateLimitError;

const BACKGROUND_CONTEXT_NAME: &str = "WaitContext.Background";

#[derive(Clone, Debug)]
pub struct WaitContext {
    name: Cow<'static, str>,
    cancellation: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl Default for WaitContext {
    fn default() -> Self {
        Self::background()
    }
}

impl WaitContext {
    pub fn background() -> Self {
        Self::named(BACKGROUND_CONTEXT_NAME)
    }

    /// A never-cancelled context with a custom diagnostic name.
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            cancellation: None,
            deadline: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the deadline `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation_token(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// True if this context can never end a wait early.
    pub fn is_background(&self) -> bool {
        self.cancellation.is_none() && self.deadline.is_none()
    }

    /// The reason this context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<RateLimitError> {
        if self.is_cancelled() {
            return Some(self.cancelled_error());
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(RateLimitError::DeadlineExceeded),
            _ => None,
        }
    }

    /// The error a wait under this context fails with once it is cancelled.
    pub fn cancelled_error(&self) -> RateLimitError {
        RateLimitError::Cancelled {
            context: self.name.to_string(),
        }
    }
}

impl fmt::Display for WaitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
