use std::io::{self, Read};
use std::sync::Arc;

use rate_limiter::{RateLimitError, RateLimiter, WaitContext};
use tracing::trace;

use crate::ReadClose;

/// Diagnostic name of the context readers wait under unless given another one.
pub const THROTTLED_READER_CONTEXT: &str = "ThrottledReader.Context";

/// Outcome of one throttled read.
///
/// The bytes are in the caller's buffer even when `wait_result` is an error;
/// the limiter wait happens only after the inner stream has produced them.
#[derive(Debug)]
pub struct ThrottledRead {
    pub bytes_read: usize,
    pub wait_result: Result<(), RateLimitError>,
}

/// Decorates a readable stream so that every byte it produces is paid for with
/// one token from a shared [`RateLimiter`] before the read returns.
///
/// Reads that produce no bytes (end of stream or an inner error) return
/// straight away without touching the limiter.
pub struct ThrottledReader<R> {
    inner: R,
    limiter: Arc<RateLimiter>,
    context: WaitContext,

    /// Limiter error from a read that already handed its bytes to the caller.
    deferred_error: Option<RateLimitError>,
}

impl<R: Read> ThrottledReader<R> {
    pub fn new(inner: R, limiter: Arc<RateLimiter>) -> Self {
        Self::with_context(inner, limiter, WaitContext::named(THROTTLED_READER_CONTEXT))
    }

    pub fn with_context(inner: R, limiter: Arc<RateLimiter>, context: WaitContext) -> Self {
        Self {
            inner,
            limiter,
            context,
            deferred_error: None,
        }
    }

    /// Reads from the inner stream, then waits for the limiter to admit the bytes produced.
    ///
    /// Inner stream errors are returned as `Err` untouched. A limiter error is
    /// reported in [`ThrottledRead::wait_result`] next to the byte count.
    pub fn read_throttled(&mut self, buf: &mut [u8]) -> io::Result<ThrottledRead> {
        let bytes_read = self.inner.read(buf)?;
        if bytes_read == 0 {
            return Ok(ThrottledRead {
                bytes_read,
                wait_result: Ok(()),
            });
        }

        let wait_result = self.limiter.wait_for(bytes_read as u64, &self.context);
        if let Err(e) = &wait_result {
            trace!("ThrottledReader: {bytes_read} bytes read but limiter wait failed: {e}");
        }

        Ok(ThrottledRead {
            bytes_read,
            wait_result,
        })
    }
}

impl<R> ThrottledReader<R> {
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn context(&self) -> &WaitContext {
        &self.context
    }
}

impl<R: Read> Read for ThrottledReader<R> {
    /// Returns the bytes of a read whose limiter wait failed as `Ok(n)`; the
    /// limiter error is then returned by the following call.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(e) = self.deferred_error.take() {
            return Err(e.into());
        }

        let ThrottledRead {
            bytes_read,
            wait_result,
        } = self.read_throttled(buf)?;

        if let Err(e) = wait_result {
            self.deferred_error = Some(e);
        }
        Ok(bytes_read)
    }
}

impl<R: ReadClose> ReadClose for ThrottledReader<R> {
    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

impl<R> std::fmt::Debug for ThrottledReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottledReader")
            .field("limiter", &self.limiter)
            .field("context", &self.context.name())
            .field("deferred_error", &self.deferred_error)
            .finish_non_exhaustive()
    }
}
