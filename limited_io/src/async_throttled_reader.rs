//! Throttling for tokio readers.
//!
//! An `AsyncRead` implementation cannot hold the caller's buffer across a
//! `Poll::Pending`, so bytes produced by the inner reader are staged in an
//! internal buffer while their reservation matures and copied out afterwards.
//! Callers still never see a byte before it has been paid for.

use std::future::Future;
use std::io;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::ready;
use pin_project::pin_project;
use rate_limiter::{RateLimitError, RateLimiter, Reservation, WaitContext};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::trace;

use crate::throttled_reader::THROTTLED_READER_CONTEXT;

enum State {
    Idle,

    /// Bytes produced by the inner reader, held until their reservation matures.
    Waiting {
        staged: Bytes,
        reservation: Reservation,
        sleep: Pin<Box<Sleep>>,
        cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    },

    /// Paid-for bytes not yet handed to the caller. Never charged again.
    Ready(Bytes),
}

/// Async counterpart of [`ThrottledReader`](crate::ThrottledReader).
///
/// If the wait is cancelled through the context's token, the staged bytes are
/// still delivered and the `Cancelled` error is returned by the next poll.
#[pin_project]
pub struct AsyncThrottledReader<R> {
    #[pin]
    inner: R,
    limiter: Arc<RateLimiter>,
    context: WaitContext,
    state: State,
    scratch: BytesMut,
    deferred_error: Option<RateLimitError>,
}

impl<R: AsyncRead> AsyncThrottledReader<R> {
    pub fn new(inner: R, limiter: Arc<RateLimiter>) -> Self {
        Self::with_context(inner, limiter, WaitContext::named(THROTTLED_READER_CONTEXT))
    }

    pub fn with_context(inner: R, limiter: Arc<RateLimiter>, context: WaitContext) -> Self {
        Self {
            inner,
            limiter,
            context,
            state: State::Idle,
            scratch: BytesMut::new(),
            deferred_error: None,
        }
    }
}

impl<R> AsyncThrottledReader<R> {
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn context(&self) -> &WaitContext {
        &self.context
    }

    /// Returns the inner reader. Bytes staged but not yet delivered are lost.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead> AsyncRead for AsyncThrottledReader<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();

        loop {
            match &mut *this.state {
                State::Ready(data) => {
                    let n = data.len().min(buf.remaining());
                    buf.put_slice(&data.split_to(n));
                    if data.is_empty() {
                        *this.state = State::Idle;
                    }
                    return Poll::Ready(Ok(()));
                },
                State::Waiting {
                    staged,
                    reservation,
                    sleep,
                    cancelled,
                } => {
                    if let Some(cancelled) = cancelled {
                        if cancelled.as_mut().poll(cx).is_ready() {
                            this.limiter.cancel(reservation);
                            trace!("AsyncThrottledReader: wait for {} bytes cancelled", staged.len());
                            *this.deferred_error = Some(this.context.cancelled_error());
                            let data = mem::take(staged);
                            *this.state = State::Ready(data);
                            continue;
                        }
                    }

                    ready!(sleep.as_mut().poll(cx));
                    let data = mem::take(staged);
                    *this.state = State::Ready(data);
                },
                State::Idle => {
                    if let Some(e) = this.deferred_error.take() {
                        return Poll::Ready(Err(e.into()));
                    }
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }

                    this.scratch.clear();
                    this.scratch.resize(buf.remaining(), 0);
                    let mut staging = ReadBuf::new(&mut this.scratch[..]);
                    ready!(this.inner.as_mut().poll_read(cx, &mut staging))?;

                    let n = staging.filled().len();
                    if n == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    this.scratch.truncate(n);
                    let staged = this.scratch.split().freeze();

                    match this.limiter.reserve(n as u64, this.context) {
                        Err(e) => {
                            trace!("AsyncThrottledReader: {n} bytes read but limiter wait failed: {e}");
                            *this.deferred_error = Some(e);
                            *this.state = State::Ready(staged);
                        },
                        Ok(reservation) if reservation.delay_from(Instant::now()).is_zero() => {
                            *this.state = State::Ready(staged);
                        },
                        Ok(reservation) => {
                            let sleep = Box::pin(sleep_until(reservation.ready_at()));
                            let cancelled = this
                                .context
                                .cancellation_token()
                                .map(|token| Box::pin(token.clone().cancelled_owned()));
                            *this.state = State::Waiting {
                                staged,
                                reservation,
                                sleep,
                                cancelled,
                            };
                        },
                    }
                },
            }
        }
    }
}
