use std::time::Instant as StdInstant;

use parking_lot::Mutex;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, trace};

use crate::bucket::{Reservation, TokenBucket};
use crate::context::WaitContext;
use crate::error::Result;

/// Upper bound on a single blocking sleep while a cancellable context is attached.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A token bucket rate limiter shared by every stream in one limiting domain.
///
/// One token is one byte. The bucket starts full, refills at `rate` tokens per
/// second and holds at most `burst` tokens; no single request may exceed
/// `burst`. Waiters are admitted in the order their reservations were taken.
///
/// The internal lock is held only for the token arithmetic, never while waiting,
/// so any number of threads or tasks may wait on the same limiter concurrently.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64, burst: u64) -> Self {
        assert!(bytes_per_sec > 0, "rate limit must be positive");
        assert!(burst > 0, "burst must be positive");

        Self {
            bucket: Mutex::new(TokenBucket::new(bytes_per_sec as f64, burst, Instant::now())),
        }
    }

    /// Refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.bucket.lock().rate()
    }

    pub fn burst(&self) -> u64 {
        self.bucket.lock().burst()
    }

    /// Current token balance. Negative while reservations are waiting to mature.
    pub fn available_tokens(&self) -> f64 {
        self.bucket.lock().advance(Instant::now())
    }

    /// Takes `n` tokens if they are available right now, without going into debt.
    pub fn try_acquire(&self, n: u64) -> bool {
        self.bucket.lock().try_take(Instant::now(), n)
    }

    /// Reserves `n` tokens under `ctx`.
    ///
    /// Fails if the context is already done, if `n` exceeds the burst, or if the
    /// reservation would mature after the context's deadline. On success the tokens
    /// are committed; the caller must wait until [`Reservation::ready_at`] or
    /// [`cancel`](Self::cancel) the reservation.
    pub fn reserve(&self, n: u64, ctx: &WaitContext) -> Result<Reservation> {
        if let Some(e) = ctx.err() {
            debug!("Rate limiter wait for {n} tokens not started; context {ctx} is done: {e}");
            return Err(e);
        }

        let now = Instant::now();
        let max_wait = ctx.deadline().map(|d| d.saturating_duration_since(now));
        let result = self.bucket.lock().reserve(now, n, max_wait);

        if let Err(e) = &result {
            debug!("Rate limiter rejected reservation of {n} tokens: {e}");
        }
        result
    }

    /// Hands back the tokens of a reservation that has not matured yet.
    pub fn cancel(&self, reservation: &Reservation) {
        self.bucket.lock().cancel(Instant::now(), reservation);
    }

    /// Blocks the calling thread until `n` tokens are granted.
    ///
    /// Without a cancellation token on `ctx` this is a single sleep. With one,
    /// the sleep is sliced so a cancellation is observed promptly; the
    /// reservation is then refunded and the wait fails.
    pub fn wait_for(&self, n: u64, ctx: &WaitContext) -> Result<()> {
        if n == 0 {
            return Ok(());
        }

        let reservation = self.reserve(n, ctx)?;
        let delay = reservation.delay_from(Instant::now());
        if delay.is_zero() {
            return Ok(());
        }

        trace!("Rate limiter: waiting {delay:?} for {n} tokens ({ctx})");

        let Some(token) = ctx.cancellation_token() else {
            std::thread::sleep(delay);
            return Ok(());
        };

        // Measured on the std clock; this path sleeps the OS thread, not the runtime.
        let ready_at = StdInstant::now() + delay;
        loop {
            if token.is_cancelled() {
                self.cancel(&reservation);
                debug!("Rate limiter wait for {n} tokens cancelled ({ctx})");
                return Err(ctx.cancelled_error());
            }

            let remaining = ready_at.saturating_duration_since(StdInstant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            std::thread::sleep(remaining.min(CANCEL_POLL_INTERVAL));
        }
    }

    /// Waits on the tokio timer until `n` tokens are granted.
    ///
    /// If the returned future is dropped before completing, the reservation is
    /// refunded.
    pub async fn wait_for_async(&self, n: u64, ctx: &WaitContext) -> Result<()> {
        if n == 0 {
            return Ok(());
        }

        let reservation = self.reserve(n, ctx)?;
        let delay = reservation.delay_from(Instant::now());
        if delay.is_zero() {
            return Ok(());
        }

        trace!("Rate limiter: waiting {delay:?} for {n} tokens ({ctx})");

        let mut guard = RefundOnDrop {
            limiter: self,
            reservation: Some(&reservation),
        };

        let result = match ctx.cancellation_token() {
            None => {
                sleep_until(reservation.ready_at()).await;
                Ok(())
            },
            Some(token) => {
                tokio::select! {
                    _ = sleep_until(reservation.ready_at()) => Ok(()),
                    _ = token.cancelled() => {
                        debug!("Rate limiter wait for {n} tokens cancelled ({ctx})");
                        guard.refund();
                        Err(ctx.cancelled_error())
                    },
                }
            },
        };

        guard.disarm();
        result
    }
}

/// Refunds a pending reservation when an async wait is abandoned midway.
struct RefundOnDrop<'a> {
    limiter: &'a RateLimiter,
    reservation: Option<&'a Reservation>,
}

impl RefundOnDrop<'_> {
    fn refund(&mut self) {
        if let Some(r) = self.reservation.take() {
            self.limiter.cancel(r);
        }
    }

    fn disarm(&mut self) {
        self.reservation = None;
    }
}

impl Drop for RefundOnDrop<'_> {
    fn drop(&mut self) {
        self.refund();
    }
}
