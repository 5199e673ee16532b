use tokio::time::{Duration, Instant};

use crate::error::{RateLimitError, Result};

/// Tokens held back from the bucket on behalf of one caller.
///
/// A reservation is committed as soon as it is created; the holder is expected
/// to wait until [`ready_at`](Self::ready_at) before acting on it, or to hand it
/// back through [`RateLimiter::cancel`](crate::RateLimiter::cancel).
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    tokens: u64,
    ready_at: Instant,
}

impl Reservation {
    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn ready_at(&self) -> Instant {
        self.ready_at
    }

    /// Time left until the reservation matures, measured from `now`.
    pub fn delay_from(&self, now: Instant) -> Duration {
        self.ready_at.saturating_duration_since(now)
    }
}

/// Token bucket state.
///
/// Tokens refill continuously at `rate` per second up to `burst`. The balance
/// is allowed to go negative: a negative balance is debt owed by callers that
/// have reserved tokens but are still waiting for them to mature.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    rate: f64,
    burst: u64,
    tokens: f64,
    last: Instant,

    /// Ready instant of the most recent reservation.
    last_event: Instant,
}

impl TokenBucket {
    pub(crate) fn new(rate: f64, burst: u64, now: Instant) -> Self {
        debug_assert!(rate.is_finite() && rate > 0.0);

        Self {
            rate,
            burst,
            tokens: burst as f64,
            last: now,
            last_event: now,
        }
    }

    pub(crate) fn rate(&self) -> f64 {
        self.rate
    }

    pub(crate) fn burst(&self) -> u64 {
        self.burst
    }

    /// Token balance at `now` without committing the refill.
    pub(crate) fn advance(&self, now: Instant) -> f64 {
        // saturating_duration_since clamps clock skew to zero elapsed time.
        let elapsed = now.saturating_duration_since(self.last);
        let refilled = self.tokens + elapsed.as_secs_f64() * self.rate;
        refilled.min(self.burst as f64)
    }

    fn duration_from_tokens(&self, tokens: f64) -> Duration {
        if tokens <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(tokens / self.rate)
    }

    fn tokens_from_duration(&self, d: Duration) -> f64 {
        d.as_secs_f64() * self.rate
    }

    /// Takes `n` tokens at `now`, possibly into debt. Nothing is mutated on failure.
    pub(crate) fn reserve(&mut self, now: Instant, n: u64, max_wait: Option<Duration>) -> Result<Reservation> {
        if n > self.burst {
            return Err(RateLimitError::ExceedsBurst {
                requested: n,
                burst: self.burst,
            });
        }

        let tokens = self.advance(now) - n as f64;
        let wait = self.duration_from_tokens(-tokens);

        if let Some(max_wait) = max_wait {
            if wait > max_wait {
                return Err(RateLimitError::WouldExceedDeadline { requested: n });
            }
        }

        let ready_at = now + wait;
        self.last = now;
        self.tokens = tokens;
        self.last_event = ready_at;

        Ok(Reservation { tokens: n, ready_at })
    }

    /// Non-blocking admission; takes the tokens only if they are available right now.
    pub(crate) fn try_take(&mut self, now: Instant, n: u64) -> bool {
        match self.reserve(now, n, Some(Duration::ZERO)) {
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// Refunds a reservation that has not matured yet.
    ///
    /// Tokens that later reservations have already been scheduled against are
    /// not refunded, so those reservations keep their place in line.
    pub(crate) fn cancel(&mut self, now: Instant, reservation: &Reservation) {
        if reservation.tokens == 0 || reservation.ready_at < now {
            return;
        }

        let claimed_after = self.tokens_from_duration(self.last_event.saturating_duration_since(reservation.ready_at));
        let restore = reservation.tokens as f64 - claimed_after;
        if restore <= 0.0 {
            return;
        }

        self.tokens = (self.advance(now) + restore).min(self.burst as f64);
        self.last = now;

        if reservation.ready_at == self.last_event {
            let prev_event = reservation.ready_at - self.duration_from_tokens(reservation.tokens as f64);
            if prev_event >= now {
                self.last_event = prev_event;
            }
        }
    }
}
