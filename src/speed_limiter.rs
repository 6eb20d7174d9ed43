//! Rate limiting using a token bucket
//!
//! One limiter guards the download side (chunk request issuance) and another
//! the upload side (chunk responses). All tasks share the bucket, naturally
//! distributing bandwidth by demand.
//!
//! Tokens represent bytes and refill at the configured rate. The download
//! scheduler uses the non-blocking [`SpeedLimiter::try_acquire`]: when tokens
//! are insufficient the task parks itself on a short timer instead of
//! blocking the manager loop. The upload side awaits
//! [`SpeedLimiter::acquire`], which sleeps until tokens accrue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Shared token-bucket limiter (bytes per second; 0 = unlimited)
#[derive(Clone)]
pub struct SpeedLimiter {
    /// Rate limit in bytes per second (0 = unlimited)
    limit_bps: Arc<AtomicU64>,
    /// Available tokens (bytes transferable right now)
    tokens: Arc<AtomicU64>,
    /// Last refill timestamp (nanoseconds since an arbitrary epoch)
    last_refill: Arc<AtomicU64>,
}

impl SpeedLimiter {
    /// Create a limiter with the given rate (None = unlimited)
    #[must_use]
    pub fn new(limit_bps: Option<u64>) -> Self {
        let limit = limit_bps.unwrap_or(0);
        let now = Self::now_nanos();

        Self {
            limit_bps: Arc::new(AtomicU64::new(limit)),
            tokens: Arc::new(AtomicU64::new(limit)),
            last_refill: Arc::new(AtomicU64::new(now)),
        }
    }

    /// Change the rate; takes effect immediately
    ///
    /// Increasing the limit adds the difference to the bucket; decreasing
    /// leaves excess tokens to drain naturally.
    pub fn set_limit(&self, limit_bps: Option<u64>) {
        let new_limit = limit_bps.unwrap_or(0);
        let old_limit = self.limit_bps.swap(new_limit, Ordering::SeqCst);

        if new_limit > old_limit {
            let extra = new_limit - old_limit;
            self.tokens.fetch_add(extra, Ordering::SeqCst);
        }
    }

    /// The current rate, None when unlimited
    pub fn get_limit(&self) -> Option<u64> {
        let limit = self.limit_bps.load(Ordering::Relaxed);
        if limit == 0 { None } else { Some(limit) }
    }

    /// Try to take `bytes` tokens without waiting
    ///
    /// Returns false when the bucket cannot cover the request; the caller
    /// parks itself and retries later.
    pub fn try_acquire(&self, bytes: u64) -> bool {
        if bytes == 0 || self.limit_bps.load(Ordering::Relaxed) == 0 {
            return true;
        }
        self.refill_tokens();

        let mut current = self.tokens.load(Ordering::SeqCst);
        loop {
            if current < bytes {
                return false;
            }
            match self.tokens.compare_exchange(
                current,
                current - bytes,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Take `bytes` tokens, waiting for refills as needed
    pub async fn acquire(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }

        let mut remaining = bytes;
        loop {
            // re-read the limit each turn so runtime changes take effect
            let limit = self.limit_bps.load(Ordering::Relaxed);
            if limit == 0 {
                return;
            }

            self.refill_tokens();

            // consume what is available, down to partial amounts
            let current = self.tokens.load(Ordering::SeqCst);
            let take = remaining.min(current);
            if take > 0 {
                if self
                    .tokens
                    .compare_exchange(current, current - take, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    remaining -= take;
                    if remaining == 0 {
                        return;
                    }
                }
                continue;
            }

            // empty bucket: sleep roughly until enough tokens accrue, capped
            // so limit changes are picked up promptly
            let wait_ms = (remaining as f64 / limit as f64 * 1000.0) as u64;
            tokio::time::sleep(Duration::from_millis(wait_ms.clamp(10, 100))).await;
        }
    }

    fn refill_tokens(&self) {
        let limit = self.limit_bps.load(Ordering::Relaxed);
        if limit == 0 {
            return;
        }

        let now = Self::now_nanos();
        let last = self.last_refill.load(Ordering::SeqCst);
        let elapsed_secs = now.saturating_sub(last) as f64 / 1_000_000_000.0;
        let tokens_to_add = (limit as f64 * elapsed_secs) as u64;

        if tokens_to_add > 0
            && self
                .last_refill
                .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            // cap at the limit (one second of burst)
            let current = self.tokens.load(Ordering::SeqCst);
            let refilled = (current + tokens_to_add).min(limit);
            self.tokens.store(refilled, Ordering::SeqCst);
        }
    }

    fn now_nanos() -> u64 {
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }

    /// Empty the bucket so the next acquisition must wait (tests only)
    #[cfg(test)]
    pub(crate) fn drain_for_test(&self) {
        self.tokens.store(0, Ordering::SeqCst);
        self.last_refill.store(Self::now_nanos(), Ordering::SeqCst);
    }
}
