use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Token bucket gating every outbound LLM (and embedding) call.
///
/// Replenishment is continuous: tokens accrue at `rate_per_sec` up to
/// `capacity`, so the observed request rate never exceeds the configured
/// requests-per-minute over any sliding window. Capacity defaults to one
/// token, which keeps bursts at a single in-flight acquisition for the
/// conservative free-tier rates this ships with.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate_per_sec: f64,
    capacity: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn per_minute(requests_per_minute: f64) -> Self {
        let rpm = requests_per_minute.max(0.1);
        let rate_per_sec = rpm / 60.0;
        // Burst capacity = tokens accrued per second, floored at one.
        let capacity = rate_per_sec.max(1.0);
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            rate_per_sec,
            capacity,
        }
    }

    /// Seconds between tokens at the steady-state rate; the wait applied when
    /// a provider signals a hard quota error.
    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_per_sec)
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut s = self.state.lock().expect("token bucket lock poisoned");
                let now = Instant::now();
                let elapsed = now.duration_since(s.last_refill).as_secs_f64();
                s.tokens = (s.tokens + elapsed * self.rate_per_sec).min(self.capacity);
                s.last_refill = now;
                if s.tokens >= 1.0 {
                    s.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - s.tokens) / self.rate_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Give a token back. Used when a gated call is abandoned before the
    /// provider did any work (e.g. wrapped call timed out at dispatch).
    pub fn refund(&self) {
        let mut s = self.state.lock().expect("token bucket lock poisoned");
        s.tokens = (s.tokens + 1.0).min(self.capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_steady_rate_is_enforced() {
        // 60 rpm → one token per second, capacity 1.
        let bucket = TokenBucket::per_minute(60.0);

        let t0 = Instant::now();
        bucket.acquire().await; // initial token, immediate
        bucket.acquire().await; // must wait ~1s
        bucket.acquire().await; // another ~1s
        let elapsed = t0.elapsed();

        assert!(elapsed >= Duration::from_millis(1900), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(2200), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refund_restores_token() {
        let bucket = TokenBucket::per_minute(60.0);
        bucket.acquire().await;
        bucket.refund();

        let t0 = Instant::now();
        bucket.acquire().await;
        assert!(t0.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_cap_at_capacity() {
        let bucket = TokenBucket::per_minute(60.0);
        // Long idle period must not allow a burst beyond capacity.
        tokio::time::sleep(Duration::from_secs(600)).await;

        let t0 = Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        assert!(t0.elapsed() >= Duration::from_millis(900));
    }
}
