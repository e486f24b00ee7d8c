//! Token-bucket pacing for the shared radio send path.
//!
//! Every transmit (chat chunk, broadcast or FiMesh frame) takes one token. The bucket
//! holds up to `burst` tokens and regains one every `gap`. A zero gap disables pacing.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct SendPacer {
    gap: Duration,
    burst: u32,
    bucket: Mutex<Bucket>,
}

impl SendPacer {
    pub fn new(gap: Duration, burst: u32) -> Self {
        let burst = burst.max(1);
        Self {
            gap,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Pacer that never waits.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO, 1)
    }

    pub fn is_unlimited(&self) -> bool {
        self.gap.is_zero()
    }

    /// Wait until a send token is available and take it.
    pub async fn acquire(&self) {
        if self.is_unlimited() {
            return;
        }
        loop {
            let wait = match self.try_take(Instant::now()) {
                None => return,
                Some(wait) => wait,
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token if one is available at `now`; otherwise report how long until one is.
    fn try_take(&self, now: Instant) -> Option<Duration> {
        let mut bucket = match self.bucket.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let refill = elapsed.as_secs_f64() / self.gap.as_secs_f64();
        bucket.tokens = (bucket.tokens + refill).min(self.burst as f64);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            None
        } else {
            let missing = 1.0 - bucket.tokens;
            Some(self.gap.mul_f64(missing).max(Duration::from_millis(1)))
        }
    }
}
