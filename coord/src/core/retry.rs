use rand::random_range;
use std::future::Future;
use tokio::time::{Duration, Instant, sleep};

use common::error::CoreError;

/// Pauses between in-call RPC attempts, before jitter.
const RPC_BACKOFF: Backoff = Backoff {
    base: Duration::from_millis(200),
    cap: Duration::from_secs(5),
};

/// Re-runs a node RPC while it fails transiently and the next pause still
/// fits in `budget`. Each attempt must carry its own deadline.
pub async fn retry_transient<T, F, Fut>(budget: Duration, mut op: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let deadline = Instant::now() + budget;
    let mut attempt = 0u32;
    loop {
        let err = match op().await {
            Ok(res) => return Ok(res),
            Err(e) => e,
        };
        attempt = attempt.saturating_add(1);
        if !err.is_transient() {
            return Err(err);
        }
        let pause = half_jitter(RPC_BACKOFF.delay_for(attempt));
        if Instant::now() + pause > deadline {
            return Err(err);
        }
        sleep(pause).await;
    }
}

/// Somewhere between half of `d` and all of it.
fn half_jitter(d: Duration) -> Duration {
    let ms = d.as_millis() as u64;
    Duration::from_millis(ms / 2 + random_range(0..=ms / 2))
}

/// Backoff between persisted task attempts: `base * 2^(attempt-1)`, capped.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// `attempt` is the number of the attempt that just failed, starting at 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}
