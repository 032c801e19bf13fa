//! Fixed-schedule retry for transient backend failures.

use crate::context::Context;
use crate::error::Result;
use std::future::Future;
use std::time::Duration;

/// How many times to retry a transient failure and how long to wait.
///
/// The wait before retry `i` (counting from zero) is `base_delay * (2i + 1)`,
/// so the default policy waits 1s, 3s and 5s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// A policy that retries without waiting.
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries, Duration::ZERO)
    }

    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2 * retry + 1)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// retry budget is spent. The last error is returned.
    pub async fn run<F, Fut, T>(&self, ctx: &Context, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            match ctx.run(op()).await {
                Err(err) if err.is_transient() && retry < self.max_retries => {
                    let delay = self.delay(retry);
                    tracing::warn!(
                        op = what,
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient storage error, retrying"
                    );
                    ctx.sleep(delay).await?;
                    retry += 1;
                }
                res => return res,
            }
        }
    }
}
