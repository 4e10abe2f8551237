use std::future::Future;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::ProviderError;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Exponential backoff with jitter for board/AI writes. Defaults: 1 s
/// initial, 30 s cap, 3 attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial: Duration, max: Duration, attempts: u32) -> Self {
        Self { initial, max, attempts }
    }

    /// Backoff before retry number `attempt` (1-based), with jitter of up
    /// to half the base delay added.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self
            .initial
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max);
        base + jitter(base / 2)
    }
}

fn jitter(up_to: Duration) -> Duration {
    if up_to.is_zero() {
        return Duration::ZERO;
    }
    // Derive cheap entropy from a fresh v4 uuid; avoids a dedicated RNG
    // dependency for a non-cryptographic delay.
    let entropy = Uuid::new_v4().as_u128();
    Duration::from_millis((entropy % (up_to.as_millis().max(1))) as u64)
}

// ---------------------------------------------------------------------------
// with_retry / with_deadline
// ---------------------------------------------------------------------------

/// Run `op` with bounded retries on transient provider errors. Non-transient
/// errors surface immediately.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient provider failure; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Bound a provider call with a deadline; expiry maps to
/// [`ProviderError::Timeout`].
pub async fn with_deadline<T, Fut>(deadline: Duration, fut: Fut) -> Result<T, ProviderError>
where
    Fut: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
