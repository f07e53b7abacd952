//! Retries for remote operations that fail transiently.
//!
//! Object stores throw occasional 5xx responses, throttle with 429, or drop
//! connections mid-request; a backup should ride those out rather than
//! abort. Anything else (missing object, bad credentials, auth failure) is
//! surfaced immediately.

use bolong_core::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How often and how patiently a remote operation is retried. Delays double
/// per attempt, capped at `max_delay`, with up to a quarter of random
/// jitter on top so parallel restore workers don't hammer the store in
/// lockstep.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub attempts: u32,
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> RetryConfig {
        RetryConfig {
            attempts: 5,
            first_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    fn delay(&self, attempt: u32) -> Duration {
        let doubled = self
            .first_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        doubled + doubled.mul_f64(rand::thread_rng().gen_range(0.0..0.25))
    }
}

/// Whether a failed remote operation stands a chance on a second try.
/// Plain IO errors are taken for network hiccups. The drivers fold HTTP
/// status into their `Remote` error strings, so overload and timeout
/// conditions are recognized there; everything else is permanent.
fn transient(err: &Error) -> bool {
    match err {
        Error::Io(_) => true,
        Error::Remote(msg) => ["500", "502", "503", "429", "timeout", "timed out", "reset"]
            .iter()
            .any(|hint| msg.contains(hint)),
        _ => false,
    }
}

/// Run `op`, retrying transient failures per `config`. `what` names the
/// operation in the retry log line.
pub async fn retry<T, F, Fut>(config: &RetryConfig, what: &str, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < config.attempts && transient(&e) => {
                let delay = config.delay(attempt);
                warn!("{} failed ({}), retrying in {:?}", what, e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
