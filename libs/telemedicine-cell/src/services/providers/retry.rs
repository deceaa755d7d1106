// libs/telemedicine-cell/src/services/providers/retry.rs
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::warn;

use shared_config::TelemedicineSettings;

use crate::error::ProviderError;

/// Bounded retry with exponential backoff for provider calls. Each attempt is
/// capped by `call_timeout`; an elapsed timeout counts as a transient failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &TelemedicineSettings) -> Self {
        Self {
            max_attempts: settings.provider_max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.provider_initial_backoff_ms),
            call_timeout: Duration::from_secs(settings.provider_timeout_secs.max(1)),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter_ms = (self.initial_backoff.as_millis() as u64) / 2;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1;
        loop {
            let result = match timeout(self.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::transient(format!(
                    "{} timed out after {:?}",
                    operation, self.call_timeout
                ))),
            };

            match result {
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        operation, attempt, self.max_attempts, err, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
