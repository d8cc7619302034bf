//! Pacing primitives shared by every long-running operation: the per-provider
//! delay between fetches, bounded retry with backoff for transient failures,
//! and the consecutive-failure circuit breaker.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use rootline_common::{DelayWindow, Provider, RootlineError, SyncSettings};

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Applies a uniformly random delay from the provider's window between
/// consecutive fetches. The first fetch against a provider is not delayed.
pub struct RateLimiter {
    windows: HashMap<Provider, DelayWindow>,
    started: Mutex<HashMap<Provider, bool>>,
}

impl RateLimiter {
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            windows: Provider::ALL
                .into_iter()
                .map(|p| (p, settings.pacing_for(p)))
                .collect(),
            started: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self, provider: Provider) -> DelayWindow {
        self.windows
            .get(&provider)
            .copied()
            .unwrap_or_else(DelayWindow::none)
    }

    /// Sleep before the next fetch against `provider`. Returns the delay applied.
    pub async fn wait(&self, provider: Provider) -> Duration {
        let first = {
            let mut started = self.started.lock().await;
            !std::mem::replace(started.entry(provider).or_insert(false), true)
        };
        if first {
            return Duration::ZERO;
        }

        let delay = sample_delay(self.window(provider));
        if !delay.is_zero() {
            debug!(provider = %provider, delay_ms = delay.as_millis() as u64, "Pacing before fetch");
            tokio::time::sleep(delay).await;
        }
        delay
    }
}

/// Uniform sample from `[min, max]` milliseconds.
pub fn sample_delay(window: DelayWindow) -> Duration {
    let window = window.normalized();
    if window.max_delay_ms == 0 {
        return Duration::ZERO;
    }
    let ms = rand::rng().random_range(window.min_delay_ms..=window.max_delay_ms);
    Duration::from_millis(ms)
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded retry for transient failures. Delay is base * 3^attempt + jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(
            settings.retry_max_attempts,
            Duration::from_millis(settings.retry_base_delay_ms),
        )
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let jitter = Duration::from_millis(rand::rng().random_range(0..1000));
        self.base_delay
            .saturating_mul(3u32.saturating_pow(attempt))
            .saturating_add(jitter)
    }

    /// Run `op` until it succeeds, fails non-transiently, or attempts run out.
    /// The last transient error is returned when attempts are exhausted.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RootlineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RootlineError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let backoff = self.backoff(attempt);
                    warn!(
                        label,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Counts consecutive per-unit failures. Any success resets the count.
#[derive(Debug, Clone)]
pub struct ConsecutiveFailures {
    threshold: u32,
    count: u32,
}

impl ConsecutiveFailures {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            count: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.count = 0;
    }

    /// Returns true once the threshold is reached.
    pub fn record_failure(&mut self) -> bool {
        self.count += 1;
        self.is_tripped()
    }

    pub fn is_tripped(&self) -> bool {
        self.count >= self.threshold
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}
