//! Rate limiting, concurrency limiting and retry logic
//!
//! Used for download client HTTP calls (rate-limited client plus retry with
//! backoff), for metadata extraction (bounded concurrency plus a rate quota)
//! and for the processing queue's missing-source backoff schedule.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use reqwest::{Client, Response};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Configuration for rate limiting
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per second
    pub requests_per_second: u32,
    /// Burst capacity (allows short bursts above the rate)
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 2,
            burst_size: 5,
        }
    }
}

impl RateLimitConfig {
    fn limiter(&self) -> DirectLimiter {
        let quota = Quota::per_second(
            NonZeroU32::new(self.requests_per_second).unwrap_or(NonZeroU32::MIN),
        )
        .allow_burst(NonZeroU32::new(self.burst_size).unwrap_or(NonZeroU32::MIN));

        RateLimiter::direct(quota)
    }
}

/// A rate-limited HTTP client wrapper
pub struct RateLimitedClient {
    client: Client,
    limiter: Arc<DirectLimiter>,
    retry: RetryConfig,
    name: String,
}

impl RateLimitedClient {
    /// Create a new rate-limited client
    pub fn new(name: &str, config: RateLimitConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .cookie_store(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            limiter: Arc::new(config.limiter()),
            retry: RetryConfig::default(),
            name: name.to_string(),
        })
    }

    /// Client for polling a local download client.
    ///
    /// Download clients live on the LAN and tolerate frequent polling, but a
    /// burst of per-item calls should still not hammer them.
    pub fn for_download_client(name: &str) -> Result<Self> {
        Self::new(
            name,
            RateLimitConfig {
                requests_per_second: 5,
                burst_size: 10,
            },
        )
    }

    /// Rate-limited GET with query parameters.
    ///
    /// GETs are idempotent, so network errors and transient statuses (408,
    /// 429, 5xx) are retried with backoff before giving up.
    pub async fn get_with_query<T: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        query: &T,
    ) -> Result<Response> {
        retry_async(
            || async move {
                self.wait_for_permit().await;
                debug!(client = %self.name, url = %url, "Making rate-limited GET request");

                let response = self
                    .client
                    .get(url)
                    .query(query)
                    .send()
                    .await
                    .context("HTTP request failed")?;
                if response.is_transient_error() {
                    if response.is_rate_limited() {
                        warn!(client = %self.name, "Rate limited by remote");
                    }
                    anyhow::bail!("{} returned {}", self.name, response.status());
                }
                Ok(response)
            },
            &self.retry,
            &self.name,
        )
        .await
    }

    /// Wait for rate limit and POST a form body
    pub async fn post_form<T: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        form: &T,
    ) -> Result<Response> {
        self.wait_for_permit().await;
        debug!(client = %self.name, url = %url, "Making rate-limited POST request");

        self.client
            .post(url)
            .form(form)
            .send()
            .await
            .context("HTTP request failed")
    }

    /// Wait for a rate limit permit
    pub async fn wait_for_permit(&self) {
        self.limiter.until_ready().await;
    }
}

/// Bounds how many operations run at once, optionally with a rate quota on
/// how often new ones may start
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    rate: Option<DirectLimiter>,
    name: String,
}

impl ConcurrencyLimiter {
    /// Create a new concurrency limiter
    pub fn new(name: &str, max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            rate: None,
            name: name.to_string(),
        }
    }

    /// Additionally limit how many operations may start per second
    pub fn with_rate(mut self, config: RateLimitConfig) -> Self {
        self.rate = Some(config.limiter());
        self
    }

    /// Acquire a permit and run the operation
    pub async fn run<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .with_context(|| format!("Concurrency limiter '{}' closed", self.name))?;
        if let Some(rate) = &self.rate {
            rate.until_ready().await;
        }
        debug!(limiter = %self.name, "Acquired concurrency permit");
        let result = operation().await;
        debug!(limiter = %self.name, "Released concurrency permit");
        Ok(result)
    }

    /// Get available permits
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_interval: Duration,
    /// Maximum backoff duration
    pub max_interval: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Schedule used when a job's source has not appeared on disk yet
    pub fn missing_source(initial_delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_interval: initial_delay,
            max_interval: Duration::from_secs(6 * 3600),
            multiplier: 2.0,
        }
    }

    /// Create an ExponentialBackoff from this config
    pub fn to_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: self.multiplier,
            randomization_factor: 0.0,
            max_elapsed_time: Some(Duration::from_secs(120)),
            ..Default::default()
        }
    }

    /// Deterministic delay before retry number `attempt` (1-based):
    /// `initial × multiplier^(attempt-1)`, capped at `max_interval`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Execute an async operation with retry logic
pub async fn retry_async<T, E, Fut, F>(
    operation: F,
    config: &RetryConfig,
    operation_name: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;
    let mut backoff = config.to_backoff();

    loop {
        attempts += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempts >= config.max_retries {
                    warn!(
                        operation = %operation_name,
                        attempts = attempts,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                if let Some(duration) = backoff.next_backoff() {
                    warn!(
                        operation = %operation_name,
                        attempt = attempts,
                        error = %e,
                        retry_in_ms = duration.as_millis() as u64,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(duration).await;
                } else {
                    return Err(e);
                }
            }
        }
    }
}

/// Helper trait for classifying HTTP responses
pub trait ResponseExt {
    /// Check if the response indicates rate limiting (429)
    fn is_rate_limited(&self) -> bool;

    /// Check if the response indicates a transient error that should be retried
    fn is_transient_error(&self) -> bool;
}

impl ResponseExt for Response {
    fn is_rate_limited(&self) -> bool {
        self.status().as_u16() == 429
    }

    fn is_transient_error(&self) -> bool {
        let status = self.status().as_u16();
        status == 429 || status == 408 || (500..600).contains(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_missing_source_delays_double() {
        let config = RetryConfig::missing_source(Duration::from_secs(30), 3);
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(60));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(120));
    }

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig {
            max_interval: Duration::from_secs(100),
            ..RetryConfig::missing_source(Duration::from_secs(30), 10)
        };
        assert_eq!(config.delay_for_attempt(8), Duration::from_secs(100));
    }

    #[tokio::test]
    async fn test_retry_async_stops_after_max() {
        let calls = AtomicUsize::new(0);
        let config = RetryConfig {
            max_retries: 2,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            multiplier: 1.0,
        };

        let result: Result<(), String> = retry_async(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("nope".to_string()) }
            },
            &config,
            "test",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrency_limiter_bounds_parallelism() {
        let limiter = Arc::new(ConcurrencyLimiter::new("test", 2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .run(|| async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test]
    async fn test_get_retries_transient_status() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .respond_with(ResponseTemplate::new(200))
            .with_priority(2)
            .mount(&server)
            .await;

        let client = RateLimitedClient::new("test", RateLimitConfig::default()).unwrap();
        let resp = client
            .get_with_query(&format!("{}/api", server.uri()), &[("mode", "queue")])
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
    }
}
