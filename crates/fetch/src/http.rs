use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use url::Url;

use crawlsite_core::{CrawlConfig, FetchError};

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_FACTOR: u32 = 2;
const RATE_LIMIT_HARD_CAP: u32 = 6;

/// Outcome of a single successful fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub elapsed: Duration,
    pub final_url: Url,
}

/// Issues one GET, returning `{status, headers, body, elapsed}` or a typed
/// failure. Implemented once in production by `HttpFetcher`; the trait
/// seam lets the validator and frontier share one mock in tests.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchOutcome, FetchError>;
}

/// Single-origin HTTP GET with bounded concurrency, timeout, retry, and
/// 429-aware backoff. One `HttpFetcher` per run — the semaphore and client
/// are owned, never global, so runs never contend with each other.
pub struct HttpFetcher {
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    max_body_size: usize,
    retry_attempts: u32,
}

impl HttpFetcher {
    pub fn new(config: &CrawlConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            timeout: config.request_timeout(),
            max_body_size: 10 * 1024 * 1024,
            retry_attempts: config.retry_attempts,
        })
    }

    fn backoff_delay(attempt: u32) -> Duration {
        let base_ms = BACKOFF_BASE.as_millis() as u64 * (BACKOFF_FACTOR as u64).pow(attempt);
        let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
        let jittered_ms = (base_ms as f64 * (1.0 + jitter_frac)).max(0.0) as u64;
        Duration::from_millis(jittered_ms)
    }

    async fn one_attempt(&self, url: &Url) -> Result<FetchOutcome, FetchError> {
        let start = Instant::now();
        let resp = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout(self.timeout)
                } else {
                    FetchError::Transport(e.to_string())
                }
            })?;

        let status = resp.status().as_u16();
        let final_url = resp.url().clone();

        if status == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(FetchError::RateLimited { retry_after });
        }

        let mut headers = HashMap::new();
        for (k, v) in resp.headers() {
            if let Ok(val) = v.to_str() {
                headers.insert(k.as_str().to_lowercase(), val.to_string());
            }
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        if body.len() > self.max_body_size {
            return Err(FetchError::BodyTooLarge {
                size: body.len(),
                max: self.max_body_size,
            });
        }

        Ok(FetchOutcome {
            status,
            headers,
            body: body.to_vec(),
            elapsed: start.elapsed(),
            final_url,
        })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchOutcome, FetchError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("fetch semaphore never closed");

        let mut timeout_retried = false;
        let mut rate_limit_attempts: u32 = 0;
        let mut transport_attempts: u32 = 0;

        loop {
            match self.one_attempt(url).await {
                Ok(outcome) if outcome.status >= 500 => {
                    if transport_attempts >= self.retry_attempts {
                        return Err(FetchError::Giveup);
                    }
                    let delay = Self::backoff_delay(transport_attempts);
                    transport_attempts += 1;
                    debug!(%url, attempt = transport_attempts, ?delay, status = outcome.status, "retrying 5xx");
                    tokio::time::sleep(delay).await;
                }
                Ok(outcome) => return Ok(outcome),
                Err(FetchError::RateLimited { retry_after }) => {
                    if rate_limit_attempts >= RATE_LIMIT_HARD_CAP {
                        warn!(%url, "rate limit hard cap reached");
                        return Err(FetchError::RateLimited { retry_after });
                    }
                    let computed = Self::backoff_delay(rate_limit_attempts);
                    let delay = retry_after.map_or(computed, |ra| ra.max(computed));
                    rate_limit_attempts += 1;
                    debug!(%url, attempt = rate_limit_attempts, ?delay, "backing off on 429");
                    tokio::time::sleep(delay).await;
                }
                Err(FetchError::Timeout(d)) => {
                    if timeout_retried {
                        return Err(FetchError::Timeout(d));
                    }
                    timeout_retried = true;
                    debug!(%url, "retrying once after timeout");
                }
                Err(FetchError::Transport(msg)) => {
                    if transport_attempts >= self.retry_attempts {
                        return Err(FetchError::Transport(msg));
                    }
                    let delay = Self::backoff_delay(transport_attempts);
                    transport_attempts += 1;
                    debug!(%url, attempt = transport_attempts, ?delay, %msg, "retrying transport error");
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_within_jitter() {
        let d0 = HttpFetcher::backoff_delay(0).as_millis() as f64;
        let d1 = HttpFetcher::backoff_delay(1).as_millis() as f64;
        // d1 should be roughly double d0, allowing for +-20% jitter on both ends.
        assert!(d0 <= 500.0 * 1.21);
        assert!(d1 >= 500.0 * 2.0 * 0.79 - 1.0 || d1 <= 500.0 * 2.0 * 1.21 + 1.0);
    }
}
