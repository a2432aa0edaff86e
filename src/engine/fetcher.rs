// * Fetch Worker
// * One URL in, image bytes or an abandonment reason out. Breaker, jitter, retries and backoff live here.

use crate::config::DownloadConfig;
use crate::engine::circuit_breaker::CircuitBreaker;
use crate::engine::normalization::origin_of;
use crate::network::{
    build_headers, FailureReason, FetchFailure, FetchOutcome, FetchedImage, ImageClient,
    NetworkError, UserAgentPool,
};
use crate::ops::telemetry::record_fetch_attempt;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

// * Why a URL was given up on
#[derive(Debug, Error)]
pub enum FetchAbandoned {
    #[error("circuit open for domain")]
    CircuitOpen,

    #[error("permanent failure: {0}")]
    Permanent(FetchFailure),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: FetchFailure },

    #[error("request could not be built: {0}")]
    Request(#[from] NetworkError),
}

impl FetchAbandoned {
    pub fn failure(&self) -> Option<&FetchFailure> {
        match self {
            FetchAbandoned::Permanent(f) | FetchAbandoned::Exhausted { last: f, .. } => Some(f),
            _ => None,
        }
    }
}

// * uniform(0.5 * base, 1.5 * base)
pub fn jitter(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let factor: f64 = rand::thread_rng().gen_range(0.5..=1.5);
    base.mul_f64(factor)
}

// * backoff_base ^ attempt seconds (attempt is 0-based); a base <= 0 disables backoff
pub fn backoff_delay(backoff_base: f64, attempt: u32) -> Duration {
    if backoff_base <= 0.0 {
        return Duration::ZERO;
    }
    let secs = backoff_base.powi(attempt as i32);
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

pub struct Fetcher {
    client: ImageClient,
    agents: UserAgentPool,
    breaker: Arc<CircuitBreaker>,
    max_attempts: u32,
    backoff_base: f64,
    request_delay: Duration,
}

impl Fetcher {
    pub fn new(config: &DownloadConfig, breaker: Arc<CircuitBreaker>) -> Result<Self, NetworkError> {
        Ok(Self {
            client: ImageClient::new(config.timeout(), config.max_image_bytes)?,
            agents: UserAgentPool::new(&config.user_agents),
            breaker,
            max_attempts: config.max_retries.max(1),
            backoff_base: config.backoff_base,
            request_delay: Duration::from_secs_f64(config.request_delay_secs.max(0.0)),
        })
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Fetches `url` with retries. The referer defaults to the URL's own origin.
    pub async fn fetch(
        &self,
        url: &str,
        referer: Option<&str>,
    ) -> Result<FetchedImage, FetchAbandoned> {
        let referer = referer.map(str::to_string).or_else(|| origin_of(url));
        let mut last = FetchFailure::new(FailureReason::Transport, None);

        for attempt in 0..self.max_attempts {
            // * Re-checked per attempt: a trip mid-retry abandons the URL
            if !self.breaker.allow(url) {
                record_fetch_attempt(FailureReason::CircuitOpen.as_str());
                debug!(url = %url, attempt = attempt, "Circuit open, skipping fetch");
                return Err(FetchAbandoned::CircuitOpen);
            }

            let delay = jitter(self.request_delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let headers = build_headers(self.agents.pick(), referer.as_deref())?;
            match self.client.fetch(url, headers).await {
                FetchOutcome::Success(image) => {
                    self.breaker.report(url, true, Some(image.status));
                    record_fetch_attempt("success");
                    return Ok(image);
                }
                FetchOutcome::Permanent(failure) => {
                    record_fetch_attempt(failure.reason.as_str());
                    // * An oversized body says nothing about the host's health
                    if failure.reason != FailureReason::TooLarge {
                        self.breaker.report(url, false, failure.status);
                    }
                    debug!(url = %url, failure = %failure, "Permanent fetch failure");
                    return Err(FetchAbandoned::Permanent(failure));
                }
                FetchOutcome::Retryable(failure) => {
                    record_fetch_attempt(failure.reason.as_str());
                    self.breaker.report(url, false, failure.status);
                    debug!(
                        url = %url,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        failure = %failure,
                        "Fetch attempt failed"
                    );
                    last = failure;
                }
            }

            if attempt + 1 < self.max_attempts {
                let backoff = backoff_delay(self.backoff_base, attempt);
                if !backoff.is_zero() {
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        Err(FetchAbandoned::Exhausted {
            attempts: self.max_attempts,
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..200 {
            let d = jitter(base);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1500));
        }
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_backoff_delay() {
        assert_eq!(backoff_delay(2.0, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(2.0, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2.0, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(0.0, 2), Duration::ZERO);
        assert_eq!(backoff_delay(-1.0, 2), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_network() {
        let breaker = Arc::new(CircuitBreaker::new(&crate::config::BreakerConfig::default()));
        breaker.report("http://127.0.0.1:9/a.jpg", false, Some(429));

        let config = DownloadConfig {
            request_delay_secs: 0.0,
            ..Default::default()
        };
        let fetcher = Fetcher::new(&config, breaker).unwrap();
        let err = fetcher.fetch("http://127.0.0.1:9/a.jpg", None).await.unwrap_err();
        assert!(matches!(err, FetchAbandoned::CircuitOpen));
    }

    #[tokio::test]
    async fn test_connection_refused_exhausts_retries() {
        let breaker = Arc::new(CircuitBreaker::new(&crate::config::BreakerConfig {
            enabled: false,
            ..Default::default()
        }));
        let config = DownloadConfig {
            request_delay_secs: 0.0,
            backoff_base: 0.0,
            max_retries: 2,
            timeout_secs: 2,
            ..Default::default()
        };
        let fetcher = Fetcher::new(&config, breaker).unwrap();
        // * Port 9 (discard) is closed on test machines
        let err = fetcher.fetch("http://127.0.0.1:9/a.jpg", None).await.unwrap_err();
        match err {
            FetchAbandoned::Exhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(
                    last.reason,
                    FailureReason::Connect | FailureReason::Transport | FailureReason::Timeout
                ));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
