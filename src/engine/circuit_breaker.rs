// * Circuit Breaker
// * Tracks consecutive failures per domain and blocks a domain for a cooldown once it trips

use crate::config::BreakerConfig;
use crate::engine::normalization::domain_of;
use crate::ops::telemetry::record_breaker_trip;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// * HTTP status that trips the breaker on first sight
const RATE_LIMITED: u16 = 429;

// * Circuit state for a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

// * Result of checking circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitCheckResult {
    pub state: CircuitState,
    pub failure_count: u32,
    // * Time left until the domain reopens, when Open
    pub remaining: Option<Duration>,
}

#[derive(Debug, Default)]
struct DomainState {
    consecutive_failures: u32,
    blocked_until: Option<Instant>,
}

impl DomainState {
    fn is_blocked(&self, now: Instant) -> bool {
        matches!(self.blocked_until, Some(until) if now < until)
    }
}

// * CircuitBreaker isolates failing domains from healthy ones.
// * No half-open probe: a domain is Closed again as soon as its cooldown has elapsed.
#[derive(Debug)]
pub struct CircuitBreaker {
    enabled: bool,
    threshold: u32,
    cooldown: Duration,
    domains: Mutex<HashMap<String, DomainState>>,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            enabled: config.enabled,
            threshold: config.threshold.max(1),
            cooldown: config.cooldown(),
            domains: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    // * Domain key for a URL; unparseable URLs are keyed by themselves
    fn key(url: &str) -> String {
        domain_of(url).unwrap_or_else(|| url.to_string())
    }

    // * False while the URL's domain is inside its cooldown window
    pub fn allow(&self, url: &str) -> bool {
        if !self.enabled {
            return true;
        }
        let key = Self::key(url);
        let domains = self.domains.lock().unwrap_or_else(|e| e.into_inner());
        match domains.get(&key) {
            Some(state) => !state.is_blocked(Instant::now()),
            None => true,
        }
    }

    // * Records the result of one request against the URL's domain.
    // * Returns true when this report tripped the breaker.
    pub fn report(&self, url: &str, success: bool, status: Option<u16>) -> bool {
        if !self.enabled {
            return false;
        }
        let key = Self::key(url);
        let now = Instant::now();
        let mut domains = self.domains.lock().unwrap_or_else(|e| e.into_inner());
        let state = domains.entry(key.clone()).or_default();

        if success {
            // * blocked_until is left alone
            state.consecutive_failures = 0;
            return false;
        }

        if status == Some(RATE_LIMITED) {
            state.blocked_until = Some(now + self.cooldown);
            state.consecutive_failures = 0;
            drop(domains);
            warn!(domain = %key, cooldown_secs = self.cooldown.as_secs_f64(), "Circuit breaker TRIPPED by 429");
            record_breaker_trip();
            return true;
        }

        state.consecutive_failures += 1;
        debug!(domain = %key, failures = state.consecutive_failures, "Domain failure recorded");

        if state.consecutive_failures >= self.threshold {
            state.blocked_until = Some(now + self.cooldown);
            state.consecutive_failures = 0;
            drop(domains);
            warn!(
                domain = %key,
                threshold = self.threshold,
                cooldown_secs = self.cooldown.as_secs_f64(),
                "Circuit breaker TRIPPED"
            );
            record_breaker_trip();
            return true;
        }

        false
    }

    // * Checks the current circuit state for a domain key (see domain_of)
    pub fn check(&self, domain: &str) -> CircuitCheckResult {
        let now = Instant::now();
        let domains = self.domains.lock().unwrap_or_else(|e| e.into_inner());
        match domains.get(domain) {
            Some(state) if self.enabled && state.is_blocked(now) => CircuitCheckResult {
                state: CircuitState::Open,
                failure_count: state.consecutive_failures,
                remaining: state.blocked_until.map(|until| until - now),
            },
            Some(state) => CircuitCheckResult {
                state: CircuitState::Closed,
                failure_count: state.consecutive_failures,
                remaining: None,
            },
            None => CircuitCheckResult {
                state: CircuitState::Closed,
                failure_count: 0,
                remaining: None,
            },
        }
    }

    // * Clears a domain (manual recovery)
    pub fn reset(&self, domain: &str) {
        let mut domains = self.domains.lock().unwrap_or_else(|e| e.into_inner());
        domains.remove(domain);
    }

    // * Number of domains currently inside a cooldown
    pub fn open_domains(&self) -> usize {
        let now = Instant::now();
        let domains = self.domains.lock().unwrap_or_else(|e| e.into_inner());
        domains.values().filter(|s| s.is_blocked(now)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://img.example.com/a.jpg";
    const DOMAIN: &str = "img.example.com";

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker {
            enabled: true,
            threshold,
            cooldown: Duration::from_millis(cooldown_ms),
            domains: Mutex::new(HashMap::new()),
        }
    }

    #[test]
    fn test_trips_after_threshold() {
        let breaker = breaker(3, 60_000);
        assert!(!breaker.report(URL, false, Some(500)));
        assert!(!breaker.report(URL, false, None));
        assert!(breaker.allow(URL));
        assert!(breaker.report(URL, false, Some(503)));
        assert!(!breaker.allow(URL));

        let check = breaker.check(DOMAIN);
        assert_eq!(check.state, CircuitState::Open);
        // * Counter resets on trip
        assert_eq!(check.failure_count, 0);
        assert!(check.remaining.is_some());
    }

    #[test]
    fn test_429_trips_immediately() {
        let breaker = breaker(3, 60_000);
        assert!(breaker.report(URL, false, Some(429)));
        assert!(!breaker.allow(URL));
    }

    #[test]
    fn test_success_resets_counter() {
        let breaker = breaker(3, 60_000);
        breaker.report(URL, false, Some(500));
        breaker.report(URL, false, Some(500));
        breaker.report(URL, true, Some(200));
        assert_eq!(breaker.check(DOMAIN).failure_count, 0);
        breaker.report(URL, false, Some(500));
        breaker.report(URL, false, Some(500));
        assert!(breaker.allow(URL));
    }

    #[test]
    fn test_success_does_not_reopen_tripped_domain() {
        let breaker = breaker(1, 60_000);
        breaker.report(URL, false, Some(500));
        breaker.report(URL, true, Some(200));
        assert!(!breaker.allow(URL));
    }

    #[test]
    fn test_domains_are_isolated() {
        let breaker = breaker(1, 60_000);
        breaker.report(URL, false, Some(500));
        assert!(!breaker.allow(URL));
        assert!(breaker.allow("https://other.example.org/b.jpg"));
        assert_eq!(breaker.open_domains(), 1);
    }

    #[test]
    fn test_recovers_after_cooldown() {
        let breaker = breaker(1, 50);
        breaker.report(URL, false, Some(429));
        assert!(!breaker.allow(URL));
        std::thread::sleep(Duration::from_millis(80));
        assert!(breaker.allow(URL));
        assert_eq!(breaker.check(DOMAIN).state, CircuitState::Closed);
    }

    #[test]
    fn test_disabled_always_allows() {
        let breaker = CircuitBreaker::new(&BreakerConfig {
            enabled: false,
            ..Default::default()
        });
        for _ in 0..10 {
            assert!(!breaker.report(URL, false, Some(429)));
        }
        assert!(breaker.allow(URL));
    }

    #[test]
    fn test_reset() {
        let breaker = breaker(1, 60_000);
        breaker.report(URL, false, Some(500));
        breaker.reset(DOMAIN);
        assert!(breaker.allow(URL));
    }
}
