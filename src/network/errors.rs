use std::fmt;
use thiserror::Error;

// * Unified Error type for the Network Layer.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid header value for {0}")]
    InvalidHeader(&'static str),
}

// * Why a single fetch attempt produced no image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    // * Non-success HTTP status
    HttpStatus,
    // * 200 with a text/html/json/xml/js body
    UnsupportedMedia,
    // * Body larger than the configured cap
    TooLarge,
    Timeout,
    Connect,
    // * Any other transport error (reset, body read, redirect loop)
    Transport,
    // * Circuit breaker refused the attempt
    CircuitOpen,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::HttpStatus => "http_status",
            FailureReason::UnsupportedMedia => "unsupported_media",
            FailureReason::TooLarge => "too_large",
            FailureReason::Timeout => "timeout",
            FailureReason::Connect => "connect",
            FailureReason::Transport => "transport",
            FailureReason::CircuitOpen => "circuit_open",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchFailure {
    pub reason: FailureReason,
    pub status: Option<u16>,
}

impl FetchFailure {
    pub fn new(reason: FailureReason, status: Option<u16>) -> Self {
        Self { reason, status }
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (HTTP {})", self.reason, status),
            None => write!(f, "{}", self.reason),
        }
    }
}

// * Bytes of a successful image response
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub status: u16,
    pub content_type: Option<String>,
}

// * Result of one fetch attempt, as a value. Retry logic is a match over this.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Success(FetchedImage),
    // * Worth another attempt after backoff
    Retryable(FetchFailure),
    // * No retry will change the answer
    Permanent(FetchFailure),
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success(_))
    }

    pub fn failure(&self) -> Option<&FetchFailure> {
        match self {
            FetchOutcome::Success(_) => None,
            FetchOutcome::Retryable(f) | FetchOutcome::Permanent(f) => Some(f),
        }
    }
}

// * Maps a non-success status to its retry class: 408, 429 and 5xx retry, other 4xx do not
pub fn outcome_for_status(status: u16) -> FetchOutcome {
    let failure = FetchFailure::new(FailureReason::HttpStatus, Some(status));
    match status {
        408 | 429 => FetchOutcome::Retryable(failure),
        400..=499 => FetchOutcome::Permanent(failure),
        _ => FetchOutcome::Retryable(failure),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert!(matches!(outcome_for_status(404), FetchOutcome::Permanent(_)));
        assert!(matches!(outcome_for_status(403), FetchOutcome::Permanent(_)));
        assert!(matches!(outcome_for_status(429), FetchOutcome::Retryable(_)));
        assert!(matches!(outcome_for_status(408), FetchOutcome::Retryable(_)));
        assert!(matches!(outcome_for_status(503), FetchOutcome::Retryable(_)));
        assert_eq!(outcome_for_status(500).failure().unwrap().status, Some(500));
    }

    #[test]
    fn test_failure_display() {
        let failure = FetchFailure::new(FailureReason::HttpStatus, Some(503));
        assert_eq!(failure.to_string(), "http_status (HTTP 503)");
        assert_eq!(FetchFailure::new(FailureReason::Timeout, None).to_string(), "timeout");
    }
}
