// * Network Layer: image HTTP client, request identity and fetch outcomes

pub mod client;
pub mod errors;
pub mod identity;

pub use client::{classify_response, ImageClient, ResponseClass};
pub use errors::{
    outcome_for_status, FailureReason, FetchFailure, FetchOutcome, FetchedImage, NetworkError,
};
pub use identity::{build_headers, UserAgentPool};
