// * Engine: the control plane of a run
// * Candidate intake, per-domain governance, fetch retries and the worker pool

pub mod circuit_breaker;
pub mod collector;
pub mod dispatcher;
pub mod fetcher;
pub mod normalization;
pub mod rate_limiter;
pub mod stats;

pub use circuit_breaker::{CircuitBreaker, CircuitCheckResult, CircuitState};
pub use collector::{ImageCandidate, LineFileCollector, PageCollector, StaticCollector};
pub use dispatcher::{Dispatcher, PipelineError, RunReport, RunState, StopHandle, StopReason};
pub use fetcher::{FetchAbandoned, Fetcher};
pub use rate_limiter::{DomainGate, DomainSlot};
pub use stats::{DropReason, PipelineStats, StatsSnapshot};
