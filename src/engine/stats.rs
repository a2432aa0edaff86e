// * Pipeline Statistics
// * Run-local counters for every outcome, mirrored into the Prometheus registry

use crate::ops::telemetry;
use crate::persistence::DedupCheckResult;
use crate::refinery::{DecodeError, Rejection, RefineryReject};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

// * Every way a candidate can end without producing an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    UrlScreened,
    DuplicateUrl,
    CircuitOpen,
    FetchFailed,
    Decode,
    Grayscale,
    TooSmall,
    Orientation,
    Watermark,
    LowScore,
    ExactDuplicate,
    NearDuplicate,
    StorageFailed,
    MetadataFailed,
    Draining,
    Panicked,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::UrlScreened => "url_screened",
            DropReason::DuplicateUrl => "duplicate_url",
            DropReason::CircuitOpen => "circuit_open",
            DropReason::FetchFailed => "fetch_failed",
            DropReason::Decode => "decode",
            DropReason::Grayscale => "grayscale",
            DropReason::TooSmall => "too_small",
            DropReason::Orientation => "orientation",
            DropReason::Watermark => "watermark",
            DropReason::LowScore => "low_score",
            DropReason::ExactDuplicate => "exact_duplicate",
            DropReason::NearDuplicate => "near_duplicate",
            DropReason::StorageFailed => "storage_failed",
            DropReason::MetadataFailed => "metadata_failed",
            DropReason::Draining => "draining",
            DropReason::Panicked => "panicked",
        }
    }

    // * Environment or code problems, as opposed to expected content outcomes
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            DropReason::StorageFailed | DropReason::MetadataFailed | DropReason::Panicked
        )
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&Rejection> for DropReason {
    fn from(rejection: &Rejection) -> Self {
        match rejection {
            Rejection::TooSmall { .. } => DropReason::TooSmall,
            Rejection::Orientation { .. } => DropReason::Orientation,
            Rejection::Watermark { .. } => DropReason::Watermark,
            Rejection::LowScore { .. } => DropReason::LowScore,
        }
    }
}

impl From<&RefineryReject> for DropReason {
    fn from(reject: &RefineryReject) -> Self {
        match reject {
            RefineryReject::Decode(DecodeError::Grayscale) => DropReason::Grayscale,
            RefineryReject::Decode(_) => DropReason::Decode,
            RefineryReject::Filtered(rejection) => rejection.into(),
        }
    }
}

impl DropReason {
    // * Dedup verdict to drop reason; None when the hash is unique
    pub fn from_dedup(result: &DedupCheckResult) -> Option<Self> {
        match result {
            DedupCheckResult::Unique => None,
            DedupCheckResult::ExactDuplicate => Some(DropReason::ExactDuplicate),
            DedupCheckResult::NearDuplicate { .. } => Some(DropReason::NearDuplicate),
        }
    }
}

// * Snapshot of the counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub processed: u64,
    pub saved: u64,
    pub bytes_downloaded: u64,
    pub drops: HashMap<DropReason, u64>,
}

impl StatsSnapshot {
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.drops.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_dropped(&self) -> u64 {
        self.drops.values().sum()
    }
}

// * PipelineStats is shared by the producer, every worker and the heartbeat
#[derive(Debug, Default)]
pub struct PipelineStats {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    processed: AtomicU64,
    saved: AtomicU64,
    bytes_downloaded: AtomicU64,
    in_flight: AtomicU64,
    drops: Mutex<HashMap<DropReason, u64>>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        telemetry::set_queue_depth(self.queue_depth() as i64);
    }

    pub fn record_dequeued(&self) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
        telemetry::set_queue_depth(self.queue_depth() as i64);
    }

    // * Candidates sitting in the work queue
    pub fn queue_depth(&self) -> u64 {
        let enqueued = self.enqueued.load(Ordering::Relaxed);
        enqueued.saturating_sub(self.dequeued.load(Ordering::Relaxed))
    }

    pub fn begin_item(&self) {
        telemetry::increment_in_flight();
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_item(&self) {
        telemetry::decrement_in_flight();
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    // * Returns the new saved count
    pub fn record_saved(&self) -> u64 {
        telemetry::record_image_saved();
        self.saved.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_bytes(&self, bytes: u64) {
        telemetry::record_bytes_downloaded(bytes);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        telemetry::record_drop(reason.as_str());
        let mut drops = self.drops.lock().unwrap_or_else(|e| e.into_inner());
        *drops.entry(reason).or_insert(0) += 1;
    }

    pub fn saved(&self) -> u64 {
        self.saved.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self, reason: DropReason) -> u64 {
        let drops = self.drops.lock().unwrap_or_else(|e| e.into_inner());
        drops.get(&reason).copied().unwrap_or(0)
    }

    // * Largest drop counters first, ties broken by name
    pub fn top_drops(&self, n: usize) -> Vec<(DropReason, u64)> {
        let drops = self.drops.lock().unwrap_or_else(|e| e.into_inner());
        let mut top: Vec<(DropReason, u64)> = drops.iter().map(|(r, c)| (*r, *c)).collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.as_str().cmp(b.0.as_str())));
        top.truncate(n);
        top
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            saved: self.saved.load(Ordering::SeqCst),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            drops: self.drops.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }
}
