// * Pipeline Dispatcher
// * One producer streams candidates into a bounded queue; a fixed worker pool fetches, filters,
// * dedups and stores them. RUNNING -> DRAINING -> STOPPED.

use crate::config::PipelineConfig;
use crate::engine::circuit_breaker::CircuitBreaker;
use crate::engine::collector::{ImageCandidate, PageCollector};
use crate::engine::fetcher::{FetchAbandoned, Fetcher};
use crate::engine::normalization::{domain_of, path_has_keyword, url_fingerprint};
use crate::engine::rate_limiter::DomainGate;
use crate::engine::stats::{DropReason, PipelineStats, StatsSnapshot};
use crate::network::NetworkError;
use crate::persistence::{
    HashIndex, ImageRecord, MetadataStore, StorageError, StorageWriter, StoreError,
};
use crate::refinery::{ImageScorer, HeuristicPhotoScorer, Refinery};
use futures::{FutureExt, StreamExt};
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// * Drop reasons shown in the heartbeat
const HEARTBEAT_TOP_DROPS: usize = 5;

// * Startup failures of a run. Per-candidate failures never surface here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Metadata store error: {0}")]
    Store(#[from] StoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Network client error: {0}")]
    Network(#[from] NetworkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    // * The collector ran out of candidates
    CollectorExhausted,
    TargetReached,
    TimeLimit,
    BudgetExhausted,
    // * StopHandle::stop
    External,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::CollectorExhausted => "collector_exhausted",
            StopReason::TargetReached => "target_reached",
            StopReason::TimeLimit => "time_limit",
            StopReason::BudgetExhausted => "budget_exhausted",
            StopReason::External => "external",
        };
        f.write_str(s)
    }
}

// * Shared run state; the first reason to request a drain wins
struct RunControl {
    state: watch::Sender<RunState>,
    reason: Mutex<Option<StopReason>>,
}

impl RunControl {
    fn new() -> Self {
        let (state, _) = watch::channel(RunState::Running);
        Self {
            state,
            reason: Mutex::new(None),
        }
    }

    fn state(&self) -> RunState {
        *self.state.borrow()
    }

    fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    fn drain(&self, reason: StopReason) {
        let mut current = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        let changed = self.state.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Draining;
                true
            } else {
                false
            }
        });
        if changed {
            *current = Some(reason);
            drop(current);
            info!(reason = %reason, "Pipeline DRAINING");
        }
    }

    fn stop(&self) {
        self.state.send_replace(RunState::Stopped);
    }

    fn reason(&self) -> Option<StopReason> {
        *self.reason.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// * Resolves once the run leaves RUNNING
async fn wait_until_draining(rx: &mut watch::Receiver<RunState>) {
    loop {
        if *rx.borrow_and_update() != RunState::Running {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Lets the caller force the DRAINING transition (e.g. on Ctrl-C)
#[derive(Clone)]
pub struct StopHandle {
    control: Arc<RunControl>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.control.drain(StopReason::External);
    }

    pub fn state(&self) -> RunState {
        self.control.state()
    }
}

/// Outcome of a finished run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Images already in the store when the run started
    pub starting_count: u64,
    pub saved: u64,
    pub stats: StatsSnapshot,
    pub stop_reason: StopReason,
    pub elapsed: Duration,
}

impl RunReport {
    /// Dataset size at the end of the run
    pub fn total(&self) -> u64 {
        self.starting_count + self.saved
    }
}

// * Everything a worker needs, shared behind one Arc
struct WorkerContext {
    config: Arc<PipelineConfig>,
    store: Arc<dyn MetadataStore>,
    refinery: Arc<Refinery>,
    index: HashIndex,
    writer: StorageWriter,
    fetcher: Fetcher,
    gate: DomainGate,
    global: Arc<Semaphore>,
    stats: Arc<PipelineStats>,
    control: Arc<RunControl>,
    starting_count: u64,
}

/// The Pipeline Orchestrator.
///
/// A `Dispatcher` drives a single run; build a new one for the next run.
pub struct Dispatcher {
    config: Arc<PipelineConfig>,
    store: Arc<dyn MetadataStore>,
    scorer: Option<Arc<dyn ImageScorer>>,
    control: Arc<RunControl>,
    stats: Arc<PipelineStats>,
}

impl Dispatcher {
    /// `scorer` is the external classifier; without one, `classifier.heuristic` selects the built-in scorer
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn MetadataStore>,
        scorer: Option<Arc<dyn ImageScorer>>,
    ) -> Self {
        let scorer = scorer.or_else(|| {
            config
                .classifier
                .heuristic
                .then(|| Arc::new(HeuristicPhotoScorer::new()) as Arc<dyn ImageScorer>)
        });

        Self {
            config: Arc::new(config),
            store,
            scorer,
            control: Arc::new(RunControl::new()),
            stats: Arc::new(PipelineStats::new()),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// Live counters, readable while the run is in progress
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Runs the pipeline until the collector is exhausted or a stop condition fires
    pub async fn run(&self, collector: &dyn PageCollector) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let config = Arc::clone(&self.config);
        let threads = config.download.threads.max(1);
        let target = config.run.target;

        let starting_count = self.store.count_images().await?;
        info!(
            starting_count = starting_count,
            target = target,
            threads = threads,
            "Pipeline starting"
        );

        if target > 0 && starting_count >= target {
            info!(starting_count = starting_count, target = target, "Target already reached");
            self.control.drain(StopReason::TargetReached);
            self.control.stop();
            return Ok(self.report(starting_count, started));
        }

        let index = HashIndex::load(self.store.as_ref()).await?;
        let writer = StorageWriter::open(&config.storage, Arc::clone(&self.store)).await?;
        let breaker = Arc::new(CircuitBreaker::new(&config.download.circuit_breaker));
        let fetcher = Fetcher::new(&config.download, breaker)?;

        let ctx = Arc::new(WorkerContext {
            config: Arc::clone(&config),
            store: Arc::clone(&self.store),
            refinery: Arc::new(Refinery::new(
                config.image.clone(),
                &config.classifier,
                self.scorer.clone(),
            )),
            index,
            writer,
            fetcher,
            gate: DomainGate::new(
                config.download.per_site_concurrency,
                config.download.max_requests_per_second_per_site,
            ),
            global: Arc::new(Semaphore::new(threads)),
            stats: Arc::clone(&self.stats),
            control: Arc::clone(&self.control),
            starting_count,
        });

        let (tx, rx) = mpsc::channel::<ImageCandidate>(config.queue_capacity());
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let producer = tokio::spawn(produce(Arc::clone(&ctx), collector.candidates(), tx));

        let workers: Vec<JoinHandle<()>> = (0..threads)
            .map(|id| tokio::spawn(consume(id, Arc::clone(&ctx), Arc::clone(&rx))))
            .collect();

        let heartbeat = tokio::spawn(heartbeat(Arc::clone(&ctx)));
        let timer = (config.run.run_seconds > 0).then(|| {
            let control = Arc::clone(&self.control);
            let limit = Duration::from_secs(config.run.run_seconds);
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                control.drain(StopReason::TimeLimit);
            })
        });

        if let Err(e) = producer.await {
            error!(error = %e, "Producer task failed");
        }
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task failed");
            }
        }

        heartbeat.abort();
        if let Some(timer) = timer {
            timer.abort();
        }

        self.control.drain(StopReason::CollectorExhausted);
        self.control.stop();

        let report = self.report(starting_count, started);
        info!(
            saved = report.saved,
            total = report.total(),
            stop_reason = %report.stop_reason,
            elapsed_secs = report.elapsed.as_secs_f64(),
            "Pipeline STOPPED"
        );
        Ok(report)
    }

    fn report(&self, starting_count: u64, started: Instant) -> RunReport {
        let stats = self.stats.snapshot();
        RunReport {
            starting_count,
            saved: stats.saved,
            stats,
            stop_reason: self
                .control
                .reason()
                .unwrap_or(StopReason::CollectorExhausted),
            elapsed: started.elapsed(),
        }
    }
}

// * Pulls from the collector until it ends or the run drains. Blocks on a full queue.
async fn produce(
    ctx: Arc<WorkerContext>,
    mut candidates: futures::stream::BoxStream<'static, ImageCandidate>,
    tx: mpsc::Sender<ImageCandidate>,
) {
    let download = &ctx.config.download;
    let mut seen: HashSet<u64> = HashSet::new();
    let mut state_rx = ctx.control.state.subscribe();

    loop {
        let next = tokio::select! {
            biased;
            _ = wait_until_draining(&mut state_rx) => break,
            next = candidates.next() => next,
        };
        let Some(candidate) = next else {
            debug!(seen = seen.len(), "Collector exhausted");
            break;
        };

        if download.skip_watermarked_urls
            && path_has_keyword(&candidate.url, &download.watermark_keywords)
        {
            debug!(url = %candidate.url, "URL screened by keyword");
            ctx.stats.record_drop(DropReason::UrlScreened);
            continue;
        }

        if !seen.insert(url_fingerprint(&candidate.url)) {
            ctx.stats.record_drop(DropReason::DuplicateUrl);
            continue;
        }

        tokio::select! {
            biased;
            _ = wait_until_draining(&mut state_rx) => {
                ctx.stats.record_drop(DropReason::Draining);
                break;
            }
            sent = tx.send(candidate) => {
                if sent.is_err() {
                    break;
                }
                ctx.stats.record_enqueued();
            }
        }
    }
}

// * Worker loop: one candidate at a time until the queue closes
async fn consume(
    id: usize,
    ctx: Arc<WorkerContext>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ImageCandidate>>>,
) {
    debug!(worker = id, "Worker started");
    loop {
        let next = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(candidate) = next else {
            break;
        };
        ctx.stats.record_dequeued();

        if !ctx.control.is_running() {
            ctx.stats.record_drop(DropReason::Draining);
            continue;
        }

        let Ok(_slot) = Arc::clone(&ctx.global).acquire_owned().await else {
            break;
        };

        ctx.stats.begin_item();
        let outcome = AssertUnwindSafe(process(&ctx, &candidate))
            .catch_unwind()
            .await;
        ctx.stats.end_item();

        match outcome {
            Ok(Ok(record)) => on_saved(&ctx, &record),
            Ok(Err(reason)) => ctx.stats.record_drop(reason),
            Err(_) => {
                error!(worker = id, url = %candidate.url, "Candidate processing panicked");
                ctx.stats.record_drop(DropReason::Panicked);
            }
        }
    }
    debug!(worker = id, "Worker finished");
}

fn on_saved(ctx: &WorkerContext, record: &ImageRecord) {
    let saved = ctx.stats.record_saved();
    let total = ctx.starting_count + saved;
    info!(
        url = %record.url,
        path = %record.saved_path.display(),
        phash = %record.phash,
        total = total,
        "Image saved"
    );

    let target = ctx.config.run.target;
    if target > 0 && total >= target {
        ctx.control.drain(StopReason::TargetReached);
    }
    if ctx.writer.budget_exhausted() {
        warn!(bytes = ctx.writer.total_bytes(), "Storage budget exhausted");
        ctx.control.drain(StopReason::BudgetExhausted);
    }
}

// * Fetch -> refine -> dedup -> store for a single candidate
async fn process(
    ctx: &WorkerContext,
    candidate: &ImageCandidate,
) -> Result<ImageRecord, DropReason> {
    let url = candidate.url.as_str();
    let Some(domain) = domain_of(url) else {
        debug!(url = %url, "Candidate URL has no host");
        return Err(DropReason::FetchFailed);
    };

    let fetched = {
        let _site = ctx
            .gate
            .acquire(&domain)
            .await
            .ok_or(DropReason::FetchFailed)?;
        ctx.fetcher
            .fetch(url, candidate.referer.as_deref())
            .await
            .map_err(|e| {
                debug!(url = %url, reason = %e, "Fetch abandoned");
                match e {
                    FetchAbandoned::CircuitOpen => DropReason::CircuitOpen,
                    _ => DropReason::FetchFailed,
                }
            })?
    };
    ctx.stats.record_bytes(fetched.bytes.len() as u64);

    let refinery = Arc::clone(&ctx.refinery);
    let bytes = fetched.bytes;
    let refined = tokio::task::spawn_blocking(move || refinery.process(&bytes))
        .await
        .map_err(|e| {
            error!(url = %url, error = %e, "Refinery task failed");
            DropReason::Panicked
        })?
        .map_err(|reject| {
            debug!(url = %url, reason = %reject, "Image rejected");
            DropReason::from(&reject)
        })?;

    if ctx.config.dedup.enable {
        let phash = refined.phash;
        let exists = ctx.store.has_exact_hash(phash).await.map_err(|e| {
            error!(url = %url, error = %e, "Hash lookup failed");
            DropReason::MetadataFailed
        })?;
        if exists {
            return Err(DropReason::ExactDuplicate);
        }

        // * The only critical section: check-then-insert on the in-memory index
        let verdict = ctx
            .index
            .check_and_insert(phash, ctx.config.dedup.hamming_threshold);
        if let Some(reason) = DropReason::from_dedup(&verdict) {
            debug!(url = %url, phash = %phash, verdict = ?verdict, "Duplicate image");
            return Err(reason);
        }

        if let Err(e) = ctx.store.insert_hash(phash).await {
            error!(url = %url, phash = %phash, error = %e, "Hash insert failed");
            return Err(DropReason::MetadataFailed);
        }
    }

    ctx.writer
        .write(refined, url, &domain)
        .await
        .map_err(|e| {
            if e.is_orphan() {
                DropReason::MetadataFailed
            } else {
                error!(url = %url, error = %e, "Storage write failed");
                DropReason::StorageFailed
            }
        })
}

// * Periodic progress log; no effect on the run
async fn heartbeat(ctx: Arc<WorkerContext>) {
    let period = Duration::from_secs(ctx.config.run.heartbeat_secs.max(1));
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tick.tick().await;
        let top: Vec<String> = ctx
            .stats
            .top_drops(HEARTBEAT_TOP_DROPS)
            .into_iter()
            .map(|(reason, count)| format!("{}={}", reason, count))
            .collect();
        info!(
            saved = ctx.stats.saved(),
            total = ctx.starting_count + ctx.stats.saved(),
            target = ctx.config.run.target,
            queue_depth = ctx.stats.queue_depth(),
            in_flight = ctx.stats.in_flight(),
            open_domains = ctx.fetcher.breaker().open_domains(),
            top_drops = %top.join(","),
            "Heartbeat"
        );
    }
}
