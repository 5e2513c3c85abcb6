use crate::extract::{ExtractError, Extractor};
use crate::metrics;
use crate::models::{
    FailedItem, ItemHandle, ItemRecord, PriceQuote, ProgressEntry, Stage, StageRecord,
    ValuationResult,
};
use crate::progress::ProgressStore;
use crate::sources::PriceFinder;
use crate::valuate::Valuator;
use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network-shaped failure worth retrying with backoff.
    Transient,
    /// Page shape no longer matches; retrying the same request cannot help.
    Structural,
    /// Upstream asked us to slow down.
    RateLimited,
    /// Text recognition failed for an image.
    Recognition,
    /// Bad configuration; fatal for the run, surfaced before processing.
    Config,
}

#[derive(Debug, Error)]
#[error("{stage:?} stage failed: {message}")]
pub struct PipelineError {
    pub stage: Stage,
    pub message: String,
    pub kind: ErrorKind,
}

impl PipelineError {
    pub fn retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Transient | ErrorKind::RateLimited)
    }
}

impl From<ExtractError> for PipelineError {
    fn from(err: ExtractError) -> Self {
        let kind = match &err {
            ExtractError::PageUnavailable(_) => ErrorKind::Transient,
            ExtractError::StructureMismatch { .. } => ErrorKind::Structural,
        };
        Self {
            stage: Stage::Extract,
            message: err.to_string(),
            kind,
        }
    }
}

/// Extraction seam the orchestrator drives; the concrete extractor already
/// handles the relaxed-selector retry internally.
#[async_trait]
pub trait ExtractStage: Send + Sync {
    async fn extract(&self, handle: &ItemHandle) -> Result<ItemRecord, PipelineError>;
}

#[async_trait]
impl ExtractStage for Extractor {
    async fn extract(&self, handle: &ItemHandle) -> Result<ItemRecord, PipelineError> {
        Ok(Extractor::extract(self, handle).await?)
    }
}

/// Pricing seam. The production finder absorbs source failures into empty
/// quote sets, so its error arm is never taken; the seam keeps the retry
/// policy applicable to stricter implementations.
#[async_trait]
pub trait PriceStage: Send + Sync {
    async fn find_prices(&self, item: &ItemRecord) -> Result<Vec<PriceQuote>, PipelineError>;
}

#[async_trait]
impl PriceStage for PriceFinder {
    async fn find_prices(&self, item: &ItemRecord) -> Result<Vec<PriceQuote>, PipelineError> {
        Ok(PriceFinder::find_prices(self, item).await)
    }
}

/// Retry ceilings and backoff shape for the network-bound stages.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub extract_attempts: u32,
    pub price_attempts: u32,
    pub backoff_base: Duration,
}

/// Everything the run hands to the report boundary.
#[derive(Debug)]
pub struct RunOutcome {
    pub results: Vec<ValuationResult>,
    pub failures: Vec<FailedItem>,
    pub discovered: usize,
    pub resumed: usize,
}

/// Drives each discovered item through extract, price and valuate. Stage
/// outcomes go to the progress store before the item advances, so a crash at
/// any point resumes as a continuation instead of a rerun.
pub struct Orchestrator {
    extractor: Arc<dyn ExtractStage>,
    pricer: Arc<dyn PriceStage>,
    valuator: Valuator,
    progress: Arc<ProgressStore>,
    retry: RetryPolicy,
    worker_pool_size: usize,
    network_slots: Arc<Semaphore>,
    cancel: watch::Receiver<bool>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        extractor: Arc<dyn ExtractStage>,
        pricer: Arc<dyn PriceStage>,
        valuator: Valuator,
        progress: Arc<ProgressStore>,
        retry: RetryPolicy,
        worker_pool_size: usize,
        global_network_cap: usize,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            extractor,
            pricer,
            valuator,
            progress,
            retry,
            worker_pool_size: worker_pool_size.max(1),
            network_slots: Arc::new(Semaphore::new(global_network_cap.max(1))),
            cancel,
        }
    }

    /// Processes the batch with a bounded worker pool. One item's failure
    /// never halts the run; the outcome aggregates everything the progress
    /// store knows when the pool drains.
    pub async fn run(&self, handles: Vec<ItemHandle>) -> RunOutcome {
        let discovered = handles.len();
        let discovered_ids: std::collections::HashSet<String> =
            handles.iter().map(|handle| handle.id.clone()).collect();
        let resumed = AtomicUsize::new(0);

        futures::stream::iter(handles)
            .for_each_concurrent(self.worker_pool_size, |handle| {
                let resumed = &resumed;
                async move {
                    if *self.cancel.borrow() {
                        return;
                    }
                    self.process_item(&handle, resumed).await;
                }
            })
            .await;

        // The log may hold entries from other auctions sharing the data dir
        // or from items beyond a lowered cap; the report covers only what
        // this run discovered.
        let mut results = self.progress.completed_valuations().await;
        results.retain(|result| discovered_ids.contains(&result.item_id));
        let mut failures = self.progress.failures().await;
        failures.retain(|failure| discovered_ids.contains(&failure.item_id));
        info!(
            target = "lotscout.pipeline",
            discovered,
            valuated = results.len(),
            failed = failures.len(),
            resumed = resumed.load(Ordering::SeqCst),
            "run complete"
        );
        RunOutcome {
            results,
            failures,
            discovered,
            resumed: resumed.load(Ordering::SeqCst),
        }
    }

    /// One item's state machine. Consults the progress store first and
    /// resumes from the recorded snapshot; a previously failed item is
    /// re-attempted from the start.
    async fn process_item(&self, handle: &ItemHandle, resumed: &AtomicUsize) {
        let (record, quotes) = match self.progress.latest(&handle.id).await.map(|e| e.record) {
            Some(StageRecord::Valuated { .. }) => {
                resumed.fetch_add(1, Ordering::SeqCst);
                metrics::item_state("skipped_complete");
                return;
            }
            Some(StageRecord::Priced { record, quotes }) => {
                resumed.fetch_add(1, Ordering::SeqCst);
                (record, Some(quotes))
            }
            Some(StageRecord::Extracted { record }) => {
                resumed.fetch_add(1, Ordering::SeqCst);
                (record, None)
            }
            Some(StageRecord::Failed { stage, .. }) => {
                info!(
                    target = "lotscout.pipeline",
                    item_id = %handle.id,
                    failed_stage = stage.as_str(),
                    "re-attempting previously failed item"
                );
                match self.run_extract(handle).await {
                    Some(record) => (record, None),
                    None => return,
                }
            }
            None => match self.run_extract(handle).await {
                Some(record) => (record, None),
                None => return,
            },
        };

        if *self.cancel.borrow() {
            return;
        }

        let quotes = match quotes {
            Some(quotes) => quotes,
            None => match self.run_price(&record).await {
                Some(quotes) => quotes,
                None => return,
            },
        };

        // Valuation is pure and cheap; it runs inline, no retry policy.
        let started = Instant::now();
        let result = self.valuator.valuate(&record, quotes);
        metrics::stage_elapsed("valuate", started.elapsed().as_millis());
        self.record(&record.id, StageRecord::Valuated { result }).await;
        metrics::item_state("valuated");
    }

    /// Extract with retry; records the outcome either way. None means the
    /// item is done (failed terminally or the run was cancelled mid-retry).
    async fn run_extract(&self, handle: &ItemHandle) -> Option<ItemRecord> {
        let started = Instant::now();
        let outcome = self
            .with_retry(Stage::Extract, self.retry.extract_attempts, || async move {
                let _permit = self.acquire_network_slot().await?;
                self.extractor.extract(handle).await
            })
            .await;
        metrics::stage_elapsed("extract", started.elapsed().as_millis());

        match outcome {
            Ok(record) => {
                self.record(
                    &handle.id,
                    StageRecord::Extracted {
                        record: record.clone(),
                    },
                )
                .await;
                metrics::item_state("extracted");
                Some(record)
            }
            Err(err) => {
                self.record(
                    &handle.id,
                    StageRecord::Failed {
                        stage: Stage::Extract,
                        reason: err.message,
                    },
                )
                .await;
                metrics::item_state("failed");
                None
            }
        }
    }

    async fn run_price(&self, record: &ItemRecord) -> Option<Vec<PriceQuote>> {
        let started = Instant::now();
        let outcome = self
            .with_retry(Stage::Price, self.retry.price_attempts, || async move {
                let _permit = self.acquire_network_slot().await?;
                self.pricer.find_prices(record).await
            })
            .await;
        metrics::stage_elapsed("price", started.elapsed().as_millis());

        match outcome {
            Ok(quotes) => {
                self.record(
                    &record.id,
                    StageRecord::Priced {
                        record: record.clone(),
                        quotes: quotes.clone(),
                    },
                )
                .await;
                metrics::item_state("priced");
                Some(quotes)
            }
            Err(err) => {
                self.record(
                    &record.id,
                    StageRecord::Failed {
                        stage: Stage::Price,
                        reason: err.message,
                    },
                )
                .await;
                metrics::item_state("failed");
                None
            }
        }
    }

    async fn with_retry<T, F, Fut>(
        &self,
        stage: Stage,
        attempts: u32,
        op: F,
    ) -> Result<T, PipelineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let attempts = attempts.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            if *self.cancel.borrow() {
                return Err(PipelineError {
                    stage,
                    message: "run cancelled".into(),
                    kind: ErrorKind::Transient,
                });
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = err.retryable() && attempt + 1 < attempts;
                    warn!(
                        target = "lotscout.pipeline",
                        stage = stage.as_str(),
                        attempt = attempt + 1,
                        error = %err,
                        retrying = retryable,
                        "stage attempt failed"
                    );
                    if !retryable {
                        return Err(err);
                    }
                    tokio::time::sleep(self.backoff(attempt)).await;
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(PipelineError {
            stage,
            message: "retry ceiling reached".into(),
            kind: ErrorKind::Transient,
        }))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry.backoff_base;
        let exp = base.saturating_mul(2_u32.saturating_pow(attempt));
        let jitter_ceiling = (base.as_millis() as u64 / 2).max(1);
        let jitter = rand::rng().random_range(0..jitter_ceiling);
        exp + Duration::from_millis(jitter)
    }

    async fn acquire_network_slot(
        &self,
    ) -> Result<tokio::sync::SemaphorePermit<'_>, PipelineError> {
        self.network_slots
            .acquire()
            .await
            .map_err(|_| PipelineError {
                stage: Stage::Extract,
                message: "network slot pool closed".into(),
                kind: ErrorKind::Transient,
            })
    }

    async fn record(&self, item_id: &str, record: StageRecord) {
        if let Err(err) = self
            .progress
            .append(ProgressEntry::new(item_id, record))
            .await
        {
            // The run goes on; the affected item just loses resume coverage.
            warn!(
                target = "lotscout.pipeline",
                item_id,
                error = %err,
                "failed to record progress entry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Confidence;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn temp_log() -> PathBuf {
        std::env::temp_dir().join(format!("lotscout-pipeline-{}.jsonl", uuid::Uuid::new_v4()))
    }

    fn handle(id: &str) -> ItemHandle {
        ItemHandle {
            id: id.into(),
            source_url: format!("https://auction.example/lots/{id}"),
            listing_title: format!("Lot {id}"),
        }
    }

    fn record_for(id: &str) -> ItemRecord {
        ItemRecord {
            id: id.into(),
            title: format!("Item {id}"),
            description: "Dyson V10 vacuum".into(),
            condition: None,
            current_bid: Some(40.0),
            time_remaining: None,
            source_url: format!("https://auction.example/lots/{id}"),
            image_refs: Vec::new(),
            raw_fields: BTreeMap::new(),
        }
    }

    struct MockExtractor {
        calls: AtomicUsize,
        fail_ids: Vec<String>,
    }

    impl MockExtractor {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_ids: Vec::new(),
            }
        }

        fn failing_on(ids: &[&str]) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_ids: ids.iter().map(|id| id.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl ExtractStage for MockExtractor {
        async fn extract(&self, handle: &ItemHandle) -> Result<ItemRecord, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_ids.contains(&handle.id) {
                return Err(PipelineError {
                    stage: Stage::Extract,
                    message: "HTTP 503".into(),
                    kind: ErrorKind::Transient,
                });
            }
            Ok(record_for(&handle.id))
        }
    }

    struct MockPricer {
        calls: AtomicUsize,
        quotes: Vec<PriceQuote>,
    }

    impl MockPricer {
        fn with_quotes(quotes: Vec<PriceQuote>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                quotes,
            }
        }

        fn empty() -> Self {
            Self::with_quotes(Vec::new())
        }
    }

    #[async_trait]
    impl PriceStage for MockPricer {
        async fn find_prices(&self, _item: &ItemRecord) -> Result<Vec<PriceQuote>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.quotes.clone())
        }
    }

    fn quote(price: f64) -> PriceQuote {
        PriceQuote {
            source_name: "web_search".into(),
            price,
            currency: "USD".into(),
            match_confidence: 0.8,
            query_used: "dyson v10".into(),
        }
    }

    fn orchestrator(
        extractor: Arc<MockExtractor>,
        pricer: Arc<MockPricer>,
        progress: Arc<ProgressStore>,
        cancel: watch::Receiver<bool>,
    ) -> Orchestrator {
        Orchestrator::new(
            extractor,
            pricer,
            Valuator::new(0.5),
            progress,
            RetryPolicy {
                extract_attempts: 2,
                price_attempts: 2,
                backoff_base: Duration::from_millis(1),
            },
            4,
            8,
            cancel,
        )
    }

    #[tokio::test]
    async fn second_run_reinvokes_nothing_and_keeps_results() {
        let path = temp_log();
        let (_tx, cancel) = watch::channel(false);
        let handles = vec![handle("a"), handle("b")];

        let progress = Arc::new(ProgressStore::open(&path).await.unwrap());
        let extractor = Arc::new(MockExtractor::new());
        let pricer = Arc::new(MockPricer::with_quotes(vec![quote(100.0), quote(110.0)]));
        let first = orchestrator(extractor, pricer, progress, cancel.clone())
            .run(handles.clone())
            .await;
        assert_eq!(first.results.len(), 2);

        let progress = Arc::new(ProgressStore::open(&path).await.unwrap());
        let extractor = Arc::new(MockExtractor::new());
        let pricer = Arc::new(MockPricer::with_quotes(vec![quote(999.0)]));
        let second = orchestrator(extractor.clone(), pricer.clone(), progress, cancel)
            .run(handles)
            .await;

        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(pricer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.resumed, 2);
        let mut estimates: Vec<_> = second
            .results
            .iter()
            .map(|result| result.estimated_value)
            .collect();
        estimates.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(estimates, vec![Some(105.0), Some(105.0)]);
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn extracted_item_resumes_at_pricing() {
        let path = temp_log();
        let (_tx, cancel) = watch::channel(false);

        let progress = Arc::new(ProgressStore::open(&path).await.unwrap());
        progress
            .append(ProgressEntry::new(
                "a",
                StageRecord::Extracted {
                    record: record_for("a"),
                },
            ))
            .await
            .unwrap();

        let extractor = Arc::new(MockExtractor::new());
        let pricer = Arc::new(MockPricer::with_quotes(vec![quote(90.0), quote(100.0)]));
        let outcome = orchestrator(extractor.clone(), pricer.clone(), progress, cancel)
            .run(vec![handle("a")])
            .await;

        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(pricer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.resumed, 1);
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn one_failing_item_never_halts_the_run() {
        let path = temp_log();
        let (_tx, cancel) = watch::channel(false);

        let progress = Arc::new(ProgressStore::open(&path).await.unwrap());
        let extractor = Arc::new(MockExtractor::failing_on(&["bad"]));
        let pricer = Arc::new(MockPricer::with_quotes(vec![quote(50.0), quote(60.0)]));
        let outcome = orchestrator(extractor.clone(), pricer, progress, cancel)
            .run(vec![handle("bad"), handle("good")])
            .await;

        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].item_id, "good");
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].item_id, "bad");
        assert_eq!(outcome.failures[0].stage, Stage::Extract);
        // Both attempts spent on the failing item, one on the good one.
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 3);
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn pricing_with_no_quotes_still_valuates_low_confidence() {
        let path = temp_log();
        let (_tx, cancel) = watch::channel(false);

        let progress = Arc::new(ProgressStore::open(&path).await.unwrap());
        let extractor = Arc::new(MockExtractor::new());
        let pricer = Arc::new(MockPricer::empty());
        let outcome = orchestrator(extractor, pricer, progress, cancel)
            .run(vec![handle("a")])
            .await;

        assert_eq!(outcome.results.len(), 1);
        let result = &outcome.results[0];
        assert!(result.estimated_value.is_none());
        assert!(result.profit_margin.is_none());
        assert_eq!(result.confidence, Confidence::Low);
        assert!(result.price_quotes.is_empty());
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn cancelled_run_issues_no_stage_operations() {
        let path = temp_log();
        let (tx, cancel) = watch::channel(false);
        tx.send(true).unwrap();

        let progress = Arc::new(ProgressStore::open(&path).await.unwrap());
        let extractor = Arc::new(MockExtractor::new());
        let pricer = Arc::new(MockPricer::empty());
        let outcome = orchestrator(extractor.clone(), pricer.clone(), progress, cancel)
            .run(vec![handle("a"), handle("b")])
            .await;

        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(pricer.calls.load(Ordering::SeqCst), 0);
        assert!(outcome.results.is_empty());
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn outcome_excludes_entries_for_undiscovered_items() {
        let path = temp_log();
        let (_tx, cancel) = watch::channel(false);

        // Leftovers from a different auction sharing the same progress log.
        let progress = Arc::new(ProgressStore::open(&path).await.unwrap());
        progress
            .append(ProgressEntry::new(
                "other-auction-lot",
                StageRecord::Valuated {
                    result: ValuationResult {
                        item_id: "other-auction-lot".into(),
                        estimated_value: Some(500.0),
                        acquisition_cost: Some(100.0),
                        profit_margin: Some(400.0),
                        confidence: Confidence::High,
                        price_quotes: vec![],
                    },
                },
            ))
            .await
            .unwrap();
        progress
            .append(ProgressEntry::new(
                "other-auction-dud",
                StageRecord::Failed {
                    stage: Stage::Extract,
                    reason: "HTTP 500".into(),
                },
            ))
            .await
            .unwrap();

        let extractor = Arc::new(MockExtractor::new());
        let pricer = Arc::new(MockPricer::with_quotes(vec![quote(50.0), quote(60.0)]));
        let outcome = orchestrator(extractor, pricer, progress, cancel)
            .run(vec![handle("a")])
            .await;

        assert_eq!(outcome.discovered, 1);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].item_id, "a");
        assert!(outcome.failures.is_empty());
        tokio::fs::remove_file(&path).await.ok();
    }

    #[test]
    fn only_transient_and_rate_limited_errors_are_retryable() {
        let err = |kind| PipelineError {
            stage: Stage::Extract,
            message: "x".into(),
            kind,
        };
        assert!(err(ErrorKind::Transient).retryable());
        assert!(err(ErrorKind::RateLimited).retryable());
        assert!(!err(ErrorKind::Structural).retryable());
        assert!(!err(ErrorKind::Recognition).retryable());
        assert!(!err(ErrorKind::Config).retryable());
    }

    #[tokio::test]
    async fn failed_item_is_reattempted_on_resume() {
        let path = temp_log();
        let (_tx, cancel) = watch::channel(false);

        let progress = Arc::new(ProgressStore::open(&path).await.unwrap());
        progress
            .append(ProgressEntry::new(
                "a",
                StageRecord::Failed {
                    stage: Stage::Extract,
                    reason: "HTTP 503".into(),
                },
            ))
            .await
            .unwrap();

        let extractor = Arc::new(MockExtractor::new());
        let pricer = Arc::new(MockPricer::with_quotes(vec![quote(70.0), quote(80.0)]));
        let outcome = orchestrator(extractor.clone(), pricer, progress, cancel)
            .run(vec![handle("a")])
            .await;

        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.failures.is_empty());
        tokio::fs::remove_file(&path).await.ok();
    }
}
