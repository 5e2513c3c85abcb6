pub mod marketplace;
pub mod web_search;

use crate::metrics;
use crate::models::{ItemRecord, PriceQuote};
use crate::query::{QueryGenerator, QueryPlan};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http error: {0}")]
    Http(String),
    #[error("rate limited by upstream")]
    RateLimited,
    #[error("unexpected response shape: {0}")]
    InvalidResponse(String),
}

/// One external price source. Implementations are independent: the set of
/// configured sources can change without touching the valuation logic.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;
    async fn quotes(&self, plan: &QueryPlan) -> Result<Vec<PriceQuote>, SourceError>;
}

/// Wraps a source with an in-flight request cap. Callers wait for a slot
/// rather than being rejected, so a burst of items degrades to a queue
/// instead of a failure storm.
pub struct RateCappedSource {
    inner: Arc<dyn PriceSource>,
    slots: Arc<Semaphore>,
}

impl RateCappedSource {
    pub fn new(inner: Arc<dyn PriceSource>, cap: usize) -> Self {
        Self {
            inner,
            slots: Arc::new(Semaphore::new(cap.max(1))),
        }
    }
}

#[async_trait]
impl PriceSource for RateCappedSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn quotes(&self, plan: &QueryPlan) -> Result<Vec<PriceQuote>, SourceError> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| SourceError::Http("source slot pool closed".into()))?;
        self.inner.quotes(plan).await
    }
}

/// Fans one item out to every configured source and aggregates the quotes.
pub struct PriceFinder {
    generator: Arc<dyn QueryGenerator>,
    sources: Vec<Arc<dyn PriceSource>>,
}

impl PriceFinder {
    pub fn new(generator: Arc<dyn QueryGenerator>, sources: Vec<Arc<dyn PriceSource>>) -> Self {
        Self { generator, sources }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Queries all sources concurrently. A failing source contributes an
    /// explicit empty result; one source's outage never blocks the others.
    /// Within each source, duplicate quotes (equal price to the cent) collapse
    /// to one.
    pub async fn find_prices(&self, item: &ItemRecord) -> Vec<PriceQuote> {
        let plan = self.generator.generate(item).await;
        if plan.general.is_empty() && plan.marketplace.is_empty() {
            debug!(target = "lotscout.sources", item_id = %item.id, "no usable query text");
            return Vec::new();
        }

        let lookups = self.sources.iter().map(|source| {
            let plan = plan.clone();
            async move {
                match source.quotes(&plan).await {
                    Ok(quotes) => {
                        metrics::source_quotes(source.name(), quotes.len());
                        dedup_by_cents(quotes)
                    }
                    Err(err) => {
                        warn!(
                            target = "lotscout.sources",
                            source = source.name(),
                            error = %err,
                            "price source failed"
                        );
                        metrics::source_quotes(source.name(), 0);
                        Vec::new()
                    }
                }
            }
        });

        futures::future::join_all(lookups)
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}

fn dedup_by_cents(mut quotes: Vec<PriceQuote>) -> Vec<PriceQuote> {
    let mut seen = std::collections::HashSet::new();
    quotes.retain(|quote| seen.insert((quote.price * 100.0).round() as i64));
    quotes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::PassthroughGenerator;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn item(description: &str) -> ItemRecord {
        ItemRecord {
            id: "lot-1".into(),
            title: "Lot #1".into(),
            description: description.into(),
            condition: None,
            current_bid: None,
            time_remaining: None,
            source_url: "https://auction.example/lot/1".into(),
            image_refs: Vec::new(),
            raw_fields: BTreeMap::new(),
        }
    }

    fn quote(source: &str, price: f64) -> PriceQuote {
        PriceQuote {
            source_name: source.into(),
            price,
            currency: "USD".into(),
            match_confidence: 0.8,
            query_used: "q".into(),
        }
    }

    struct FixedSource {
        name: String,
        result: Result<Vec<PriceQuote>, SourceError>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PriceSource for FixedSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn quotes(&self, _plan: &QueryPlan) -> Result<Vec<PriceQuote>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.result {
                Ok(quotes) => Ok(quotes.clone()),
                Err(SourceError::Http(msg)) => Err(SourceError::Http(msg.clone())),
                Err(SourceError::RateLimited) => Err(SourceError::RateLimited),
                Err(SourceError::InvalidResponse(msg)) => {
                    Err(SourceError::InvalidResponse(msg.clone()))
                }
            }
        }
    }

    #[tokio::test]
    async fn failing_source_does_not_block_others() {
        let good = Arc::new(FixedSource {
            name: "good".into(),
            result: Ok(vec![quote("good", 25.0)]),
            calls: AtomicUsize::new(0),
        });
        let bad = Arc::new(FixedSource {
            name: "bad".into(),
            result: Err(SourceError::Http("503".into())),
            calls: AtomicUsize::new(0),
        });
        let finder = PriceFinder::new(
            Arc::new(PassthroughGenerator),
            vec![bad.clone(), good.clone()],
        );

        let quotes = finder.find_prices(&item("Dyson V10 vacuum")).await;
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].source_name, "good");
        assert_eq!(bad.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_prices_within_a_source_collapse() {
        let source = Arc::new(FixedSource {
            name: "dupes".into(),
            result: Ok(vec![
                quote("dupes", 19.99),
                quote("dupes", 19.990),
                quote("dupes", 24.99),
            ]),
            calls: AtomicUsize::new(0),
        });
        let finder = PriceFinder::new(Arc::new(PassthroughGenerator), vec![source]);

        let quotes = finder.find_prices(&item("Dyson V10 vacuum")).await;
        assert_eq!(quotes.len(), 2);
    }

    #[tokio::test]
    async fn empty_query_skips_all_sources() {
        let source = Arc::new(FixedSource {
            name: "never".into(),
            result: Ok(vec![quote("never", 5.0)]),
            calls: AtomicUsize::new(0),
        });
        let finder = PriceFinder::new(Arc::new(PassthroughGenerator), vec![source.clone()]);

        let quotes = finder.find_prices(&item("!!!")).await;
        assert!(quotes.is_empty());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rate_cap_passes_quotes_through() {
        let inner = Arc::new(FixedSource {
            name: "capped".into(),
            result: Ok(vec![quote("capped", 12.5)]),
            calls: AtomicUsize::new(0),
        });
        let capped = RateCappedSource::new(inner, 2);
        let plan = QueryPlan {
            general: "dyson".into(),
            marketplace: "dyson".into(),
        };
        let quotes = capped.quotes(&plan).await.unwrap();
        assert_eq!(quotes.len(), 1);
        assert_eq!(capped.name(), "capped");
    }
}
