mod catalog;
mod config;
mod extract;
mod http;
mod identity;
mod llm;
mod metrics;
mod models;
mod ocr;
mod pipeline;
mod progress;
mod query;
mod report;
mod sources;
mod valuate;

use catalog::{AuctionCatalog, ListingSource};
use chrono::Utc;
use config::Config;
use extract::{Extractor, SiteProfile};
use identity::IdentityGate;
use llm::{LlmClient, LlmConfig};
use models::{ItemHandle, RunSummary};
use ocr::{ImageProcessor, NullRecognizer, TesseractRecognizer, TextRecognizer};
use pipeline::{Orchestrator, RetryPolicy};
use progress::ProgressStore;
use query::{LlmQueryGenerator, PassthroughGenerator, QueryGenerator};
use report::RunReport;
use sources::marketplace::MarketplaceSource;
use sources::web_search::WebSearchSource;
use sources::{PriceFinder, PriceSource, RateCappedSource};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;
use valuate::Valuator;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "lotscout", "run aborted: {err}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;
    let client = http::build_client(config.network_timeout);

    // Refuse to touch the auction site when the VPN is down.
    let gate = IdentityGate::new(client.clone(), config.home_ip.clone());
    if !gate.is_network_identity_safe().await? {
        eyre::bail!("egress IP matches home IP; refusing to start");
    }

    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(
        target = "lotscout",
        run_id = %run_id,
        auction_url = %config.auction_url,
        "starting run"
    );

    let handles = discover(&config, client.clone()).await?;
    info!(target = "lotscout", discovered = handles.len(), "discovery complete");

    let recognizer: Arc<dyn TextRecognizer> = if config.ocr_enabled {
        Arc::new(TesseractRecognizer::new(&config.tesseract_path))
    } else {
        Arc::new(NullRecognizer)
    };
    let images = ImageProcessor::new(
        client.clone(),
        config.images_dir(),
        recognizer,
        config.ocr_pool_size,
        config.network_timeout,
    );
    let extractor = Arc::new(Extractor::new(
        client.clone(),
        SiteProfile::named(&config.site_profile),
        images,
    ));

    let generator: Arc<dyn QueryGenerator> = match (&config.openrouter_api_key, config.openrouter_enabled) {
        (Some(key), true) => Arc::new(LlmQueryGenerator::new(LlmClient::new(
            client.clone(),
            LlmConfig::new(key.clone(), config.openrouter_model.clone()),
        ))),
        _ => Arc::new(PassthroughGenerator),
    };

    let mut sources: Vec<Arc<dyn PriceSource>> = Vec::new();
    if config.web_search_enabled
        && let (Some(key), Some(cx)) = (&config.google_api_key, &config.google_cx)
    {
        sources.push(Arc::new(RateCappedSource::new(
            Arc::new(WebSearchSource::new(client.clone(), key.clone(), cx.clone())),
            config.per_source_cap,
        )));
    }
    if config.marketplace_enabled {
        sources.push(Arc::new(RateCappedSource::new(
            Arc::new(MarketplaceSource::new(client.clone())),
            config.per_source_cap,
        )));
    }
    let pricer = Arc::new(PriceFinder::new(generator, sources));
    if pricer.source_count() == 0 {
        warn!(
            target = "lotscout",
            "no price sources configured; items will valuate without quotes"
        );
    }

    let progress = Arc::new(ProgressStore::open(&config.progress_path()).await?);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(target = "lotscout", "interrupt received, finishing in-flight items");
            cancel_tx.send(true).ok();
        }
    });

    let orchestrator = Orchestrator::new(
        extractor,
        pricer,
        Valuator::new(config.min_match_confidence),
        progress,
        RetryPolicy {
            extract_attempts: config.extract_attempts,
            price_attempts: config.price_attempts,
            backoff_base: config.backoff_base,
        },
        config.worker_pool_size,
        config.global_network_cap,
        cancel_rx,
    );

    let outcome = orchestrator.run(handles).await;
    let summary = RunSummary {
        run_id,
        auction_url: config.auction_url.clone(),
        started_at,
        finished_at: Utc::now(),
        discovered: outcome.discovered,
        valuated: outcome.results.len(),
        failed: outcome.failures.len(),
        resumed: outcome.resumed,
    };

    let report = RunReport::new(summary, outcome);
    let path = report.write_json(&config.output_dir()).await?;
    info!(target = "lotscout", report = %path.display(), "run finished");
    Ok(())
}

/// Walks gallery pages until the item cap or the last page, deduplicating
/// handles across pages.
async fn discover(config: &Config, client: reqwest::Client) -> eyre::Result<Vec<ItemHandle>> {
    let catalog = AuctionCatalog::new(client, config.auction_url.clone());
    let mut handles = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor = None;

    loop {
        let (batch, next) = catalog.next_batch(cursor).await?;
        for handle in batch {
            if handles.len() >= config.max_items {
                break;
            }
            if seen.insert(handle.id.clone()) {
                handles.push(handle);
            }
        }
        if handles.len() >= config.max_items {
            break;
        }
        match next {
            Some(next_cursor) => cursor = Some(next_cursor),
            None => break,
        }
    }
    Ok(handles)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
