use super::{PriceSource, SourceError};
use crate::models::PriceQuote;
use crate::query::QueryPlan;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use tracing::debug;

const SEARCH_URL: &str = "https://www.amazon.com/s";
const MAX_RESULTS: usize = 5;

static CARD: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div[data-component-type='s-search-result']").unwrap());
static OFFSCREEN: Lazy<Selector> = Lazy::new(|| Selector::parse(".a-price .a-offscreen").unwrap());
static WHOLE: Lazy<Selector> = Lazy::new(|| Selector::parse(".a-price-whole").unwrap());
static FRACTION: Lazy<Selector> = Lazy::new(|| Selector::parse(".a-price-fraction").unwrap());

/// Price source scraping a marketplace search results page. Selector-based
/// and therefore brittle against site redesigns; disabled by default.
pub struct MarketplaceSource {
    client: Client,
}

impl MarketplaceSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PriceSource for MarketplaceSource {
    fn name(&self) -> &str {
        "marketplace"
    }

    async fn quotes(&self, plan: &QueryPlan) -> Result<Vec<PriceQuote>, SourceError> {
        let response = self
            .client
            .get(SEARCH_URL)
            .query(&[("k", plan.marketplace.as_str())])
            .send()
            .await
            .map_err(|err| SourceError::Http(err.to_string()))?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                return Err(SourceError::RateLimited);
            }
            status if !status.is_success() => {
                return Err(SourceError::Http(format!("HTTP {status}")));
            }
            _ => {}
        }

        let body = response
            .text()
            .await
            .map_err(|err| SourceError::Http(err.to_string()))?;

        let prices = scrape_prices(&body);
        debug!(
            target = "lotscout.sources",
            query = %plan.marketplace,
            quotes = prices.len(),
            "marketplace search complete"
        );
        Ok(prices
            .into_iter()
            .map(|price| PriceQuote {
                source_name: "marketplace".into(),
                price,
                currency: "USD".into(),
                match_confidence: 0.7,
                query_used: plan.marketplace.clone(),
            })
            .collect())
    }
}

/// Walks the result cards and reads the first price each one exposes, trying
/// the screen-reader price text before the split whole/fraction spans.
fn scrape_prices(body: &str) -> Vec<f64> {
    let document = Html::parse_document(body);

    let mut prices = Vec::new();
    for result in document.select(&CARD).take(MAX_RESULTS) {
        let price = result
            .select(&OFFSCREEN)
            .next()
            .and_then(|node| parse_price(&node.text().collect::<String>()))
            .or_else(|| {
                let whole_text = result
                    .select(&WHOLE)
                    .next()
                    .map(|node| node.text().collect::<String>())?;
                let fraction_text = result
                    .select(&FRACTION)
                    .next()
                    .map(|node| node.text().collect::<String>())
                    .unwrap_or_else(|| "00".into());
                parse_price(&format!("{whole_text}.{fraction_text}"))
            });
        if let Some(price) = price
            && price > 0.0
        {
            prices.push(price);
        }
    }
    prices
}

fn parse_price(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|ch| ch.is_ascii_digit() || *ch == '.')
        .collect();
    // The split spans sometimes carry their own trailing dot.
    let cleaned = cleaned.replace("..", ".");
    cleaned.parse::<f64>().ok()
}
