use super::{PriceSource, SourceError};
use crate::models::PriceQuote;
use crate::query::QueryPlan;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

const SEARCH_URL: &str = "https://www.googleapis.com/customsearch/v1";
const RESULTS_PER_QUERY: u32 = 10;

/// Prices must land in this open interval to count; anything outside is
/// almost always an unrelated number the regex happened to match.
const MIN_PRICE: f64 = 0.0;
const MAX_PRICE: f64 = 10_000.0;

static PRICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\s?([0-9]{1,3}(?:,[0-9]{3})*(?:\.[0-9]{1,2})?)").unwrap());

/// Price source backed by the Google Custom Search JSON API. Extracts dollar
/// amounts from result titles and snippets; a price in the title is a
/// stronger signal than one buried in the snippet.
pub struct WebSearchSource {
    client: Client,
    api_key: String,
    cx: String,
}

impl WebSearchSource {
    pub fn new(client: Client, api_key: impl Into<String>, cx: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            cx: cx.into(),
        }
    }

    fn quotes_from_results(&self, query: &str, results: &[SearchResult]) -> Vec<PriceQuote> {
        let mut quotes = Vec::new();
        for result in results {
            for (text, confidence) in [(&result.title, 0.8_f32), (&result.snippet, 0.6_f32)] {
                for price in extract_prices(text) {
                    quotes.push(PriceQuote {
                        source_name: "web_search".into(),
                        price,
                        currency: "USD".into(),
                        match_confidence: confidence,
                        query_used: query.to_string(),
                    });
                }
            }
        }
        quotes
    }
}

#[async_trait]
impl PriceSource for WebSearchSource {
    fn name(&self) -> &str {
        "web_search"
    }

    async fn quotes(&self, plan: &QueryPlan) -> Result<Vec<PriceQuote>, SourceError> {
        let query = format!("{} price", plan.general);
        let num = RESULTS_PER_QUERY.to_string();
        let response = self
            .client
            .get(SEARCH_URL)
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.cx.as_str()),
                ("q", query.as_str()),
                ("num", num.as_str()),
            ])
            .send()
            .await
            .map_err(|err| SourceError::Http(err.to_string()))?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => return Err(SourceError::RateLimited),
            status if !status.is_success() => {
                return Err(SourceError::Http(format!("HTTP {status}")));
            }
            _ => {}
        }

        let payload: SearchResponse = response
            .json()
            .await
            .map_err(|err| SourceError::InvalidResponse(err.to_string()))?;

        let quotes = self.quotes_from_results(&plan.general, &payload.items);
        debug!(
            target = "lotscout.sources",
            query = %query,
            results = payload.items.len(),
            quotes = quotes.len(),
            "web search complete"
        );
        Ok(quotes)
    }
}

fn extract_prices(text: &str) -> Vec<f64> {
    PRICE
        .captures_iter(text)
        .filter_map(|captures| captures.get(1))
        .filter_map(|m| m.as_str().replace(',', "").parse::<f64>().ok())
        .filter(|price| *price > MIN_PRICE && *price < MAX_PRICE)
        .collect()
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchResult>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchResult {
    title: String,
    snippet: String,
}
