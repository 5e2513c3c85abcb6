use crate::extract::resolve_url;
use crate::models::ItemHandle;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("gallery page unavailable: {0}")]
    PageUnavailable(String),
}

/// Where item handles come from. Pagination is opaque to callers: they feed
/// the returned cursor back in until it comes back `None`.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn next_batch(
        &self,
        cursor: Option<String>,
    ) -> Result<(Vec<ItemHandle>, Option<String>), CatalogError>;
}

// Link ladders, most specific first; the first tier that matches anything
// wins.
static ITEM_TIERS: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        "div.item-row a[href]",
        "div.tile-container a[href]",
        "a[href*='/item/']",
        "a[href*='lot']",
    ]
    .iter()
    .map(|raw| Selector::parse(raw).unwrap())
    .collect()
});
static NEXT_PAGE: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[rel='next'], li.next a[href], a.pagination-next").unwrap());

/// Walks an auction gallery page by page, yielding deduplicated item handles.
pub struct AuctionCatalog {
    client: Client,
    gallery_url: String,
}

impl AuctionCatalog {
    pub fn new(client: Client, gallery_url: impl Into<String>) -> Self {
        Self {
            client,
            gallery_url: gallery_url.into(),
        }
    }
}

#[async_trait]
impl ListingSource for AuctionCatalog {
    async fn next_batch(
        &self,
        cursor: Option<String>,
    ) -> Result<(Vec<ItemHandle>, Option<String>), CatalogError> {
        let url = cursor.unwrap_or_else(|| self.gallery_url.clone());
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| CatalogError::PageUnavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CatalogError::PageUnavailable(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|err| CatalogError::PageUnavailable(err.to_string()))?;

        let (handles, next) = parse_gallery(&body, &url);
        debug!(
            target = "lotscout.catalog",
            url = %url,
            items = handles.len(),
            has_next = next.is_some(),
            "gallery page parsed"
        );
        Ok((handles, next))
    }
}

fn parse_gallery(body: &str, page_url: &str) -> (Vec<ItemHandle>, Option<String>) {
    let document = Html::parse_document(body);

    let mut handles = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for tier in ITEM_TIERS.iter() {
        for link in document.select(tier) {
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let source_url = resolve_url(page_url, href);
            // Skip self-links and pagination controls caught by loose tiers.
            if source_url == page_url || !source_url.starts_with("http") {
                continue;
            }
            let Some(id) = handle_id(&source_url) else {
                continue;
            };
            if !seen.insert(id.clone()) {
                continue;
            }
            let listing_title = link
                .text()
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            handles.push(ItemHandle {
                id,
                source_url,
                listing_title,
            });
        }
        if !handles.is_empty() {
            break;
        }
    }

    let next = document
        .select(&NEXT_PAGE)
        .next()
        .and_then(|node| node.value().attr("href"))
        .map(|href| resolve_url(page_url, href))
        .filter(|next_url| next_url != page_url);

    (handles, next)
}

/// Stable item id from the listing URL: the last non-empty path segment,
/// lowercased, query string dropped.
fn handle_id(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segment = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && !segment.contains('.'))?;
    Some(segment.to_lowercase())
}
