use crate::models::{ImageRef, ItemHandle, ItemRecord};
use crate::ocr::ImageProcessor;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

static LOT_HEAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*lot\s*#\s*([A-Za-z0-9\-]+)\s*:\s*(.+)$").unwrap());

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("page unavailable: {0}")]
    PageUnavailable(String),
    #[error("page structure did not match profile `{profile}`: {missing}")]
    StructureMismatch { profile: String, missing: String },
}

/// One tier of selectors for a site layout. Only `title` is mandatory; the
/// rest stay empty on no-match without failing extraction.
struct SelectorSet {
    title: Selector,
    description: Selector,
    bid: Selector,
    time_remaining: Selector,
    condition: Selector,
    /// Image elements paired with the attribute holding the URL.
    images: Vec<(Selector, &'static str)>,
}

/// Named selector profile for an auction site: a strict set for the layout as
/// shipped, and a relaxed set tried once when the strict one stops matching.
pub struct SiteProfile {
    name: String,
    strict: SelectorSet,
    relaxed: SelectorSet,
}

impl SiteProfile {
    /// Profile lookup by configured name; unknown names get the generic
    /// profile so a typo degrades instead of aborting the run.
    pub fn named(name: &str) -> Self {
        match name {
            "bidrl" => Self::bidrl(),
            other => {
                if other != "generic" {
                    warn!(
                        target = "lotscout.extract",
                        profile = other,
                        "unknown site profile, using generic"
                    );
                }
                Self::generic()
            }
        }
    }

    fn bidrl() -> Self {
        Self {
            name: "bidrl".into(),
            strict: SelectorSet {
                title: sel("div.item-head h4"),
                description: sel("div.item-description"),
                bid: sel("span[data-currency]"),
                time_remaining: sel("span.time-remaining"),
                condition: sel("span.item-condition"),
                images: vec![
                    (sel("ul.light-gallery li[data-src]"), "data-src"),
                    (sel("div.item-gallery img"), "src"),
                ],
            },
            relaxed: SelectorSet {
                title: sel("h4, h3, h1"),
                description: sel("div[class*='description'], p[class*='desc']"),
                bid: sel("span[class*='bid'], span[class*='price']"),
                time_remaining: sel("span[class*='time']"),
                condition: sel("span[class*='condition']"),
                images: vec![(sel("li[data-src]"), "data-src"), (sel("img"), "src")],
            },
        }
    }

    fn generic() -> Self {
        Self {
            name: "generic".into(),
            strict: SelectorSet {
                title: sel("h1"),
                description: sel("div[class*='description']"),
                bid: sel("span[class*='bid'], span[class*='price']"),
                time_remaining: sel("span[class*='time']"),
                condition: sel("span[class*='condition']"),
                images: vec![(sel("img"), "src")],
            },
            relaxed: SelectorSet {
                title: sel("h1, h2, title"),
                description: sel("p"),
                bid: sel("span"),
                time_remaining: sel("time, span[class*='time']"),
                condition: sel("span[class*='condition']"),
                images: vec![(sel("img"), "src")],
            },
        }
    }
}

fn sel(raw: &str) -> Selector {
    Selector::parse(raw).unwrap()
}

/// Fetches one item page and turns it into a structured record, running the
/// image processor over every photo before returning.
pub struct Extractor {
    client: Client,
    profile: SiteProfile,
    images: ImageProcessor,
}

impl Extractor {
    pub fn new(client: Client, profile: SiteProfile, images: ImageProcessor) -> Self {
        Self {
            client,
            profile,
            images,
        }
    }

    pub async fn extract(&self, handle: &ItemHandle) -> Result<ItemRecord, ExtractError> {
        let response = self
            .client
            .get(&handle.source_url)
            .send()
            .await
            .map_err(|err| ExtractError::PageUnavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ExtractError::PageUnavailable(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|err| ExtractError::PageUnavailable(err.to_string()))?;

        let mut record = self.parse(&body, handle)?;
        self.images.enrich(&mut record).await;
        Ok(record)
    }

    /// Strict selectors first; on mismatch, one pass with the relaxed set
    /// before surfacing the error.
    fn parse(&self, body: &str, handle: &ItemHandle) -> Result<ItemRecord, ExtractError> {
        match parse_with(body, handle, &self.profile.strict) {
            Some(record) => Ok(record),
            None => {
                debug!(
                    target = "lotscout.extract",
                    item_id = %handle.id,
                    profile = %self.profile.name,
                    "strict selectors missed, retrying relaxed"
                );
                parse_with(body, handle, &self.profile.relaxed).ok_or_else(|| {
                    ExtractError::StructureMismatch {
                        profile: self.profile.name.clone(),
                        missing: "title".into(),
                    }
                })
            }
        }
    }
}

fn parse_with(body: &str, handle: &ItemHandle, set: &SelectorSet) -> Option<ItemRecord> {
    let document = Html::parse_document(body);

    let head = document
        .select(&set.title)
        .next()
        .map(|node| collapse(&node.text().collect::<String>()))
        .filter(|text| !text.is_empty())?;

    let mut raw_fields = BTreeMap::new();
    let title = match LOT_HEAD.captures(&head) {
        Some(captures) => {
            raw_fields.insert("lot_code".into(), captures[1].to_string());
            captures[2].trim().to_string()
        }
        None => head,
    };

    let description = document
        .select(&set.description)
        .next()
        .map(|node| collapse(&node.text().collect::<String>()))
        .unwrap_or_default();

    let current_bid = document
        .select(&set.bid)
        .next()
        .and_then(|node| parse_money(&node.text().collect::<String>()));

    let time_remaining = document
        .select(&set.time_remaining)
        .next()
        .map(|node| collapse(&node.text().collect::<String>()))
        .filter(|text| !text.is_empty());

    let condition = document
        .select(&set.condition)
        .next()
        .map(|node| collapse(&node.text().collect::<String>()))
        .filter(|text| !text.is_empty());

    let mut seen = std::collections::HashSet::new();
    let mut image_refs = Vec::new();
    for (selector, attr) in &set.images {
        for node in document.select(selector) {
            if let Some(raw_url) = node.value().attr(attr) {
                let url = resolve_url(&handle.source_url, raw_url);
                if url.starts_with("http") && seen.insert(url.clone()) {
                    image_refs.push(ImageRef::new(url));
                }
            }
        }
        // The first matching tier wins; lower tiers are fallbacks only.
        if !image_refs.is_empty() {
            break;
        }
    }

    Some(ItemRecord {
        id: handle.id.clone(),
        title,
        description,
        condition,
        current_bid,
        time_remaining,
        source_url: handle.source_url.clone(),
        image_refs,
        raw_fields,
    })
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_money(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|ch| ch.is_ascii_digit() || *ch == '.')
        .collect();
    cleaned.parse::<f64>().ok().filter(|value| *value >= 0.0)
}

/// Resolves a possibly relative href against the page it came from.
pub(crate) fn resolve_url(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    if let Some(rest) = href.strip_prefix("//") {
        return format!("https://{rest}");
    }
    let origin = base
        .match_indices('/')
        .nth(2)
        .map(|(idx, _)| &base[..idx])
        .unwrap_or(base);
    if href.starts_with('/') {
        format!("{origin}{href}")
    } else {
        let dir = base.rsplit_once('/').map(|(head, _)| head).unwrap_or(base);
        format!("{dir}/{href}")
    }
}
