use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Raw handle for one lot, produced by the listing source. Immutable; `id` is
/// derived from the auction's own lot identifier so it stays stable across
/// restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemHandle {
    pub id: String,
    pub source_url: String,
    pub listing_title: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRef {
    pub url: String,
    pub local_cache_path: Option<PathBuf>,
    /// Set at most once, by the image processor.
    pub recognized_text: Option<String>,
}

impl ImageRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            local_cache_path: None,
            recognized_text: None,
        }
    }
}

/// Structured description of one lot after extraction. Owned by the stage
/// currently processing it; treated as immutable once pricing begins.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub condition: Option<String>,
    /// Current bid at extraction time, in the site's display currency. This is
    /// an estimate of acquisition cost, not a guarantee of the final price.
    pub current_bid: Option<f64>,
    pub time_remaining: Option<String>,
    pub source_url: String,
    #[serde(default)]
    pub image_refs: Vec<ImageRef>,
    #[serde(default)]
    pub raw_fields: BTreeMap<String, String>,
}

impl ItemRecord {
    /// Text used for price queries: the OCR-enhanced description when the
    /// image processor produced one, otherwise the listed description.
    pub fn search_text(&self) -> &str {
        match self.raw_fields.get("enhanced_description") {
            Some(text) if !text.trim().is_empty() => text,
            _ => {
                if self.description.trim().is_empty() {
                    &self.title
                } else {
                    &self.description
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceQuote {
    pub source_name: String,
    pub price: f64,
    pub currency: String,
    pub match_confidence: f32,
    pub query_used: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValuationResult {
    pub item_id: String,
    pub estimated_value: Option<f64>,
    pub acquisition_cost: Option<f64>,
    /// `estimated_value - acquisition_cost`; present only when both inputs are.
    pub profit_margin: Option<f64>,
    pub confidence: Confidence,
    pub price_quotes: Vec<PriceQuote>,
}

/// Pipeline stages an item moves through, in order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Price,
    Valuate,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Price => "price",
            Stage::Valuate => "valuate",
        }
    }
}

/// One durable stage outcome. The payload carries the stage's output snapshot
/// so a resumed run continues from it without re-running the stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageRecord {
    Extracted {
        record: ItemRecord,
    },
    /// Carries the extracted record forward so a resume can valuate without
    /// re-running extraction.
    Priced {
        record: ItemRecord,
        quotes: Vec<PriceQuote>,
    },
    Valuated {
        result: ValuationResult,
    },
    Failed {
        stage: Stage,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEntry {
    pub item_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub record: StageRecord,
}

impl ProgressEntry {
    pub fn new(item_id: impl Into<String>, record: StageRecord) -> Self {
        Self {
            item_id: item_id.into(),
            timestamp: Utc::now(),
            record,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedItem {
    pub item_id: String,
    pub stage: Stage,
    pub reason: String,
}

/// Run metadata handed to the report boundary alongside the ordered results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub auction_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub discovered: usize,
    pub valuated: usize,
    pub failed: usize,
    /// Items whose stages were skipped because a previous run completed them.
    pub resumed: usize,
}
