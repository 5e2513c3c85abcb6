use crate::llm::{LlmClient, LlmMessage};
use crate::models::ItemRecord;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

static LOT_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)lot\s*#.*?:").unwrap());
static LOT_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z]{2,4}\d{3,}\b").unwrap());
static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9\s]").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

const MAX_QUERY_LEN: usize = 100;

/// Search strings for the price sources. Both fields are always populated;
/// sources pick the one that suits them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    pub general: String,
    pub marketplace: String,
}

/// Capability that turns an item's text into search queries. The LLM-backed
/// implementation is optional; swapping it for the passthrough cleaner changes
/// no other component's contract.
#[async_trait]
pub trait QueryGenerator: Send + Sync {
    async fn generate(&self, item: &ItemRecord) -> QueryPlan;
}

/// Trivial generator: scrub lot numbers and punctuation from the item text and
/// use the result for every source.
pub struct PassthroughGenerator;

#[async_trait]
impl QueryGenerator for PassthroughGenerator {
    async fn generate(&self, item: &ItemRecord) -> QueryPlan {
        let cleaned = clean_query(item.search_text());
        QueryPlan {
            general: cleaned.clone(),
            marketplace: cleaned,
        }
    }
}

/// Strip auction noise from free text so it works as a search query: lot
/// prefixes and codes go, punctuation collapses to spaces, length is capped.
pub fn clean_query(text: &str) -> String {
    let text = LOT_PREFIX.replace_all(text, " ");
    let text = LOT_CODE.replace_all(&text, " ");
    let text = NON_ALNUM.replace_all(&text, " ");
    let text = WHITESPACE.replace_all(&text, " ");
    let mut cleaned = text.trim().to_string();
    if cleaned.len() > MAX_QUERY_LEN {
        let cut = cleaned
            .char_indices()
            .take_while(|(idx, _)| *idx < MAX_QUERY_LEN)
            .last()
            .map(|(idx, ch)| idx + ch.len_utf8())
            .unwrap_or(0);
        cleaned.truncate(cut);
        cleaned = cleaned.trim_end().to_string();
    }
    cleaned
}

const IDENTIFY_PROMPT: &str = r#"You analyze noisy auction listing text (descriptions plus OCR output from
item photos) and identify the product being sold. The text may contain OCR
errors, gibberish, lot numbers, and auction boilerplate ("Sold As Is",
"No Reserve"). Ignore the noise, find the product, and extract its brand and
model. When you cannot identify a field with confidence, you MUST answer
"Unknown" for it rather than guess.

Respond STRICTLY with JSON in this shape:
{
  "product_type": "specific product type or Unknown",
  "brand": "brand name or Unknown",
  "model": "model name/number or Unknown",
  "general_query": "search string for a web search engine, or empty if too uncertain",
  "marketplace_query": "search string for an e-commerce site, or empty if too uncertain"
}"#;

#[derive(Debug, Deserialize)]
struct Identification {
    #[serde(default)]
    product_type: String,
    #[serde(default)]
    brand: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    general_query: String,
    #[serde(default)]
    marketplace_query: String,
}

impl Identification {
    fn insufficient(&self) -> bool {
        let unknown = |s: &str| {
            let s = s.trim();
            s.is_empty() || s.eq_ignore_ascii_case("unknown") || s.eq_ignore_ascii_case("unclear")
        };
        unknown(&self.product_type)
            || unknown(&self.brand)
            || unknown(&self.model)
            || self.general_query.trim().is_empty()
            || self.marketplace_query.trim().is_empty()
    }
}

/// LLM-backed generator. Falls back to the passthrough cleaner whenever the
/// model errors out or cannot identify the product confidently.
pub struct LlmQueryGenerator {
    llm: LlmClient,
}

impl LlmQueryGenerator {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }

    fn prepare_input(item: &ItemRecord) -> String {
        let mut parts = vec![format!("ITEM DESCRIPTION: {}", item.description)];
        if let Some(text) = item.raw_fields.get("enhanced_description") {
            parts.push(format!("ENHANCED DESCRIPTION: {text}"));
        }
        if let Some(brands) = item.raw_fields.get("ocr_brands") {
            parts.push(format!("DETECTED BRANDS: {brands}"));
        }
        if let Some(models) = item.raw_fields.get("ocr_model_numbers") {
            parts.push(format!("DETECTED MODEL NUMBERS: {models}"));
        }
        for image in &item.image_refs {
            if let Some(text) = &image.recognized_text {
                parts.push(format!("OCR TEXT: {text}"));
            }
        }
        parts.join("\n\n")
    }

    fn parse_identification(text: &str) -> Option<Identification> {
        // Models occasionally wrap JSON in a markdown fence or prose; take the
        // outermost braces.
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        serde_json::from_str(&text[start..=end]).ok()
    }
}

#[async_trait]
impl QueryGenerator for LlmQueryGenerator {
    async fn generate(&self, item: &ItemRecord) -> QueryPlan {
        let fallback = PassthroughGenerator.generate(item).await;
        let input = Self::prepare_input(item);
        if input.trim().is_empty() {
            return fallback;
        }

        let messages = [
            LlmMessage {
                role: "system".into(),
                content: IDENTIFY_PROMPT.into(),
            },
            LlmMessage {
                role: "user".into(),
                content: input,
            },
        ];

        let response = match self.llm.chat(&messages).await {
            Ok(response) => response,
            Err(err) => {
                warn!(target = "lotscout.query", item_id = %item.id, error = %err, "llm query generation failed");
                return fallback;
            }
        };

        let Some(identification) = Self::parse_identification(&response.text) else {
            warn!(target = "lotscout.query", item_id = %item.id, "llm response had no parseable JSON");
            return fallback;
        };

        if identification.insufficient() {
            info!(
                target = "lotscout.query",
                item_id = %item.id,
                "llm could not identify product confidently; using cleaned text"
            );
            return fallback;
        }

        info!(
            target = "lotscout.query",
            item_id = %item.id,
            brand = %identification.brand,
            model = %identification.model,
            product = %identification.product_type,
            "llm identified product"
        );

        QueryPlan {
            general: clean_query(&identification.general_query),
            marketplace: clean_query(&identification.marketplace_query),
        }
    }
}
