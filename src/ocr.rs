use crate::models::ItemRecord;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("download timed out")]
    Timeout,
    #[error("image exceeds size ceiling ({0} bytes)")]
    TooLarge(u64),
    #[error("download failed: {0}")]
    Download(String),
    #[error("recognition engine failed: {0}")]
    Engine(String),
}

/// Black-box text recognition over a locally cached image file.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, image_path: &Path) -> Result<String, RecognitionError>;
}

/// Shells out to the tesseract binary; engine internals stay outside the
/// pipeline.
pub struct TesseractRecognizer {
    binary: String,
}

impl TesseractRecognizer {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl TextRecognizer for TesseractRecognizer {
    async fn recognize(&self, image_path: &Path) -> Result<String, RecognitionError> {
        let output = tokio::process::Command::new(&self.binary)
            .arg(image_path)
            .arg("stdout")
            .args(["--oem", "3", "--psm", "4", "-l", "eng"])
            .output()
            .await
            .map_err(|err| RecognitionError::Engine(err.to_string()))?;

        if !output.status.success() {
            return Err(RecognitionError::Engine(format!(
                "tesseract exited with {}",
                output.status
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Recognizer used when OCR is disabled; every image yields no text.
pub struct NullRecognizer;

#[async_trait]
impl TextRecognizer for NullRecognizer {
    async fn recognize(&self, _image_path: &Path) -> Result<String, RecognitionError> {
        Ok(String::new())
    }
}

/// Downloads item images and runs text recognition over them, merging the
/// recognized text into the item's description. Pure with respect to the
/// pipeline apart from the local image cache, which is keyed by URL so
/// repeated runs skip re-downloading unchanged images.
pub struct ImageProcessor {
    client: Client,
    cache_dir: PathBuf,
    recognizer: Arc<dyn TextRecognizer>,
    /// CPU-bound recognitions run behind this pool so an OCR backlog never
    /// starves the network workers.
    ocr_slots: Arc<Semaphore>,
    max_image_bytes: u64,
    download_timeout: Duration,
}

impl ImageProcessor {
    pub fn new(
        client: Client,
        cache_dir: PathBuf,
        recognizer: Arc<dyn TextRecognizer>,
        ocr_pool_size: usize,
        download_timeout: Duration,
    ) -> Self {
        Self {
            client,
            cache_dir,
            recognizer,
            ocr_slots: Arc::new(Semaphore::new(ocr_pool_size.max(1))),
            max_image_bytes: 8 * 1024 * 1024,
            download_timeout,
        }
    }

    /// Runs recognition over every image of the item and merges the text.
    /// Individual image failures are logged and skipped; this function only
    /// returns once OCR has terminated for the whole item, successfully or
    /// with an explicit no-text outcome.
    pub async fn enrich(&self, item: &mut ItemRecord) {
        for index in 0..item.image_refs.len() {
            let url = item.image_refs[index].url.clone();
            match self.recognize_url(&url).await {
                Ok((path, text)) => {
                    let image = &mut item.image_refs[index];
                    image.local_cache_path = Some(path);
                    let trimmed = text.trim();
                    if !trimmed.is_empty() && image.recognized_text.is_none() {
                        image.recognized_text = Some(normalize_ocr_text(trimmed));
                    }
                }
                Err(err) => {
                    warn!(
                        target = "lotscout.ocr",
                        item_id = %item.id,
                        url = %url,
                        error = %err,
                        "skipping image after recognition failure"
                    );
                }
            }
        }
        merge_recognized_text(item);
    }

    async fn recognize_url(&self, url: &str) -> Result<(PathBuf, String), RecognitionError> {
        let path = self.fetch_cached(url).await?;
        let _permit = self
            .ocr_slots
            .acquire()
            .await
            .map_err(|_| RecognitionError::Engine("ocr pool closed".into()))?;
        let text = self.recognizer.recognize(&path).await?;
        Ok((path, text))
    }

    async fn fetch_cached(&self, url: &str) -> Result<PathBuf, RecognitionError> {
        let path = self.cache_dir.join(format!("{:016x}.img", url_key(url)));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(target = "lotscout.ocr", url = %url, "image cache hit");
            return Ok(path);
        }

        let response = self
            .client
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    RecognitionError::Timeout
                } else {
                    RecognitionError::Download(err.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(RecognitionError::Download(format!(
                "HTTP {}",
                response.status()
            )));
        }
        if let Some(len) = response.content_length()
            && len > self.max_image_bytes
        {
            return Err(RecognitionError::TooLarge(len));
        }

        let bytes = response.bytes().await.map_err(|err| {
            if err.is_timeout() {
                RecognitionError::Timeout
            } else {
                RecognitionError::Download(err.to_string())
            }
        })?;
        if bytes.len() as u64 > self.max_image_bytes {
            return Err(RecognitionError::TooLarge(bytes.len() as u64));
        }

        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|err| RecognitionError::Download(err.to_string()))?;
        Ok(path)
    }
}

fn url_key(url: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);
    hasher.finish()
}

static OCR_NOISE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9\s\.,\-\$%#/]").unwrap());
static MERGE_NOISE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9\s\.,\-#]").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static LOT_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)lot\s*#.*?:").unwrap());

static MODEL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)model[: ]?([a-z0-9\-]{3,15})",
        r"(?i)part[.: #]?([a-z0-9\-]{3,15})",
        r"(?i)series[: ]?([a-z0-9\-]{2,10})",
        r"(?i)\b([a-z]{1,4}[0-9]{2,6})\b",
        r"(?i)\b([a-z]{1,4}-[0-9]{2,6})\b",
        r"(?i)\b(v[0-9]{1,3})\b",
        r"(?i)sku[: ]?([a-z0-9\-]{4,15})",
        r"(?i)upc[: ]?([0-9\-]{10,15})",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

/// Brands worth flagging when they show up in photographed packaging.
const KNOWN_BRANDS: &[&str] = &[
    "samsung", "sony", "apple", "lg", "bosch", "dewalt", "milwaukee", "makita", "craftsman",
    "ryobi", "stanley", "kitchenaid", "whirlpool", "maytag", "kenmore", "frigidaire", "philips",
    "panasonic", "toshiba", "sharp", "dell", "hp", "microsoft", "lenovo", "asus", "acer", "canon",
    "nikon", "gopro", "bose", "sennheiser", "jbl", "sonos", "pioneer", "yamaha", "denon", "vizio",
    "insignia", "nintendo", "playstation", "xbox", "dyson", "shark", "hoover", "bissell", "miele",
    "roomba", "irobot", "cuisinart", "ninja", "breville", "coleman", "weber", "traeger", "yeti",
    "nike", "adidas", "rolex", "casio", "citizen", "seiko", "timex", "fossil", "omega", "lego",
];

static BRANDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"\b(?:{})\b", KNOWN_BRANDS.join("|"))).unwrap());

fn normalize_ocr_text(raw: &str) -> String {
    let scrubbed = OCR_NOISE.replace_all(raw, " ");
    WHITESPACE.replace_all(&scrubbed, " ").trim().to_string()
}

/// Folds recognized image text into the item: detected brands and model
/// numbers lead the enhanced description, followed by the cleaned listing
/// description and the OCR text itself. Always records an explicit outcome in
/// `raw_fields` so extraction is never silently incomplete.
pub fn merge_recognized_text(item: &mut ItemRecord) {
    let texts: Vec<&str> = item
        .image_refs
        .iter()
        .filter_map(|image| image.recognized_text.as_deref())
        .filter(|text| text.len() > 10)
        .collect();

    let clean_description = LOT_PREFIX
        .replace_all(&item.description, " ")
        .trim()
        .to_string();

    if texts.is_empty() {
        let fallback = tidy(&clean_description);
        item.raw_fields
            .insert("enhanced_description".into(), fallback);
        item.raw_fields.insert("ocr_status".into(), "no_text_found".into());
        return;
    }

    let combined_ocr = texts.join(" ");
    let lower = combined_ocr.to_lowercase();

    let brands: BTreeSet<&str> = BRANDS.find_iter(&lower).map(|m| m.as_str()).collect();

    let mut models = BTreeSet::new();
    for pattern in MODEL_PATTERNS.iter() {
        for captures in pattern.captures_iter(&lower) {
            if let Some(m) = captures.get(1)
                && m.as_str().len() >= 3
            {
                models.insert(m.as_str().to_string());
            }
        }
    }

    let mut parts = Vec::new();
    if !brands.is_empty() {
        parts.push(brands.iter().copied().collect::<Vec<_>>().join(" "));
    }
    if !models.is_empty() {
        parts.push(models.iter().cloned().collect::<Vec<_>>().join(" "));
    }
    parts.push(clean_description);
    parts.push(combined_ocr.clone());
    let enhanced = tidy(&parts.join(" "));

    item.raw_fields.insert("enhanced_description".into(), enhanced);
    item.raw_fields.insert("ocr_status".into(), "text_found".into());
    item.raw_fields.insert("ocr_text".into(), combined_ocr);
    if !brands.is_empty() {
        item.raw_fields.insert(
            "ocr_brands".into(),
            brands.iter().copied().collect::<Vec<_>>().join(", "),
        );
    }
    if !models.is_empty() {
        item.raw_fields.insert(
            "ocr_model_numbers".into(),
            models.iter().cloned().collect::<Vec<_>>().join(", "),
        );
    }
}

fn tidy(text: &str) -> String {
    let text = MERGE_NOISE.replace_all(text, " ");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}
