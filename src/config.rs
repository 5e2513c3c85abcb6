use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration consumed by the pipeline. Values come from the environment
/// (a `.env` file is honored); loading happens once, before any item is
/// processed, so a bad value can never leave a partial run behind.
#[derive(Debug, Clone)]
pub struct Config {
    /// Gallery URL of the auction to analyze.
    pub auction_url: String,
    pub max_items: usize,
    pub extract_attempts: u32,
    pub price_attempts: u32,
    pub backoff_base: Duration,
    pub network_timeout: Duration,
    /// Worker pool driving per-item pipelines through the network-bound stages.
    pub worker_pool_size: usize,
    /// Bounded pool for CPU-bound text recognition, sized independently of the
    /// network pool.
    pub ocr_pool_size: usize,
    /// Global cap on simultaneous network-bound operations, distinct from the
    /// per-source caps.
    pub global_network_cap: usize,
    /// In-flight request cap applied to each price source.
    pub per_source_cap: usize,
    pub min_match_confidence: f32,
    pub web_search_enabled: bool,
    pub marketplace_enabled: bool,
    pub google_api_key: Option<String>,
    pub google_cx: Option<String>,
    pub openrouter_enabled: bool,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    pub ocr_enabled: bool,
    pub tesseract_path: String,
    /// IP the run must NOT be seen as; the identity gate refuses to start when
    /// the probe returns this address.
    pub home_ip: String,
    pub data_dir: PathBuf,
    pub site_profile: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{key}`: {value}")]
    Invalid { key: &'static str, value: String },
    #[error("could not create data directory {0}: {1}")]
    DataDir(PathBuf, std::io::Error),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let auction_url =
            env::var("AUCTION_URL").map_err(|_| ConfigError::Missing("AUCTION_URL"))?;
        if !auction_url.starts_with("http") {
            return Err(ConfigError::Invalid {
                key: "AUCTION_URL",
                value: auction_url,
            });
        }

        let google_api_key = non_empty_env("GOOGLE_API_KEY");
        let google_cx = non_empty_env("GOOGLE_CX");
        // Web search needs API credentials; without them the source is off
        // regardless of the flag.
        let web_search_enabled = parse_env_bool("ENABLE_WEB_SEARCH", true)
            && google_api_key.is_some()
            && google_cx.is_some();

        let config = Self {
            auction_url,
            max_items: parse_env("MAX_ITEMS", 100),
            extract_attempts: parse_env("EXTRACT_ATTEMPTS", 3),
            price_attempts: parse_env("PRICE_ATTEMPTS", 2),
            backoff_base: Duration::from_millis(parse_env("BACKOFF_BASE_MS", 500)),
            network_timeout: Duration::from_secs(parse_env("NETWORK_TIMEOUT_SECS", 30)),
            worker_pool_size: parse_env("WORKER_POOL_SIZE", 4).max(1),
            ocr_pool_size: parse_env("OCR_POOL_SIZE", 2).max(1),
            global_network_cap: parse_env("GLOBAL_NETWORK_CAP", 8).max(1),
            per_source_cap: parse_env("PER_SOURCE_CAP", 2).max(1),
            min_match_confidence: parse_env("MIN_MATCH_CONFIDENCE", 0.5_f32).clamp(0.0, 1.0),
            web_search_enabled,
            marketplace_enabled: parse_env_bool("ENABLE_MARKETPLACE_SEARCH", false),
            google_api_key,
            google_cx,
            openrouter_enabled: parse_env_bool("OPENROUTER_ENABLED", false),
            openrouter_api_key: non_empty_env("OPENROUTER_API_KEY"),
            openrouter_model: env::var("OPENROUTER_MODEL")
                .unwrap_or_else(|_| "openai/gpt-4o-mini".into()),
            ocr_enabled: parse_env_bool("OCR_ENABLED", true),
            tesseract_path: env::var("TESSERACT_PATH").unwrap_or_else(|_| "tesseract".into()),
            home_ip: env::var("HOME_IP").unwrap_or_else(|_| "127.0.0.1".into()),
            data_dir: PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "data".into())),
            site_profile: env::var("SITE_PROFILE").unwrap_or_else(|_| "bidrl".into()),
        };

        config.ensure_data_dirs()?;
        Ok(config)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    pub fn progress_path(&self) -> PathBuf {
        self.data_dir.join("progress").join("progress.jsonl")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("output")
    }

    fn ensure_data_dirs(&self) -> Result<(), ConfigError> {
        for dir in [
            self.data_dir.clone(),
            self.images_dir(),
            self.data_dir.join("progress"),
            self.output_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|err| ConfigError::DataDir(dir.clone(), err))?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_bool_accepts_common_truthy_values() {
        unsafe { env::set_var("LOTSCOUT_TEST_FLAG", "Yes") };
        assert!(parse_env_bool("LOTSCOUT_TEST_FLAG", false));
        unsafe { env::set_var("LOTSCOUT_TEST_FLAG", "0") };
        assert!(!parse_env_bool("LOTSCOUT_TEST_FLAG", true));
        unsafe { env::remove_var("LOTSCOUT_TEST_FLAG") };
        assert!(parse_env_bool("LOTSCOUT_TEST_FLAG", true));
    }

    #[test]
    fn parse_env_falls_back_on_garbage() {
        unsafe { env::set_var("LOTSCOUT_TEST_NUM", "not-a-number") };
        assert_eq!(parse_env::<usize>("LOTSCOUT_TEST_NUM", 7), 7);
        unsafe { env::remove_var("LOTSCOUT_TEST_NUM") };
    }
}
