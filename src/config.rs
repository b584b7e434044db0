use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    // Feeds
    pub feed_urls: Vec<String>,

    // Locales: first entry is the base locale, the rest are localization targets
    pub locales: Vec<String>,

    // Translation backend (OpenAI-compatible chat completions)
    pub openai_api_keys: Vec<String>,
    pub openai_api_url: String,
    pub openai_model: String,
    pub daily_request_limit: u32,

    // CMS
    pub cms_url: String,
    pub cms_token: String,

    // Persistence
    pub database_path: String,
    pub usage_file: String,

    // Deduplication
    pub title_similarity_threshold: f64,

    // Worker loop
    pub max_processing_secs: u64,
    pub poll_interval_secs: u64,
    pub max_items_per_cycle: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            // Feeds - comma-separated list of RSS feed URLs
            feed_urls: csv_list(&std::env::var("FEED_URLS").context("FEED_URLS not set")?),

            // Locales - comma-separated, first is the base locale
            locales: csv_list(
                &std::env::var("LOCALES").unwrap_or_else(|_| "en,es,pt-BR".to_string()),
            ),

            // Translation backend - comma-separated credential list
            openai_api_keys: csv_list(
                &std::env::var("OPENAI_API_KEYS").context("OPENAI_API_KEYS not set")?,
            ),
            openai_api_url: std::env::var("OPENAI_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".to_string()),
            openai_model: std::env::var("OPENAI_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            daily_request_limit: std::env::var("DAILY_REQUEST_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(200),

            // CMS
            cms_url: std::env::var("CMS_URL").context("CMS_URL not set")?,
            cms_token: std::env::var("CMS_TOKEN").context("CMS_TOKEN not set")?,

            // Persistence
            database_path: std::env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "data/pipeline.db".to_string()),
            usage_file: std::env::var("USAGE_FILE")
                .unwrap_or_else(|_| "data/key_usage.json".to_string()),

            // Deduplication
            title_similarity_threshold: std::env::var("TITLE_SIMILARITY_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.85),

            // Worker loop
            max_processing_secs: std::env::var("MAX_PROCESSING_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
            poll_interval_secs: std::env::var("POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            max_items_per_cycle: std::env::var("MAX_ITEMS_PER_CYCLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        };

        if config.feed_urls.is_empty() {
            anyhow::bail!("FEED_URLS must contain at least one feed URL");
        }
        if config.locales.is_empty() {
            anyhow::bail!("LOCALES must contain at least one locale");
        }
        if config.openai_api_keys.is_empty() {
            anyhow::bail!("OPENAI_API_KEYS must contain at least one key");
        }

        Ok(config)
    }

    /// The base locale: the first entry of the enabled-locale list.
    pub fn base_locale(&self) -> &str {
        &self.locales[0]
    }

    /// Localization targets: every enabled locale after the base.
    pub fn target_locales(&self) -> &[String] {
        &self.locales[1..]
    }
}

fn csv_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
