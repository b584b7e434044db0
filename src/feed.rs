use crate::config::Config;
use crate::error::PipelineError;
use crate::retry::{with_retry, RetryConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// One syndicated item as the pipeline sees it.
///
/// The feed format itself is the `rss` crate's problem; downstream components
/// only rely on `guid`, `title` and `body`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedItem {
    pub guid: String,
    pub title: String,
    pub link: String,
    pub published_at: Option<String>,
    pub body: String,
}

impl FeedItem {
    /// Reject items that cannot be translated or published.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.title.trim().is_empty() {
            return Err(PipelineError::Validation(format!(
                "item {} has no title",
                self.guid
            )));
        }
        if self.body.trim().is_empty() {
            return Err(PipelineError::Validation(format!(
                "item {} has no body",
                self.guid
            )));
        }
        Ok(())
    }
}

/// Fetch every configured feed and return the parsed items, newest first.
///
/// A feed that fails after retries is logged and skipped; one broken feed
/// must not starve the others.
pub async fn fetch_feed_items(config: &Config) -> Result<Vec<FeedItem>> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .user_agent("feed-localizer/0.1")
        .build()
        .context("Failed to build feed HTTP client")?;

    let mut all_items = Vec::new();
    let mut fail_count = 0;
    let retry_config = RetryConfig::feed_fetch();

    for url in &config.feed_urls {
        let result = with_retry(&retry_config, &format!("feed {}", url), || {
            fetch_one_feed(&client, url)
        })
        .await;

        match result {
            Ok(items) => {
                info!("Fetched {} items from {}", items.len(), url);
                all_items.extend(items);
            }
            Err(e) => {
                fail_count += 1;
                warn!("Feed {} failed after retries: {}", url, e);
            }
        }
    }

    if fail_count == config.feed_urls.len() && fail_count > 0 {
        warn!("All {} feed fetches failed", fail_count);
    }

    // Newest first; items without a date sort last
    all_items.sort_by(|a, b| b.published_at.cmp(&a.published_at));

    Ok(all_items)
}

async fn fetch_one_feed(client: &reqwest::Client, url: &str) -> Result<Vec<FeedItem>> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to fetch feed {}", url))?;

    if !response.status().is_success() {
        anyhow::bail!("Feed {} returned status {}", url, response.status());
    }

    let bytes = response
        .bytes()
        .await
        .with_context(|| format!("Failed to read feed body from {}", url))?;

    let channel = rss::Channel::read_from(&bytes[..])
        .with_context(|| format!("Failed to parse RSS from {}", url))?;

    let items = channel
        .items()
        .iter()
        .filter_map(item_from_rss)
        .collect::<Vec<_>>();

    Ok(items)
}

/// Map an RSS item to a `FeedItem`, preferring `guid` over `link` as the
/// external identifier and `content:encoded` over `description` as the body.
/// Items with neither identifier are dropped.
fn item_from_rss(item: &rss::Item) -> Option<FeedItem> {
    let link = item.link().unwrap_or_default().to_string();
    let guid = item
        .guid()
        .map(|g| g.value().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| (!link.is_empty()).then(|| link.clone()))?;

    let body = item
        .content()
        .filter(|c| !c.trim().is_empty())
        .or_else(|| item.description())
        .unwrap_or_default()
        .to_string();

    Some(FeedItem {
        guid,
        title: item.title().unwrap_or_default().to_string(),
        link,
        published_at: item.pub_date().map(|d| d.to_string()),
        body,
    })
}
