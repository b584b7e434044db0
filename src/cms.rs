use crate::config::Config;
use crate::error::PipelineError;
use crate::retry::{with_retry_if, RetryConfig};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A post as returned by the CMS after creation.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CreatedPost {
    /// Shared identity across the base document and all localizations.
    #[serde(rename = "documentId")]
    pub document_id: String,
    /// The locale-specific post id.
    #[serde(rename = "id")]
    pub post_id: i64,
    pub slug: String,
}

#[derive(Debug, Serialize)]
struct PostPayload<'a> {
    title: &'a str,
    content: &'a str,
    slug: &'a str,
}

#[derive(Debug, Serialize)]
struct PublishPayload {
    #[serde(rename = "publishedAt")]
    published_at: String,
}

/// Client for a headless CMS that models content as one base document plus
/// per-locale localizations sharing a document id.
#[derive(Clone)]
pub struct CmsClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl CmsClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build CMS HTTP client")?;

        Ok(Self {
            client,
            base_url: config.cms_url.trim_end_matches('/').to_string(),
            token: config.cms_token.clone(),
        })
    }

    /// Create the base-locale document. The returned `document_id` is the
    /// shared identity every localization attaches to.
    pub async fn create_base_document(
        &self,
        locale: &str,
        title: &str,
        content: &str,
        slug: &str,
    ) -> Result<CreatedPost> {
        let url = format!("{}/posts?locale={}", self.base_url, locale);
        let payload = PostPayload { title, content, slug };

        let post = self
            .send_for_post("create base document", || {
                self.client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", self.token))
                    .json(&payload)
            })
            .await?;

        debug!(
            "Created base document {} (post {}) in locale {}",
            post.document_id, post.post_id, locale
        );
        Ok(post)
    }

    /// Attach a localization for `locale` to an existing document.
    pub async fn create_localization(
        &self,
        document_id: &str,
        locale: &str,
        title: &str,
        content: &str,
        slug: &str,
    ) -> Result<CreatedPost> {
        let url = format!("{}/posts/{}?locale={}", self.base_url, document_id, locale);
        let payload = PostPayload { title, content, slug };

        let post = self
            .send_for_post(&format!("create localization {}", locale), || {
                self.client
                    .put(&url)
                    .header("Authorization", format!("Bearer {}", self.token))
                    .json(&payload)
            })
            .await?;

        debug!(
            "Created localization {} (post {}) on document {}",
            locale, post.post_id, document_id
        );
        Ok(post)
    }

    /// Publish every locale of a document at once.
    pub async fn publish_all(&self, document_id: &str) -> Result<()> {
        self.publish(document_id, "*").await
    }

    /// Publish a single locale of a document.
    pub async fn publish_locale(&self, document_id: &str, locale: &str) -> Result<()> {
        self.publish(document_id, locale).await
    }

    async fn publish(&self, document_id: &str, locale: &str) -> Result<()> {
        let url = format!("{}/posts/{}?locale={}", self.base_url, document_id, locale);
        let payload = PublishPayload {
            published_at: Utc::now().to_rfc3339(),
        };

        let operation = format!("publish {} locale {}", document_id, locale);
        with_retry_if(
            &RetryConfig::cms_call(),
            &operation,
            || async {
                let response = self
                    .client
                    .put(&url)
                    .header("Authorization", format!("Bearer {}", self.token))
                    .json(&payload)
                    .send()
                    .await
                    .context("Failed to send publish request to CMS")?;

                check_status(response).await.map(|_| ())
            },
            is_retryable,
        )
        .await
    }

    async fn send_for_post<F>(&self, operation: &str, build: F) -> Result<CreatedPost>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        with_retry_if(
            &RetryConfig::cms_call(),
            operation,
            || async {
                let response = build()
                    .send()
                    .await
                    .context("Failed to send request to CMS")?;

                let body = check_status(response).await?;
                let post: CreatedPost = serde_json::from_str(&body)
                    .context("Failed to parse CMS post response")?;
                Ok(post)
            },
            is_retryable,
        )
        .await
    }
}

/// Map non-2xx responses to errors: 4xx becomes a validation error (never
/// retried, the CMS is telling us the request is wrong, e.g. a slug
/// collision), everything else keeps its status text for retry
/// classification.
async fn check_status(response: reqwest::Response) -> Result<String> {
    let status = response.status();
    if status.is_success() {
        return response.text().await.context("Failed to read CMS response");
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|e| format!("<failed to read body: {}>", e));

    if status.is_client_error() {
        Err(PipelineError::CmsValidation(format!("({}) {}", status, body)).into())
    } else {
        anyhow::bail!("CMS error ({}): {}", status, body)
    }
}

fn is_retryable(error: &anyhow::Error) -> bool {
    // Validation errors are final; 5xx and network failures are transient.
    error.downcast_ref::<PipelineError>().is_none()
}
