use crate::cms::CmsClient;
use crate::error::is_all_credentials_exhausted;
use crate::feed::FeedItem;
use crate::slug::slugify;
use crate::translator::Translator;
use anyhow::{Context, Result};
use tracing::{info, warn};

/// One locale-specific post belonging to a document set.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalizedPost {
    pub post_id: i64,
    pub locale: String,
    pub slug: String,
    pub title: String,
}

/// A locale that failed during the localization loop, kept for operator
/// visibility. The item as a whole still counts as published.
#[derive(Debug, Clone, PartialEq)]
pub struct LocaleFailure {
    pub locale: String,
    pub reason: String,
}

/// The published result of one item: exactly one base post plus a possibly
/// partial set of localizations, all sharing `document_id`.
#[derive(Debug, Clone)]
pub struct DocumentSet {
    pub document_id: String,
    pub base_post: LocalizedPost,
    pub localizations: Vec<LocalizedPost>,
    pub failed_locales: Vec<LocaleFailure>,
}

/// Publishes one item as a linked set of locale documents.
///
/// Protocol: translate into the base locale and create the base document
/// (fatal on failure, nothing exists yet), then attach the remaining locales
/// one by one (each failure is recorded and skipped), then flip everything
/// to published. A document available in fewer locales than requested is
/// still a successful publish. Once the base document exists the item always
/// completes; even credential-pool exhaustion only trims the locale set.
pub struct MultiLocalePublisher {
    translator: Translator,
    cms: CmsClient,
    locales: Vec<String>,
}

impl MultiLocalePublisher {
    pub fn new(translator: Translator, cms: CmsClient, locales: Vec<String>) -> Self {
        assert!(!locales.is_empty(), "at least one locale is required");
        Self {
            translator,
            cms,
            locales,
        }
    }

    pub async fn publish_item(&self, item: &FeedItem) -> Result<DocumentSet> {
        let base_locale = &self.locales[0];

        // NotStarted -> BaseCreated. Any failure here is fatal for the item.
        let (base_title, base_content) = self
            .translate_pair(item, base_locale)
            .await
            .with_context(|| format!("base locale {} translation failed", base_locale))?;

        let base_slug = slugify(&base_title);
        let base = self
            .cms
            .create_base_document(base_locale, &base_title, &base_content, &base_slug)
            .await
            .context("failed to create base document")?;

        info!(
            "Created base document {} for item {} in {}",
            base.document_id, item.guid, base_locale
        );

        let mut set = DocumentSet {
            document_id: base.document_id.clone(),
            base_post: LocalizedPost {
                post_id: base.post_id,
                locale: base_locale.clone(),
                slug: base.slug,
                title: base_title,
            },
            localizations: Vec::new(),
            failed_locales: Vec::new(),
        };

        // BaseCreated -> Localized(k). Per-locale failures are non-fatal.
        // A dry credential pool stops the loop early and records every
        // remaining locale as failed: the base document already exists, so
        // surfacing the error here would re-run the item later and create a
        // second base document for the same content.
        let targets = &self.locales[1..];
        for (i, locale) in targets.iter().enumerate() {
            match self.localize(item, &set.document_id, locale).await {
                Ok(post) => {
                    info!(
                        "Localized item {} into {} (post {})",
                        item.guid, locale, post.post_id
                    );
                    set.localizations.push(post);
                }
                Err(e) if is_all_credentials_exhausted(&e) => {
                    warn!(
                        "Credential pool exhausted while localizing item {}; skipping {} remaining locale(s)",
                        item.guid,
                        targets.len() - i
                    );
                    let reason = format!("{:#}", e);
                    for skipped in &targets[i..] {
                        set.failed_locales.push(LocaleFailure {
                            locale: skipped.clone(),
                            reason: reason.clone(),
                        });
                    }
                    break;
                }
                Err(e) => {
                    warn!("Locale {} failed for item {}: {:#}", locale, item.guid, e);
                    set.failed_locales.push(LocaleFailure {
                        locale: locale.clone(),
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        // Localized(k) -> Published. Failures are logged, never rolled back.
        self.publish_created_posts(&set).await;

        Ok(set)
    }

    async fn localize(
        &self,
        item: &FeedItem,
        document_id: &str,
        locale: &str,
    ) -> Result<LocalizedPost> {
        let (title, content) = self.translate_pair(item, locale).await?;
        let slug = slugify(&title);

        let post = self
            .cms
            .create_localization(document_id, locale, &title, &content, &slug)
            .await?;

        Ok(LocalizedPost {
            post_id: post.post_id,
            locale: locale.to_string(),
            slug: post.slug,
            title,
        })
    }

    async fn translate_pair(&self, item: &FeedItem, locale: &str) -> Result<(String, String)> {
        let title = self.translator.translate(&item.title, locale, true).await?;
        let content = self.translator.translate(&item.body, locale, false).await?;
        Ok((title, content))
    }

    /// Flip the base post and every created localization to published. Tries
    /// the bulk all-locales publish first, then falls back to per-locale
    /// publish calls.
    async fn publish_created_posts(&self, set: &DocumentSet) {
        match self.cms.publish_all(&set.document_id).await {
            Ok(()) => {
                info!("Published all locales of document {}", set.document_id);
                return;
            }
            Err(e) => {
                warn!(
                    "Bulk publish of {} failed, falling back to per-locale: {:#}",
                    set.document_id, e
                );
            }
        }

        let mut locales = vec![set.base_post.locale.as_str()];
        locales.extend(set.localizations.iter().map(|p| p.locale.as_str()));

        for locale in locales {
            if let Err(e) = self.cms.publish_locale(&set.document_id, locale).await {
                warn!(
                    "Publish of document {} locale {} failed: {:#}",
                    set.document_id, locale, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cms::CmsClient;
    use crate::config::Config;
    use crate::translator::Translator;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(api_url: &str, cms_url: &str, tmp: &TempDir) -> Config {
        Config {
            feed_urls: vec!["https://feeds.example.com/a.xml".to_string()],
            locales: vec!["en".to_string(), "pt-BR".to_string(), "es".to_string()],
            openai_api_keys: vec!["k1".to_string()],
            openai_api_url: api_url.to_string(),
            openai_model: "gpt-4o-mini".to_string(),
            daily_request_limit: 100,
            cms_url: cms_url.to_string(),
            cms_token: "cms-secret".to_string(),
            database_path: tmp.path().join("db").to_str().unwrap().to_string(),
            usage_file: tmp.path().join("usage.json").to_str().unwrap().to_string(),
            title_similarity_threshold: 0.85,
            max_processing_secs: 600,
            poll_interval_secs: 1,
            max_items_per_cycle: 20,
        }
    }

    fn item() -> FeedItem {
        FeedItem {
            guid: "item-1".to_string(),
            title: "Bitcoin Hits New High".to_string(),
            link: "https://example.com/btc".to_string(),
            published_at: None,
            body: "Bitcoin reached a new all-time high today.".to_string(),
        }
    }

    fn completion(content: &str) -> serde_json::Value {
        serde_json::json!({"choices":[{"message":{"role":"assistant","content":content}}]})
    }

    fn created_post(document_id: &str, post_id: i64, slug: &str) -> serde_json::Value {
        serde_json::json!({"documentId":document_id,"id":post_id,"slug":slug})
    }

    async fn mock_translation(server: &MockServer, needle: &str, translated: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_string_contains(needle))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(translated)))
            .mount(server)
            .await;
    }

    fn make_publisher(translation_uri: &str, cms_uri: &str, tmp: &TempDir) -> MultiLocalePublisher {
        let url = format!("{}/v1/chat/completions", translation_uri);
        let config = test_config(&url, cms_uri, tmp);
        let translator = Translator::new(&config).unwrap();
        let cms = CmsClient::new(&config).unwrap();
        MultiLocalePublisher::new(translator, cms, config.locales.clone())
    }

    #[tokio::test]
    async fn test_full_publish_all_locales() {
        let translation = MockServer::start().await;
        let cms = MockServer::start().await;
        let tmp = TempDir::new().unwrap();

        // The translator echoes per-locale variants (locale appears in the prompt)
        mock_translation(&translation, "'en'", "Bitcoin Hits New High").await;
        mock_translation(&translation, "'pt-BR'", "Bitcoin atinge nova máxima").await;
        mock_translation(&translation, "'es'", "Bitcoin alcanza nuevo máximo").await;

        Mock::given(method("POST"))
            .and(path("/posts"))
            .and(query_param("locale", "en"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(created_post("doc-1", 10, "bitcoin-hits-new-high")),
            )
            .mount(&cms)
            .await;
        Mock::given(method("PUT"))
            .and(path("/posts/doc-1"))
            .and(query_param("locale", "pt-BR"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(created_post("doc-1", 11, "bitcoin-atinge-nova-maxima")),
            )
            .mount(&cms)
            .await;
        Mock::given(method("PUT"))
            .and(path("/posts/doc-1"))
            .and(query_param("locale", "es"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(created_post("doc-1", 12, "bitcoin-alcanza-nuevo-maximo")),
            )
            .mount(&cms)
            .await;
        Mock::given(method("PUT"))
            .and(path("/posts/doc-1"))
            .and(query_param("locale", "*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&cms)
            .await;

        let publisher = make_publisher(&translation.uri(), &cms.uri(), &tmp);
        let set = publisher.publish_item(&item()).await.unwrap();

        assert_eq!(set.document_id, "doc-1");
        assert_eq!(set.base_post.locale, "en");
        assert_eq!(set.localizations.len(), 2);
        assert!(set.failed_locales.is_empty());

        // Every locale shares the document identity; slugs are per-locale
        assert_eq!(set.localizations[0].slug, "bitcoin-atinge-nova-maxima");
        assert_eq!(set.localizations[1].slug, "bitcoin-alcanza-nuevo-maximo");
    }

    #[tokio::test]
    async fn test_single_locale_failure_is_partial_success() {
        let translation = MockServer::start().await;
        let cms = MockServer::start().await;
        let tmp = TempDir::new().unwrap();

        mock_translation(&translation, "'en'", "Bitcoin Hits New High").await;
        // pt-BR translation errors out with a non-quota failure
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_string_contains("'pt-BR'"))
            .respond_with(ResponseTemplate::new(400).set_body_string("unsupported locale"))
            .mount(&translation)
            .await;
        mock_translation(&translation, "'es'", "Bitcoin alcanza nuevo máximo").await;

        Mock::given(method("POST"))
            .and(path("/posts"))
            .respond_with(ResponseTemplate::new(201).set_body_json(created_post("doc-1", 10, "s")))
            .mount(&cms)
            .await;
        Mock::given(method("PUT"))
            .and(path("/posts/doc-1"))
            .and(query_param("locale", "es"))
            .respond_with(ResponseTemplate::new(200).set_body_json(created_post("doc-1", 12, "se")))
            .mount(&cms)
            .await;
        Mock::given(method("PUT"))
            .and(path("/posts/doc-1"))
            .and(query_param("locale", "*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&cms)
            .await;

        let publisher = make_publisher(&translation.uri(), &cms.uri(), &tmp);
        let set = publisher.publish_item(&item()).await.unwrap();

        assert_eq!(set.base_post.locale, "en");
        assert_eq!(set.localizations.len(), 1);
        assert_eq!(set.localizations[0].locale, "es");
        assert_eq!(set.failed_locales.len(), 1);
        assert_eq!(set.failed_locales[0].locale, "pt-BR");
    }

    #[tokio::test]
    async fn test_pool_exhaustion_after_base_keeps_single_base_document() {
        let translation = MockServer::start().await;
        let cms = MockServer::start().await;
        let tmp = TempDir::new().unwrap();

        mock_translation(&translation, "'en'", "Title").await;
        // The only credential dies on the first localization
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_string_contains("'pt-BR'"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_string("You exceeded your current quota"),
            )
            .mount(&translation)
            .await;

        // Exactly one base document may ever be created for this item
        Mock::given(method("POST"))
            .and(path("/posts"))
            .respond_with(ResponseTemplate::new(201).set_body_json(created_post("doc-1", 10, "t")))
            .expect(1)
            .mount(&cms)
            .await;
        Mock::given(method("PUT"))
            .and(path("/posts/doc-1"))
            .and(query_param("locale", "*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&cms)
            .await;

        let publisher = make_publisher(&translation.uri(), &cms.uri(), &tmp);

        // The item still publishes: pool exhaustion after the base document
        // exists trims the locale set instead of failing the item, so a
        // retry can never create a duplicate base document.
        let set = publisher.publish_item(&item()).await.unwrap();

        assert_eq!(set.base_post.locale, "en");
        assert!(set.localizations.is_empty());
        assert_eq!(set.failed_locales.len(), 2);
        assert_eq!(set.failed_locales[0].locale, "pt-BR");
        assert_eq!(set.failed_locales[1].locale, "es");
    }

    #[tokio::test]
    async fn test_base_document_failure_is_fatal() {
        let translation = MockServer::start().await;
        let cms = MockServer::start().await;
        let tmp = TempDir::new().unwrap();

        mock_translation(&translation, "'en'", "Title").await;
        Mock::given(method("POST"))
            .and(path("/posts"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid payload"))
            .mount(&cms)
            .await;

        let publisher = make_publisher(&translation.uri(), &cms.uri(), &tmp);
        let err = publisher.publish_item(&item()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("base document"));
    }

    #[tokio::test]
    async fn test_slug_collision_recorded_as_locale_failure() {
        let translation = MockServer::start().await;
        let cms = MockServer::start().await;
        let tmp = TempDir::new().unwrap();

        mock_translation(&translation, "'en'", "Title").await;
        mock_translation(&translation, "'pt-BR'", "Título repetido").await;
        mock_translation(&translation, "'es'", "Título repetido también").await;

        Mock::given(method("POST"))
            .and(path("/posts"))
            .respond_with(ResponseTemplate::new(201).set_body_json(created_post("doc-1", 10, "t")))
            .mount(&cms)
            .await;
        // pt-BR slug collides with an existing post; the CMS refuses
        Mock::given(method("PUT"))
            .and(path("/posts/doc-1"))
            .and(query_param("locale", "pt-BR"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string("slug must be unique per locale"),
            )
            .mount(&cms)
            .await;
        Mock::given(method("PUT"))
            .and(path("/posts/doc-1"))
            .and(query_param("locale", "es"))
            .respond_with(ResponseTemplate::new(200).set_body_json(created_post("doc-1", 12, "x")))
            .mount(&cms)
            .await;
        Mock::given(method("PUT"))
            .and(path("/posts/doc-1"))
            .and(query_param("locale", "*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&cms)
            .await;

        let publisher = make_publisher(&translation.uri(), &cms.uri(), &tmp);
        let set = publisher.publish_item(&item()).await.unwrap();

        assert_eq!(set.failed_locales.len(), 1);
        assert!(set.failed_locales[0].reason.contains("slug must be unique"));
        assert_eq!(set.localizations.len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_publish_failure_falls_back_to_per_locale() {
        let translation = MockServer::start().await;
        let cms = MockServer::start().await;
        let tmp = TempDir::new().unwrap();

        mock_translation(&translation, "'en'", "Title").await;
        mock_translation(&translation, "'pt-BR'", "Título").await;
        mock_translation(&translation, "'es'", "Título es").await;

        Mock::given(method("POST"))
            .and(path("/posts"))
            .respond_with(ResponseTemplate::new(201).set_body_json(created_post("doc-1", 10, "t")))
            .mount(&cms)
            .await;
        Mock::given(method("PUT"))
            .and(path("/posts/doc-1"))
            .and(query_param("locale", "pt-BR"))
            .respond_with(ResponseTemplate::new(200).set_body_json(created_post("doc-1", 11, "p")))
            .mount(&cms)
            .await;
        Mock::given(method("PUT"))
            .and(path("/posts/doc-1"))
            .and(query_param("locale", "es"))
            .respond_with(ResponseTemplate::new(200).set_body_json(created_post("doc-1", 12, "e")))
            .mount(&cms)
            .await;
        // Bulk publish unsupported: 400 (not retried), then per-locale calls
        Mock::given(method("PUT"))
            .and(path("/posts/doc-1"))
            .and(query_param("locale", "*"))
            .respond_with(ResponseTemplate::new(400).set_body_string("wildcard not supported"))
            .expect(1)
            .mount(&cms)
            .await;
        Mock::given(method("PUT"))
            .and(path("/posts/doc-1"))
            .and(query_param("locale", "en"))
            .and(header("Authorization", "Bearer cms-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&cms)
            .await;

        let publisher = make_publisher(&translation.uri(), &cms.uri(), &tmp);
        let set = publisher.publish_item(&item()).await.unwrap();
        assert_eq!(set.localizations.len(), 2);
    }
}
