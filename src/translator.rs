use crate::config::Config;
use crate::error::PipelineError;
use crate::retry::{with_retry_if, RetryConfig};
use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// OpenAI-compatible chat completion request
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

/// Per-credential usage for one day.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyUsage {
    pub count: u32,
    pub exhausted: bool,
}

/// On-disk usage document: one record per credential for the current day.
#[derive(Debug, Serialize, Deserialize)]
struct UsageState {
    date: NaiveDate,
    keys: BTreeMap<String, KeyUsage>,
    #[serde(skip)]
    active: usize,
}

impl UsageState {
    fn fresh(date: NaiveDate, credential_ids: &[String]) -> Self {
        Self {
            date,
            keys: credential_ids
                .iter()
                .map(|id| (id.clone(), KeyUsage::default()))
                .collect(),
            active: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Credential {
    id: String,
    key: String,
}

/// Translation client that rotates across N interchangeable credentials.
///
/// Each credential carries a daily request budget. Selection sticks to the
/// active credential while it has capacity, then scans the configured order
/// for the first credential with room. A response classified as a quota
/// error marks the credential exhausted immediately (even under the numeric
/// limit) and the call retries once on the next credential. Exhaustion is
/// one-directional within a day and clears only at local-midnight rollover.
pub struct Translator {
    client: reqwest::Client,
    api_url: String,
    model: String,
    credentials: Vec<Credential>,
    daily_limit: u32,
    usage_path: PathBuf,
    state: Mutex<UsageState>,
}

impl Translator {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(90))
            .build()
            .context("Failed to build translation HTTP client")?;

        let credentials: Vec<Credential> = config
            .openai_api_keys
            .iter()
            .enumerate()
            .map(|(i, key)| Credential {
                id: format!("key-{}", i + 1),
                key: key.clone(),
            })
            .collect();

        let ids: Vec<String> = credentials.iter().map(|c| c.id.clone()).collect();
        let usage_path = PathBuf::from(&config.usage_file);
        let state = load_usage(&usage_path, &ids)?;

        Ok(Self {
            client,
            api_url: config.openai_api_url.clone(),
            model: config.openai_model.clone(),
            credentials,
            daily_limit: config.daily_request_limit,
            usage_path,
            state,
        })
    }

    /// Translate `text` into `target_locale`.
    ///
    /// Fails with `PipelineError::AllCredentialsExhausted` once no credential
    /// has capacity left for the day; other failures surface as translation
    /// or quota errors without aborting the pipeline.
    pub async fn translate(
        &self,
        text: &str,
        target_locale: &str,
        is_title: bool,
    ) -> Result<String> {
        let mut last_quota_error: Option<anyhow::Error> = None;

        // Original attempt plus one rotation retry after a quota error.
        for _ in 0..2 {
            let credential = match self.select_credential()? {
                Some(c) => c,
                None => return Err(pool_exhausted(last_quota_error)),
            };

            match self
                .request_translation(&credential, text, target_locale, is_title)
                .await
            {
                Ok(translated) => {
                    self.note_success(&credential.id)?;
                    return Ok(translated);
                }
                Err(e) if is_quota_error(&e) => {
                    warn!(
                        "Credential {} hit a quota error, marking exhausted: {}",
                        credential.id, e
                    );
                    self.mark_exhausted(&credential.id)?;
                    last_quota_error =
                        Some(e.context(PipelineError::QuotaExhausted(credential.id.clone())));
                }
                Err(e) => return Err(e),
            }
        }

        // Two quota errors in a row; report exhaustion if the pool is dry.
        if self.select_credential()?.is_none() {
            Err(pool_exhausted(last_quota_error))
        } else {
            Err(last_quota_error.expect("loop only exits after a quota error"))
        }
    }

    /// Remaining capacity check, for observability and tests.
    pub fn usage_snapshot(&self) -> (NaiveDate, BTreeMap<String, KeyUsage>) {
        let state = self.state.lock().unwrap();
        (state.date, state.keys.clone())
    }

    /// Pick a credential with capacity: the active one if it still has room,
    /// otherwise the first configured credential that does.
    fn select_credential(&self) -> Result<Option<Credential>> {
        let mut state = self.state.lock().unwrap();
        self.rollover_if_needed(&mut state)?;

        let has_capacity = |usage: &KeyUsage| !usage.exhausted && usage.count < self.daily_limit;

        let active_id = &self.credentials[state.active].id;
        if state.keys.get(active_id).map(has_capacity).unwrap_or(false) {
            return Ok(Some(self.credentials[state.active].clone()));
        }

        for (i, credential) in self.credentials.iter().enumerate() {
            if state
                .keys
                .get(&credential.id)
                .map(has_capacity)
                .unwrap_or(false)
            {
                if i != state.active {
                    info!("Rotating active credential to {}", credential.id);
                }
                state.active = i;
                return Ok(Some(credential.clone()));
            }
        }

        Ok(None)
    }

    /// Reset all counters when the local date rolls over.
    fn rollover_if_needed(&self, state: &mut UsageState) -> Result<()> {
        let today = Local::now().date_naive();
        if state.date != today {
            info!("Quota day rolled over to {}, resetting usage", today);
            let ids: Vec<String> = self.credentials.iter().map(|c| c.id.clone()).collect();
            *state = UsageState::fresh(today, &ids);
            persist_usage(&self.usage_path, state)?;
        }
        Ok(())
    }

    fn note_success(&self, credential_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(usage) = state.keys.get_mut(credential_id) {
            usage.count += 1;
            if usage.count >= self.daily_limit {
                info!(
                    "Credential {} reached its daily limit of {}",
                    credential_id, self.daily_limit
                );
                usage.exhausted = true;
            }
        }
        persist_usage(&self.usage_path, &state)
    }

    fn mark_exhausted(&self, credential_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(usage) = state.keys.get_mut(credential_id) {
            usage.exhausted = true;
        }
        persist_usage(&self.usage_path, &state)
    }

    /// One translation request against one credential, with bounded retries
    /// for transient failures. Quota-classified errors are never retried
    /// here; they bubble up so `translate` can rotate credentials.
    async fn request_translation(
        &self,
        credential: &Credential,
        text: &str,
        target_locale: &str,
        is_title: bool,
    ) -> Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: build_system_prompt(target_locale, is_title),
                },
                Message {
                    role: "user".to_string(),
                    content: text.to_string(),
                },
            ],
            max_tokens: if is_title { 200 } else { 4096 },
            temperature: 0.3,
        };

        let operation_name = format!("Translation to {} via {}", target_locale, credential.id);

        with_retry_if(
            &RetryConfig::translation_call(),
            &operation_name,
            || async {
                let response = self
                    .client
                    .post(&self.api_url)
                    .header("Authorization", format!("Bearer {}", credential.key))
                    .header("Content-Type", "application/json")
                    .json(&request)
                    .send()
                    .await
                    .context("Failed to send request to translation backend")?;

                if !response.status().is_success() {
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|e| format!("<failed to read body: {}>", e));
                    anyhow::bail!("translation backend error ({}): {}", status, body);
                }

                let chat_response: ChatResponse = response
                    .json()
                    .await
                    .context("Failed to parse translation response")?;

                let translated = chat_response
                    .choices
                    .first()
                    .map(|c| c.message.content.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| {
                        PipelineError::Translation(
                            "translation response contained no choices".to_string(),
                        )
                    })?;

                debug!(
                    "Translated {} chars to {} via {}",
                    text.len(),
                    target_locale,
                    credential.id
                );
                Ok(translated)
            },
            |e: &anyhow::Error| is_transient_error(e) && !is_quota_error(e),
        )
        .await
    }
}

/// Quota-indicative markers in backend error text. The backend does not
/// return a structured machine code, so the string matching lives here and
/// nowhere else.
const QUOTA_MARKERS: &[&str] = &[
    "quota",
    "rate limit",
    "rate_limit",
    "resource_exhausted",
    "insufficient_quota",
    "billing",
    "429",
];

/// Build the pool-dry error. `AllCredentialsExhausted` must sit at the root
/// of the chain, not as attached context, or the downcast in
/// `is_all_credentials_exhausted` cannot see it; the triggering quota error
/// rides along as display context.
fn pool_exhausted(last_quota_error: Option<anyhow::Error>) -> anyhow::Error {
    let err = anyhow::Error::new(PipelineError::AllCredentialsExhausted);
    match last_quota_error {
        Some(e) => err.context(format!("last quota error: {:#}", e)),
        None => err,
    }
}

fn is_quota_error(error: &anyhow::Error) -> bool {
    let text = format!("{:#}", error).to_lowercase();
    QUOTA_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Retry 5xx responses and anything without a parseable status (network
/// errors, timeouts); never retry other 4xx client errors.
fn is_transient_error(error: &anyhow::Error) -> bool {
    let text = format!("{:#}", error);

    if let Some(status) = extract_status(&text) {
        return status >= 500;
    }
    true
}

/// Pull the numeric status out of "translation backend error (500 Internal
/// Server Error): ..." style messages.
fn extract_status(text: &str) -> Option<u16> {
    let start = text.find("error (")?;
    let rest = &text[start + "error (".len()..];
    let end = rest.find(')')?;
    rest[..end].split_whitespace().next()?.parse().ok()
}

fn build_system_prompt(target_locale: &str, is_title: bool) -> String {
    if is_title {
        format!(
            "You are a professional news translator. Translate the headline \
             into the locale '{}'. Return only the translated headline, with \
             no quotes and no commentary.",
            target_locale
        )
    } else {
        format!(
            r#"You are a professional news translator. Translate the article into the locale '{}'.

Rules:
- Do NOT translate proper names of people, companies, or products
- Do NOT translate URLs or code snippets
- Preserve all markdown formatting and the original structure
- Keep acronyms (AI, GPU, ETF, etc.) in their original form
- If a term has no good translation, keep the original term"#,
            target_locale
        )
    }
}

fn load_usage(path: &PathBuf, credential_ids: &[String]) -> Result<Mutex<UsageState>> {
    let today = Local::now().date_naive();

    let state = match std::fs::read_to_string(path) {
        Ok(raw) => {
            let mut loaded: UsageState =
                serde_json::from_str(&raw).context("Failed to parse credential usage file")?;
            if loaded.date != today {
                UsageState::fresh(today, credential_ids)
            } else {
                // New credentials added to the config start from zero
                for id in credential_ids {
                    loaded.keys.entry(id.clone()).or_default();
                }
                loaded
            }
        }
        Err(_) => UsageState::fresh(today, credential_ids),
    };

    persist_usage(path, &state)?;
    Ok(Mutex::new(state))
}

fn persist_usage(path: &PathBuf, state: &UsageState) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create usage file directory")?;
        }
    }
    let json = serde_json::to_string_pretty(state).context("Failed to serialize usage state")?;
    std::fs::write(path, json).context("Failed to write usage file")?;
    Ok(())
}
