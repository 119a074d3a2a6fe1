use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;

use crate::config::DocpubConfig;
use crate::model::{Actor, PageStore, PageTitle, WriteAction};

#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

impl RemoteStoreConfig {
    pub fn from_config(config: &DocpubConfig) -> Self {
        Self {
            api_url: config.api_url().unwrap_or_default(),
            user_agent: config.user_agent(),
            timeout_ms: env_value_u64("DOCPUB_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_u64("DOCPUB_RATE_LIMIT_READ", 300),
            rate_limit_write_ms: env_value_u64("DOCPUB_RATE_LIMIT_WRITE", 1_000),
            max_retries: env_value_usize("DOCPUB_HTTP_RETRIES", 2),
            max_write_retries: env_value_usize("DOCPUB_HTTP_WRITE_RETRIES", 1),
            retry_delay_ms: env_value_u64("DOCPUB_HTTP_RETRY_DELAY_MS", 500),
        }
    }
}

/// Page repository backed by a MediaWiki-compatible HTTP API. Writes
/// require bot credentials in WIKI_BOT_USER / WIKI_BOT_PASS; login is
/// deferred until the first write.
#[derive(Debug)]
pub struct RemotePageStore {
    client: Client,
    config: RemoteStoreConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    csrf_token: Option<String>,
    logged_in: bool,
}

impl RemotePageStore {
    pub fn new(config: RemoteStoreConfig) -> Result<Self> {
        if config.api_url.trim().is_empty() {
            bail!("remote API URL is not configured; set DOCPUB_API_URL or [site] api_url");
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build remote HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            csrf_token: None,
            logged_in: false,
        })
    }

    pub fn request_count(&self) -> usize {
        self.request_count
    }

    fn request_json_get(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let base_url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid API URL: {}", self.config.api_url))?;

        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit(false);
            let response = self
                .client
                .get(base_url.clone())
                .header("User-Agent", self.config.user_agent.clone())
                .query(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt, false);
                            continue;
                        }
                        bail!("remote API request failed with HTTP {status}");
                    }

                    let payload: Value = response
                        .json()
                        .context("failed to decode remote API JSON response")?;
                    check_api_error(&payload)?;
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, false);
                        continue;
                    }
                    return Err(error).context("failed to call remote API");
                }
            }
        }

        bail!("remote API request exhausted retry budget")
    }

    fn request_json_post(&mut self, params: &[(&str, String)], is_write: bool) -> Result<Value> {
        let max_retries = if is_write {
            self.config.max_write_retries
        } else {
            self.config.max_retries
        };
        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        for attempt in 0..=max_retries {
            self.apply_rate_limit(is_write);
            let response = self
                .client
                .post(&self.config.api_url)
                .header("User-Agent", self.config.user_agent.clone())
                .form(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt, is_write);
                            continue;
                        }
                        bail!("remote API request failed with HTTP {status}");
                    }

                    let payload: Value = response
                        .json()
                        .context("failed to decode remote API JSON response")?;
                    check_api_error(&payload)?;
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(error).context("failed to call remote API");
                }
            }
        }

        bail!("remote API request exhausted retry budget")
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        sleep(Duration::from_millis(
            base.saturating_mul(multiplier).saturating_add(jitter),
        ));
    }

    fn ensure_logged_in(&mut self) -> Result<()> {
        if self.logged_in {
            return Ok(());
        }
        let username = env::var("WIKI_BOT_USER")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("WIKI_BOT_USER is not set; writes need bot credentials"))?;
        let password = env::var("WIKI_BOT_PASS")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("WIKI_BOT_PASS is not set; writes need bot credentials"))?;

        let token_response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", "login".to_string()),
        ])?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .context("failed to decode login token response")?;
        let login_token = token_payload
            .query
            .tokens
            .as_ref()
            .and_then(|tokens| tokens.logintoken.as_ref())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("failed to get login token"))?;

        let login_response = self.request_json_post(
            &[
                ("action", "login".to_string()),
                ("lgname", username),
                ("lgpassword", password),
                ("lgtoken", login_token),
            ],
            true,
        )?;
        let login_payload: LoginResponse =
            serde_json::from_value(login_response).context("failed to decode login response")?;
        match login_payload.login.result.as_deref() {
            Some("Success") => {
                self.csrf_token = None;
                self.logged_in = true;
                Ok(())
            }
            other => bail!(
                "remote login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
        }
    }

    fn ensure_csrf_token(&mut self) -> Result<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
        ])?;
        let parsed: TokenQueryResponse =
            serde_json::from_value(response).context("failed to decode csrf token response")?;
        let token = parsed
            .query
            .tokens
            .as_ref()
            .and_then(|tokens| tokens.csrftoken.as_ref())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("failed to get csrf token"))?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }

    fn query_page(&mut self, title: &PageTitle) -> Result<Option<String>> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("titles", title.full()),
            ("prop", "revisions".to_string()),
            ("rvprop", "content".to_string()),
            ("rvslots", "main".to_string()),
        ])?;
        let parsed: QueryResponse =
            serde_json::from_value(response).context("failed to decode page query response")?;
        let Some(page) = parsed.query.pages.into_iter().next() else {
            return Ok(None);
        };
        if page.missing.unwrap_or(false) {
            return Ok(None);
        }
        let content = page
            .revisions
            .into_iter()
            .next()
            .and_then(|revision| revision.slots)
            .and_then(|slots| slots.main)
            .and_then(|main| main.content);
        Ok(Some(content.unwrap_or_default()))
    }
}

impl PageStore for RemotePageStore {
    fn exists(&mut self, title: &PageTitle) -> Result<bool> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("titles", title.full()),
        ])?;
        let parsed: QueryResponse =
            serde_json::from_value(response).context("failed to decode page query response")?;
        Ok(parsed
            .query
            .pages
            .first()
            .is_some_and(|page| !page.missing.unwrap_or(false)))
    }

    fn read(&mut self, title: &PageTitle) -> Result<Option<String>> {
        self.query_page(title)
    }

    fn create_or_modify(
        &mut self,
        title: &PageTitle,
        body: &str,
        summary: &str,
        actor: &Actor,
    ) -> Result<WriteAction> {
        self.ensure_logged_in()?;
        let token = self.ensure_csrf_token()?;
        // Edits go out under the bot account; the acting user is carried
        // in the summary.
        let response = self.request_json_post(
            &[
                ("action", "edit".to_string()),
                ("title", title.full()),
                ("text", body.to_string()),
                ("summary", format!("{summary} [{}]", actor.name)),
                ("bot", "1".to_string()),
                ("token", token),
            ],
            true,
        )?;
        let edit_payload: EditResponse =
            serde_json::from_value(response).context("failed to decode edit response")?;
        let edit = edit_payload
            .edit
            .ok_or_else(|| anyhow::anyhow!("missing edit payload in API response"))?;
        if edit.result.as_deref() != Some("Success") {
            bail!(
                "remote edit failed for {}: {}",
                title,
                edit.result.unwrap_or_else(|| "unknown".to_string())
            );
        }
        Ok(if edit.new.unwrap_or(false) {
            WriteAction::Created
        } else {
            WriteAction::Modified
        })
    }
}

fn check_api_error(payload: &Value) -> Result<()> {
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        bail!("remote API error [{code}]: {info}");
    }
    Ok(())
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    #[allow(dead_code)]
    title: Option<String>,
    missing: Option<bool>,
    #[serde(default)]
    revisions: Vec<RevisionItem>,
}

#[derive(Debug, Deserialize)]
struct RevisionItem {
    slots: Option<SlotsPayload>,
}

#[derive(Debug, Deserialize)]
struct SlotsPayload {
    main: Option<SlotContent>,
}

#[derive(Debug, Deserialize)]
struct SlotContent {
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EditResponse {
    edit: Option<EditPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct EditPayload {
    result: Option<String>,
    new: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::{EditResponse, QueryResponse, RemotePageStore, RemoteStoreConfig, check_api_error};

    fn test_config() -> RemoteStoreConfig {
        RemoteStoreConfig {
            api_url: "https://docs.example.org/api.php".to_string(),
            user_agent: "docpub-test/0.1".to_string(),
            timeout_ms: 1_000,
            rate_limit_read_ms: 0,
            rate_limit_write_ms: 0,
            max_retries: 0,
            max_write_retries: 0,
            retry_delay_ms: 0,
        }
    }

    #[test]
    fn empty_api_url_is_rejected_up_front() {
        let config = RemoteStoreConfig {
            api_url: String::new(),
            ..test_config()
        };
        let error = RemotePageStore::new(config).expect_err("must fail");
        assert!(error.to_string().contains("DOCPUB_API_URL"));
    }

    #[test]
    fn api_error_payload_is_surfaced() {
        let payload = serde_json::json!({
            "error": { "code": "badtoken", "info": "Invalid CSRF token." }
        });
        let error = check_api_error(&payload).expect_err("must fail");
        assert!(error.to_string().contains("badtoken"));
        assert!(error.to_string().contains("Invalid CSRF token."));
    }

    #[test]
    fn page_query_decodes_missing_and_content() {
        let payload = serde_json::json!({
            "query": { "pages": [
                { "title": "Ghost", "missing": true }
            ]}
        });
        let parsed: QueryResponse = serde_json::from_value(payload).expect("decode");
        assert_eq!(parsed.query.pages.len(), 1);
        assert_eq!(parsed.query.pages[0].missing, Some(true));

        let payload = serde_json::json!({
            "query": { "pages": [
                { "title": "Widget", "revisions": [
                    { "slots": { "main": { "content": "page body" } } }
                ]}
            ]}
        });
        let parsed: QueryResponse = serde_json::from_value(payload).expect("decode");
        let content = parsed.query.pages[0]
            .revisions
            .first()
            .and_then(|revision| revision.slots.as_ref())
            .and_then(|slots| slots.main.as_ref())
            .and_then(|main| main.content.as_deref());
        assert_eq!(content, Some("page body"));
    }

    #[test]
    fn edit_response_distinguishes_created_from_modified() {
        let payload = serde_json::json!({
            "edit": { "result": "Success", "new": true }
        });
        let parsed: EditResponse = serde_json::from_value(payload).expect("decode");
        let edit = parsed.edit.expect("edit payload");
        assert_eq!(edit.result.as_deref(), Some("Success"));
        assert_eq!(edit.new, Some(true));

        let payload = serde_json::json!({
            "edit": { "result": "Success" }
        });
        let parsed: EditResponse = serde_json::from_value(payload).expect("decode");
        assert_eq!(parsed.edit.expect("edit payload").new, None);
    }
}
