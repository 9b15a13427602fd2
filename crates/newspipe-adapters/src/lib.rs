//! Upstream article source contract + Event Registry and fixture-backed implementations.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use newspipe_core::{Article, DateWindow};
use newspipe_storage::{classify_reqwest_error, classify_status, RetryDisposition};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "newspipe-adapters";

/// Upper bound the upstream accepts for one page of results.
pub const MAX_PAGE_SIZE: u32 = 100;

pub const DEFAULT_EVENT_REGISTRY_URL: &str = "https://eventregistry.org";

/// One page request against a single query target and date window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub query: String,
    pub lang: Option<String>,
    pub window: Option<DateWindow>,
    /// 1-based.
    pub page: u32,
    pub page_size: u32,
    pub skip_duplicates: bool,
}

impl PageQuery {
    pub fn effective_page_size(&self) -> u32 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("upstream rejected request: {0}")]
    Upstream(String),
    #[error("undecodable response: {0}")]
    Decode(String),
    #[error("fixture {path}: {message}")]
    Fixture { path: PathBuf, message: String },
}

/// Outcome of a single page call. The retry driver only re-issues `Transient`.
#[derive(Debug)]
pub enum PageResult {
    Success(Vec<Article>),
    Transient(SourceError),
    Fatal(SourceError),
}

impl PageResult {
    pub fn from_error(err: SourceError, disposition: RetryDisposition) -> Self {
        match disposition {
            RetryDisposition::Retryable => PageResult::Transient(err),
            RetryDisposition::NonRetryable => PageResult::Fatal(err),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PageResult::Success(_))
    }
}

#[async_trait]
pub trait ArticleSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_page(&self, query: &PageQuery) -> PageResult;
}

#[derive(Debug, Clone)]
pub struct EventRegistryConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl EventRegistryConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_EVENT_REGISTRY_URL.to_string(),
            timeout: Duration::from_secs(60),
            user_agent: Some(format!("newspipe/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

/// Article search over the Event Registry (NewsAPI.ai) HTTP API.
#[derive(Debug)]
pub struct EventRegistryClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl EventRegistryClient {
    pub fn new(config: EventRegistryConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/api/v1/article/getArticles",
                config.base_url.trim_end_matches('/')
            ),
            api_key: config.api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, query: &PageQuery) -> Result<Vec<Article>, (SourceError, RetryDisposition)> {
        let body = build_request_body(query, &self.api_key);
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                let disposition = classify_reqwest_error(&err);
                (SourceError::Transport(err), disposition)
            })?;

        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|err| {
            let disposition = classify_reqwest_error(&err);
            (SourceError::Transport(err), disposition)
        })?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes).chars().take(300).collect();
            return Err((
                SourceError::HttpStatus {
                    status: status.as_u16(),
                    body,
                },
                classify_status(status),
            ));
        }

        decode_response(&bytes).map_err(|err| {
            let disposition = match err {
                SourceError::Upstream(_) => RetryDisposition::NonRetryable,
                _ => RetryDisposition::Retryable,
            };
            (err, disposition)
        })
    }
}

#[async_trait]
impl ArticleSource for EventRegistryClient {
    fn source_id(&self) -> &str {
        "event-registry"
    }

    async fn fetch_page(&self, query: &PageQuery) -> PageResult {
        let span = info_span!("er_get_articles", query = %query.query, page = query.page);
        match self.send(query).instrument(span).await {
            Ok(articles) => PageResult::Success(articles),
            Err((err, disposition)) => PageResult::from_error(err, disposition),
        }
    }
}

/// `getArticles` request body for one page.
pub fn build_request_body(query: &PageQuery, api_key: &str) -> JsonValue {
    let mut body = json!({
        "action": "getArticles",
        "resultType": "articles",
        "keyword": query.query,
        "isDuplicateFilter": if query.skip_duplicates { "skipDuplicates" } else { "keepAll" },
        "dataType": ["news"],
        "articlesPage": query.page.max(1),
        "articlesCount": query.effective_page_size(),
        "articlesSortBy": "date",
        "includeArticleBody": true,
        "includeArticleConcepts": true,
        "apiKey": api_key,
    });
    if let Some(lang) = query.lang.as_deref().filter(|l| !l.is_empty()) {
        body["lang"] = json!(lang);
    }
    if let Some(window) = query.window {
        body["dateStart"] = json!(window.start_str());
        body["dateEnd"] = json!(window.end_str());
    }
    body
}

/// Extracts `articles.results`. An `error` payload is reported as
/// [`SourceError::Upstream`].
pub fn decode_response(bytes: &[u8]) -> Result<Vec<Article>, SourceError> {
    let value: JsonValue =
        serde_json::from_slice(bytes).map_err(|e| SourceError::Decode(e.to_string()))?;
    if let Some(err) = value.get("error") {
        let message = err
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(SourceError::Upstream(message));
    }
    let Some(results) = value.get("articles").and_then(|a| a.get("results")) else {
        return Err(SourceError::Decode("missing articles.results".to_string()));
    };
    serde_json::from_value(results.clone()).map_err(|e| SourceError::Decode(e.to_string()))
}

/// Serves pages from JSON files on disk, for offline runs and demos.
///
/// Layout: `<root>/<query-slug>/<window>/page-<n>.json`, where `<window>` is
/// `recent` or `<start>_<end>`. A missing page file is an empty page.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    root: PathBuf,
}

impl FixtureSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn page_path(&self, query: &PageQuery) -> PathBuf {
        let window = query
            .window
            .map(|w| format!("{}_{}", w.start_str(), w.end_str()))
            .unwrap_or_else(|| "recent".to_string());
        self.root
            .join(query_slug(&query.query))
            .join(window)
            .join(format!("page-{}.json", query.page))
    }

    async fn load(&self, query: &PageQuery) -> Result<Vec<Article>, SourceError> {
        let path = self.page_path(query);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no fixture page; treating as end of results");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(SourceError::Fixture {
                    path,
                    message: err.to_string(),
                })
            }
        };
        let mut articles: Vec<Article> =
            serde_json::from_str(&text).map_err(|e| SourceError::Fixture {
                path: path.clone(),
                message: e.to_string(),
            })?;
        articles.truncate(query.effective_page_size() as usize);
        Ok(articles)
    }
}

#[async_trait]
impl ArticleSource for FixtureSource {
    fn source_id(&self) -> &str {
        "fixtures"
    }

    async fn fetch_page(&self, query: &PageQuery) -> PageResult {
        match self.load(query).await {
            Ok(articles) => PageResult::Success(articles),
            Err(err) => PageResult::Fatal(err),
        }
    }
}

type PageKey = (String, Option<DateWindow>, u32);

/// Scripted in-memory source: fixed pages per `(query, window, page)`, with
/// optional injected failures. Every call is recorded.
#[derive(Debug, Default)]
pub struct MemorySource {
    pages: HashMap<PageKey, Vec<Article>>,
    fatal: HashSet<PageKey>,
    transient_failures: Mutex<HashMap<PageKey, usize>>,
    calls: Mutex<Vec<PageQuery>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(
        mut self,
        query: &str,
        window: Option<DateWindow>,
        page: u32,
        articles: Vec<Article>,
    ) -> Self {
        self.pages.insert((query.to_string(), window, page), articles);
        self
    }

    /// The next `count` calls for this page fail with a retryable error.
    pub fn with_transient_failures(
        self,
        query: &str,
        window: Option<DateWindow>,
        page: u32,
        count: usize,
    ) -> Self {
        self.transient_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((query.to_string(), window, page), count);
        self
    }

    pub fn with_fatal(mut self, query: &str, window: Option<DateWindow>, page: u32) -> Self {
        self.fatal.insert((query.to_string(), window, page));
        self
    }

    pub fn calls(&self) -> Vec<PageQuery> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl ArticleSource for MemorySource {
    fn source_id(&self) -> &str {
        "memory"
    }

    async fn fetch_page(&self, query: &PageQuery) -> PageResult {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(query.clone());
        let key = (query.query.clone(), query.window, query.page);

        if self.fatal.contains(&key) {
            return PageResult::Fatal(SourceError::Upstream(format!(
                "scripted fatal failure for {} page {}",
                query.query, query.page
            )));
        }
        {
            let mut failures = self.transient_failures.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(remaining) = failures.get_mut(&key).filter(|n| **n > 0) {
                *remaining -= 1;
                return PageResult::Transient(SourceError::HttpStatus {
                    status: 503,
                    body: "scripted transient failure".to_string(),
                });
            }
        }

        let mut articles = self.pages.get(&key).cloned().unwrap_or_default();
        articles.truncate(query.effective_page_size() as usize);
        PageResult::Success(articles)
    }
}

/// Lowercase, alphanumeric runs joined by `-`: `"Tencent OR 0700.HK"` -> `tencent-or-0700-hk`.
pub fn query_slug(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
