//! GitHub source client: batch search with bounded retry, fail-fast point
//! lookups, and branch-fallback readme retrieval.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repolens_core::{FetchMode, RepoCandidate};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("repolens/", env!("CARGO_PKG_VERSION"));
const JSON_ACCEPT: &str = "application/vnd.github.v3+json";
const HTML_ACCEPT: &str = "application/vnd.github.html";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("repository not found on source")]
    NotFound,
    #[error("github api returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("request to github failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid source options: {0}")]
    Options(String),
}

/// Credentials and transport options, read from the config store by callers.
#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    pub token: Option<String>,
    pub proxy: Option<String>,
}

/// Readme lookup outcome. Absence is a plain result, not an error, so
/// callers can tell "source is down" apart from "content doesn't exist".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readme {
    Found(String),
    Unavailable,
}

impl Readme {
    pub fn into_option(self) -> Option<String> {
        match self {
            Readme::Found(html) => Some(html),
            Readme::Unavailable => None,
        }
    }
}

/// Outcome of a connectivity self-test.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionTest {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_transport(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded retry with capped exponential delay. The default reproduces the
/// documented baseline of three attempts two seconds apart.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Contract the pipeline drives; mocked in pipeline tests.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// One search request for a batch of candidates, retried on transient
    /// failure. An empty list is a valid result.
    async fn search_repos(
        &self,
        mode: FetchMode,
        count: u32,
    ) -> Result<Vec<RepoCandidate>, SourceError>;

    /// Single-item lookup, no retry; callers decide how to react.
    async fn fetch_detail(&self, owner: &str, name: &str) -> Result<RepoCandidate, SourceError>;

    /// Rendered readme, trying the hinted branch then fixed fallbacks.
    /// Never errors; every failure collapses to `Unavailable`.
    async fn fetch_readme(&self, owner: &str, name: &str, default_branch: &str) -> Readme;
}

/// Wire shape of a repository in GitHub API responses.
#[derive(Debug, Deserialize)]
struct ApiRepo {
    id: i64,
    name: String,
    full_name: String,
    description: Option<String>,
    html_url: String,
    stargazers_count: i64,
    forks_count: i64,
    language: Option<String>,
    default_branch: Option<String>,
    owner: ApiOwner,
    #[serde(default)]
    topics: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiOwner {
    login: String,
    avatar_url: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    items: Vec<ApiRepo>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

impl From<ApiRepo> for RepoCandidate {
    fn from(repo: ApiRepo) -> Self {
        Self {
            github_id: repo.id,
            name: repo.name,
            full_name: repo.full_name,
            owner_login: repo.owner.login,
            owner_avatar: repo.owner.avatar_url,
            html_url: repo.html_url,
            default_branch: repo.default_branch.unwrap_or_else(|| "main".to_string()),
            description: repo.description,
            language: repo.language,
            topics: repo.topics,
            stars: repo.stargazers_count,
            forks: repo.forks_count,
        }
    }
}

/// Search query string + sort key for a fetch mode, relative to `now`.
fn search_query(mode: FetchMode, now: DateTime<Utc>) -> (String, &'static str) {
    match mode {
        FetchMode::Trending => {
            let window_start = (now - chrono::Duration::days(7)).format("%Y-%m-%d");
            (format!("created:>{window_start}"), "stars")
        }
        FetchMode::Newest => ("is:public".to_string(), "updated"),
    }
}

#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    retry: RetryPolicy,
}

impl GithubClient {
    pub fn new(options: SourceOptions) -> Result<Self, SourceError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(20));
        if let Some(proxy_url) = options.proxy.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|err| SourceError::Options(format!("invalid proxy url: {err}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder.build()?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            token: options.token.filter(|t| !t.trim().is_empty()),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn headers(&self, accept: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(accept));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("token {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    async fn error_from_response(response: reqwest::Response) -> SourceError {
        let status = response.status().as_u16();
        let message = match response.text().await {
            Ok(body) => serde_json::from_str::<ApiErrorBody>(&body)
                .map(|e| e.message)
                .unwrap_or_else(|_| body.chars().take(200).collect()),
            Err(err) => err.to_string(),
        };
        SourceError::Status { status, message }
    }

    /// One minimal round trip against the source, used only to validate
    /// configuration; never part of the steady-state pipeline.
    pub async fn test_connection(&self) -> ConnectionTest {
        let url = format!("{}/zen", self.base_url);
        match self.http.get(&url).headers(self.headers(JSON_ACCEPT)).send().await {
            Ok(response) if response.status().is_success() => ConnectionTest {
                success: true,
                message: "github connection successful".to_string(),
            },
            Ok(response) => ConnectionTest {
                success: false,
                message: Self::error_from_response(response).await.to_string(),
            },
            Err(err) => ConnectionTest {
                success: false,
                message: format!("connection failed: {err}"),
            },
        }
    }
}

#[async_trait]
impl SourceClient for GithubClient {
    async fn search_repos(
        &self,
        mode: FetchMode,
        count: u32,
    ) -> Result<Vec<RepoCandidate>, SourceError> {
        let (query, sort) = search_query(mode, Utc::now());
        let url = format!("{}/search/repositories", self.base_url);
        let per_page = count.clamp(1, 100).to_string();
        let params = [
            ("q", query.as_str()),
            ("sort", sort),
            ("order", "desc"),
            ("per_page", per_page.as_str()),
        ];

        let mut last_error: Option<SourceError> = None;
        for attempt in 0..self.retry.max_attempts {
            let result = self
                .http
                .get(&url)
                .headers(self.headers(JSON_ACCEPT))
                .query(&params)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    let parsed: SearchResponse = response.json().await?;
                    debug!(count = parsed.items.len(), ?mode, "search returned candidates");
                    return Ok(parsed.items.into_iter().map(RepoCandidate::from).collect());
                }
                Ok(response) => {
                    let status = response.status();
                    let error = Self::error_from_response(response).await;
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt + 1 < self.retry.max_attempts
                    {
                        warn!(attempt = attempt + 1, %status, "search attempt failed, retrying");
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                        last_error = Some(error);
                        continue;
                    }
                    return Err(error);
                }
                Err(err) => {
                    if classify_transport(&err) == RetryDisposition::Retryable
                        && attempt + 1 < self.retry.max_attempts
                    {
                        warn!(attempt = attempt + 1, error = %err, "search attempt failed, retrying");
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                        last_error = Some(SourceError::Transport(err));
                        continue;
                    }
                    return Err(SourceError::Transport(err));
                }
            }
        }
        Err(last_error.unwrap_or(SourceError::Status {
            status: 0,
            message: "retry budget exhausted".to_string(),
        }))
    }

    async fn fetch_detail(&self, owner: &str, name: &str) -> Result<RepoCandidate, SourceError> {
        let url = format!("{}/repos/{owner}/{name}", self.base_url);
        let response = self
            .http
            .get(&url)
            .headers(self.headers(JSON_ACCEPT))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound);
        }
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        let repo: ApiRepo = response.json().await?;
        Ok(repo.into())
    }

    async fn fetch_readme(&self, owner: &str, name: &str, default_branch: &str) -> Readme {
        let url = format!("{}/repos/{owner}/{name}/readme", self.base_url);
        let hint = default_branch.trim();
        let mut refs: Vec<Option<&str>> = Vec::new();
        if !hint.is_empty() {
            refs.push(Some(hint));
        }
        for fallback in ["main", "master"] {
            if fallback != hint {
                refs.push(Some(fallback));
            }
        }
        // Last resort: let the API resolve its own default branch.
        refs.push(None);

        for branch in refs {
            let mut request = self.http.get(&url).headers(self.headers(HTML_ACCEPT));
            if let Some(branch) = branch {
                request = request.query(&[("ref", branch)]);
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => match response.text().await {
                    Ok(html) if !html.trim().is_empty() => return Readme::Found(html),
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(repo = %format!("{owner}/{name}"), error = %err, "readme body read failed");
                        continue;
                    }
                },
                Ok(_) => continue,
                Err(err) => {
                    debug!(repo = %format!("{owner}/{name}"), error = %err, "readme request failed");
                    continue;
                }
            }
        }
        Readme::Unavailable
    }
}
