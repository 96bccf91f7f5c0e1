//! Pipeline orchestration: the batch scheduler, the in-memory job status
//! machine, and the enrichment worker that backfills readmes and summaries.
//!
//! The scheduler owns its own timer loop instead of delegating to a cron
//! runner, so interval changes written through the config API take effect
//! without a restart: a watch channel wakes the loop, which re-reads the
//! interval and re-arms the sleep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use repolens_ai::{AiSettings, OpenAiClient, Summarizer};
use repolens_core::{FetchMode, JobState, JobStatus, Repo, RepoCandidate, RepoSummary};
use repolens_source::{GithubClient, Readme, SourceClient, SourceError, SourceOptions};
use repolens_storage::{keys, ConfigStore, RepoStore};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors surfaced to callers of the on-demand pipeline entry points.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid repository name, expected owner/name")]
    InvalidInput,
    #[error("repository not found")]
    NotFound,
    #[error(transparent)]
    Source(SourceError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What a re-analysis request decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReanalyzeOutcome {
    /// The catalog no longer knows the repository; the row was removed.
    DeletedGone,
    /// Neither a description nor a readme exists; the row was removed.
    DeletedEmpty,
    /// Identity was refreshed and enrichment re-runs in the background.
    Started,
}

impl ReanalyzeOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            ReanalyzeOutcome::DeletedGone => "repository no longer exists on source, deleted",
            ReanalyzeOutcome::DeletedEmpty => {
                "repository has no description or readme, deleted"
            }
            ReanalyzeOutcome::Started => "re-analysis started",
        }
    }
}

/// Backfills readme content and AI summaries for one stored repository.
///
/// Two independent stages: content first, then summary. A summarizer
/// failure is logged and swallowed so the summary stays unset and a later
/// pass retries it; storage failures propagate.
#[derive(Clone)]
pub struct Enricher {
    store: Arc<dyn RepoStore>,
    source: Arc<dyn SourceClient>,
    summarizer: Arc<dyn Summarizer>,
}

impl Enricher {
    pub fn new(
        store: Arc<dyn RepoStore>,
        source: Arc<dyn SourceClient>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            store,
            source,
            summarizer,
        }
    }

    /// Enrich `stored` using the fresh candidate for source coordinates.
    /// With `force` unset, stages that already have data are skipped.
    pub async fn enrich(&self, stored: &Repo, fresh: &RepoCandidate, force: bool) -> Result<()> {
        let mut readme_text = stored.readme.clone();

        if force || stored.readme.is_none() {
            let fetched = self
                .source
                .fetch_readme(&fresh.owner_login, &fresh.name, &fresh.default_branch)
                .await;
            match fetched.into_option() {
                Some(html) => {
                    self.store
                        .set_readme(stored.id, &html)
                        .await
                        .with_context(|| format!("storing readme for {}", fresh.full_name))?;
                    readme_text = Some(html);
                }
                None => {
                    debug!(repo = %fresh.full_name, "no readme available");
                }
            }
        }

        if force || stored.summary.is_none() {
            match self
                .summarizer
                .summarize_repo(fresh, readme_text.as_deref())
                .await
            {
                Ok(summary) => {
                    self.store
                        .set_summary(stored.id, &summary)
                        .await
                        .with_context(|| format!("storing summary for {}", fresh.full_name))?;
                }
                Err(err) => {
                    // Left unset on purpose: the next enrichment pass retries.
                    warn!(
                        repo = %fresh.full_name,
                        error = %format!("{err:#}"),
                        "summarization failed, summary left unset"
                    );
                }
            }
        }

        Ok(())
    }
}

/// Owns the periodic batch run and the job status visible over the API.
///
/// At most one batch runs at a time; overlapping triggers are dropped with
/// a log line. Status lives only in process memory.
pub struct Scheduler {
    store: Arc<dyn RepoStore>,
    config: Arc<dyn ConfigStore>,
    source: Arc<dyn SourceClient>,
    enricher: Enricher,
    status: Mutex<JobStatus>,
    running: AtomicBool,
    reschedule_tx: watch::Sender<()>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn RepoStore>,
        config: Arc<dyn ConfigStore>,
        source: Arc<dyn SourceClient>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Arc<Self> {
        let (reschedule_tx, _) = watch::channel(());
        Arc::new(Self {
            enricher: Enricher::new(Arc::clone(&store), Arc::clone(&source), summarizer),
            store,
            config,
            source,
            status: Mutex::new(JobStatus::default()),
            running: AtomicBool::new(false),
            reschedule_tx,
        })
    }

    /// Snapshot of the current job status.
    pub fn status(&self) -> JobStatus {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn update_status(&self, apply: impl FnOnce(&mut JobStatus)) {
        let mut guard = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        apply(&mut guard);
    }

    /// Run one batch inline. Returns false when a batch was already
    /// running and this call was dropped.
    pub async fn run_once(&self) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("batch fetch already in progress, trigger ignored");
            return false;
        }

        self.update_status(|status| {
            *status = JobStatus {
                state: JobState::Fetching,
                message: "starting batch fetch".to_string(),
                processed: 0,
                total: 0,
            };
        });

        if let Err(err) = self.run_batch().await {
            error!(error = %format!("{err:#}"), "batch fetch failed");
            self.update_status(|status| {
                status.state = JobState::Error;
                status.message = format!("batch fetch failed: {err:#}");
            });
        }

        self.running.store(false, Ordering::Release);
        true
    }

    /// Fire-and-forget trigger used by the web surface and the timer.
    pub fn trigger(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_once().await;
        });
    }

    async fn run_batch(&self) -> Result<()> {
        let mode = FetchMode::parse(&self.config.get(keys::PULL_TYPE).await?);
        let count = self
            .config
            .get(keys::PULL_COUNT)
            .await?
            .trim()
            .parse::<u32>()
            .unwrap_or(10);

        self.update_status(|status| {
            status.message = "querying source catalog".to_string();
        });
        let candidates = self
            .source
            .search_repos(mode, count)
            .await
            .context("searching source catalog")?;
        info!(count = candidates.len(), ?mode, "batch search returned");

        if candidates.is_empty() {
            self.update_status(|status| {
                status.state = JobState::Completed;
                status.message =
                    "fetched 0 repositories; check search criteria or source connectivity"
                        .to_string();
            });
            return Ok(());
        }

        let total = candidates.len() as u32;
        self.update_status(|status| {
            status.state = JobState::Processing;
            status.total = total;
            status.message = format!("fetched {total} repositories, processing");
        });

        let mut processed = 0u32;
        for (index, candidate) in candidates.iter().enumerate() {
            self.update_status(|status| {
                status.message =
                    format!("processing {}/{}: {}", index + 1, total, candidate.full_name);
            });
            match self.process_candidate(candidate).await {
                Ok(()) => {
                    processed += 1;
                    self.update_status(|status| status.processed = processed);
                }
                Err(err) => {
                    warn!(
                        repo = %candidate.full_name,
                        error = %format!("{err:#}"),
                        "candidate failed, continuing batch"
                    );
                    self.update_status(|status| {
                        status.message =
                            format!("error processing {}: {err:#}", candidate.full_name);
                    });
                }
            }
        }

        self.update_status(|status| {
            status.state = JobState::Completed;
            status.message = format!("batch complete: {processed}/{total} repositories processed");
        });
        Ok(())
    }

    async fn process_candidate(&self, candidate: &RepoCandidate) -> Result<()> {
        let stored = self.store.upsert_basic(candidate).await?;
        self.enricher.enrich(&stored, candidate, false).await
    }

    /// Background timer driving the periodic batch. Re-arms from config
    /// after every run and whenever [`Scheduler::reschedule`] fires.
    pub fn spawn_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let mut reschedule_rx = self.reschedule_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let minutes = scheduler.fetch_interval_minutes().await;
                debug!(minutes, "next batch fetch scheduled");
                tokio::select! {
                    _ = sleep(interval_duration(minutes)) => {
                        scheduler.trigger();
                    }
                    changed = reschedule_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        info!("fetch interval changed, rescheduling");
                    }
                }
            }
        })
    }

    /// Wake the timer loop so it re-reads the configured interval.
    pub fn reschedule(&self) {
        let _ = self.reschedule_tx.send(());
    }

    async fn fetch_interval_minutes(&self) -> u64 {
        self.config
            .get(keys::PULL_FREQUENCY_MINUTES)
            .await
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|minutes| *minutes > 0)
            .unwrap_or(60)
    }

    /// Manually add one repository by `owner/name`, then enrich it in the
    /// background.
    pub async fn add_repo(self: &Arc<Self>, name: &str) -> Result<Repo, PipelineError> {
        let Some((owner, repo_name)) = name.trim().split_once('/') else {
            return Err(PipelineError::InvalidInput);
        };
        if owner.is_empty() || repo_name.is_empty() {
            return Err(PipelineError::InvalidInput);
        }

        let detail = match self.source.fetch_detail(owner, repo_name).await {
            Ok(detail) => detail,
            Err(SourceError::NotFound) => return Err(PipelineError::NotFound),
            Err(err) => return Err(PipelineError::Source(err)),
        };

        let stored = self.store.upsert_basic(&detail).await?;
        info!(repo = %stored.full_name, "repository added manually");
        self.spawn_enrichment(stored.clone(), detail, false);
        Ok(stored)
    }

    /// Re-analyze one stored repository against the live catalog. Deletes
    /// rows the catalog dropped and rows with no usable content.
    pub async fn reanalyze(self: &Arc<Self>, id: Uuid) -> Result<ReanalyzeOutcome, PipelineError> {
        let Some(repo) = self.store.get(id).await? else {
            return Err(PipelineError::NotFound);
        };

        let detail = match self.source.fetch_detail(&repo.owner_login, &repo.name).await {
            Ok(detail) => detail,
            Err(SourceError::NotFound) => {
                info!(repo = %repo.full_name, "source no longer lists repository, deleting");
                self.store.delete(id).await?;
                return Ok(ReanalyzeOutcome::DeletedGone);
            }
            Err(err) => return Err(PipelineError::Source(err)),
        };

        if detail.description_is_empty() {
            let readme = self
                .source
                .fetch_readme(&detail.owner_login, &detail.name, &detail.default_branch)
                .await;
            if matches!(readme, Readme::Unavailable) {
                info!(repo = %detail.full_name, "no description and no readme, deleting");
                self.store.delete(id).await?;
                return Ok(ReanalyzeOutcome::DeletedEmpty);
            }
        }

        self.store.refresh_identity(id, &detail).await?;
        let stored = self.store.upsert_basic(&detail).await?;
        self.spawn_enrichment(stored, detail, true);
        Ok(ReanalyzeOutcome::Started)
    }

    fn spawn_enrichment(&self, stored: Repo, fresh: RepoCandidate, force: bool) {
        let enricher = self.enricher.clone();
        tokio::spawn(async move {
            if let Err(err) = enricher.enrich(&stored, &fresh, force).await {
                error!(
                    repo = %fresh.full_name,
                    error = %format!("{err:#}"),
                    "background enrichment failed"
                );
            }
        });
    }
}

/// Minutes to a sleep duration; saturates so an absurd configured value
/// cannot overflow the multiplication.
fn interval_duration(minutes: u64) -> Duration {
    Duration::from_secs(minutes.saturating_mul(60))
}

/// Overlay non-blank candidate values onto the stored source options.
fn merge_source_options(
    mut stored: SourceOptions,
    token: Option<String>,
    proxy: Option<String>,
) -> SourceOptions {
    if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
        stored.token = Some(token);
    }
    if let Some(proxy) = proxy.filter(|p| !p.trim().is_empty()) {
        stored.proxy = Some(proxy);
    }
    stored
}

/// Overlay non-blank candidate values onto the stored provider settings.
fn merge_ai_settings(
    mut stored: AiSettings,
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
) -> AiSettings {
    if let Some(base_url) = base_url.filter(|v| !v.trim().is_empty()) {
        stored.base_url = base_url;
    }
    if let Some(api_key) = api_key.filter(|v| !v.trim().is_empty()) {
        stored.api_key = api_key;
    }
    if let Some(model) = model.filter(|v| !v.trim().is_empty()) {
        stored.model = model;
    }
    stored
}

/// [`SourceClient`] that builds a fresh catalog client per call from the
/// stored configuration, so token and proxy edits apply immediately.
pub struct ConfigSourceClient {
    config: Arc<dyn ConfigStore>,
}

impl ConfigSourceClient {
    pub fn new(config: Arc<dyn ConfigStore>) -> Self {
        Self { config }
    }

    async fn stored_options(&self) -> Result<SourceOptions, SourceError> {
        let token = self
            .config
            .get(keys::GITHUB_TOKEN)
            .await
            .map_err(|err| SourceError::Options(err.to_string()))?;
        let proxy = self
            .config
            .get(keys::PROXY_URL)
            .await
            .map_err(|err| SourceError::Options(err.to_string()))?;
        Ok(SourceOptions {
            token: Some(token).filter(|t| !t.trim().is_empty()),
            proxy: Some(proxy).filter(|p| !p.trim().is_empty()),
        })
    }

    async fn client(&self) -> Result<GithubClient, SourceError> {
        GithubClient::new(self.stored_options().await?)
    }

    /// Connectivity probe. Non-blank candidate credentials take precedence
    /// over the stored ones, so a token or proxy can be validated before
    /// it is saved.
    pub async fn test_connection(
        &self,
        token: Option<String>,
        proxy: Option<String>,
    ) -> repolens_source::ConnectionTest {
        let options = match self.stored_options().await {
            Ok(stored) => merge_source_options(stored, token, proxy),
            Err(err) => {
                return repolens_source::ConnectionTest {
                    success: false,
                    message: err.to_string(),
                }
            }
        };
        match GithubClient::new(options) {
            Ok(client) => client.test_connection().await,
            Err(err) => repolens_source::ConnectionTest {
                success: false,
                message: err.to_string(),
            },
        }
    }
}

#[async_trait]
impl SourceClient for ConfigSourceClient {
    async fn search_repos(
        &self,
        mode: FetchMode,
        count: u32,
    ) -> Result<Vec<RepoCandidate>, SourceError> {
        self.client().await?.search_repos(mode, count).await
    }

    async fn fetch_detail(&self, owner: &str, name: &str) -> Result<RepoCandidate, SourceError> {
        self.client().await?.fetch_detail(owner, name).await
    }

    async fn fetch_readme(&self, owner: &str, name: &str, default_branch: &str) -> Readme {
        match self.client().await {
            Ok(client) => client.fetch_readme(owner, name, default_branch).await,
            Err(err) => {
                warn!(error = %err, "could not build catalog client for readme fetch");
                Readme::Unavailable
            }
        }
    }
}

/// [`Summarizer`] that reads provider settings from the stored
/// configuration on every call.
pub struct ConfigSummarizer {
    config: Arc<dyn ConfigStore>,
}

impl ConfigSummarizer {
    pub fn new(config: Arc<dyn ConfigStore>) -> Self {
        Self { config }
    }

    async fn stored_settings(&self) -> Result<AiSettings> {
        Ok(AiSettings {
            base_url: self.config.get(keys::AI_BASE_URL).await?,
            api_key: self.config.get(keys::AI_API_KEY).await?,
            model: self.config.get(keys::AI_MODEL).await?,
        })
    }

    async fn client(&self) -> Result<OpenAiClient> {
        Ok(OpenAiClient::new(self.stored_settings().await?))
    }

    /// Provider probe. Non-blank candidate settings take precedence over
    /// the stored ones, so a configuration can be validated before it is
    /// saved.
    pub async fn test_connection(
        &self,
        base_url: Option<String>,
        api_key: Option<String>,
        model: Option<String>,
    ) -> Result<repolens_ai::AiConnectionTest> {
        let settings = merge_ai_settings(self.stored_settings().await?, base_url, api_key, model);
        Ok(OpenAiClient::new(settings).test_connection().await)
    }
}

#[async_trait]
impl Summarizer for ConfigSummarizer {
    async fn summarize_repo(
        &self,
        candidate: &RepoCandidate,
        readme: Option<&str>,
    ) -> Result<RepoSummary> {
        self.client().await?.summarize_repo(candidate, readme).await
    }

    async fn summarize_text(&self, text: &str) -> Result<String> {
        self.client().await?.summarize_text(text).await
    }
}
