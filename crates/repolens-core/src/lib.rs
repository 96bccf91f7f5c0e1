//! Core domain model for repolens: persisted repositories, raw candidates
//! from the source catalog, and the batch job status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raw repository metadata as returned by the source catalog.
///
/// This is the handoff contract from the source fetcher into persistence and
/// enrichment; nothing in it is storage-assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoCandidate {
    pub github_id: i64,
    pub name: String,
    pub full_name: String,
    pub owner_login: String,
    pub owner_avatar: String,
    pub html_url: String,
    pub default_branch: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub topics: Vec<String>,
    pub stars: i64,
    pub forks: i64,
}

impl RepoCandidate {
    /// True when the catalog reports no usable description.
    pub fn description_is_empty(&self) -> bool {
        self.description
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .is_empty()
    }
}

/// Structured AI summary attached to a repository.
///
/// When present, all three fields are populated together; a partially built
/// summary is never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSummary {
    pub narrative: String,
    pub features: Vec<String>,
    pub use_cases: Vec<String>,
}

/// Canonical persisted repository row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    pub id: Uuid,
    pub github_id: i64,
    pub name: String,
    pub full_name: String,
    pub owner_login: String,
    pub owner_avatar: String,
    pub html_url: String,
    pub default_branch: String,
    pub description: String,
    pub language: String,
    pub topics: Vec<String>,
    pub stars: i64,
    pub forks: i64,
    pub readme: Option<String>,
    pub summary: Option<RepoSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Selection mode for a batch fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Popularity-ranked over a trailing seven-day window.
    Trending,
    /// Recency-ranked, unconstrained.
    Newest,
}

impl FetchMode {
    /// Lenient parse of a config value; unknown strings fall back to trending.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "newest" | "new" => Self::Newest,
            _ => Self::Trending,
        }
    }
}

/// Sort order for the listing read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    Newest,
    Random,
}

/// Listing query parameters.
#[derive(Debug, Clone)]
pub struct ListParams {
    pub page: u32,
    pub per_page: u32,
    pub search: Option<String>,
    pub sort: SortMode,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 10,
            search: None,
            sort: SortMode::Newest,
        }
    }
}

/// One page of listing results.
#[derive(Debug, Clone, Serialize)]
pub struct ListPage {
    pub data: Vec<Repo>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
}

/// Batch job state machine.
///
/// `Idle` is both the initial state and the resting state between runs;
/// `Completed` and `Error` are the terminal states of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Fetching,
    Processing,
    Completed,
    Error,
}

/// Observable progress of the current (or most recent) batch run.
///
/// Lives only in process memory; a restart loses it. `processed` is
/// monotonically non-decreasing within one run and resets when the next
/// run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    pub message: String,
    pub processed: u32,
    pub total: u32,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            state: JobState::Idle,
            message: String::new(),
            processed: 0,
            total: 0,
        }
    }
}
