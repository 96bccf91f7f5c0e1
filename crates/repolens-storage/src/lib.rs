//! SQLite persistence for repolens: repository rows with
//! upsert-by-external-id dedup, and the key-value config store.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repolens_core::{ListPage, ListParams, Repo, RepoCandidate, RepoSummary, SortMode};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

pub mod keys {
    pub const GITHUB_TOKEN: &str = "GITHUB_TOKEN";
    pub const PULL_FREQUENCY_MINUTES: &str = "PULL_FREQUENCY_MINUTES";
    pub const PULL_COUNT: &str = "PULL_COUNT";
    pub const PULL_TYPE: &str = "PULL_TYPE";
    pub const PROXY_URL: &str = "PROXY_URL";
    pub const AI_BASE_URL: &str = "AI_BASE_URL";
    pub const AI_API_KEY: &str = "AI_API_KEY";
    pub const AI_MODEL: &str = "AI_MODEL";
}

/// Built-in defaults used when a config key has no stored row.
pub const DEFAULT_CONFIG: &[(&str, &str)] = &[
    (keys::GITHUB_TOKEN, ""),
    (keys::PULL_FREQUENCY_MINUTES, "60"),
    (keys::PULL_COUNT, "10"),
    (keys::PULL_TYPE, "trending"),
    (keys::PROXY_URL, ""),
    (keys::AI_BASE_URL, "https://api.openai.com/v1"),
    (keys::AI_API_KEY, ""),
    (keys::AI_MODEL, "gpt-4o-mini"),
];

fn default_for(key: &str) -> &'static str {
    DEFAULT_CONFIG
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
        .unwrap_or("")
}

/// Connect to the given SQLite database, creating it if missing, and run
/// pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database url {database_url}"))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("connecting to sqlite database")?;
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("running migrations")?;
    Ok(pool)
}

/// In-memory pool for tests. A single connection keeps every statement on
/// the same in-memory database.
pub async fn memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .context("connecting to in-memory sqlite")?;
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("running migrations")?;
    Ok(pool)
}

/// Persistence contract for repository rows.
#[async_trait]
pub trait RepoStore: Send + Sync {
    /// Upsert keyed on `github_id`. A new id creates a full row with readme
    /// and summary unset; an existing id refreshes only the volatile metrics
    /// and `updated_at`; identity and descriptive fields are left alone.
    /// Returns the post-upsert row.
    async fn upsert_basic(&self, candidate: &RepoCandidate) -> Result<Repo>;

    /// Explicit identity/descriptive refresh from a fresh detail fetch.
    /// Only the re-analysis path calls this; the recurring batch never does.
    async fn refresh_identity(&self, id: Uuid, candidate: &RepoCandidate) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Repo>>;

    async fn get_by_github_id(&self, github_id: i64) -> Result<Option<Repo>>;

    async fn list(&self, params: &ListParams) -> Result<ListPage>;

    /// Returns false when no row had the given id.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Cleanup: delete rows with an empty description AND an empty readme
    /// (strict conjunction). Returns the number of rows removed.
    async fn delete_empty(&self) -> Result<u64>;

    /// One uniformly-chosen row, or None on an empty store.
    async fn sample_random(&self) -> Result<Option<Repo>>;

    async fn set_readme(&self, id: Uuid, readme: &str) -> Result<()>;

    async fn set_summary(&self, id: Uuid, summary: &RepoSummary) -> Result<()>;

    /// Whether the backend can order uniformly at random natively. Listing
    /// degrades to newest-first when this is false.
    fn supports_random_order(&self) -> bool {
        false
    }
}

/// Key-value settings with read-through defaults.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<String>;

    /// All known keys, stored values overlaid on the defaults.
    async fn get_all(&self) -> Result<BTreeMap<String, String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn set_many(&self, entries: &BTreeMap<String, String>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteRepoStore {
    pool: SqlitePool,
}

impl SqliteRepoStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const REPO_COLUMNS: &str = "id, github_id, name, full_name, owner_login, owner_avatar, html_url, \
     default_branch, description, language, topics, stars, forks, readme, summary, \
     created_at, updated_at";

fn repo_from_row(row: &SqliteRow) -> Result<Repo> {
    let id: String = row.try_get("id")?;
    let topics_json: String = row.try_get("topics")?;
    let summary_json: Option<String> = row.try_get("summary")?;
    let summary = match summary_json {
        Some(raw) => Some(serde_json::from_str(&raw).context("decoding stored summary")?),
        None => None,
    };
    Ok(Repo {
        id: Uuid::parse_str(&id).context("decoding stored repo id")?,
        github_id: row.try_get("github_id")?,
        name: row.try_get("name")?,
        full_name: row.try_get("full_name")?,
        owner_login: row.try_get("owner_login")?,
        owner_avatar: row.try_get("owner_avatar")?,
        html_url: row.try_get("html_url")?,
        default_branch: row.try_get("default_branch")?,
        description: row.try_get("description")?,
        language: row.try_get("language")?,
        topics: serde_json::from_str(&topics_json).context("decoding stored topics")?,
        stars: row.try_get("stars")?,
        forks: row.try_get("forks")?,
        readme: row.try_get("readme")?,
        summary,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[async_trait]
impl RepoStore for SqliteRepoStore {
    async fn upsert_basic(&self, candidate: &RepoCandidate) -> Result<Repo> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let topics = serde_json::to_string(&candidate.topics).context("encoding topics")?;
        sqlx::query(
            r#"
            INSERT INTO repos (id, github_id, name, full_name, owner_login, owner_avatar,
                               html_url, default_branch, description, language, topics,
                               stars, forks, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(github_id) DO UPDATE SET
                stars = excluded.stars,
                forks = excluded.forks,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id.to_string())
        .bind(candidate.github_id)
        .bind(&candidate.name)
        .bind(&candidate.full_name)
        .bind(&candidate.owner_login)
        .bind(&candidate.owner_avatar)
        .bind(&candidate.html_url)
        .bind(&candidate.default_branch)
        .bind(candidate.description.as_deref().unwrap_or(""))
        .bind(candidate.language.as_deref().unwrap_or(""))
        .bind(&topics)
        .bind(candidate.stars)
        .bind(candidate.forks)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting {}", candidate.full_name))?;

        self.get_by_github_id(candidate.github_id)
            .await?
            .with_context(|| format!("row missing after upsert of {}", candidate.full_name))
    }

    async fn refresh_identity(&self, id: Uuid, candidate: &RepoCandidate) -> Result<()> {
        let topics = serde_json::to_string(&candidate.topics).context("encoding topics")?;
        sqlx::query(
            r#"
            UPDATE repos SET
                name = ?2, full_name = ?3, owner_login = ?4, owner_avatar = ?5,
                html_url = ?6, default_branch = ?7, description = ?8, language = ?9,
                topics = ?10, updated_at = ?11
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .bind(&candidate.name)
        .bind(&candidate.full_name)
        .bind(&candidate.owner_login)
        .bind(&candidate.owner_avatar)
        .bind(&candidate.html_url)
        .bind(&candidate.default_branch)
        .bind(candidate.description.as_deref().unwrap_or(""))
        .bind(candidate.language.as_deref().unwrap_or(""))
        .bind(&topics)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("refreshing identity of {id}"))?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Repo>> {
        let row = sqlx::query(&format!("SELECT {REPO_COLUMNS} FROM repos WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(repo_from_row).transpose()
    }

    async fn get_by_github_id(&self, github_id: i64) -> Result<Option<Repo>> {
        let row = sqlx::query(&format!(
            "SELECT {REPO_COLUMNS} FROM repos WHERE github_id = ?1"
        ))
        .bind(github_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(repo_from_row).transpose()
    }

    async fn list(&self, params: &ListParams) -> Result<ListPage> {
        let page = params.page.max(1);
        let per_page = params.per_page.clamp(1, 100);
        let offset = i64::from(page - 1) * i64::from(per_page);
        let term = params
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        // Random order only applies to the unfiltered set; a search term or
        // a backend without native random ordering degrades to newest-first.
        let randomize = matches!(params.sort, SortMode::Random)
            && term.is_none()
            && self.supports_random_order();
        let order = if randomize {
            "RANDOM()"
        } else {
            "created_at DESC"
        };

        let (total, rows) = match term {
            Some(term) => {
                let pattern = format!("%{term}%");
                let total: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM repos WHERE full_name LIKE ?1 OR description LIKE ?1",
                )
                .bind(&pattern)
                .fetch_one(&self.pool)
                .await?;
                let rows = sqlx::query(&format!(
                    "SELECT {REPO_COLUMNS} FROM repos \
                     WHERE full_name LIKE ?1 OR description LIKE ?1 \
                     ORDER BY {order} LIMIT ?2 OFFSET ?3"
                ))
                .bind(&pattern)
                .bind(i64::from(per_page))
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                (total, rows)
            }
            None => {
                let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM repos")
                    .fetch_one(&self.pool)
                    .await?;
                let rows = sqlx::query(&format!(
                    "SELECT {REPO_COLUMNS} FROM repos ORDER BY {order} LIMIT ?1 OFFSET ?2"
                ))
                .bind(i64::from(per_page))
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                (total, rows)
            }
        };

        let data = rows
            .iter()
            .map(repo_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(ListPage {
            data,
            total,
            page,
            per_page,
        })
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM repos WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_empty(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM repos WHERE TRIM(description) = '' \
             AND (readme IS NULL OR TRIM(readme) = '')",
        )
        .execute(&self.pool)
        .await?;
        let count = result.rows_affected();
        debug!(count, "cleanup removed empty repos");
        Ok(count)
    }

    async fn sample_random(&self) -> Result<Option<Repo>> {
        let row = sqlx::query(&format!(
            "SELECT {REPO_COLUMNS} FROM repos ORDER BY RANDOM() LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(repo_from_row).transpose()
    }

    async fn set_readme(&self, id: Uuid, readme: &str) -> Result<()> {
        sqlx::query("UPDATE repos SET readme = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id.to_string())
            .bind(readme)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .with_context(|| format!("storing readme of {id}"))?;
        Ok(())
    }

    async fn set_summary(&self, id: Uuid, summary: &RepoSummary) -> Result<()> {
        let raw = serde_json::to_string(summary).context("encoding summary")?;
        sqlx::query("UPDATE repos SET summary = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id.to_string())
            .bind(&raw)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .with_context(|| format!("storing summary of {id}"))?;
        Ok(())
    }

    fn supports_random_order(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct SqliteConfigStore {
    pool: SqlitePool,
}

impl SqliteConfigStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    async fn get(&self, key: &str) -> Result<String> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.unwrap_or_else(|| default_for(key).to_string()))
    }

    async fn get_all(&self) -> Result<BTreeMap<String, String>> {
        let mut merged: BTreeMap<String, String> = DEFAULT_CONFIG
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let rows = sqlx::query("SELECT key, value FROM config")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let key: String = row.try_get("key")?;
            let value: String = row.try_get("value")?;
            // Unknown keys are ignored rather than surfaced.
            if merged.contains_key(&key) {
                merged.insert(key, value);
            }
        }
        Ok(merged)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("storing config key {key}"))?;
        Ok(())
    }

    async fn set_many(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        for (key, value) in entries {
            self.set(key, value).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn candidate(github_id: i64, full_name: &str) -> RepoCandidate {
        let (owner, name) = full_name.split_once('/').unwrap();
        RepoCandidate {
            github_id,
            name: name.to_string(),
            full_name: full_name.to_string(),
            owner_login: owner.to_string(),
            owner_avatar: format!("https://avatars.test/{owner}"),
            html_url: format!("https://github.test/{full_name}"),
            default_branch: "main".to_string(),
            description: Some(format!("{name} does things")),
            language: Some("Rust".to_string()),
            topics: vec!["cli".to_string()],
            stars: 10,
            forks: 2,
        }
    }

    async fn store() -> SqliteRepoStore {
        SqliteRepoStore::new(memory_pool().await.expect("memory pool"))
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_external_id() {
        let store = store().await;
        let first = store.upsert_basic(&candidate(1, "acme/widget")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = store.upsert_basic(&candidate(1, "acme/widget")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at > first.updated_at);

        let page = store.list(&ListParams::default()).await.unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn upsert_refreshes_metrics_but_not_identity() {
        let store = store().await;
        let first = store.upsert_basic(&candidate(7, "acme/widget")).await.unwrap();

        let mut changed = candidate(7, "acme/widget");
        changed.description = Some("a completely different description".to_string());
        changed.stars = 999;
        changed.default_branch = "develop".to_string();
        let second = store.upsert_basic(&changed).await.unwrap();

        assert_eq!(second.stars, 999);
        assert_eq!(second.description, first.description);
        assert_eq!(second.default_branch, "main");
    }

    #[tokio::test]
    async fn refresh_identity_overwrites_descriptive_fields() {
        let store = store().await;
        let repo = store.upsert_basic(&candidate(9, "acme/widget")).await.unwrap();

        let mut fresh = candidate(9, "acme/widget");
        fresh.description = Some("renamed and rewritten".to_string());
        fresh.topics = vec!["parser".to_string(), "cli".to_string()];
        store.refresh_identity(repo.id, &fresh).await.unwrap();

        let updated = store.get(repo.id).await.unwrap().unwrap();
        assert_eq!(updated.description, "renamed and rewritten");
        assert_eq!(updated.topics.len(), 2);
    }

    #[tokio::test]
    async fn enrichment_fields_start_unset_and_update_independently() {
        let store = store().await;
        let repo = store.upsert_basic(&candidate(2, "acme/tool")).await.unwrap();
        assert!(repo.readme.is_none());
        assert!(repo.summary.is_none());

        store.set_readme(repo.id, "<h1>tool</h1>").await.unwrap();
        let with_readme = store.get(repo.id).await.unwrap().unwrap();
        assert_eq!(with_readme.readme.as_deref(), Some("<h1>tool</h1>"));
        assert!(with_readme.summary.is_none());

        let summary = RepoSummary {
            narrative: "a tool".to_string(),
            features: vec!["fast".to_string()],
            use_cases: vec!["tooling".to_string()],
        };
        store.set_summary(repo.id, &summary).await.unwrap();
        let complete = store.get(repo.id).await.unwrap().unwrap();
        assert_eq!(complete.summary, Some(summary));
    }

    #[tokio::test]
    async fn cleanup_requires_both_fields_empty() {
        let store = store().await;

        let mut no_desc = candidate(10, "acme/bare");
        no_desc.description = None;
        let bare = store.upsert_basic(&no_desc).await.unwrap();

        let mut no_desc_with_readme = candidate(11, "acme/documented");
        no_desc_with_readme.description = Some("  ".to_string());
        let documented = store.upsert_basic(&no_desc_with_readme).await.unwrap();
        store.set_readme(documented.id, "<p>docs</p>").await.unwrap();

        let described = store.upsert_basic(&candidate(12, "acme/described")).await.unwrap();

        let removed = store.delete_empty().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(bare.id).await.unwrap().is_none());
        assert!(store.get(documented.id).await.unwrap().is_some());
        assert!(store.get(described.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sample_random_on_empty_store_is_none() {
        let store = store().await;
        assert!(store.sample_random().await.unwrap().is_none());

        store.upsert_basic(&candidate(3, "acme/only")).await.unwrap();
        let sampled = store.sample_random().await.unwrap().unwrap();
        assert_eq!(sampled.github_id, 3);
    }

    #[tokio::test]
    async fn list_searches_and_paginates() {
        let store = store().await;
        for i in 0..5 {
            store
                .upsert_basic(&candidate(100 + i, &format!("acme/widget-{i}")))
                .await
                .unwrap();
        }
        store.upsert_basic(&candidate(200, "other/gadget")).await.unwrap();

        let page = store
            .list(&ListParams {
                page: 1,
                per_page: 3,
                search: Some("widget".to_string()),
                sort: SortMode::Newest,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.data.len(), 3);

        // Random sort with a search term degrades to newest without failing.
        let degraded = store
            .list(&ListParams {
                page: 1,
                per_page: 10,
                search: Some("widget".to_string()),
                sort: SortMode::Random,
            })
            .await
            .unwrap();
        assert_eq!(degraded.total, 5);

        let random = store
            .list(&ListParams {
                page: 1,
                per_page: 4,
                search: None,
                sort: SortMode::Random,
            })
            .await
            .unwrap();
        assert_eq!(random.data.len(), 4);
        assert_eq!(random.total, 6);
    }

    #[tokio::test]
    async fn config_falls_back_to_defaults() {
        let config = SqliteConfigStore::new(memory_pool().await.unwrap());
        assert_eq!(config.get(keys::PULL_FREQUENCY_MINUTES).await.unwrap(), "60");
        assert_eq!(config.get(keys::PULL_TYPE).await.unwrap(), "trending");

        config.set(keys::PULL_TYPE, "newest").await.unwrap();
        assert_eq!(config.get(keys::PULL_TYPE).await.unwrap(), "newest");

        let all = config.get_all().await.unwrap();
        assert_eq!(all.get(keys::PULL_TYPE).map(String::as_str), Some("newest"));
        assert_eq!(all.get(keys::PULL_COUNT).map(String::as_str), Some("10"));
    }
}
