//! JSON API over the repository store, the scheduler, and the config
//! layer. Every response body is JSON; errors render as `{"error": ...}`
//! with a matching status code.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use repolens_ai::Summarizer;
use repolens_core::{ListParams, SortMode};
use repolens_storage::{keys, ConfigStore, RepoStore};
use repolens_sync::{ConfigSourceClient, ConfigSummarizer, PipelineError, Scheduler};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn RepoStore>,
    config: Arc<dyn ConfigStore>,
    scheduler: Arc<Scheduler>,
    github: Arc<ConfigSourceClient>,
    ai: Arc<ConfigSummarizer>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn RepoStore>,
        config: Arc<dyn ConfigStore>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            store,
            github: Arc::new(ConfigSourceClient::new(Arc::clone(&config))),
            ai: Arc::new(ConfigSummarizer::new(Arc::clone(&config))),
            config,
            scheduler,
        }
    }
}

enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal(err) => {
                error!(error = %format!("{err:#}"), "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidInput => ApiError::BadRequest(err.to_string()),
            PipelineError::NotFound => ApiError::NotFound(err.to_string()),
            PipelineError::Source(source) => ApiError::Internal(source.into()),
            PipelineError::Other(inner) => ApiError::Internal(inner),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/repos", get(list_repos_handler))
        .route("/api/repos/fetch", post(fetch_handler))
        .route("/api/repos/job-status", get(job_status_handler))
        .route("/api/repos/random", get(random_repo_handler))
        .route("/api/repos/add", post(add_repo_handler))
        .route("/api/repos/cleanup", post(cleanup_handler))
        .route("/api/repos/{id}", get(get_repo_handler))
        .route("/api/repos/{id}", delete(delete_repo_handler))
        .route("/api/repos/{id}/analyze", post(analyze_repo_handler))
        .route("/api/config", get(get_config_handler))
        .route("/api/config", post(update_config_handler))
        .route("/api/config/test-ai", post(test_ai_handler))
        .route("/api/config/test-github", post(test_github_handler))
        .route("/api/analyze-content", post(analyze_content_handler))
        .with_state(state)
}

pub async fn serve(state: AppState, addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "web server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize, Default)]
struct ReposQuery {
    page: Option<u32>,
    per_page: Option<u32>,
    search: Option<String>,
    sort: Option<String>,
}

async fn list_repos_handler(
    State(state): State<AppState>,
    Query(query): Query<ReposQuery>,
) -> ApiResult<Json<repolens_core::ListPage>> {
    let sort = match query.sort.as_deref().map(str::trim) {
        Some("random") => SortMode::Random,
        _ => SortMode::Newest,
    };
    let params = ListParams {
        page: query.page.unwrap_or(1),
        per_page: query.per_page.unwrap_or(10),
        search: query.search.filter(|s| !s.trim().is_empty()),
        sort,
    };
    Ok(Json(state.store.list(&params).await?))
}

async fn fetch_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.scheduler.trigger();
    Json(json!({ "message": "batch fetch triggered" }))
}

async fn job_status_handler(State(state): State<AppState>) -> Json<repolens_core::JobStatus> {
    Json(state.scheduler.status())
}

async fn random_repo_handler(
    State(state): State<AppState>,
) -> ApiResult<Json<Option<repolens_core::Repo>>> {
    Ok(Json(state.store.sample_random().await?))
}

#[derive(Debug, Deserialize)]
struct AddRepoBody {
    name: String,
}

async fn add_repo_handler(
    State(state): State<AppState>,
    Json(body): Json<AddRepoBody>,
) -> ApiResult<Json<repolens_core::Repo>> {
    let repo = state.scheduler.add_repo(&body.name).await?;
    Ok(Json(repo))
}

async fn cleanup_handler(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let removed = state.store.delete_empty().await?;
    info!(removed, "cleanup removed empty repositories");
    Ok(Json(json!({ "count": removed })))
}

async fn get_repo_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> ApiResult<Json<repolens_core::Repo>> {
    match state.store.get(id).await? {
        Some(repo) => Ok(Json(repo)),
        None => Err(ApiError::NotFound("repository not found".to_string())),
    }
}

async fn delete_repo_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    if state.store.delete(id).await? {
        Ok(Json(json!({ "message": "repository deleted" })))
    } else {
        Err(ApiError::NotFound("repository not found".to_string()))
    }
}

async fn analyze_repo_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state.scheduler.reanalyze(id).await?;
    Ok(Json(json!({ "message": outcome.message() })))
}

async fn get_config_handler(
    State(state): State<AppState>,
) -> ApiResult<Json<BTreeMap<String, String>>> {
    Ok(Json(state.config.get_all().await?))
}

async fn update_config_handler(
    State(state): State<AppState>,
    Json(entries): Json<BTreeMap<String, String>>,
) -> ApiResult<Json<serde_json::Value>> {
    if entries.is_empty() {
        return Err(ApiError::BadRequest("no config entries given".to_string()));
    }
    state.config.set_many(&entries).await?;
    if entries.contains_key(keys::PULL_FREQUENCY_MINUTES) {
        state.scheduler.reschedule();
    }
    Ok(Json(json!({ "message": "config updated" })))
}

/// Candidate provider settings to validate before saving. Absent fields
/// fall back to the stored configuration.
#[derive(Debug, Default, Deserialize)]
struct TestAiBody {
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
}

async fn test_ai_handler(
    State(state): State<AppState>,
    body: Option<Json<TestAiBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let result = state
        .ai
        .test_connection(body.base_url, body.api_key, body.model)
        .await?;
    Ok(Json(json!({
        "success": result.success,
        "message": result.message,
        "duration_ms": result.duration_ms,
    })))
}

/// Candidate source credentials to validate before saving. Absent fields
/// fall back to the stored configuration.
#[derive(Debug, Default, Deserialize)]
struct TestGithubBody {
    token: Option<String>,
    proxy: Option<String>,
}

async fn test_github_handler(
    State(state): State<AppState>,
    body: Option<Json<TestGithubBody>>,
) -> Json<serde_json::Value> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let result = state.github.test_connection(body.token, body.proxy).await;
    Json(json!({
        "success": result.success,
        "message": result.message,
    }))
}

#[derive(Debug, Deserialize)]
struct AnalyzeContentBody {
    text: String,
}

async fn analyze_content_handler(
    State(state): State<AppState>,
    Json(body): Json<AnalyzeContentBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.text.trim().is_empty() {
        return Err(ApiError::BadRequest("text must not be empty".to_string()));
    }
    let analysis = state
        .ai
        .summarize_text(&body.text)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(json!({ "analysis": analysis })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use repolens_storage::{memory_pool, SqliteConfigStore, SqliteRepoStore};
    use tower::ServiceExt;

    async fn test_app() -> (Router, Arc<SqliteRepoStore>) {
        let pool = memory_pool().await.expect("memory pool");
        let store = Arc::new(SqliteRepoStore::new(pool.clone()));
        let config = Arc::new(SqliteConfigStore::new(pool));
        let source = Arc::new(ConfigSourceClient::new(
            Arc::clone(&config) as Arc<dyn ConfigStore>
        ));
        let summarizer = Arc::new(ConfigSummarizer::new(
            Arc::clone(&config) as Arc<dyn ConfigStore>
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&store) as Arc<dyn RepoStore>,
            Arc::clone(&config) as Arc<dyn ConfigStore>,
            source,
            summarizer,
        );
        let state = AppState::new(
            Arc::clone(&store) as Arc<dyn RepoStore>,
            config,
            scheduler,
        );
        (app(state), store)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _store) = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn job_status_starts_idle() {
        let (app, _store) = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/repos/job-status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["state"], "idle");
        assert_eq!(body["processed"], 0);
        assert_eq!(body["total"], 0);
    }

    #[tokio::test]
    async fn empty_store_lists_an_empty_page() {
        let (app, _store) = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/repos?page=1&per_page=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total"], 0);
        assert_eq!(body["page"], 1);
        assert_eq!(body["per_page"], 5);
        assert!(body["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn random_on_empty_store_is_null() {
        let (app, _store) = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/repos/random")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await.is_null());
    }

    #[tokio::test]
    async fn malformed_add_name_is_a_bad_request() {
        let (app, _store) = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/repos/add")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"name": "no-slash"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("owner/name"));
    }

    #[tokio::test]
    async fn unknown_repo_is_not_found() {
        let (app, _store) = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/repos/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn config_roundtrips_and_exposes_defaults() {
        let (app, _store) = test_app().await;
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/config")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"PULL_COUNT": "25"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/config")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["PULL_COUNT"], "25");
        assert_eq!(body["PULL_FREQUENCY_MINUTES"], "60");
    }

    #[tokio::test]
    async fn empty_config_update_is_rejected() {
        let (app, _store) = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/config")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_analyze_content_is_rejected() {
        let (app, _store) = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/analyze-content")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"text": "  "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn github_test_validates_candidate_proxy_from_the_body() {
        let (app, _store) = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/config/test-github")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"proxy": "::not a url::"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("proxy"));
    }

    #[tokio::test]
    async fn ai_test_without_a_body_uses_the_stored_settings() {
        let (app, _store) = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/config/test-ai")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        // No key is stored, so the probe fails before reaching a provider.
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("not configured"));
    }

    #[tokio::test]
    async fn delete_reports_not_found_for_unknown_id() {
        let (app, _store) = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/repos/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
