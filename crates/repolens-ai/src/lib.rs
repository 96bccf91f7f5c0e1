//! Summarization capability over an OpenAI-compatible chat-completions API.
//!
//! The pipeline talks to the [`Summarizer`] trait; [`OpenAiClient`] is the
//! live implementation. Provider failures surface as errors here and are
//! caught at the enrichment-worker boundary, so a failed summarization
//! leaves the stored summary unset rather than persisting a placeholder.

use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use repolens_core::{RepoCandidate, RepoSummary};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Cap applied to readme content before prompting.
const README_CHAR_CAP: usize = 50_000;

#[derive(Debug, Clone, Deserialize)]
pub struct AiSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl AiSettings {
    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

/// Result of the configuration-validation round trip.
#[derive(Debug, Clone, Serialize)]
pub struct AiConnectionTest {
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Structured summary from item metadata plus optional long-form
    /// content. Tolerates absent content by summarizing metadata alone.
    async fn summarize_repo(
        &self,
        candidate: &RepoCandidate,
        readme: Option<&str>,
    ) -> Result<RepoSummary>;

    /// Free-form narrative analysis of arbitrary documentation text.
    async fn summarize_text(&self, text: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Clone)]
pub struct OpenAiClient {
    settings: AiSettings,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(settings: AiSettings) -> Self {
        Self {
            settings,
            http: reqwest::Client::new(),
        }
    }

    async fn chat(&self, system: String, user: String, json_mode: bool) -> Result<String> {
        if !self.settings.is_configured() {
            bail!("AI api key is not configured");
        }
        let url = format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );
        let request = ChatRequest {
            model: self.settings.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.7,
            response_format: json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        debug!(model = %self.settings.model, json_mode, "chat completion request");
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(&request)
            .send()
            .await
            .context("sending chat completion request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("AI provider returned {status}: {body}");
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("decoding chat completion response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("AI provider returned no choices"))
    }

    /// One minimal prompt round trip, reporting success and latency.
    pub async fn test_connection(&self) -> AiConnectionTest {
        let start = Instant::now();
        let result = self
            .chat(
                "You are a connectivity probe.".to_string(),
                "Reply with the single word: ok".to_string(),
                false,
            )
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(_) => AiConnectionTest {
                success: true,
                message: "AI connection successful".to_string(),
                duration_ms,
            },
            Err(err) => AiConnectionTest {
                success: false,
                message: err.to_string(),
                duration_ms,
            },
        }
    }
}

fn truncate_chars(text: &str, cap: usize) -> &str {
    match text.char_indices().nth(cap) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Some providers wrap JSON-mode output in a markdown fence anyway.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

fn repo_user_prompt(candidate: &RepoCandidate, readme: Option<&str>) -> String {
    format!(
        "Project: {}\n\
         Description: {}\n\
         Language: {}\n\
         Topics: {}\n\
         Readme content: {}\n\n\
         Required JSON format:\n\
         {{\n\
           \"narrative\": \"a concise summary of the project (under 200 words)\",\n\
           \"features\": [\"feature 1\", \"feature 2\", \"feature 3\"],\n\
           \"use_cases\": [\"case 1\", \"case 2\", \"case 3\"]\n\
         }}",
        candidate.full_name,
        candidate.description.as_deref().unwrap_or("not available"),
        candidate.language.as_deref().unwrap_or("unknown"),
        candidate.topics.join(", "),
        readme
            .map(|r| truncate_chars(r, README_CHAR_CAP))
            .unwrap_or("not available"),
    )
}

#[async_trait]
impl Summarizer for OpenAiClient {
    async fn summarize_repo(
        &self,
        candidate: &RepoCandidate,
        readme: Option<&str>,
    ) -> Result<RepoSummary> {
        let system = "You are a senior software analyst. Analyze the repository metadata \
                      and readme content and summarize the project. Return JSON only."
            .to_string();
        let raw = self
            .chat(system, repo_user_prompt(candidate, readme), true)
            .await?;
        let summary: RepoSummary = serde_json::from_str(strip_code_fence(&raw))
            .context("decoding structured summary from AI response")?;
        Ok(summary)
    }

    async fn summarize_text(&self, text: &str) -> Result<String> {
        let system = "You are a senior software analyst. Analyze the following project \
                      documentation and summarize its core functionality, key features, \
                      technical highlights, and use cases as structured markdown."
            .to_string();
        self.chat(system, truncate_chars(text, README_CHAR_CAP).to_string(), false)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> RepoCandidate {
        RepoCandidate {
            github_id: 1,
            name: "widget".into(),
            full_name: "acme/widget".into(),
            owner_login: "acme".into(),
            owner_avatar: String::new(),
            html_url: String::new(),
            default_branch: "main".into(),
            description: Some("makes widgets".into()),
            language: Some("Rust".into()),
            topics: vec!["cli".into()],
            stars: 1,
            forks: 0,
        }
    }

    #[test]
    fn chat_response_extracts_first_choice() {
        let raw = r#"{
            "choices": [
                {"message": {"role": "assistant", "content": "hello"}},
                {"message": {"role": "assistant", "content": "ignored"}}
            ]
        }"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content);
        assert_eq!(content.as_deref(), Some("hello"));
    }

    #[test]
    fn summary_json_survives_a_markdown_fence() {
        let raw = "```json\n{\"narrative\": \"n\", \"features\": [\"f\"], \"use_cases\": []}\n```";
        let summary: RepoSummary = serde_json::from_str(strip_code_fence(raw)).unwrap();
        assert_eq!(summary.narrative, "n");
        assert_eq!(summary.features, vec!["f"]);
        assert!(summary.use_cases.is_empty());
    }

    #[test]
    fn prompt_tolerates_missing_readme_and_description() {
        let mut c = candidate();
        c.description = None;
        let prompt = repo_user_prompt(&c, None);
        assert!(prompt.contains("Description: not available"));
        assert!(prompt.contains("Readme content: not available"));
    }

    #[test]
    fn readme_is_truncated_before_prompting() {
        let long = "x".repeat(README_CHAR_CAP + 100);
        let prompt = repo_user_prompt(&candidate(), Some(&long));
        assert!(prompt.len() < long.len() + 600);
    }

    #[test]
    fn unconfigured_settings_are_detected() {
        let settings = AiSettings {
            base_url: "https://api.openai.com/v1".into(),
            api_key: "  ".into(),
            model: "gpt-4o-mini".into(),
        };
        assert!(!settings.is_configured());
    }

    #[tokio::test]
    async fn missing_key_fails_synchronously_without_network() {
        let client = OpenAiClient::new(AiSettings {
            base_url: "https://api.openai.com/v1".into(),
            api_key: String::new(),
            model: "gpt-4o-mini".into(),
        });
        let err = client
            .summarize_text("some documentation")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[tokio::test]
    #[ignore] // requires a configured provider
    async fn live_summarize_text() {
        let client = OpenAiClient::new(AiSettings {
            base_url: std::env::var("AI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: std::env::var("AI_API_KEY").expect("AI_API_KEY must be set"),
            model: std::env::var("AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
        });
        let analysis = client
            .summarize_text("A small library that parses RFC 3339 timestamps.")
            .await
            .expect("summarization should succeed");
        assert!(!analysis.is_empty());
    }
}
