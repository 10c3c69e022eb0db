use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dio_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use crate::parse::ParseError;

pub const GENERATION_SOURCE_ID: &str = "llm";
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";

const SYSTEM_PROMPT: &str =
    "You are a B2B sales analyst. Reply with exactly one JSON object and no other text.";

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("generation transport failed: {0}")]
    Transport(#[source] FetchError),
    #[error("generation endpoint returned http {0}")]
    HttpStatus(u16),
    #[error("no api key configured for the generation endpoint")]
    MissingCredential,
    #[error("generation endpoint returned no content")]
    EmptyResponse,
    #[error("unparsable generation response: {0}")]
    Parse(#[from] ParseError),
}

impl From<FetchError> for GenerationError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, .. } => GenerationError::HttpStatus(status),
            other => GenerationError::Transport(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: 1500,
            temperature: 0.3,
        }
    }
}

/// A generative text service. Implementations return the raw reply text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn model(&self) -> &str;
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}

/// Runs one generation under a hard deadline.
pub async fn generate_within(
    generator: &dyn TextGenerator,
    request: &GenerationRequest,
    limit: Duration,
) -> Result<String, GenerationError> {
    match tokio::time::timeout(limit, generator.generate(request)).await {
        Ok(result) => result,
        Err(_) => Err(GenerationError::Timeout(limit)),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_LLM_BASE_URL.to_string(),
            api_key: None,
            model: DEFAULT_LLM_MODEL.to_string(),
        }
    }
}

/// OpenAI-compatible chat-completions client over the shared fetcher.
pub struct HttpTextGenerator {
    fetcher: Arc<HttpFetcher>,
    settings: LlmSettings,
}

impl HttpTextGenerator {
    pub fn new(fetcher: Arc<HttpFetcher>, settings: LlmSettings) -> Self {
        Self { fetcher, settings }
    }

    /// Client settings for the generation endpoint: the request timeout is the
    /// generation budget and a timed-out completion is never re-sent.
    pub fn client_config(timeout: Duration, user_agent: Option<String>) -> HttpClientConfig {
        HttpClientConfig {
            timeout,
            user_agent,
            backoff: BackoffPolicy {
                max_retries: 0,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    fn model(&self) -> &str {
        &self.settings.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let api_key = self
            .settings
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(GenerationError::MissingCredential)?;

        let body = chat_body(&self.settings.model, request);
        let headers = [("Authorization", format!("Bearer {api_key}"))];
        let response = self
            .fetcher
            .post_json(GENERATION_SOURCE_ID, &self.endpoint(), &headers, &body)
            .await?;

        message_content(&response).ok_or(GenerationError::EmptyResponse)
    }
}

fn chat_body(model: &str, request: &GenerationRequest) -> JsonValue {
    json!({
        "model": model,
        "messages": [
            {"role": "system", "content": SYSTEM_PROMPT},
            {"role": "user", "content": request.prompt},
        ],
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
    })
}

fn message_content(response: &JsonValue) -> Option<String> {
    response
        .pointer("/choices/0/message/content")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
