use std::env;

use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::types::{ApiError, ApiResponse, ChatRequest, ChatResponse, Message};

pub const DEFAULT_CHAT_BASE_URL: &str = "https://api.deepseek.com/v1";
pub const DEFAULT_CHAT_MODEL: &str = "deepseek-chat";
const ERROR_SNIPPET_CHARS: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("{0} not set")]
    ApiKeyNotSet(&'static str),

    #[error("invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("API rate limit exceeded")]
    RateLimited,

    #[error("API quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("model returned an empty response")]
    EmptyResponse,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Chat-completion oracle used for entity verification and purification sampling.
/// Implemented by `LlmClient` for production; mock implementations used in tests.
pub trait ChatOracle {
    async fn complete(&self, messages: &[Message], temperature: f32) -> Result<String, LlmError>;
}

#[derive(Clone)]
struct ApiKey(String);

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Base URL, credentials and model name of one OpenAI-compatible API.
#[derive(Debug, Clone)]
pub struct Endpoint {
    base_url: String,
    api_key: ApiKey,
    model: String,
}

impl Endpoint {
    /// Builds an endpoint from already-read settings. Blank values fall back to defaults;
    /// a blank key is reported under `key_var`.
    pub fn resolve(
        key_var: &'static str,
        api_key: Option<String>,
        base_url: Option<String>,
        model: Option<String>,
        defaults: (&str, &str),
    ) -> Result<Self, LlmError> {
        let api_key = non_blank(api_key).ok_or(LlmError::ApiKeyNotSet(key_var))?;
        let base_url = non_blank(base_url).unwrap_or_else(|| defaults.0.to_string());
        let model = non_blank(model).unwrap_or_else(|| defaults.1.to_string());
        Ok(Self {
            base_url: validate_base_url(&base_url)?,
            api_key: ApiKey(api_key),
            model,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[cfg(test)]
    pub(crate) fn for_test(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: ApiKey("test-key".to_string()),
            model: "test-model".to_string(),
        }
    }

    pub(crate) async fn post<B, R>(&self, http: &Client, path: &str, body: &B) -> Result<R, LlmError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned + ApiResponse,
    {
        let url = format!("{}{path}", self.base_url);

        let response = http
            .post(&url)
            .bearer_auth(&self.api_key.0)
            .header("User-Agent", crate::USER_AGENT)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!(%url, "API rate limited");
            return Err(LlmError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if let Ok(body) = serde_json::from_str::<R>(&text)
                && let Some(err) = body.api_error()
            {
                let classified = classify_api_error(status.as_u16(), err);
                warn!(error = %classified, "API error");
                return Err(classified);
            }
            let snippet: String = text.chars().take(ERROR_SNIPPET_CHARS).collect();
            warn!(status = %status, "API error (no structured body)");
            return Err(LlmError::Api {
                code: status.as_u16(),
                message: format!("HTTP {status}: {snippet}"),
            });
        }

        let body: R = response.json().await?;
        if let Some(err) = body.api_error() {
            let classified = classify_api_error(status.as_u16(), err);
            warn!(error = %classified, "API error in 2xx response");
            return Err(classified);
        }
        Ok(body)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn validate_base_url(raw: &str) -> Result<String, LlmError> {
    let invalid = |reason: String| LlmError::InvalidBaseUrl {
        url: raw.to_string(),
        reason,
    };
    let parsed = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(raw.trim_end_matches('/').to_string()),
        other => Err(invalid(format!("unsupported scheme '{other}'"))),
    }
}

fn classify_api_error(status: u16, err: &ApiError) -> LlmError {
    let message = err
        .message
        .clone()
        .unwrap_or_else(|| "Unknown error".to_string());
    let tag = err
        .code
        .as_ref()
        .and_then(|c| c.as_str())
        .or(err.kind.as_deref())
        .unwrap_or_default();

    if status == 429 || tag.contains("rate_limit") {
        LlmError::RateLimited
    } else if status == 402 || tag.contains("insufficient_quota") {
        LlmError::QuotaExhausted(message)
    } else {
        LlmError::Api {
            code: status,
            message,
        }
    }
}

/// Chat-completions client for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct LlmClient {
    http: Client,
    endpoint: Endpoint,
}

impl LlmClient {
    pub fn new(http: Client, endpoint: Endpoint) -> Self {
        Self { http, endpoint }
    }

    /// Reads `LLM_API_KEY`, `LLM_BASE_URL` and `LLM_MODEL`.
    pub fn from_env(http: Client) -> Result<Self, LlmError> {
        let endpoint = Endpoint::resolve(
            "LLM_API_KEY",
            env::var("LLM_API_KEY").ok(),
            env::var("LLM_BASE_URL").ok(),
            env::var("LLM_MODEL").ok(),
            (DEFAULT_CHAT_BASE_URL, DEFAULT_CHAT_MODEL),
        )?;
        Ok(Self::new(http, endpoint))
    }
}

impl ChatOracle for LlmClient {
    async fn complete(&self, messages: &[Message], temperature: f32) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: self.endpoint.model(),
            messages,
            temperature,
        };
        let response: ChatResponse = self
            .endpoint
            .post(&self.http, "/chat/completions", &request)
            .await?;

        let content = response
            .choices
            .and_then(|choices| choices.into_iter().next())
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)?;

        debug!(model = %self.endpoint.model(), chars = content.len(), "chat completion");
        Ok(content)
    }
}
