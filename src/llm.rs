//! Language-model providers behind one `invoke(system, user) -> text` seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::{ApiKeys, ProviderConfig, ProviderKind};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvokeOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4000,
        }
    }
}

impl From<&ProviderConfig> for InvokeOptions {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// Failures of a model call. All of them end the stage that made the call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("{provider}: rate limited ({detail})")]
    RateLimited { provider: String, detail: String },

    #[error("{provider}: API key rejected ({detail})")]
    Unauthorized { provider: String, detail: String },

    #[error("{provider}: quota or balance exhausted ({detail})")]
    QuotaExceeded { provider: String, detail: String },

    #[error("{provider}: {detail}")]
    Provider { provider: String, detail: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no API key for {provider}: set {variable} or add it to api_keys.toml")]
    MissingApiKey { provider: String, variable: String },
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, system_prompt: &str, user_prompt: &str, options: &InvokeOptions) -> Result<String, ProviderError>;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Message {
    role: String,
    content: String,
}

impl Message {
    fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for the `/chat/completions` API shared by DeepSeek and OpenAI.
pub struct OpenAiCompatClient {
    name: String,
    base_url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(name: impl Into<String>, base_url: String, model: String, api_key: String) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
            client: http_client(),
        }
    }

    fn classify(&self, status: reqwest::StatusCode, body: String) -> ProviderError {
        let provider = self.name.clone();
        let detail = format!("{status}: {body}");
        let lowered = body.to_lowercase();
        match status.as_u16() {
            401 | 403 => ProviderError::Unauthorized { provider, detail },
            402 => ProviderError::QuotaExceeded { provider, detail },
            _ if lowered.contains("insufficient_quota")
                || lowered.contains("insufficient balance")
                || lowered.contains("quota") =>
            {
                ProviderError::QuotaExceeded { provider, detail }
            }
            429 => ProviderError::RateLimited { provider, detail },
            _ => ProviderError::Provider { provider, detail },
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, system_prompt: &str, user_prompt: &str, options: &InvokeOptions) -> Result<String, ProviderError> {
        debug!(provider = %self.name, model = %self.model, "chat completion");

        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![Message::new("system", system_prompt), Message::new("user", user_prompt)],
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Provider {
                provider: self.name.clone(),
                detail: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.classify(status, body));
        }

        let completion: ChatCompletionResponse = response.json().await.map_err(|e| ProviderError::Provider {
            provider: self.name.clone(),
            detail: format!("invalid response body: {e}"),
        })?;

        Ok(completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: Message,
}

pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn with_config(base_url: String, model: String) -> Self {
        OllamaClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client: http_client(),
        }
    }
}

#[async_trait]
impl ModelProvider for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn invoke(&self, system_prompt: &str, user_prompt: &str, options: &InvokeOptions) -> Result<String, ProviderError> {
        debug!(model = %self.model, "ollama chat");

        let request = OllamaChatRequest {
            model: &self.model,
            messages: vec![Message::new("system", system_prompt), Message::new("user", user_prompt)],
            stream: false,
            options: OllamaOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
            },
        };

        let provider = || "ollama".to_string();
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Provider {
                provider: provider(),
                detail: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = format!("Ollama API error: {status}: {body}");
            return Err(match status.as_u16() {
                429 => ProviderError::RateLimited { provider: provider(), detail },
                _ => ProviderError::Provider { provider: provider(), detail },
            });
        }

        let body: OllamaChatResponse = response.json().await.map_err(|e| ProviderError::Provider {
            provider: provider(),
            detail: format!("invalid response body: {e}"),
        })?;
        Ok(body.message.content)
    }
}

/// Build the configured provider, resolving its API key.
pub fn build_provider(config: &ProviderConfig, keys: &ApiKeys) -> Result<Arc<dyn ModelProvider>, ConfigError> {
    let model = config.model();
    let base_url = config.base_url();

    let api_key = match config.kind.api_key_name() {
        Some(variable) => Some(keys.get(variable).ok_or_else(|| ConfigError::MissingApiKey {
            provider: format!("{:?}", config.kind).to_lowercase(),
            variable: variable.to_string(),
        })?),
        None => None,
    };

    Ok(match (config.kind, api_key) {
        (ProviderKind::Ollama, _) | (_, None) => Arc::new(OllamaClient::with_config(base_url, model)),
        (ProviderKind::Deepseek, Some(key)) => Arc::new(OpenAiCompatClient::new("deepseek", base_url, model, key)),
        (ProviderKind::Openai, Some(key)) => Arc::new(OpenAiCompatClient::new("openai", base_url, model, key)),
    })
}
