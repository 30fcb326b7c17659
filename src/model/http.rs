use super::CompletionModel;
use crate::config::ModelConfig;
use crate::error::{calculate_backoff, is_retryable, ForgeError, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client for any OpenAI-compatible endpoint
/// (OpenAI, OpenRouter, Ollama, vLLM, ...).
pub struct OpenAiCompatibleModel {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    retry: RetryConfig,
}

impl OpenAiCompatibleModel {
    pub fn from_config(config: &ModelConfig) -> Result<Self, ForgeError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ForgeError::Config {
                reason: format!("cannot build HTTP client: {}", e),
            })?;
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty());

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
            retry: config.retry.clone(),
        })
    }

    fn send_once(&self, prompt: &str, attempt: u32) -> Result<String, ForgeError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().map_err(|e| ForgeError::Model {
            message: e.to_string(),
            retryable: e.is_timeout() || e.is_connect() || e.is_request(),
            attempt,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ForgeError::Model {
                message: format!("HTTP {}", status),
                retryable: status.is_server_error() || status.as_u16() == 429,
                attempt,
            });
        }

        let parsed: ChatResponse = response.json().map_err(|e| ForgeError::Model {
            message: format!("malformed response: {}", e),
            retryable: false,
            attempt,
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ForgeError::Model {
                message: "response has no content".to_string(),
                retryable: false,
                attempt,
            })
    }
}

impl CompletionModel for OpenAiCompatibleModel {
    fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        let mut attempt = 0;
        loop {
            match self.send_once(prompt, attempt) {
                Ok(text) => {
                    debug!(model = %self.model, attempt, chars = text.len(), "Completion received");
                    return Ok(text);
                }
                Err(e) if is_retryable(&e) && attempt + 1 < self.retry.max_attempts => {
                    let backoff = calculate_backoff(attempt, &self.retry);
                    warn!(model = %self.model, attempt, backoff_ms = backoff, error = %e, "Retrying completion");
                    std::thread::sleep(Duration::from_millis(backoff));
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn name(&self) -> &str {
        &self.model
    }
}
