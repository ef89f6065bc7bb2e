use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::embedder::{api_client, backoff, is_transient};
use crate::error::{ConfigError, GenerationError};

/// Sampling settings for one kind of completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct LLMConfig {
    pub model: String,
    pub temperature: f32,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo".to_string(),
            temperature: 0.7,
        }
    }
}

/// A text-completion capability.
pub trait Generator: Send + Sync {
    fn generate(&self, prompt: &str, temperature: f32, model: &str)
    -> Result<String, GenerationError>;

    fn generate_with(&self, prompt: &str, config: &LLMConfig) -> Result<String, GenerationError> {
        self.generate(prompt, config.temperature, &config.model)
    }
}

/// Blocking client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiChat {
    client: Client,
    endpoint: String,
    max_attempts: usize,
}

impl OpenAiChat {
    pub fn new(
        api_key: &str,
        base_url: &str,
        timeout: Duration,
        max_attempts: usize,
    ) -> Result<Self, ConfigError> {
        let client = api_client(api_key, timeout)?
            .build()
            .map_err(|e| ConfigError::Invalid {
                key: "PAPERCHAT_OPENAI_BASE",
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self::with_client(client, base_url, max_attempts))
    }

    pub fn with_client(client: Client, base_url: &str, max_attempts: usize) -> Self {
        Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Generator for OpenAiChat {
    fn generate(
        &self,
        prompt: &str,
        temperature: f32,
        model: &str,
    ) -> Result<String, GenerationError> {
        if prompt.trim().is_empty() {
            return Err(GenerationError::EmptyPrompt);
        }
        let body = ChatRequest {
            model,
            temperature,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let retry = attempt < self.max_attempts;
            let resp = match self.client.post(&self.endpoint).json(&body).send() {
                Ok(resp) => resp,
                Err(e) if retry && (e.is_timeout() || e.is_connect()) => {
                    warn!(attempt, error = %e, "completion request failed, retrying");
                    thread::sleep(backoff(attempt));
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = resp.status();
            if !status.is_success() {
                let text = resp
                    .text()
                    .unwrap_or_else(|_| "<body unavailable>".to_string());
                if retry && is_transient(status) {
                    warn!(attempt, %status, "completion service busy, retrying");
                    thread::sleep(backoff(attempt));
                    continue;
                }
                return Err(GenerationError::Service {
                    status: status.as_u16(),
                    body: text,
                });
            }

            let parsed: ChatResponse = resp
                .json()
                .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;
            debug!(model, choices = parsed.choices.len(), "completion received");
            return parsed
                .choices
                .into_iter()
                .find_map(|choice| choice.message.content)
                .ok_or_else(|| GenerationError::InvalidResponse("response had no content".into()));
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}
