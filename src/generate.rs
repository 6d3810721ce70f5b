//! Text generation capability.
//!
//! The query pipeline hands the generator a system instruction and a
//! fully assembled user prompt; the generator returns the model's text.
//! No retries here: a generation call sits at the end of an interactive
//! request, and the caller would rather see the failure than wait out a
//! backoff.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::GenerationConfig;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("generation provider rate limited the request")]
    RateLimited,
    #[error("generation provider quota exhausted")]
    QuotaExceeded,
    #[error("generation request timed out")]
    Timeout,
    #[error("generation service error: {0}")]
    Service(String),
    #[error("generation auth error: {0}")]
    Auth(String),
}

/// Returned verbatim when retrieval comes back empty; the model is never
/// called in that case.
pub const INSUFFICIENT_CONTEXT_ANSWER: &str =
    "I could not find relevant information in the indexed documents to answer this question.";

const SYSTEM_PROMPT: &str = "You are an assistant that answers questions based on the \
provided context. Be concise and accurate. If the context does not contain the answer, \
say so explicitly instead of guessing.";

pub fn build_prompt(context: &str, query: &str) -> String {
    format!(
        "Based on the following context, please answer the question.\n\n\
         Context:\n{}\n\nQuestion: {}\n\nAnswer:",
        context, query
    )
}

/// Produce the answer text for a query. `context` of `None` means
/// retrieval found nothing usable, which short-circuits to the
/// insufficient-context answer. A generation failure is an error, never a
/// substituted default answer.
pub async fn answer_question(
    generator: &dyn Generator,
    query: &str,
    context: Option<&str>,
) -> Result<String, GenerateError> {
    match context {
        None => Ok(INSUFFICIENT_CONTEXT_ANSWER.to_string()),
        Some(ctx) => {
            generator
                .complete(SYSTEM_PROMPT, &build_prompt(ctx, query))
                .await
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, GenerateError>;

    /// Connectivity probe for health reporting.
    async fn ping(&self) -> bool;
}

// ============ OpenAI-compatible adapter ============

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

pub struct OpenAiGenerator {
    config: GenerationConfig,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self, GenerateError> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            GenerateError::Auth("OPENAI_API_KEY environment variable not set".into())
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GenerateError::Service(e.to_string()))?;
        Ok(Self {
            config: config.clone(),
            api_key,
            client,
        })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1")
            .trim_end_matches('/')
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, GenerateError> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url()))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.config.model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": prompt },
                ],
                "max_tokens": self.config.max_tokens,
                "temperature": self.config.temperature,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerateError::Timeout
                } else {
                    GenerateError::Service(e.to_string())
                }
            })?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(GenerateError::Auth(format!(
                "provider returned HTTP {}",
                status
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                // The provider reuses 429 for both throttling and a spent
                // quota; only the body tells them apart.
                return if body.contains("insufficient_quota") {
                    Err(GenerateError::QuotaExceeded)
                } else {
                    Err(GenerateError::RateLimited)
                };
            }
            return Err(GenerateError::Service(format!(
                "HTTP {}: {}",
                status,
                body.chars().take(300).collect::<String>()
            )));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| GenerateError::Service(format!("malformed response: {}", e)))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GenerateError::Service("response contained no choices".into()))?;
        Ok(choice.message.content)
    }

    async fn ping(&self) -> bool {
        let resp = self
            .client
            .get(format!("{}/models", self.base_url()))
            .bearer_auth(&self.api_key)
            .send()
            .await;
        matches!(resp, Ok(r) if r.status().is_success())
    }
}

// ============ Fake adapter ============

/// Scripted generator for tests. Replies with the configured text (or an
/// echo of the prompt) and records the last prompt it saw so tests can
/// assert on what context reached the model.
#[derive(Default)]
pub struct FakeGenerator {
    reply: Option<String>,
    fail: bool,
    last_prompt: Mutex<Option<String>>,
}

impl FakeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn complete(&self, _system: &str, prompt: &str) -> Result<String, GenerateError> {
        *self.last_prompt.lock().unwrap() = Some(prompt.to_string());
        if self.fail {
            return Err(GenerateError::Service("scripted failure".into()));
        }
        Ok(self
            .reply
            .clone()
            .unwrap_or_else(|| format!("echo: {}", prompt.chars().take(120).collect::<String>())))
    }

    async fn ping(&self) -> bool {
        !self.fail
    }
}
