//! Transport seam for C4: a minimal chat-completion client trait, one
//! `reqwest`-backed production implementation, one in-memory fake for
//! tests — the same split the pack uses for its `LLMClient` traits.

use crate::error::{LcaError, Result};
use crate::scheduler::RateLimiter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

/// Chat-completion transport behind C4. Implementations are responsible
/// only for sending the request and returning the raw assistant text;
/// JSON parsing and schema validation happen in [`crate::oracle`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat_completion(&self, messages: Vec<ChatMessage>) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    top_p: f64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageBody,
}

#[derive(Debug, Deserialize)]
struct ChatMessageBody {
    content: String,
}

/// HTTP-backed production client. Temperature 0 / top-p 0.2 for
/// deterministic classification — callers never need to set these,
/// they are baked into every request this client sends.
pub struct HttpLlmClient {
    endpoint: String,
    model: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpLlmClient {
    pub fn new(endpoint: String, model: String, timeout: Duration) -> Self {
        Self { endpoint, model, client: reqwest::Client::new(), timeout }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat_completion(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let request = ChatRequest { model: &self.model, messages: &messages, temperature: 0.0, top_p: 0.2 };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| LcaError::LlmTransport { attempts: 1, source: e.into() })?;

        if response.status().is_server_error() || response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LcaError::LlmTransport {
                attempts: 1,
                source: anyhow::anyhow!("upstream returned {}", response.status()),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LcaError::LlmMalformed(format!("response body: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LcaError::LlmMalformed("empty choices array".to_string()))
    }
}

/// Decorates any [`LlmClient`] with the process-wide pacing token
/// bucket: every `decide`/`convert_unit` call, regardless of which
/// worker issues it, passes through here first.
pub struct RateLimitedLlmClient {
    inner: Arc<dyn LlmClient>,
    limiter: Arc<RateLimiter>,
}

impl RateLimitedLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl LlmClient for RateLimitedLlmClient {
    async fn chat_completion(&self, messages: Vec<ChatMessage>) -> Result<String> {
        self.limiter.acquire().await;
        self.inner.chat_completion(messages).await
    }
}

/// Deterministic in-process fake used by tests and the e2e scenarios in
/// `tests/`: returns canned JSON bodies keyed by a substring match against
/// the last user message, so a test can script a whole conversation
/// (initial `decide`, a correction retry, `convert_unit`) without a
/// network dependency.
pub struct FakeLlmClient {
    responses: Vec<(String, String)>,
}

impl FakeLlmClient {
    pub fn new() -> Self {
        Self { responses: Vec::new() }
    }

    /// Register a canned response: the first entry whose `needle` is a
    /// substring of the last user message's content wins.
    pub fn on(mut self, needle: impl Into<String>, response: impl Into<String>) -> Self {
        self.responses.push((needle.into(), response.into()));
        self
    }
}

impl Default for FakeLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for FakeLlmClient {
    async fn chat_completion(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("");

        self.responses
            .iter()
            .find(|(needle, _)| last_user.contains(needle.as_str()))
            .map(|(_, response)| response.clone())
            .ok_or_else(|| LcaError::LlmMalformed(format!("no fake response registered for: {last_user}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn rate_limited_client_paces_successive_calls() {
        let inner: Arc<dyn LlmClient> = Arc::new(FakeLlmClient::new().on("ping", r#"{"ok":true}"#));
        let limited = RateLimitedLlmClient::new(inner, Arc::new(RateLimiter::new(Duration::from_millis(30))));

        let start = Instant::now();
        limited.chat_completion(vec![ChatMessage::user("ping")]).await.unwrap();
        limited.chat_completion(vec![ChatMessage::user("ping")]).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
