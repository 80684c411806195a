//! Chat-completion client for a local `llama-server`.
//!
//! Talks to the OpenAI-compatible `/v1` API. A 503 "Loading model" answer is
//! retried with a fixed delay; a 400 is surfaced immediately.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080/v1";
/// llama-server ignores the key unless started with `--api-key`.
pub const DEFAULT_API_KEY: &str = "none";
pub const DEFAULT_MODEL: &str = "local";

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);
const READY_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

static ENV_CONFIG: LazyLock<ClientConfig> = LazyLock::new(|| ClientConfig {
    base_url: std::env::var("LLAMA_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
    api_key: std::env::var("LLAMA_API_KEY").unwrap_or_else(|_| DEFAULT_API_KEY.to_string()),
    model: DEFAULT_MODEL.to_string(),
    retry: RetryPolicy::default(),
});

/// Bounded retries for the "model still loading" condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    /// `LLAMA_BASE_URL` and `LLAMA_API_KEY`, read once per process.
    pub fn from_env() -> Self {
        ENV_CONFIG.clone()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Per-call options for [`LlamaClient::send`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// GBNF grammar text constraining the output.
    pub grammar: Option<String>,
}

impl RequestOptions {
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_grammar(mut self, grammar: impl Into<String>) -> Self {
        self.grammar = Some(grammar.into());
        self
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    /// Older llama-server revisions only read this name.
    #[serde(skip_serializing_if = "Option::is_none")]
    n_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    grammar: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone)]
pub struct LlamaClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl LlamaClient {
    /// Client for `base_url`, with the API key from the environment.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_config(ClientConfig {
            base_url: base_url.into(),
            ..ClientConfig::from_env()
        })
    }

    pub fn from_env() -> Self {
        Self::with_config(ClientConfig::from_env())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.config.api_key = api_key.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends `prompt` as the user message and returns the trimmed reply.
    pub async fn send(&self, prompt: &str, options: &RequestOptions) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = options.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            messages.push(Message {
                role: "system",
                content: system,
            });
        }
        messages.push(Message {
            role: "user",
            content: prompt,
        });

        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages,
            max_tokens: options.max_tokens,
            n_predict: options.max_tokens,
            temperature: options.temperature,
            grammar: options.grammar.as_deref(),
        };

        let response = self.complete(&request).await?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Decode("response contains no choices".to_string()))?;
        Ok(choice.message.content.unwrap_or_default().trim().to_string())
    }

    /// Number of prompt tokens `prompt` takes once wrapped in the chat
    /// template, measured with a zero-token generation.
    pub async fn num_tokens(&self, prompt: &str) -> Result<u32> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            max_tokens: Some(0),
            n_predict: Some(0),
            temperature: Some(0.0),
            grammar: None,
        };

        let response = self.complete(&request).await?;
        response
            .usage
            .map(|usage| usage.prompt_tokens)
            .ok_or_else(|| Error::Decode("response contains no usage accounting".to_string()))
    }

    /// Polls the models listing until it answers with success.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let url = self.endpoint("models");
        let start = Instant::now();
        loop {
            let result = self
                .http
                .get(&url)
                .bearer_auth(&self.config.api_key)
                .timeout(READY_REQUEST_TIMEOUT)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(url = %url, "Server ready in {:?}", start.elapsed());
                    return Ok(());
                }
                Ok(resp) => tracing::debug!(status = %resp.status(), "Models endpoint not ready"),
                Err(e) => tracing::debug!(error = %e, "Models endpoint unreachable"),
            }

            if start.elapsed() >= timeout {
                return Err(Error::timeout(format!("readiness poll of {url}"), timeout));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn complete(
        &self,
        request: &ChatCompletionRequest<'_>,
    ) -> Result<ChatCompletionResponse> {
        let url = self.endpoint("chat/completions");
        let RetryPolicy {
            max_attempts,
            delay,
        } = self.config.retry;
        let max_attempts = max_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.post_once(&url, request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() => {
                    if attempt >= max_attempts {
                        tracing::error!(attempt, "llama-server still loading, giving up");
                        return Err(Error::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        "llama-server still loading, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post_once(
        &self,
        url: &str,
        request: &ChatCompletionRequest<'_>,
    ) -> Result<ChatCompletionResponse> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| Error::Decode(format!("{e}; body: {body}")));
        }
        Err(classify_failure(status, url, body))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

fn classify_failure(status: StatusCode, url: &str, body: String) -> Error {
    if status == StatusCode::BAD_REQUEST {
        return Error::BadRequest {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        };
    }
    if status == StatusCode::SERVICE_UNAVAILABLE || mentions_loading(&body) {
        return Error::Loading {
            status: status.as_u16(),
            body,
        };
    }
    Error::Server {
        status: status.as_u16(),
        body,
    }
}

fn mentions_loading(body: &str) -> bool {
    serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error.message.to_lowercase().contains("loading"))
        .unwrap_or(false)
}
