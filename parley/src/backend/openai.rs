//! OpenAI-compatible text completion client.
//!
//! Talks to the legacy `/completions` endpoint (`prompt` in, `choices[].text`
//! out), which most self-hosted inference servers also expose. Responses are
//! streamed as server-sent events.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BackendError, Error, Result};

use super::{ChunkStream, CompletionBackend, CompletionRequest};

/// Most OpenAI-compatible servers accept at most four stop sequences.
const MAX_STOP_SEQUENCES: usize = 4;

/// Configuration for [`OpenAiCompletions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// API key for authentication.
    pub api_key: String,
    /// Base URL for the API.
    pub base_url: String,
    /// Model to use.
    pub model: String,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
}

impl OpenAiConfig {
    /// Default OpenAI API base URL.
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";
    /// Default completion model.
    pub const DEFAULT_MODEL: &'static str = "gpt-3.5-turbo-instruct";

    /// Creates a configuration with the given API key.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Sets the base URL.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: Self::DEFAULT_BASE_URL.to_owned(),
            model: Self::DEFAULT_MODEL.to_owned(),
            timeout_secs: Some(120),
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    stop: &'a [String],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type", default)]
    error_type: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

/// One parsed server-sent event line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SseLine {
    Text(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<CompletionChunk>(data) {
        Ok(chunk) => {
            let text: String = chunk.choices.into_iter().map(|c| c.text).collect();
            if text.is_empty() {
                SseLine::Skip
            } else {
                SseLine::Text(text)
            }
        }
        Err(e) => {
            warn!(error = %e, data, "Failed to parse SSE chunk");
            SseLine::Skip
        }
    }
}

/// Splits complete lines off the front of `buffer`.
///
/// Bytes after the last newline stay in the buffer, so a line (or a UTF-8
/// sequence) split across network chunks is decoded only once complete.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let Some(last_newline) = buffer.iter().rposition(|&b| b == b'\n') else {
        return Vec::new();
    };
    let rest = buffer.split_off(last_newline + 1);
    let complete = std::mem::replace(buffer, rest);
    String::from_utf8_lossy(&complete)
        .lines()
        .map(str::to_owned)
        .collect()
}

/// Streaming client for an OpenAI-compatible `/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompletions {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiCompletions {
    /// Creates a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build()?;
        Ok(Self { config, client })
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn completions_url(&self) -> String {
        format!("{}/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn parse_error(status: u16, body: &str) -> BackendError {
        if let Ok(response) = serde_json::from_str::<ErrorResponse>(body) {
            let error = response.error;
            return match status {
                401 => BackendError::auth("openai", error.message),
                429 => BackendError::rate_limited("openai"),
                _ => {
                    let mut err = BackendError::provider("openai", error.message);
                    err.code = error
                        .code
                        .map(|c| c.as_str().map_or_else(|| c.to_string(), str::to_owned))
                        .or(error.error_type);
                    err
                }
            };
        }
        BackendError::http_status(status, body)
    }
}

#[async_trait]
impl CompletionBackend for OpenAiCompletions {
    async fn generate(&self, request: &CompletionRequest) -> Result<ChunkStream> {
        let markers = request.stop.markers();
        let body = CompletionBody {
            model: &self.config.model,
            prompt: &request.prompt,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stop: &markers[..markers.len().min(MAX_STOP_SEQUENCES)],
            stream: true,
        };

        let url = self.completions_url();
        debug!(url = %url, model = %self.config.model, prompt_len = request.prompt.len(), "Starting completion");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(BackendError::from)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Self::parse_error(status.as_u16(), &error_text).into());
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            'read: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(Error::from(BackendError::stream(e.to_string())));
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);
                for line in drain_lines(&mut buffer) {
                    match parse_sse_line(&line) {
                        SseLine::Text(text) => yield Ok(text),
                        SseLine::Done => break 'read,
                        SseLine::Skip => {}
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn backend_name(&self) -> &'static str {
        "openai"
    }
}
