//! Completion backend abstraction.
//!
//! The session protocol treats the completion service as an opaque function:
//! prompt text in, a stream of text chunks out. [`CompletionBackend`] is that
//! seam. Two implementations ship with the crate:
//!
//! - [`OpenAiCompletions`]: streams from an OpenAI-compatible `/completions`
//!   endpoint (feature `openai`, on by default)
//! - [`ScriptedBackend`]: replays canned chunk sequences, for tests and
//!   offline use

mod mock;
#[cfg(feature = "openai")]
mod openai;

pub use mock::{Responder, Script, ScriptedBackend};
#[cfg(feature = "openai")]
pub use openai::{OpenAiCompletions, OpenAiConfig};

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::truncate::StopSet;

/// Stream of generated text chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// A request to the completion backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Prompt text to continue.
    pub prompt: String,
    /// Stop markers; the session truncates locally as well.
    #[serde(default, skip_serializing_if = "StopSet::is_empty")]
    pub stop: StopSet,
    /// Maximum tokens to generate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    /// Creates a request for `prompt` without limits.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Sets the stop markers.
    #[must_use]
    pub fn stop(mut self, stop: StopSet) -> Self {
        self.stop = stop;
        self
    }

    /// Sets the maximum number of generated tokens.
    #[must_use]
    pub const fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub const fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// A text-completion service.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Starts a generation and returns its chunk stream.
    ///
    /// Errors before the first chunk are returned directly; errors while
    /// streaming arrive as stream items.
    async fn generate(&self, request: &CompletionRequest) -> Result<ChunkStream>;

    /// Name of the backend, for logging and error messages.
    fn backend_name(&self) -> &'static str;

    /// Runs a generation to the end and returns the concatenated text.
    async fn generate_text(&self, request: &CompletionRequest) -> Result<String> {
        let mut stream = self.generate(request).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            text.push_str(&chunk?);
        }
        Ok(text)
    }
}

/// Type alias for an Arc-wrapped backend.
pub type SharedBackend = Arc<dyn CompletionBackend>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_sets_limits() {
        let request = CompletionRequest::new("p")
            .stop(StopSet::single("4."))
            .max_tokens(64)
            .temperature(0.2);
        assert_eq!(request.prompt, "p");
        assert_eq!(request.stop.markers(), ["4."]);
        assert_eq!(request.max_tokens, Some(64));
    }

    #[test]
    fn request_serialization_skips_unset_fields() {
        let json = serde_json::to_value(CompletionRequest::new("p")).unwrap();
        assert_eq!(json, serde_json::json!({ "prompt": "p" }));
    }

    #[tokio::test]
    async fn generate_text_concatenates_chunks() {
        let backend = ScriptedBackend::new().with_script(Script::chunks(["a", "b", "c"]));
        let text = backend
            .generate_text(&CompletionRequest::new("p"))
            .await
            .unwrap();
        assert_eq!(text, "abc");
    }
}
