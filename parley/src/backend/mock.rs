//! Scripted completion backend.
//!
//! Replays queued chunk sequences in order, one script per generation, and
//! records every request it receives. When the queue is empty it falls back to
//! a [`Responder`] if one is set.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{BackendError, Error, Result};

use super::{ChunkStream, CompletionBackend, CompletionRequest};

/// Builds a script for a request when no queued script is left.
pub type Responder = Arc<dyn Fn(&CompletionRequest) -> Script + Send + Sync>;

/// One canned generation.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Chunks streamed in order.
    pub chunks: Vec<String>,
    /// Error yielded after the chunks; returned directly when there are none.
    pub error: Option<BackendError>,
}

impl Script {
    /// Creates a script streaming `chunks`.
    #[must_use]
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            error: None,
        }
    }

    /// Creates a script streaming `text` in pieces of `size` characters.
    #[must_use]
    pub fn text(text: &str, size: usize) -> Self {
        let chars: Vec<char> = text.chars().collect();
        Self::chunks(chars.chunks(size.max(1)).map(|c| c.iter().collect::<String>()))
    }

    /// Creates a script that fails before streaming anything.
    #[must_use]
    pub fn failure(error: BackendError) -> Self {
        Self {
            chunks: Vec::new(),
            error: Some(error),
        }
    }

    /// Fails with `error` after the chunks.
    #[must_use]
    pub fn then_fail(mut self, error: BackendError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Completion backend replaying canned scripts.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<CompletionRequest>>,
    responder: Option<Responder>,
    delay: Option<Duration>,
}

impl fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("has_responder", &self.responder.is_some())
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl ScriptedBackend {
    /// Creates a backend with no scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a script.
    #[must_use]
    pub fn with_script(mut self, script: Script) -> Self {
        self.scripts.get_mut().push_back(script);
        self
    }

    /// Sets the fallback used once the queue is empty.
    #[must_use]
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Script + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Waits `delay` before each chunk.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues a script on a shared backend.
    pub async fn push(&self, script: Script) {
        self.scripts.lock().await.push_back(script);
    }

    /// Returns every request received so far.
    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }

    async fn next_script(&self, request: &CompletionRequest) -> Script {
        if let Some(script) = self.scripts.lock().await.pop_front() {
            return script;
        }
        self.responder
            .as_ref()
            .map_or_else(Script::default, |responder| responder(request))
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn generate(&self, request: &CompletionRequest) -> Result<ChunkStream> {
        self.requests.lock().await.push(request.clone());
        let script = self.next_script(request).await;
        debug!(
            chunks = script.chunks.len(),
            fails = script.error.is_some(),
            "Replaying script"
        );

        if script.chunks.is_empty()
            && let Some(error) = script.error
        {
            return Err(error.into());
        }

        let delay = self.delay;
        let stream = async_stream::stream! {
            for chunk in script.chunks {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(chunk);
            }
            if let Some(error) = script.error {
                yield Err(Error::from(error));
            }
        };
        Ok(Box::pin(stream))
    }

    fn backend_name(&self) -> &'static str {
        "scripted"
    }
}
