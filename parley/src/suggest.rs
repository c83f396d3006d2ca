//! Follow-up question suggestions.
//!
//! After a turn completes, a second generation asks the backend for a numbered
//! list of follow-up questions. The prompt ends at the first item marker, and
//! generation is cut at the marker of the item after the last wanted one, so a
//! request for three suggestions stops at `"4."`.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};

use crate::backend::{CompletionRequest, SharedBackend};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::extract::extract_list;
use crate::prompt::{MAX_SUGGESTIONS, SUGGESTION_CUE, TemplateRegistry};
use crate::truncate::{StopSet, StreamTruncator};
use crate::turn::Turn;

/// Parses the continuation of a suggestion prompt into at most `count` items.
///
/// `generated` is the text after the `"1."` cue. Everything from the
/// `"{count+1}."` marker on is discarded; fewer items are fine.
#[must_use]
pub fn parse_suggestions(generated: &str, count: usize) -> Vec<String> {
    let stop = StopSet::single(format!("{}.", count + 1));
    let document = format!("{SUGGESTION_CUE}{generated}");
    let visible = crate::truncate::truncate(&document, &stop);
    extract_list(visible)
        .suggestions
        .into_iter()
        .take(count)
        .collect()
}

/// Runs the suggestion pass for completed turns.
#[derive(Clone)]
pub struct SuggestionGenerator {
    backend: SharedBackend,
    templates: Arc<TemplateRegistry>,
    count: usize,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl std::fmt::Debug for SuggestionGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuggestionGenerator")
            .field("backend", &self.backend.backend_name())
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl SuggestionGenerator {
    /// Creates a generator using `config`'s count and limits.
    #[must_use]
    pub fn new(
        backend: SharedBackend,
        templates: Arc<TemplateRegistry>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            backend,
            templates,
            count: config.suggestion_count.clamp(1, MAX_SUGGESTIONS),
            max_tokens: config.suggestion_max_tokens,
            temperature: config.temperature,
        }
    }

    /// Number of suggestions requested per turn.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Generates suggestions for a completed turn.
    ///
    /// A turn without output yields no suggestions.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails before or while streaming.
    pub async fn generate(&self, turn: &Turn) -> Result<Vec<String>> {
        let Some(output) = turn.output.as_ref() else {
            return Ok(Vec::new());
        };
        let prompt = self
            .templates
            .assemble_suggestions(&turn.input, output, self.count)?;

        let request = CompletionRequest {
            prompt: prompt.text,
            stop: prompt.stop.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        let mut stream = self.backend.generate(&request).await?;

        let mut truncator = StreamTruncator::new(prompt.stop);
        truncator.push(SUGGESTION_CUE);
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    truncator.push(&chunk);
                    if truncator.is_cut() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(turn_id = %turn.id, error = %e, "Suggestion stream failed");
                    return Err(e);
                }
            }
        }

        let suggestions: Vec<String> = extract_list(truncator.visible())
            .suggestions
            .into_iter()
            .take(self.count)
            .collect();
        debug!(turn_id = %turn.id, count = suggestions.len(), "Generated suggestions");
        Ok(suggestions)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::backend::{Script, ScriptedBackend};
    use crate::extract::extract;
    use crate::task::{TaskInput, TaskType};
    use crate::turn::{TurnId, TurnState};

    fn completed_turn() -> Turn {
        Turn {
            id: TurnId::new(),
            parent_id: None,
            task: TaskType::AskQuestion,
            input: TaskInput::question("How do I print?"),
            output: Some(extract(TaskType::AskQuestion, "Use `printf`.\"")),
            state: TurnState::Completed,
            feedback: None,
            sequence: 0,
        }
    }

    mod parsing {
        use super::*;

        #[test]
        fn cuts_at_next_marker() {
            let items = parse_suggestions(" q1 2. q2 3. q3 4. ignored 5. also", 3);
            assert_eq!(items, ["q1", "q2", "q3"]);
        }

        #[test]
        fn fewer_items_are_tolerated() {
            let items = parse_suggestions(" only one\n", 3);
            assert_eq!(items, ["only one"]);
        }

        #[test]
        fn empty_continuation_has_no_items() {
            assert!(parse_suggestions("", 3).is_empty());
        }
    }

    mod generator {
        use super::*;

        #[tokio::test]
        async fn generates_from_streamed_list() {
            let backend = Arc::new(ScriptedBackend::new().with_script(Script::chunks([
                " How do I print a `float`?\n2",
                ". What does `%d` mean?\n3. Can I print two values?\n4",
                ". never seen",
            ])));
            let generator = SuggestionGenerator::new(
                backend.clone(),
                Arc::new(TemplateRegistry::builtin()),
                &SessionConfig::default(),
            );
            let suggestions = generator.generate(&completed_turn()).await.unwrap();
            assert_eq!(
                suggestions,
                [
                    "How do I print a `float`?",
                    "What does `%d` mean?",
                    "Can I print two values?"
                ]
            );

            let requests = backend.requests().await;
            assert_eq!(requests.len(), 1);
            assert!(requests[0].prompt.ends_with(SUGGESTION_CUE));
            assert_eq!(requests[0].stop.markers()[0], "4.");
        }

        #[tokio::test]
        async fn turn_without_output_skips_backend() {
            let backend = Arc::new(ScriptedBackend::new());
            let generator = SuggestionGenerator::new(
                backend.clone(),
                Arc::new(TemplateRegistry::builtin()),
                &SessionConfig::default(),
            );
            let mut turn = completed_turn();
            turn.output = None;
            assert!(generator.generate(&turn).await.unwrap().is_empty());
            assert!(backend.requests().await.is_empty());
        }

        #[tokio::test]
        async fn count_follows_config() {
            let backend = Arc::new(
                ScriptedBackend::new().with_script(Script::chunks([" a 2. b 3. c"])),
            );
            let config = SessionConfig::default().with_suggestion_count(2);
            let generator =
                SuggestionGenerator::new(backend, Arc::new(TemplateRegistry::builtin()), &config);
            assert_eq!(generator.count(), 2);
            let suggestions = generator.generate(&completed_turn()).await.unwrap();
            assert_eq!(suggestions, ["a", "b"]);
        }
    }
}
