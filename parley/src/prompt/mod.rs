//! Prompt assembly.
//!
//! A prompt is built from the template of the turn's task type:
//!
//! 1. the template preamble,
//! 2. its worked exemplars, each rendered in the answer grammar,
//! 3. for follow-ups, the transcript of every ancestor turn,
//! 4. the new turn's input,
//! 5. the cue that primes the continuation.
//!
//! Assembly is a pure function of its arguments: the same task, input and
//! ancestors always produce byte-identical text.
//!
//! # Example
//!
//! ```rust,ignore
//! use parley::prompt::TemplateRegistry;
//! use parley::task::{TaskInput, TaskType};
//!
//! let registry = TemplateRegistry::builtin();
//! let prompt = registry.assemble(TaskType::AskQuestion, &TaskInput::question("What is a pointer?"), &[])?;
//! assert!(prompt.text.ends_with("\"answer\": \""));
//! ```

pub mod render;
mod templates;

pub use templates::{
    Exemplar, FOLLOW_UP_PREAMBLE, MAX_SUGGESTIONS, PromptTemplate, SuggestionExemplar,
    SuggestionTemplate, builtin, builtin_suggestions,
};

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::Rejection;
use crate::extract::AnswerRecord;
use crate::task::{TaskInput, TaskType};
use crate::truncate::StopSet;
use crate::turn::Turn;

use render::ANSWER_LABEL;

static BUILTIN: LazyLock<TemplateRegistry> = LazyLock::new(TemplateRegistry::builtin);

/// Prompt text together with the stop set for its continuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    /// Text sent to the completion backend.
    pub text: String,
    /// Markers that end the continuation.
    pub stop: StopSet,
}

/// Templates keyed by task type.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<TaskType, PromptTemplate>,
    suggestions: Option<SuggestionTemplate>,
}

impl TemplateRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in templates.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for task in TaskType::ALL {
            registry.register(builtin(task));
        }
        registry.suggestions = Some(builtin_suggestions());
        registry
    }

    /// Registers a template, returning the one it replaces.
    pub fn register(&mut self, template: PromptTemplate) -> Option<PromptTemplate> {
        self.templates.insert(template.task, template)
    }

    /// Replaces the suggestion template.
    pub fn set_suggestions(&mut self, template: SuggestionTemplate) {
        self.suggestions = Some(template);
    }

    /// Returns the template of `task`.
    #[must_use]
    pub fn get(&self, task: TaskType) -> Option<&PromptTemplate> {
        self.templates.get(&task)
    }

    /// Returns the suggestion template.
    #[must_use]
    pub const fn suggestions(&self) -> Option<&SuggestionTemplate> {
        self.suggestions.as_ref()
    }

    /// Assembles the prompt of a turn.
    ///
    /// `ancestors` are the earlier turns of the thread in creation order; pass
    /// an empty slice for a root turn. Ancestors of other task types are
    /// rendered with their own template's end marker.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::InvalidInput`] if `input` lacks a field the task
    /// requires or no template is registered for `task`.
    pub fn assemble(
        &self,
        task: TaskType,
        input: &TaskInput,
        ancestors: &[Turn],
    ) -> Result<Prompt, Rejection> {
        let template = self
            .get(task)
            .ok_or_else(|| Rejection::invalid_input(format!("no template registered for {task}")))?;
        input.validate(task)?;

        let mut text = String::new();
        let _ = writeln!(text, "{}\n", template.preamble);

        for exemplar in &template.exemplars {
            render::exchange(
                &mut text,
                task,
                &exemplar.input,
                &exemplar.output,
                &template.end_marker,
            );
        }

        if !ancestors.is_empty() {
            let _ = writeln!(text, "{FOLLOW_UP_PREAMBLE}\n");
            for turn in ancestors {
                let end_marker = self
                    .get(turn.task)
                    .map_or(template.end_marker.as_str(), |t| t.end_marker.as_str());
                let empty = AnswerRecord::default();
                render::exchange(
                    &mut text,
                    turn.task,
                    &turn.input,
                    turn.output.as_ref().unwrap_or(&empty),
                    end_marker,
                );
            }
        }

        render::input(&mut text, input);
        text.push_str(&template.cue);

        Ok(Prompt {
            text,
            stop: template.stop.clone(),
        })
    }

    /// Assembles the suggestion prompt for a completed exchange.
    ///
    /// `count` is clamped to `1..=MAX_SUGGESTIONS`. The stop set starts with
    /// the marker of the item after the last wanted one (`"4."` for three).
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::InvalidInput`] if no suggestion template is set.
    pub fn assemble_suggestions(
        &self,
        input: &TaskInput,
        output: &AnswerRecord,
        count: usize,
    ) -> Result<Prompt, Rejection> {
        let template = self
            .suggestions
            .as_ref()
            .ok_or_else(|| Rejection::invalid_input("no suggestion template registered"))?;
        let count = count.clamp(1, MAX_SUGGESTIONS);

        let mut text = String::new();
        let _ = writeln!(text, "{}\n", template.preamble);

        for exemplar in &template.exemplars {
            render::input(&mut text, &exemplar.input);
            let _ = writeln!(text, "{ANSWER_LABEL} {}", render::quote(&exemplar.answer));
            let _ = writeln!(text, "{}", template.list_header);
            for (index, question) in exemplar.questions.iter().take(count).enumerate() {
                let _ = writeln!(text, "{}. {question}", index + 1);
            }
            let _ = writeln!(text, "{}\n", template.end_marker);
        }

        render::input(&mut text, input);
        let _ = writeln!(text, "{ANSWER_LABEL} {}", render::quote(output.display_text()));
        let _ = writeln!(text, "{}", template.list_header);
        text.push_str(SUGGESTION_CUE);

        Ok(Prompt {
            text,
            stop: StopSet::new([format!("{}.", count + 1), template.end_marker.clone()]),
        })
    }
}

/// Cue of the suggestion prompt: the first item marker.
pub const SUGGESTION_CUE: &str = "1.";

/// Assembles a turn prompt with the built-in templates.
///
/// # Errors
///
/// Returns [`Rejection::InvalidInput`] if `input` lacks a required field.
pub fn assemble(task: TaskType, input: &TaskInput, ancestors: &[Turn]) -> Result<Prompt, Rejection> {
    BUILTIN.assemble(task, input, ancestors)
}

/// Assembles a suggestion prompt with the built-in template.
///
/// # Errors
///
/// Never fails with the built-in registry; the signature matches
/// [`TemplateRegistry::assemble_suggestions`].
pub fn assemble_suggestions(
    input: &TaskInput,
    output: &AnswerRecord,
    count: usize,
) -> Result<Prompt, Rejection> {
    BUILTIN.assemble_suggestions(input, output, count)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::extract::{ANSWER_CUE, extract};
    use crate::turn::{TurnId, TurnState};

    fn completed(task: TaskType, input: TaskInput, generated: &str, parent: Option<TurnId>) -> Turn {
        Turn {
            id: TurnId::new(),
            parent_id: parent,
            task,
            input,
            output: Some(extract(task, generated)),
            state: TurnState::Completed,
            feedback: None,
            sequence: 0,
        }
    }

    fn sample_input(task: TaskType) -> TaskInput {
        TaskInput::question(format!("question for {task}")).with_code("if (a == b) {}")
    }

    mod assembly {
        use super::*;

        #[test]
        fn deterministic_for_every_task() {
            let registry = TemplateRegistry::builtin();
            let root = completed(
                TaskType::AskQuestion,
                TaskInput::question("What is `strcmp`?"),
                "It compares strings.\"\n\"functions\": [[\"strcmp\", \"compares\"]]",
                None,
            );
            for task in TaskType::ALL {
                let input = sample_input(task);
                let a = registry.assemble(task, &input, std::slice::from_ref(&root)).unwrap();
                let b = registry.assemble(task, &input, std::slice::from_ref(&root)).unwrap();
                assert_eq!(a, b, "{task}");
                let c = assemble(task, &input, std::slice::from_ref(&root)).unwrap();
                assert_eq!(a, c, "{task}");
            }
        }

        #[test]
        fn root_prompt_layout() {
            let input = TaskInput::question("What is a pointer?");
            let prompt = assemble(TaskType::AskQuestion, &input, &[]).unwrap();
            let template = builtin(TaskType::AskQuestion);
            assert!(prompt.text.starts_with(&template.preamble));
            assert!(prompt.text.ends_with(&format!(
                "// [question]: \"What is a pointer?\"\n{ANSWER_CUE}"
            )));
            assert!(!prompt.text.contains(FOLLOW_UP_PREAMBLE));
            assert_eq!(
                prompt.text.matches("// [end-question-answer]").count(),
                template.exemplars.len()
            );
            assert_eq!(prompt.stop, template.stop);
        }

        #[test]
        fn follow_up_includes_ancestor_transcript_in_order() {
            let root = completed(
                TaskType::ExplainCode,
                TaskInput::code("int x = 1;"),
                "Declares `x`.\"\n\"code\": [[\"int x = 1;\", \"sets `x`\"]]",
                None,
            );
            let first = completed(
                TaskType::AskQuestion,
                TaskInput::question("Can it be negative?"),
                "Yes, `int` is signed.\"",
                Some(root.id),
            );
            let prompt = assemble(
                TaskType::AskQuestion,
                &TaskInput::question("What is the range?"),
                &[root, first],
            )
            .unwrap();
            let text = &prompt.text;
            let preamble = text.find(FOLLOW_UP_PREAMBLE).unwrap();
            let root_at = text.find("\"answer\": \"Declares `x`.\"").unwrap();
            let first_at = text.find("\"answer\": \"Yes, `int` is signed.\"").unwrap();
            let new_at = text.find("// [question]: \"What is the range?\"").unwrap();
            assert!(preamble < root_at && root_at < first_at && first_at < new_at);
            assert!(text[root_at..first_at].contains("// [end-code-explanation]"));
            assert!(text[root_at..first_at].contains("[\"int x = 1;\", \"sets `x`\"]"));
        }

        #[test]
        fn missing_required_field_is_rejected() {
            let err = assemble(TaskType::FixCode, &TaskInput::question("why?"), &[]).unwrap_err();
            assert!(matches!(err, Rejection::InvalidInput(_)));
            let err = assemble(TaskType::ExplainCode, &TaskInput::code("   "), &[]).unwrap_err();
            assert!(matches!(err, Rejection::InvalidInput(_)));
        }

        #[test]
        fn unregistered_task_is_rejected() {
            let registry = TemplateRegistry::new();
            let err = registry
                .assemble(TaskType::AskQuestion, &TaskInput::question("q"), &[])
                .unwrap_err();
            assert!(matches!(err, Rejection::InvalidInput(_)));
        }

        #[test]
        fn registering_replaces_template() {
            let mut registry = TemplateRegistry::builtin();
            let custom = PromptTemplate::new(TaskType::AskQuestion, "// custom", "// [end]");
            assert!(registry.register(custom).is_some());
            let prompt = registry
                .assemble(TaskType::AskQuestion, &TaskInput::question("q"), &[])
                .unwrap();
            assert_eq!(prompt.text, "// custom\n\n// [question]: \"q\"\n\"answer\": \"");
            assert_eq!(prompt.stop.markers()[0], "// [end]");
        }
    }

    mod suggestions {
        use super::*;

        #[test]
        fn stop_marker_follows_count() {
            let output = extract(TaskType::AskQuestion, "Use `printf`.\"");
            let input = TaskInput::question("How do I print?");
            for count in 1..=MAX_SUGGESTIONS {
                let prompt = assemble_suggestions(&input, &output, count).unwrap();
                assert_eq!(prompt.stop.markers()[0], format!("{}.", count + 1));
                assert!(prompt.text.ends_with(SUGGESTION_CUE));
                assert!(!prompt.text.contains(&format!("\n{}. ", count + 1)));
                assert!(prompt.text.contains(&format!("\n{count}. ")));
            }
        }

        #[test]
        fn count_is_clamped() {
            let output = AnswerRecord::raw_only("text");
            let input = TaskInput::question("q");
            let prompt = assemble_suggestions(&input, &output, 9).unwrap();
            assert_eq!(prompt.stop.markers()[0], "6.");
            let prompt = assemble_suggestions(&input, &output, 0).unwrap();
            assert_eq!(prompt.stop.markers()[0], "2.");
        }

        #[test]
        fn deterministic() {
            let output = extract(TaskType::AskQuestion, "Use `printf`.\"");
            let input = TaskInput::question("How do I print?");
            assert_eq!(
                assemble_suggestions(&input, &output, 3).unwrap(),
                assemble_suggestions(&input, &output, 3).unwrap()
            );
        }
    }
}
