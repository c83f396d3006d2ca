//! Canned backend for `--offline` sessions.
//!
//! Answers every prompt in the answer grammar without a model, so the whole
//! session flow (streaming, gate, follow-ups, suggestions) can be tried
//! without an API key.

use std::time::Duration;

use parley::backend::{CompletionRequest, Script, ScriptedBackend};

const CODE_LABEL: &str = "// [code]:";
const QUESTION_LABEL: &str = "// [question]:";
const SUGGESTIONS_END: &str = "// [end-suggestions]";
const EXPLANATION_END: &str = "// [end-code-explanation]";

const CANNED_SUGGESTIONS: [&str; 5] = [
    "How would I test this?",
    "What are the edge cases?",
    "Is there a simpler way to write it?",
    "How does this perform on large inputs?",
    "Which library functions are involved?",
];

/// Builds the offline backend.
pub fn backend() -> ScriptedBackend {
    ScriptedBackend::new()
        .with_delay(Duration::from_millis(15))
        .with_responder(|request| Script::text(&respond(request), 6))
}

/// Continuation text for `request`.
fn respond(request: &CompletionRequest) -> String {
    let markers = request.stop.markers();
    if markers.iter().any(|m| m == SUGGESTIONS_END) {
        return suggestions();
    }

    let question = last_field(&request.prompt, QUESTION_LABEL);
    let mut out = match question {
        Some(question) => format!(
            "Offline mode has no completion backend, so this is a canned reply to `{}`.\"\n",
            question.replace('"', "'")
        ),
        None => "Offline mode has no completion backend, so this is a canned reply.\"\n".to_string(),
    };

    if markers.iter().any(|m| m == EXPLANATION_END)
        && let Some(code) = last_field(&request.prompt, CODE_LABEL)
    {
        out.push_str("\"code\": [\n");
        for (index, line) in code.lines().filter(|l| !l.trim().is_empty()).enumerate() {
            let entry = serde_json::json!([line, format!("Line {} of the snippet.", index + 1)]);
            out.push_str(&format!("  {entry},\n"));
        }
        out.push_str("]\n");
    }

    if let Some(end) = markers.iter().find(|m| m.starts_with("//")) {
        out.push_str(end);
        out.push('\n');
    }
    out
}

fn suggestions() -> String {
    let mut out = String::new();
    for (index, question) in CANNED_SUGGESTIONS.iter().enumerate() {
        if index > 0 {
            out.push_str(&format!("{}.", index + 1));
        }
        out.push(' ');
        out.push_str(question);
        out.push('\n');
    }
    out.push_str(SUGGESTIONS_END);
    out
}

/// Decodes the value of the last comment line starting with `label`.
fn last_field(prompt: &str, label: &str) -> Option<String> {
    prompt
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(label))
        .and_then(|value| serde_json::from_str(value.trim()).ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use parley::backend::CompletionBackend;
    use parley::prelude::*;
    use parley::prompt::assemble_suggestions;
    use parley::suggest::parse_suggestions;

    use super::*;

    fn continuation(prompt: &Prompt) -> String {
        respond(&CompletionRequest::new(prompt.text.clone()).stop(prompt.stop.clone()))
    }

    #[test]
    fn answers_parse_as_records() {
        let prompt = assemble(
            TaskType::AskQuestion,
            &TaskInput::question("What is a \"slice\"?"),
            &[],
        )
        .unwrap();
        let visible = truncate(&continuation(&prompt), &prompt.stop).to_string();
        let record = extract(TaskType::AskQuestion, &visible);
        assert!(!record.malformed);
        let answer = record.answer.unwrap();
        assert!(answer.contains("What is a 'slice'?"));
    }

    #[test]
    fn explanations_echo_code_lines() {
        let input = TaskInput::code("let a = 1;\n\nlet b = a + 1;\n");
        let prompt = assemble(TaskType::ExplainCode, &input, &[]).unwrap();
        let visible = truncate(&continuation(&prompt), &prompt.stop).to_string();
        let record = extract(TaskType::ExplainCode, &visible);
        assert_eq!(record.code_parts.len(), 1);
        assert_eq!(record.code_parts[0].lines.len(), 2);
        assert_eq!(record.code_parts[0].lines[1].code, "let b = a + 1;");
    }

    #[test]
    fn suggestions_stop_at_requested_count() {
        let record = extract(TaskType::AskQuestion, "It depends.\"");
        let prompt = assemble_suggestions(&TaskInput::question("q"), &record, 3).unwrap();
        let generated = continuation(&prompt);
        let questions = parse_suggestions(&generated, 3);
        assert_eq!(questions.len(), 3);
        assert_eq!(questions[0], CANNED_SUGGESTIONS[0]);
    }

    #[tokio::test]
    async fn backend_streams_in_small_chunks() {
        let backend = backend();
        let request = CompletionRequest::new("// [question]: \"hi\"\n");
        let text = backend.generate_text(&request).await.unwrap();
        assert!(text.contains("`hi`"));
        assert_eq!(backend.requests().await.len(), 1);
    }
}
