//! Serialization of inputs and records into the answer grammar.
//!
//! Everything the model sees about earlier exchanges, exemplars and ancestor
//! turns alike, goes through these functions, so the prompt always shows the
//! exact grammar the extractor parses.

use std::fmt::Write;

use crate::extract::{AnswerRecord, CodePart, accepts, keys};
use crate::task::TaskInput;
use crate::task::TaskType;

/// Comment label introducing code input.
pub const CODE_LABEL: &str = "// [code]:";

/// Comment label introducing a question.
pub const QUESTION_LABEL: &str = "// [question]:";

/// Comment label introducing a previous answer in suggestion prompts.
pub const ANSWER_LABEL: &str = "// [answer]:";

/// Quotes `text` as a JSON string.
#[must_use]
pub fn quote(text: &str) -> String {
    serde_json::Value::String(text.to_owned()).to_string()
}

/// Appends the comment lines describing `input`, code first.
pub fn input(out: &mut String, input: &TaskInput) {
    if let Some(code) = input.code.as_deref() {
        let _ = writeln!(out, "{CODE_LABEL} {}", quote(code));
    }
    if let Some(question) = input.question.as_deref() {
        let _ = writeln!(out, "{QUESTION_LABEL} {}", quote(question));
    }
}

/// Renders `record` as a grammar document.
///
/// Only the fields `task` accepts are written; `None` writes all of them. A
/// record without a structured answer is written with its raw text as answer.
#[must_use]
pub fn record(task: Option<TaskType>, record: &AnswerRecord) -> String {
    let mut out = String::new();
    let allowed = |key: &str| task.is_none_or(|t| accepts(t, key));

    let answer = record.answer.as_deref().unwrap_or(&record.raw);
    let _ = writeln!(out, "\"answer\": {}", quote(answer));

    if allowed(keys::CODE) {
        for part in &record.code_parts {
            code_part(&mut out, part);
        }
    }
    if allowed(keys::FUNCTIONS) && !record.functions.is_empty() {
        out.push_str("\"functions\": [\n");
        for function in &record.functions {
            match &function.summary {
                Some(summary) => {
                    let _ = writeln!(out, "  [{}, {}],", quote(&function.name), quote(summary));
                }
                None => {
                    let _ = writeln!(out, "  [{}],", quote(&function.name));
                }
            }
        }
        out.push_str("]\n");
    }
    if allowed(keys::EXAMPLES) && !record.examples.is_empty() {
        out.push_str("\"examples\": [\n");
        for example in &record.examples {
            let _ = writeln!(out, "  {},", quote(example));
        }
        out.push_str("]\n");
    }
    out
}

fn code_part(out: &mut String, part: &CodePart) {
    out.push_str("\"code\": [\n");
    for line in &part.lines {
        match &line.explanation {
            Some(explanation) => {
                let _ = writeln!(out, "  [{}, {}],", quote(&line.code), quote(explanation));
            }
            None => {
                let _ = writeln!(out, "  [{}],", quote(&line.code));
            }
        }
    }
    out.push_str("]\n");
}

/// Appends one complete exchange: input, output and end marker.
pub fn exchange(
    out: &mut String,
    task: TaskType,
    turn_input: &TaskInput,
    output: &AnswerRecord,
    end_marker: &str,
) {
    input(out, turn_input);
    out.push_str(&record(Some(task), output));
    let _ = writeln!(out, "{end_marker}\n");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::extract::{CodeLine, FunctionRef, extract_document};

    fn sample() -> AnswerRecord {
        AnswerRecord {
            answer: Some("Prints \"hi\".\nThen exits.".into()),
            code_parts: vec![CodePart {
                lines: vec![
                    CodeLine {
                        code: "puts(\"hi\");".into(),
                        explanation: Some("writes `hi`".into()),
                    },
                    CodeLine {
                        code: "return 0;".into(),
                        explanation: None,
                    },
                ],
            }],
            functions: vec![FunctionRef {
                name: "puts".into(),
                summary: None,
            }],
            examples: vec!["puts(\"x\");".into()],
            ..AnswerRecord::default()
        }
    }

    #[test]
    fn rendered_record_parses_back() {
        let text = record(None, &sample());
        let parsed = extract_document(None, &text);
        assert!(!parsed.malformed, "{text}");
        assert_eq!(parsed.answer, sample().answer);
        assert_eq!(parsed.code_parts, sample().code_parts);
        assert_eq!(parsed.functions, sample().functions);
        assert_eq!(parsed.examples, sample().examples);
    }

    #[test]
    fn task_filters_fields() {
        let text = record(Some(TaskType::ExplainCode), &sample());
        assert!(text.contains("\"code\""));
        assert!(!text.contains("\"functions\""));
        assert!(!text.contains("\"examples\""));
    }

    #[test]
    fn unstructured_record_renders_raw_text() {
        let text = record(None, &AnswerRecord::raw_only("just prose"));
        assert_eq!(text, "\"answer\": \"just prose\"\n");
    }

    #[test]
    fn input_lines_are_quoted_comments() {
        let mut out = String::new();
        input(&mut out, &TaskInput::question("why \"x\"?").with_code("int x;\n"));
        assert_eq!(
            out,
            "// [code]: \"int x;\\n\"\n// [question]: \"why \\\"x\\\"?\"\n"
        );
    }
}
