//! Structured field extraction from generated text.
//!
//! [`extract`] turns the (truncated) continuation produced by the completion
//! backend into an [`AnswerRecord`]. It never fails: malformed output degrades
//! to a record carrying the raw text, and fields that are not yet resolvable in
//! a stream prefix are simply absent.
//!
//! Extraction is monotonic over prefixes of one stream. Free text (the answer)
//! grows as it streams; list items (code lines, functions, examples) appear
//! only once complete; nothing present in an earlier extraction disappears in
//! a later one.
//!
//! # Example
//!
//! ```rust,ignore
//! use parley::extract::extract;
//! use parley::task::TaskType;
//!
//! let record = extract(TaskType::AskQuestion, "Use `scanf`.\"\n\"functions\": [[\"scanf\"]]");
//! assert_eq!(record.answer.as_deref(), Some("Use `scanf`."));
//! assert_eq!(record.functions[0].name, "scanf");
//! ```

mod keywords;
mod list;
mod scan;

pub use keywords::{Keyword, KeywordSource, spans as keyword_spans};

use serde::{Deserialize, Serialize};

use crate::task::TaskType;

use scan::Value;

/// Cue that every answer template ends its prompt with.
///
/// Generated text continues inside the answer string, so the extractor puts the
/// cue back in front before scanning.
pub const ANSWER_CUE: &str = "\"answer\": \"";

/// Grammar keys.
pub(crate) mod keys {
    pub(crate) const ANSWER: &str = "answer";
    pub(crate) const CODE: &str = "code";
    pub(crate) const FUNCTIONS: &str = "functions";
    pub(crate) const EXAMPLES: &str = "examples";
    pub(crate) const SUGGESTIONS: &str = "suggestions";
}

/// One line of a code part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeLine {
    /// The code.
    pub code: String,
    /// What the line does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// An ordered block of explained code lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodePart {
    /// Lines in order.
    pub lines: Vec<CodeLine>,
}

impl CodePart {
    /// Returns the code of the part, one line per entry.
    #[must_use]
    pub fn code(&self) -> String {
        self.lines
            .iter()
            .map(|line| line.code.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A library function the answer refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRef {
    /// Function name.
    pub name: String,
    /// One-line documentation summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// A typed, possibly partial answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerRecord {
    /// The text the record was extracted from.
    pub raw: String,
    /// Free-text answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    /// Explained code parts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_parts: Vec<CodePart>,
    /// Referenced library functions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FunctionRef>,
    /// Example snippets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<String>,
    /// Suggested follow-up questions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    /// Inline keyword references found in free-text fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<Keyword>,
    /// The text stopped following the grammar at some point.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub malformed: bool,
}

impl AnswerRecord {
    /// Creates a record holding only raw text, flagged as malformed.
    #[must_use]
    pub fn raw_only(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            malformed: true,
            ..Self::default()
        }
    }

    /// Returns `true` if no structured field was extracted.
    #[must_use]
    pub fn is_unstructured(&self) -> bool {
        self.answer.is_none()
            && self.code_parts.is_empty()
            && self.functions.is_empty()
            && self.examples.is_empty()
            && self.suggestions.is_empty()
    }

    /// Text to show the user: the answer, or the raw text when nothing
    /// structured could be extracted.
    #[must_use]
    pub fn display_text(&self) -> &str {
        self.answer.as_deref().unwrap_or(&self.raw)
    }

    /// Splits the answer into paragraphs at blank lines.
    #[must_use]
    pub fn paragraphs(&self) -> Vec<&str> {
        self.answer
            .as_deref()
            .map(|answer| {
                answer
                    .split("\n\n")
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rebuilds keyword references from every free-text field.
    fn collect_keywords(&mut self) {
        let mut found = Vec::new();
        if let Some(answer) = &self.answer {
            keywords::collect_into(&mut found, answer, KeywordSource::Answer);
        }
        for (part, code_part) in self.code_parts.iter().enumerate() {
            for (line, code_line) in code_part.lines.iter().enumerate() {
                if let Some(explanation) = &code_line.explanation {
                    keywords::collect_into(
                        &mut found,
                        explanation,
                        KeywordSource::CodeExplanation { part, line },
                    );
                }
            }
        }
        for (index, function) in self.functions.iter().enumerate() {
            if let Some(summary) = &function.summary {
                keywords::collect_into(
                    &mut found,
                    summary,
                    KeywordSource::FunctionSummary { index },
                );
            }
        }
        for (index, suggestion) in self.suggestions.iter().enumerate() {
            keywords::collect_into(&mut found, suggestion, KeywordSource::Suggestion { index });
        }
        self.keywords = found;
    }
}

/// Fields a task's grammar may carry besides the answer.
pub(crate) fn accepts(task: TaskType, key: &str) -> bool {
    let code = key == keys::CODE;
    let functions = key == keys::FUNCTIONS;
    let examples = key == keys::EXAMPLES;
    match task {
        TaskType::AskQuestion => functions || examples,
        TaskType::AskFromCode => code || functions,
        TaskType::ExplainCode | TaskType::FixCode => code,
        TaskType::WriteCode => code || functions || examples,
    }
}

/// Extracts a record from the continuation generated after the answer cue.
#[must_use]
pub fn extract(task: TaskType, generated: &str) -> AnswerRecord {
    let document = format!("{ANSWER_CUE}{generated}");
    let mut record = project(Some(task), &scan::scan(&document));
    record.raw = generated.to_owned();
    record
}

/// Extracts a record from a complete grammar document (no cue prepended).
///
/// With `task == None` every recognised key is accepted.
#[must_use]
pub fn extract_document(task: Option<TaskType>, document: &str) -> AnswerRecord {
    let mut record = project(task, &scan::scan(document));
    record.raw = document.to_owned();
    record
}

/// Extracts a numbered list of suggestions, with any leading text as answer.
///
/// Unlike [`extract`], this is not monotonic over a growing prefix, so pass
/// it finished (truncated) text only.
#[must_use]
pub fn extract_list(text: &str) -> AnswerRecord {
    let parsed = list::parse(text);
    let mut record = AnswerRecord {
        raw: text.to_owned(),
        answer: parsed.preamble,
        suggestions: parsed.items,
        ..AnswerRecord::default()
    };
    record.collect_keywords();
    record
}

fn project(task: Option<TaskType>, scanned: &scan::Scan) -> AnswerRecord {
    let mut record = AnswerRecord {
        malformed: scanned.malformed,
        ..AnswerRecord::default()
    };

    for entry in &scanned.entries {
        let key = entry.key.as_str();
        if key != keys::ANSWER && key != keys::SUGGESTIONS && !task.is_none_or(|t| accepts(t, key))
        {
            continue;
        }
        match key {
            keys::ANSWER => {
                if record.answer.is_none()
                    && let Value::Str { text, closed } = &entry.value
                    && (*closed || !text.is_empty())
                {
                    record.answer = Some(text.clone());
                }
            }
            keys::CODE => {
                if let Value::List { items, closed } = &entry.value {
                    let lines: Vec<CodeLine> = items.iter().filter_map(code_line).collect();
                    if *closed || !lines.is_empty() {
                        record.code_parts.push(CodePart { lines });
                    }
                }
            }
            keys::FUNCTIONS => {
                if let Value::List { items, .. } = &entry.value {
                    record
                        .functions
                        .extend(items.iter().filter_map(function_ref));
                }
            }
            keys::EXAMPLES => {
                record.examples.extend(closed_strings(&entry.value));
            }
            keys::SUGGESTIONS => {
                record.suggestions.extend(closed_strings(&entry.value));
            }
            _ => {}
        }
    }

    record.collect_keywords();
    record
}

/// A complete `[first, second?]` pair, or a bare closed string.
fn pair(item: &Value) -> Option<(String, Option<String>)> {
    if let Some(single) = item.closed_str() {
        return Some((single.to_owned(), None));
    }
    let items = item.closed_items()?;
    let first = items.first()?.closed_str()?.to_owned();
    let second = items.get(1).and_then(Value::closed_str).map(str::to_owned);
    Some((first, second))
}

fn code_line(item: &Value) -> Option<CodeLine> {
    pair(item).map(|(code, explanation)| CodeLine { code, explanation })
}

fn function_ref(item: &Value) -> Option<FunctionRef> {
    pair(item)
        .filter(|(name, _)| !name.trim().is_empty())
        .map(|(name, summary)| FunctionRef { name, summary })
}

fn closed_strings(value: &Value) -> Vec<String> {
    match value {
        Value::List { items, .. } => items
            .iter()
            .filter_map(Value::closed_str)
            .map(str::to_owned)
            .collect(),
        Value::Str { .. } => Vec::new(),
    }
}
