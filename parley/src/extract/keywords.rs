//! Inline keyword references.
//!
//! Any backtick-delimited span inside free text (`` `printf` ``) is a keyword
//! reference. Spans do not cross line breaks and must not be empty; an
//! unclosed backtick yields nothing until its closing backtick arrives.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static KEYWORD_SPAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"`([^`\n]+)`").expect("keyword pattern is valid")
});

/// Where a keyword reference was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum KeywordSource {
    /// The free-text answer.
    Answer,
    /// The explanation of a code line.
    CodeExplanation {
        /// Index of the code part.
        part: usize,
        /// Index of the line within the part.
        line: usize,
    },
    /// The summary of a referenced function.
    FunctionSummary {
        /// Index of the function.
        index: usize,
    },
    /// A suggested follow-up question.
    Suggestion {
        /// Index of the suggestion.
        index: usize,
    },
}

/// A backtick-delimited inline reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Keyword {
    /// The text between the backticks.
    pub text: String,
    /// The field the span was found in.
    pub source: KeywordSource,
}

/// Returns the keyword spans of `text`, in order.
pub fn spans(text: &str) -> impl Iterator<Item = &str> {
    KEYWORD_SPAN
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Collects the keywords of `text` tagged with `source`.
pub(crate) fn collect_into(out: &mut Vec<Keyword>, text: &str, source: KeywordSource) {
    out.extend(spans(text).map(|span| Keyword {
        text: span.to_owned(),
        source,
    }));
}
