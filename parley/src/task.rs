//! Task types and their input fields.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Rejection;

/// The kind of question a turn asks.
///
/// The serialized token (`"ask-question"`, `"fix-code"`, ...) is the `type`
/// field of a request event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    /// A free-form programming question.
    AskQuestion,
    /// A question about a piece of code.
    AskFromCode,
    /// Explain what a piece of code does, line by line.
    ExplainCode,
    /// Find and fix the issue in a piece of code.
    FixCode,
    /// Write code that accomplishes a described task.
    WriteCode,
}

impl TaskType {
    /// All task types, in registry order.
    pub const ALL: [Self; 5] = [
        Self::AskQuestion,
        Self::AskFromCode,
        Self::ExplainCode,
        Self::FixCode,
        Self::WriteCode,
    ];

    /// Returns the wire token.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AskQuestion => "ask-question",
            Self::AskFromCode => "ask-from-code",
            Self::ExplainCode => "explain-code",
            Self::FixCode => "fix-code",
            Self::WriteCode => "write-code",
        }
    }

    /// Input fields this task cannot do without.
    #[must_use]
    pub const fn required_fields(&self) -> &'static [InputField] {
        match self {
            Self::AskQuestion | Self::WriteCode => &[InputField::Question],
            Self::AskFromCode | Self::FixCode => &[InputField::Code, InputField::Question],
            Self::ExplainCode => &[InputField::Code],
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = Rejection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|task| task.as_str() == s)
            .ok_or_else(|| Rejection::invalid_input(format!("unknown task type '{s}'")))
    }
}

/// A single field of [`TaskInput`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputField {
    /// The question text.
    Question,
    /// The code text.
    Code,
}

impl InputField {
    /// Returns the field name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Question => "question",
            Self::Code => "code",
        }
    }
}

/// Task-specific input of a turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInput {
    /// Question, issue description or task description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    /// Code the question refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl TaskInput {
    /// Creates an input holding only a question.
    #[must_use]
    pub fn question(question: impl Into<String>) -> Self {
        Self {
            question: Some(question.into()),
            code: None,
        }
    }

    /// Creates an input holding only code.
    #[must_use]
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            question: None,
            code: Some(code.into()),
        }
    }

    /// Adds code to the input.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Adds a question to the input.
    #[must_use]
    pub fn with_question(mut self, question: impl Into<String>) -> Self {
        self.question = Some(question.into());
        self
    }

    /// Returns the value of `field`, if present and not blank.
    #[must_use]
    pub fn field(&self, field: InputField) -> Option<&str> {
        let value = match field {
            InputField::Question => self.question.as_deref(),
            InputField::Code => self.code.as_deref(),
        };
        value.filter(|v| !v.trim().is_empty())
    }

    /// Checks that every field `task` requires is present.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::InvalidInput`] naming the first missing or blank
    /// field.
    pub fn validate(&self, task: TaskType) -> Result<(), Rejection> {
        for field in task.required_fields() {
            if self.field(*field).is_none() {
                return Err(Rejection::invalid_input(format!(
                    "{task} requires a non-empty '{}' field",
                    field.as_str()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn tokens_round_trip_through_serde() {
        for task in TaskType::ALL {
            let json = serde_json::to_string(&task).unwrap();
            assert_eq!(json, format!("\"{}\"", task.as_str()));
            let back: TaskType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, task);
        }
    }

    #[test]
    fn from_str_rejects_unknown_token() {
        assert_eq!("fix-code".parse::<TaskType>().unwrap(), TaskType::FixCode);
        assert!(matches!(
            "refactor".parse::<TaskType>(),
            Err(Rejection::InvalidInput(_))
        ));
    }

    #[test]
    fn validate_requires_fields() {
        let input = TaskInput::question("why?");
        assert!(input.validate(TaskType::AskQuestion).is_ok());
        assert!(input.validate(TaskType::ExplainCode).is_err());
        assert!(input.validate(TaskType::FixCode).is_err());

        let both = input.with_code("int x;");
        assert!(both.validate(TaskType::FixCode).is_ok());
    }

    #[test]
    fn blank_fields_count_as_missing() {
        let input = TaskInput::question("   ");
        assert!(input.field(InputField::Question).is_none());
        assert!(input.validate(TaskType::AskQuestion).is_err());
    }

    #[test]
    fn input_skips_absent_fields_when_serialized() {
        let json = serde_json::to_value(TaskInput::code("x = 1")).unwrap();
        assert_eq!(json, serde_json::json!({ "code": "x = 1" }));
    }
}
