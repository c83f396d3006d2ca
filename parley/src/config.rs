//! Session configuration.
//!
//! [`SessionConfig`] holds the knobs shared by the server and client halves of
//! a session: suggestion generation, channel sizing and generation limits.
//! Unknown fields are rejected so typos in a config file surface early.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::prompt::MAX_SUGGESTIONS;

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct SessionConfig {
    /// Generate follow-up suggestions after each completed turn.
    pub suggestions_enabled: bool,
    /// Number of suggestions to request (1 to 5).
    pub suggestion_count: usize,
    /// Capacity of each direction of the session channel.
    pub channel_capacity: usize,
    /// Token limit for answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Token limit for the suggestion pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion_max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            suggestions_enabled: true,
            suggestion_count: 3,
            channel_capacity: 64,
            max_tokens: Some(512),
            suggestion_max_tokens: Some(128),
            temperature: Some(0.2),
        }
    }
}

impl SessionConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the suggestion count.
    #[must_use]
    pub const fn with_suggestion_count(mut self, count: usize) -> Self {
        self.suggestion_count = count;
        self
    }

    /// Enables or disables suggestions.
    #[must_use]
    pub const fn with_suggestions(mut self, enabled: bool) -> Self {
        self.suggestions_enabled = enabled;
        self
    }

    /// Sets the channel capacity.
    #[must_use]
    pub const fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Validate the configuration and return any issues.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if !(1..=MAX_SUGGESTIONS).contains(&self.suggestion_count) {
            issues.push(ConfigIssue::error(
                "suggestionCount",
                format!("Suggestion count must be between 1 and {MAX_SUGGESTIONS}"),
            ));
        }

        if self.channel_capacity == 0 {
            issues.push(ConfigIssue::error(
                "channelCapacity",
                "Channel capacity must be at least 1",
            ));
        }

        if self.max_tokens == Some(0) {
            issues.push(ConfigIssue::error("maxTokens", "Max tokens must be at least 1"));
        }

        if self.suggestions_enabled && self.suggestion_max_tokens == Some(0) {
            issues.push(ConfigIssue::warning(
                "suggestionMaxTokens",
                "Suggestion max tokens is 0, no suggestions will be generated",
            ));
        }

        if let Some(temperature) = self.temperature
            && !(0.0..=2.0).contains(&temperature)
        {
            issues.push(ConfigIssue::warning(
                "temperature",
                "Temperature outside 0.0..=2.0 is rejected by most backends",
            ));
        }

        issues
    }

    /// Check if the configuration is valid (no errors).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validate()
            .iter()
            .all(|issue| issue.level != IssueLevel::Error)
    }

    /// Returns the configuration if it has no error-level issues.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] listing every error-level issue.
    pub fn validated(self) -> Result<Self> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|issue| issue.level == IssueLevel::Error)
            .map(|issue| issue.to_string())
            .collect();
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(Error::config(errors.join("; ")))
        }
    }
}

/// Configuration validation issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// Issue severity level.
    pub level: IssueLevel,
    /// Configuration path (e.g., "session.suggestionCount").
    pub path: String,
    /// Human-readable message.
    pub message: String,
}

impl ConfigIssue {
    /// Create an error-level issue.
    #[must_use]
    pub fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Error,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a warning-level issue.
    #[must_use]
    pub fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Warning,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Prefixes the path with `prefix`.
    #[must_use]
    pub fn nested(mut self, prefix: &str) -> Self {
        self.path = format!("{prefix}.{}", self.path);
        self
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.level {
            IssueLevel::Error => "ERROR",
            IssueLevel::Warning => "WARN",
        };
        write!(f, "[{}] {}: {}", prefix, self.path, self.message)
    }
}

/// Severity level for configuration issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueLevel {
    /// Error that prevents the session from running correctly.
    Error,
    /// Warning about potential issues.
    Warning,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_empty());
        assert!(config.is_valid());
        assert_eq!(config.suggestion_count, 3);
    }

    #[test]
    fn suggestion_count_out_of_range_is_error() {
        for count in [0, MAX_SUGGESTIONS + 1] {
            let config = SessionConfig::default().with_suggestion_count(count);
            assert!(!config.is_valid(), "count {count}");
        }
    }

    #[test]
    fn zero_capacity_fails_validated() {
        let err = SessionConfig::default()
            .with_channel_capacity(0)
            .validated()
            .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("channelCapacity")));
    }

    #[test]
    fn odd_temperature_is_only_a_warning() {
        let config = SessionConfig {
            temperature: Some(3.5),
            ..SessionConfig::default()
        };
        let issues = config.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].level, IssueLevel::Warning);
        assert!(config.is_valid());
    }

    #[test]
    fn deserializes_camel_case_with_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"suggestionCount": 5, "suggestionsEnabled": false}"#).unwrap();
        assert_eq!(config.suggestion_count, 5);
        assert!(!config.suggestions_enabled);
        assert_eq!(config.channel_capacity, 64);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_str::<SessionConfig>(r#"{"suggestionCnt": 5}"#);
        assert!(result.is_err());
    }

    #[test]
    fn nested_prefixes_path() {
        let issue = ConfigIssue::error("maxTokens", "x").nested("session");
        assert_eq!(issue.to_string(), "[ERROR] session.maxTokens: x");
    }
}
