//! Configuration schema definitions.

use parley::backend::OpenAiConfig;
use parley::config::{ConfigIssue, IssueLevel, SessionConfig};
use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParleyConfig {
    /// Completion backend settings.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Session protocol settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Interactive chat settings.
    #[serde(default)]
    pub chat: ChatConfig,
}

/// OpenAI-compatible completion backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// API key. Falls back to `PARLEY_API_KEY`, then `OPENAI_API_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL. Falls back to `PARLEY_BASE_URL`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Completion model. Falls back to `PARLEY_MODEL`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

const fn default_timeout_secs() -> u64 {
    120
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            model: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl BackendConfig {
    /// Base URL in effect.
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or(OpenAiConfig::DEFAULT_BASE_URL)
    }

    /// Model in effect.
    #[must_use]
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(OpenAiConfig::DEFAULT_MODEL)
    }

    /// Builds the backend configuration, if an API key is known.
    #[must_use]
    pub fn openai(&self) -> Option<OpenAiConfig> {
        let api_key = self.api_key.as_deref()?;
        Some(
            OpenAiConfig::new(api_key)
                .with_base_url(self.base_url())
                .with_model(self.model())
                .with_timeout(self.timeout_secs),
        )
    }
}

/// Interactive chat settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatConfig {
    /// User id the session runs as.
    #[serde(default = "default_user")]
    pub user: String,

    /// Input prompt.
    #[serde(default = "default_prompt")]
    pub prompt: String,

    /// How long to wait for suggestions after an answer, in seconds.
    #[serde(default = "default_suggestion_wait_secs")]
    pub suggestion_wait_secs: u64,
}

fn default_user() -> String {
    "local".to_string()
}

fn default_prompt() -> String {
    "> ".to_string()
}

const fn default_suggestion_wait_secs() -> u64 {
    15
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            prompt: default_prompt(),
            suggestion_wait_secs: default_suggestion_wait_secs(),
        }
    }
}

impl ParleyConfig {
    /// Validate the configuration and return any issues.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues: Vec<ConfigIssue> = self
            .session
            .validate()
            .into_iter()
            .map(|issue| issue.nested("session"))
            .collect();

        if self.backend.api_key.is_none() {
            issues.push(ConfigIssue::warning(
                "backend.api_key",
                "No API key is set. Set PARLEY_API_KEY or OPENAI_API_KEY, or chat with --offline.",
            ));
        }

        let base_url = self.backend.base_url();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            issues.push(ConfigIssue::error(
                "backend.base_url",
                format!("Base URL must start with http:// or https://, got '{base_url}'"),
            ));
        }

        if self.backend.timeout_secs == 0 {
            issues.push(ConfigIssue::error(
                "backend.timeout_secs",
                "Timeout must be at least 1 second",
            ));
        }

        if self.chat.user.trim().is_empty() {
            issues.push(ConfigIssue::error("chat.user", "User id must not be empty"));
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

    /// Merge environment variables into the configuration.
    ///
    /// Values from the file win; the environment only fills what is unset.
    #[must_use]
    pub fn with_env(self) -> Self {
        self.merge_env(|key| std::env::var(key).ok())
    }

    /// Fills unset backend fields from `lookup`.
    #[must_use]
    pub fn merge_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if self.backend.api_key.is_none() {
            self.backend.api_key = lookup("PARLEY_API_KEY").or_else(|| lookup("OPENAI_API_KEY"));
        }
        if self.backend.base_url.is_none() {
            self.backend.base_url = lookup("PARLEY_BASE_URL");
        }
        if self.backend.model.is_none() {
            self.backend.model = lookup("PARLEY_MODEL");
        }
        self
    }
}
