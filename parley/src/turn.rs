//! Turns, their identifiers, lifecycle state and feedback.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::extract::AnswerRecord;
use crate::task::{TaskInput, TaskType};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a turn, unique within a session.
    TurnId
);
uuid_id!(
    /// Identifier of one session channel connection.
    ConnectionId
);

/// Identifier of the user owning a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Creates a user id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a turn. States only ever move forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// Created (root submitted or follow-up slot allocated), nothing streamed yet.
    #[default]
    Created,
    /// At least one snapshot has arrived.
    Streaming,
    /// The client lost its channel before the terminal event arrived.
    ///
    /// Only the client mirror uses this state.
    Stalled,
    /// The terminal event arrived.
    Completed,
}

impl TurnState {
    /// Returns `true` once the turn has completed.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Returns `true` while the turn can still receive snapshots.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Created | Self::Streaming)
    }
}

/// How useful an answer was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    /// The answer helped.
    Helpful,
    /// The answer partly helped.
    Somewhat,
    /// The answer did not help.
    NotHelpful,
}

impl Rating {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Helpful => "helpful",
            Self::Somewhat => "somewhat",
            Self::NotHelpful => "not_helpful",
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feedback attached to a completed turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    /// The usefulness rating.
    pub rating: Rating,
    /// Optional free-text reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Feedback {
    /// Creates feedback without a reason.
    #[must_use]
    pub const fn new(rating: Rating) -> Self {
        Self {
            rating,
            reason: None,
        }
    }

    /// Attaches a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// One question/answer exchange, root or follow-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Turn id.
    pub id: TurnId,
    /// Root turn this follows up on; `None` for a root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<TurnId>,
    /// Task type.
    pub task: TaskType,
    /// Task input.
    pub input: TaskInput,
    /// Latest extracted output snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<AnswerRecord>,
    /// Lifecycle state.
    pub state: TurnState,
    /// Feedback, once submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
    /// Creation order within the session.
    pub sequence: u64,
}

impl Turn {
    /// Returns `true` for a root turn.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Returns the root id of this turn's thread.
    #[must_use]
    pub fn root_id(&self) -> TurnId {
        self.parent_id.unwrap_or(self.id)
    }

    /// Returns `true` when this turn is completed and rated.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        self.state.is_completed() && self.feedback.is_some()
    }
}
