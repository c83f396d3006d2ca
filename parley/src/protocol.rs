//! Session channel frames.
//!
//! Everything crossing the per-user channel is a [`ClientFrame`] or a
//! [`ServerFrame`]. Both serialize to JSON objects tagged with `kind`, so the
//! same protocol can run over any byte transport; the in-process channel in
//! [`crate::channel`] moves the values directly.
//!
//! Streamed answers travel as [`ResponseEvent`]s shaped
//! `{ "componentId", "type", "data"? }`: zero or more `response` events, each
//! carrying a full replacement snapshot, then exactly one terminal `done` or
//! `error`. Out-of-band round trips carry a per-connection [`CallId`] and are
//! answered by a [`ServerFrame::Reply`].

use serde::{Deserialize, Serialize};

use crate::error::{Error, Rejection};
use crate::extract::AnswerRecord;
use crate::task::{TaskInput, TaskType};
use crate::thread::ThreadSnapshot;
use crate::turn::{ConnectionId, Feedback, Rating, TurnId, UserId};

/// Correlates an out-of-band round trip with its reply.
pub type CallId = u64;

/// Request to start generating an answer for a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Turn id, chosen by the client for roots and by the server for follow-ups.
    pub id: TurnId,
    /// Task type token.
    #[serde(rename = "type")]
    pub task: TaskType,
    /// Task input.
    pub data: TaskInput,
    /// Connection the request came from.
    pub from: ConnectionId,
    /// User the session belongs to.
    pub user_id: UserId,
}

/// Payload of a [`ResponseEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    /// Full replacement of the output snapshot.
    Response(AnswerRecord),
    /// Terminal: generation finished.
    Done,
    /// Terminal: the request was refused.
    Error(Rejection),
}

impl EventPayload {
    /// Returns `true` for `done` and `error`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }
}

/// An event tagged with the turn it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEvent {
    /// Turn the event belongs to.
    pub component_id: TurnId,
    /// Event type and data.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl ResponseEvent {
    /// Creates a `response` event.
    #[must_use]
    pub const fn response(component_id: TurnId, record: AnswerRecord) -> Self {
        Self {
            component_id,
            payload: EventPayload::Response(record),
        }
    }

    /// Creates a `done` event.
    #[must_use]
    pub const fn done(component_id: TurnId) -> Self {
        Self {
            component_id,
            payload: EventPayload::Done,
        }
    }

    /// Creates an `error` event.
    #[must_use]
    pub const fn error(component_id: TurnId, rejection: Rejection) -> Self {
        Self {
            component_id,
            payload: EventPayload::Error(rejection),
        }
    }

    /// Returns `true` if this event ends its turn's stream.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }
}

/// Feedback submission.
///
/// Feedback for a follow-up names both its root (`response_id`) and the
/// follow-up itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRequest {
    /// Root turn of the rated answer.
    pub response_id: TurnId,
    /// Rated follow-up, if the answer was not the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_up_id: Option<TurnId>,
    /// Rating.
    pub rating: Rating,
    /// Optional free-text reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl FeedbackRequest {
    /// Creates a feedback request for `turn` within the thread rooted at `root_id`.
    #[must_use]
    pub fn for_turn(root_id: TurnId, turn_id: TurnId, feedback: Feedback) -> Self {
        Self {
            response_id: root_id,
            follow_up_id: (turn_id != root_id).then_some(turn_id),
            rating: feedback.rating,
            reason: feedback.reason,
        }
    }

    /// The turn the feedback applies to.
    #[must_use]
    pub fn target(&self) -> TurnId {
        self.follow_up_id.unwrap_or(self.response_id)
    }

    /// The feedback value.
    #[must_use]
    pub fn feedback(&self) -> Feedback {
        Feedback {
            rating: self.rating,
            reason: self.reason.clone(),
        }
    }
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientFrame {
    /// Start generating an answer.
    Request(Request),
    /// Reserve the next follow-up slot of a thread.
    AllocateFollowUp {
        /// Round-trip id.
        call: CallId,
        /// Root of the thread.
        root_id: TurnId,
        /// Follow-up count the client believes the thread has.
        expected_position: usize,
    },
    /// Submit feedback for a completed turn.
    Feedback {
        /// Round-trip id.
        call: CallId,
        /// The feedback.
        feedback: FeedbackRequest,
    },
    /// Ask for the current gate state.
    GateQuery {
        /// Round-trip id.
        call: CallId,
    },
    /// Fetch the server's copy of a thread.
    FetchThread {
        /// Round-trip id.
        call: CallId,
        /// Root of the thread.
        root_id: TurnId,
    },
}

impl ClientFrame {
    /// Round-trip id, for frames that expect a reply.
    #[must_use]
    pub const fn call(&self) -> Option<CallId> {
        match self {
            Self::Request(_) => None,
            Self::AllocateFollowUp { call, .. }
            | Self::Feedback { call, .. }
            | Self::GateQuery { call }
            | Self::FetchThread { call, .. } => Some(*call),
        }
    }
}

/// Result of an out-of-band round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "result",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Reply {
    /// A follow-up slot was reserved.
    Allocated {
        /// Id of the reserved turn.
        new_turn_id: TurnId,
    },
    /// Current gate state.
    Gate {
        /// Whether a new root question may be asked.
        open: bool,
    },
    /// A thread snapshot.
    Thread {
        /// The snapshot.
        snapshot: ThreadSnapshot,
    },
    /// The request was refused.
    Rejected {
        /// Why.
        rejection: Rejection,
    },
}

impl From<Rejection> for Reply {
    fn from(rejection: Rejection) -> Self {
        Self::Rejected { rejection }
    }
}

impl Reply {
    /// Converts a `rejected` reply into an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rejected`] for [`Reply::Rejected`].
    pub fn into_result(self) -> Result<Self, Error> {
        match self {
            Self::Rejected { rejection } => Err(rejection.into()),
            other => Ok(other),
        }
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerFrame {
    /// A streamed event for one turn.
    Event(ResponseEvent),
    /// Reply to a client round trip.
    Reply {
        /// Round-trip id from the client frame.
        call: CallId,
        /// The reply.
        reply: Reply,
    },
    /// The gate changed or was recomputed.
    Gate {
        /// Whether a new root question may be asked.
        open: bool,
    },
    /// Follow-up suggestions for a completed turn.
    Suggestions {
        /// Turn the suggestions were generated for.
        turn_id: TurnId,
        /// Suggested questions in order.
        questions: Vec<String>,
    },
}
