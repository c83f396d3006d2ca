//! Prelude module for convenient imports.
//!
//! # Usage
//!
//! ```rust,ignore
//! use parley::prelude::*;
//! ```

#[cfg(feature = "openai")]
pub use crate::backend::{OpenAiCompletions, OpenAiConfig};
pub use crate::backend::{
    ChunkStream, CompletionBackend, CompletionRequest, Script, ScriptedBackend, SharedBackend,
};
pub use crate::channel::{Correlator, TurnEvent, duplex};
pub use crate::client::{SessionClient, TurnHandle};
pub use crate::config::{ConfigIssue, IssueLevel, SessionConfig};
pub use crate::error::{BackendError, BackendErrorKind, Error, Rejection, Result};
pub use crate::extract::{AnswerRecord, CodeLine, CodePart, FunctionRef, Keyword, extract};
pub use crate::gate::Gate;
pub use crate::prompt::{Prompt, PromptTemplate, TemplateRegistry, assemble};
pub use crate::protocol::{ClientFrame, EventPayload, Reply, ResponseEvent, ServerFrame};
pub use crate::server::SessionServer;
pub use crate::suggest::SuggestionGenerator;
pub use crate::task::{TaskInput, TaskType};
pub use crate::thread::{Thread, ThreadSnapshot, ThreadStore};
pub use crate::truncate::{StopSet, StreamTruncator, truncate};
pub use crate::turn::{Feedback, Rating, Turn, TurnId, TurnState, UserId};
