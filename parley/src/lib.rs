//! Parley - streaming question/answer sessions over a text-completion backend
//!
//! A user asks a root question, the answer streams back as a sequence of
//! full-replacement snapshots, and follow-ups extend the thread with the
//! earlier exchanges as context. Every completed turn must be rated before the
//! next root question may be asked.
//!
//! The pieces, leaves first:
//!
//! - [`truncate`] cuts streamed text at the earliest stop marker
//! - [`extract`] turns the visible text into a typed, possibly partial record
//! - [`prompt`] assembles few-shot prompts per task type
//! - [`suggest`] generates follow-up question suggestions
//! - [`thread`] and [`gate`] hold the conversation state and the rating gate
//! - [`protocol`], [`channel`], [`server`] and [`client`] run the session
//! - [`backend`] is the seam to the completion service

pub mod backend;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod extract;
pub mod gate;
pub mod prelude;
pub mod prompt;
pub mod protocol;
pub mod server;
pub mod suggest;
pub mod task;
pub mod thread;
pub mod truncate;
pub mod turn;

pub use error::{BackendError, Error, Rejection, Result};
