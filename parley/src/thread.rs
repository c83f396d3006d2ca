//! Conversation thread store.
//!
//! [`ThreadStore`] is one normalized map of turns keyed by id, plus the
//! ordering of every thread (root first, follow-ups in creation order). The
//! server keeps the authoritative copy per user; the client keeps a mirror
//! built from the same operations.
//!
//! Follow-ups are created in two steps. [`ThreadStore::reserve_follow_up`]
//! allocates the next slot of a thread and fails with a conflict unless the
//! caller's position token equals the current follow-up count;
//! [`ThreadStore::open_follow_up`] then fills the slot with the turn's task
//! and input. Reserving never mutates the thread on conflict.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Rejection;
use crate::extract::AnswerRecord;
use crate::task::{TaskInput, TaskType};
use crate::turn::{Feedback, Turn, TurnId, TurnState};

/// Ordering and suggestions of one thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    /// Root turn id.
    pub root_id: TurnId,
    /// Follow-up slots in creation order, including reserved ones.
    pub follow_ups: Vec<TurnId>,
    /// Suggested next questions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    /// Turn the suggestions were generated for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions_from: Option<TurnId>,
}

impl Thread {
    const fn new(root_id: TurnId) -> Self {
        Self {
            root_id,
            follow_ups: Vec::new(),
            suggestions: Vec::new(),
            suggestions_from: None,
        }
    }

    /// Number of follow-up slots, reserved or opened.
    #[must_use]
    pub fn follow_up_count(&self) -> usize {
        self.follow_ups.len()
    }

    /// Ids of the thread in order, root first.
    pub fn ids(&self) -> impl Iterator<Item = TurnId> + '_ {
        std::iter::once(self.root_id).chain(self.follow_ups.iter().copied())
    }
}

/// A self-contained copy of one thread, used to re-sync a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSnapshot {
    /// Thread ordering and suggestions.
    pub thread: Thread,
    /// Opened turns of the thread, in thread order.
    pub turns: Vec<Turn>,
}

/// Normalized store of turns and threads.
#[derive(Debug, Clone, Default)]
pub struct ThreadStore {
    turns: HashMap<TurnId, Turn>,
    threads: HashMap<TurnId, Thread>,
    /// Reserved follow-up slots not opened yet, mapped to their root.
    slots: HashMap<TurnId, TurnId>,
    latest: Option<TurnId>,
    next_sequence: u64,
}

impl ThreadStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_turn(&mut self, turn: Turn) -> &Turn {
        let id = turn.id;
        self.next_sequence = self.next_sequence.max(turn.sequence + 1);
        let newer = self
            .latest
            .and_then(|latest| self.turns.get(&latest))
            .is_none_or(|latest| latest.sequence <= turn.sequence);
        if newer {
            self.latest = Some(id);
        }
        self.turns.entry(id).insert_entry(turn).into_mut()
    }

    fn turn_mut(&mut self, id: TurnId) -> Result<&mut Turn, Rejection> {
        self.turns.get_mut(&id).ok_or(Rejection::UnknownTurn(id))
    }

    fn ensure_new(&self, id: TurnId) -> Result<(), Rejection> {
        if self.turns.contains_key(&id) || self.slots.contains_key(&id) || self.threads.contains_key(&id)
        {
            return Err(Rejection::DuplicateTurn(id));
        }
        Ok(())
    }

    /// Creates a root turn and its thread.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::DuplicateTurn`] if `id` is taken, or
    /// [`Rejection::InvalidInput`] if `input` lacks a required field.
    pub fn create_root(
        &mut self,
        id: TurnId,
        task: TaskType,
        input: TaskInput,
    ) -> Result<&Turn, Rejection> {
        self.ensure_new(id)?;
        input.validate(task)?;
        let turn = Turn {
            id,
            parent_id: None,
            task,
            input,
            output: None,
            state: TurnState::Created,
            feedback: None,
            sequence: self.next_sequence,
        };
        self.threads.insert(id, Thread::new(id));
        debug!(turn_id = %id, %task, "Created root turn");
        Ok(self.insert_turn(turn))
    }

    /// Reserves the next follow-up slot of a thread.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::UnknownThread`] for an unknown root,
    /// [`Rejection::OutOfOrderFollowUp`] if `expected_position` is not the
    /// current follow-up count, or [`Rejection::DuplicateTurn`] if `new_id` is
    /// taken. The thread is unchanged on error.
    pub fn reserve_follow_up(
        &mut self,
        root_id: TurnId,
        expected_position: usize,
        new_id: TurnId,
    ) -> Result<(), Rejection> {
        let actual = self
            .threads
            .get(&root_id)
            .ok_or(Rejection::UnknownThread(root_id))?
            .follow_up_count();
        if expected_position != actual {
            return Err(Rejection::OutOfOrderFollowUp {
                root_id,
                expected: expected_position,
                actual,
            });
        }
        self.ensure_new(new_id)?;
        if let Some(thread) = self.threads.get_mut(&root_id) {
            thread.follow_ups.push(new_id);
        }
        self.slots.insert(new_id, root_id);
        debug!(%root_id, turn_id = %new_id, position = actual, "Reserved follow-up slot");
        Ok(())
    }

    /// Opens a reserved follow-up slot.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::UnknownTurn`] if `id` is not a reserved slot, or
    /// [`Rejection::InvalidInput`] if `input` lacks a required field.
    pub fn open_follow_up(
        &mut self,
        id: TurnId,
        task: TaskType,
        input: TaskInput,
    ) -> Result<&Turn, Rejection> {
        let root_id = *self.slots.get(&id).ok_or(Rejection::UnknownTurn(id))?;
        input.validate(task)?;
        self.slots.remove(&id);
        let turn = Turn {
            id,
            parent_id: Some(root_id),
            task,
            input,
            output: None,
            state: TurnState::Created,
            feedback: None,
            sequence: self.next_sequence,
        };
        debug!(%root_id, turn_id = %id, %task, "Opened follow-up turn");
        Ok(self.insert_turn(turn))
    }

    /// Reserves and opens a follow-up in one step.
    ///
    /// # Errors
    ///
    /// See [`Self::reserve_follow_up`] and [`Self::open_follow_up`].
    pub fn create_follow_up(
        &mut self,
        root_id: TurnId,
        expected_position: usize,
        id: TurnId,
        task: TaskType,
        input: TaskInput,
    ) -> Result<&Turn, Rejection> {
        input.validate(task)?;
        self.reserve_follow_up(root_id, expected_position, id)?;
        self.open_follow_up(id, task, input)
    }

    /// Replaces the output snapshot of an open turn.
    ///
    /// Returns `false` (and changes nothing) once the turn is completed or
    /// stalled.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::UnknownTurn`] for an unknown id.
    pub fn apply_snapshot(&mut self, id: TurnId, record: AnswerRecord) -> Result<bool, Rejection> {
        let turn = self.turn_mut(id)?;
        if !turn.state.is_open() {
            return Ok(false);
        }
        turn.output = Some(record);
        turn.state = TurnState::Streaming;
        Ok(true)
    }

    /// Marks a turn completed. Completing twice is a no-op.
    ///
    /// Suggestions of the turn's thread are cleared, since they belonged to an
    /// older turn.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::UnknownTurn`] for an unknown id.
    pub fn complete(&mut self, id: TurnId) -> Result<&Turn, Rejection> {
        let turn = self.turn_mut(id)?;
        if turn.state.is_completed() {
            return self.turn(id).ok_or(Rejection::UnknownTurn(id));
        }
        turn.state = TurnState::Completed;
        let root_id = turn.root_id();
        if let Some(thread) = self.threads.get_mut(&root_id) {
            thread.suggestions.clear();
            thread.suggestions_from = None;
        }
        debug!(turn_id = %id, "Turn completed");
        self.turn(id).ok_or(Rejection::UnknownTurn(id))
    }

    /// Attaches feedback to a completed turn, replacing earlier feedback.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::UnknownTurn`] for an unknown id or
    /// [`Rejection::NotCompleted`] if the turn has not completed.
    pub fn attach_feedback(&mut self, id: TurnId, feedback: Feedback) -> Result<&Turn, Rejection> {
        let turn = self.turn_mut(id)?;
        if !turn.state.is_completed() {
            return Err(Rejection::NotCompleted(id));
        }
        turn.feedback = Some(feedback);
        Ok(&*turn)
    }

    /// Stores suggestions generated for `turn_id`.
    ///
    /// Returns `false` and drops them unless `turn_id` is still the most
    /// recently completed turn of its thread.
    pub fn set_suggestions(&mut self, turn_id: TurnId, questions: Vec<String>) -> bool {
        let Some(turn) = self.turns.get(&turn_id) else {
            return false;
        };
        let root_id = turn.root_id();
        if self.latest_completed(root_id).map(|t| t.id) != Some(turn_id) {
            debug!(%turn_id, "Dropping stale suggestions");
            return false;
        }
        if let Some(thread) = self.threads.get_mut(&root_id) {
            thread.suggestions = questions;
            thread.suggestions_from = Some(turn_id);
            return true;
        }
        false
    }

    /// Marks an open turn stalled. Returns `true` if the state changed.
    pub fn mark_stalled(&mut self, id: TurnId) -> bool {
        match self.turns.get_mut(&id) {
            Some(turn) if turn.state.is_open() => {
                turn.state = TurnState::Stalled;
                true
            }
            _ => false,
        }
    }

    /// Withdraws a turn the server refused before it streamed anything.
    ///
    /// A root is removed together with its thread, provided the thread has no
    /// follow-ups. A follow-up goes back to being a reserved slot, so the
    /// thread's positions stay aligned with the server. Returns `false` if the
    /// turn is unknown or already streamed.
    pub fn discard(&mut self, id: TurnId) -> bool {
        let Some(turn) = self.turns.get(&id) else {
            return false;
        };
        if turn.state != TurnState::Created {
            return false;
        }
        match turn.parent_id {
            Some(root_id) => {
                self.slots.insert(id, root_id);
            }
            None => {
                if self
                    .threads
                    .get(&id)
                    .is_some_and(|thread| !thread.follow_ups.is_empty())
                {
                    return false;
                }
                self.threads.remove(&id);
            }
        }
        self.turns.remove(&id);
        self.latest = self
            .turns
            .values()
            .max_by_key(|t| t.sequence)
            .map(|t| t.id);
        debug!(turn_id = %id, "Discarded refused turn");
        true
    }

    /// Returns `true` if `id` is a reserved follow-up slot not opened yet.
    #[must_use]
    pub fn is_reserved(&self, id: TurnId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Returns a turn.
    #[must_use]
    pub fn turn(&self, id: TurnId) -> Option<&Turn> {
        self.turns.get(&id)
    }

    /// Returns the thread rooted at `root_id`.
    #[must_use]
    pub fn thread(&self, root_id: TurnId) -> Option<&Thread> {
        self.threads.get(&root_id)
    }

    /// Returns the opened turns of a thread in order.
    #[must_use]
    pub fn thread_turns(&self, root_id: TurnId) -> Vec<&Turn> {
        self.threads.get(&root_id).map_or_else(Vec::new, |thread| {
            thread.ids().filter_map(|id| self.turns.get(&id)).collect()
        })
    }

    /// Current follow-up count of a thread.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::UnknownThread`] for an unknown root.
    pub fn follow_up_count(&self, root_id: TurnId) -> Result<usize, Rejection> {
        self.threads
            .get(&root_id)
            .map(Thread::follow_up_count)
            .ok_or(Rejection::UnknownThread(root_id))
    }

    /// Turns preceding `id` in its thread, in order. Empty for a root.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::UnknownTurn`] for an unknown id.
    pub fn ancestors(&self, id: TurnId) -> Result<Vec<Turn>, Rejection> {
        let turn = self.turns.get(&id).ok_or(Rejection::UnknownTurn(id))?;
        let Some(root_id) = turn.parent_id else {
            return Ok(Vec::new());
        };
        Ok(self
            .thread_turns(root_id)
            .into_iter()
            .take_while(|t| t.id != id)
            .cloned()
            .collect())
    }

    /// The most recently created turn of the session.
    #[must_use]
    pub fn latest_turn(&self) -> Option<&Turn> {
        self.latest.and_then(|id| self.turns.get(&id))
    }

    /// The most recently created completed turn of a thread.
    #[must_use]
    pub fn latest_completed(&self, root_id: TurnId) -> Option<&Turn> {
        self.thread_turns(root_id)
            .into_iter()
            .filter(|t| t.state.is_completed())
            .max_by_key(|t| t.sequence)
    }

    /// Ids of turns still waiting for their terminal event.
    #[must_use]
    pub fn open_turns(&self) -> Vec<TurnId> {
        let mut open: Vec<&Turn> = self.turns.values().filter(|t| t.state.is_open()).collect();
        open.sort_by_key(|t| t.sequence);
        open.into_iter().map(|t| t.id).collect()
    }

    /// Root ids in creation order.
    #[must_use]
    pub fn roots(&self) -> Vec<TurnId> {
        let mut roots: Vec<&Turn> = self
            .threads
            .keys()
            .filter_map(|id| self.turns.get(id))
            .collect();
        roots.sort_by_key(|t| t.sequence);
        roots.into_iter().map(|t| t.id).collect()
    }

    /// Copies one thread for re-syncing.
    #[must_use]
    pub fn snapshot(&self, root_id: TurnId) -> Option<ThreadSnapshot> {
        let thread = self.threads.get(&root_id)?.clone();
        let turns = thread
            .ids()
            .filter_map(|id| self.turns.get(&id).cloned())
            .collect();
        Some(ThreadSnapshot { thread, turns })
    }

    /// Replaces a thread with a snapshot taken elsewhere.
    ///
    /// Turns of the old copy missing from the snapshot are removed, except a
    /// turn opened locally in a slot the snapshot still has reserved: the
    /// server has not seen its request yet, so it is kept. Other slots
    /// reserved in the snapshot stay reserved.
    pub fn replace_thread(&mut self, snapshot: ThreadSnapshot) {
        let ThreadSnapshot { thread, turns } = snapshot;
        let root_id = thread.root_id;
        let mut local: HashMap<TurnId, Turn> = HashMap::new();
        if let Some(old) = self.threads.remove(&root_id) {
            for id in old.ids() {
                if let Some(turn) = self.turns.remove(&id) {
                    local.insert(id, turn);
                }
                self.slots.remove(&id);
            }
        }
        let mut kept = Vec::new();
        for id in &thread.follow_ups {
            if turns.iter().any(|t| t.id == *id) {
                continue;
            }
            match local.remove(id) {
                Some(turn) => kept.push(turn),
                None => {
                    self.slots.insert(*id, root_id);
                }
            }
        }
        self.threads.insert(root_id, thread);
        for turn in turns.into_iter().chain(kept) {
            self.insert_turn(turn);
        }
        self.latest = self
            .turns
            .values()
            .max_by_key(|t| t.sequence)
            .map(|t| t.id);
        debug!(%root_id, "Replaced thread from snapshot");
    }

    /// Number of opened turns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Returns `true` if no turn was opened yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
