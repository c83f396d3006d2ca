//! Concurrency gate.
//!
//! A user may start a new root question only once the latest turn of the
//! session has completed and received feedback. The server owns the
//! authoritative [`Gate`] and recomputes it from its [`ThreadStore`] after
//! every completion and feedback submission; the client keeps a mirror fed by
//! `gate` frames. Follow-ups are never gated.

use tokio::sync::watch;
use tracing::debug;

use crate::error::Rejection;
use crate::thread::ThreadStore;
use crate::turn::Turn;

/// Computes the gate from a store. An empty session is open.
#[must_use]
pub fn is_open(store: &ThreadStore) -> bool {
    store.latest_turn().is_none_or(Turn::is_settled)
}

/// Shared gate state with change notification.
#[derive(Debug)]
pub struct Gate {
    tx: watch::Sender<bool>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    /// Creates an open gate.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(true);
        Self { tx }
    }

    /// Current state.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Sets the state. Returns `true` if it changed.
    pub fn set(&self, open: bool) -> bool {
        let changed = self.tx.send_if_modified(|state| {
            if *state == open {
                return false;
            }
            *state = open;
            true
        });
        if changed {
            debug!(open, "Gate changed");
        }
        changed
    }

    /// Recomputes the state from `store` and returns it.
    pub fn recompute(&self, store: &ThreadStore) -> bool {
        let open = is_open(store);
        self.set(open);
        open
    }

    /// Fails with [`Rejection::GateClosed`] while closed.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::GateClosed`] if the gate is closed.
    pub fn check_root(&self) -> Result<(), Rejection> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Rejection::GateClosed)
        }
    }

    /// Returns a read-only view that observes every change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::extract::AnswerRecord;
    use crate::task::{TaskInput, TaskType};
    use crate::turn::{Feedback, Rating, TurnId};

    mod rule {
        use super::*;

        #[test]
        fn empty_session_is_open() {
            assert!(is_open(&ThreadStore::new()));
        }

        #[test]
        fn closes_on_new_turn_and_opens_after_feedback() {
            let mut store = ThreadStore::new();
            let root = TurnId::new();
            store
                .create_root(root, TaskType::AskQuestion, TaskInput::question("q"))
                .unwrap();
            assert!(!is_open(&store));

            store
                .apply_snapshot(root, AnswerRecord::raw_only("a"))
                .unwrap();
            store.complete(root).unwrap();
            assert!(!is_open(&store), "completed but unrated");

            store
                .attach_feedback(root, Feedback::new(Rating::Somewhat))
                .unwrap();
            assert!(is_open(&store));
        }

        #[test]
        fn latest_follow_up_decides() {
            let mut store = ThreadStore::new();
            let root = TurnId::new();
            store
                .create_root(root, TaskType::AskQuestion, TaskInput::question("q"))
                .unwrap();
            store.complete(root).unwrap();
            store
                .attach_feedback(root, Feedback::new(Rating::Helpful))
                .unwrap();

            let follow = TurnId::new();
            store
                .create_follow_up(root, 0, follow, TaskType::AskQuestion, TaskInput::question("f"))
                .unwrap();
            assert!(!is_open(&store));
            store.complete(follow).unwrap();
            store
                .attach_feedback(follow, Feedback::new(Rating::Helpful))
                .unwrap();
            assert!(is_open(&store));
        }
    }

    mod watch_state {
        use super::*;

        #[test]
        fn set_reports_changes_only() {
            let gate = Gate::new();
            assert!(gate.is_open());
            assert!(!gate.set(true));
            assert!(gate.set(false));
            assert_eq!(gate.check_root(), Err(Rejection::GateClosed));
        }

        #[tokio::test]
        async fn watchers_see_updates() {
            let gate = Gate::new();
            let mut rx = gate.watch();
            gate.set(false);
            rx.changed().await.unwrap();
            assert!(!*rx.borrow());
        }
    }
}
