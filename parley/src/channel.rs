//! In-process session channel and the client-side request correlator.
//!
//! [`duplex`] creates the per-user channel as two bounded queues. The
//! [`Correlator`] routes server events to whichever subscriber owns their turn
//! id and matches round-trip replies to their callers:
//!
//! - each turn id has at most one [`Subscription`]; it is released as soon as
//!   the terminal `done` or `error` event for that id is delivered
//! - events for an id without a subscription are discarded
//! - on disconnect every live subscription receives
//!   [`TurnEvent::ConnectionLost`] and every pending call fails

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::error::{Error, Rejection, Result};
use crate::extract::AnswerRecord;
use crate::protocol::{CallId, ClientFrame, EventPayload, Reply, ResponseEvent, ServerFrame};
use crate::turn::TurnId;

/// Client half of the session channel.
#[derive(Debug)]
pub struct ClientEnd {
    /// Frames to the server.
    pub tx: mpsc::Sender<ClientFrame>,
    /// Frames from the server.
    pub rx: mpsc::Receiver<ServerFrame>,
}

/// Server half of the session channel.
#[derive(Debug)]
pub struct ServerEnd {
    /// Frames to the client.
    pub tx: mpsc::Sender<ServerFrame>,
    /// Frames from the client.
    pub rx: mpsc::Receiver<ClientFrame>,
}

/// Creates a connected channel pair with `capacity` frames per direction.
#[must_use]
pub fn duplex(capacity: usize) -> (ClientEnd, ServerEnd) {
    let (client_tx, server_rx) = mpsc::channel(capacity.max(1));
    let (server_tx, client_rx) = mpsc::channel(capacity.max(1));
    (
        ClientEnd {
            tx: client_tx,
            rx: client_rx,
        },
        ServerEnd {
            tx: server_tx,
            rx: server_rx,
        },
    )
}

/// What a turn subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// Replacement output snapshot.
    Snapshot(AnswerRecord),
    /// Generation finished.
    Done,
    /// The server refused the request.
    Rejected(Rejection),
    /// The channel dropped before the terminal event.
    ConnectionLost,
}

impl TurnEvent {
    /// Returns `true` for every event that ends a subscription.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Snapshot(_))
    }
}

impl From<EventPayload> for TurnEvent {
    fn from(payload: EventPayload) -> Self {
        match payload {
            EventPayload::Response(record) => Self::Snapshot(record),
            EventPayload::Done => Self::Done,
            EventPayload::Error(rejection) => Self::Rejected(rejection),
        }
    }
}

/// Receiving side of a turn subscription.
///
/// Dropping it releases interest in the turn; the server keeps generating.
#[derive(Debug)]
pub struct Subscription {
    turn_id: TurnId,
    rx: mpsc::UnboundedReceiver<TurnEvent>,
}

impl Subscription {
    /// Turn this subscription listens to.
    #[must_use]
    pub const fn turn_id(&self) -> TurnId {
        self.turn_id
    }

    /// Next event, or `None` after the terminal event.
    pub async fn recv(&mut self) -> Option<TurnEvent> {
        self.rx.recv().await
    }
}

type PendingCall = oneshot::Sender<Result<Reply>>;

#[derive(Debug, Default)]
struct Inner {
    subscriptions: HashMap<TurnId, mpsc::UnboundedSender<TurnEvent>>,
    pending: HashMap<CallId, PendingCall>,
    next_call: CallId,
    closed: bool,
}

/// Per-id subscription table plus pending round trips.
#[derive(Debug, Default)]
pub struct Correlator {
    inner: Mutex<Inner>,
}

impl Correlator {
    /// Creates an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the subscriber for `turn_id`.
    ///
    /// Entries whose [`Subscription`] was dropped are pruned first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionLost`] after [`Self::close`], or a
    /// [`Rejection::DuplicateTurn`] if the id already has a live subscriber.
    pub fn subscribe(&self, turn_id: TurnId) -> Result<Subscription> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(Error::ConnectionLost);
        }
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|_, tx| !tx.is_closed());
        let pruned = before - inner.subscriptions.len();
        if pruned > 0 {
            trace!(pruned, "Pruned abandoned subscriptions");
        }
        if inner.subscriptions.contains_key(&turn_id) {
            return Err(Rejection::DuplicateTurn(turn_id).into());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscriptions.insert(turn_id, tx);
        debug!(%turn_id, "Subscribed");
        Ok(Subscription { turn_id, rx })
    }

    /// Drops the subscription for `turn_id`, if any.
    pub fn unsubscribe(&self, turn_id: TurnId) -> bool {
        self.lock().subscriptions.remove(&turn_id).is_some()
    }

    /// Returns `true` if `turn_id` has a live subscriber.
    #[must_use]
    pub fn is_subscribed(&self, turn_id: TurnId) -> bool {
        self.lock()
            .subscriptions
            .get(&turn_id)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn active(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Routes an event to its subscriber.
    ///
    /// Returns `false` when the event was discarded because nobody is
    /// subscribed to its id (or the subscriber went away).
    pub fn dispatch(&self, event: ResponseEvent) -> bool {
        let turn_id = event.component_id;
        let terminal = event.is_terminal();
        let mut inner = self.lock();
        let Some(tx) = inner.subscriptions.get(&turn_id) else {
            trace!(%turn_id, "Discarding event without subscriber");
            return false;
        };
        let delivered = tx.send(event.payload.into()).is_ok();
        if terminal || !delivered {
            inner.subscriptions.remove(&turn_id);
            debug!(%turn_id, terminal, "Released subscription");
        }
        delivered
    }

    /// Starts a round trip and returns its id and the reply receiver.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionLost`] after [`Self::close`].
    pub fn begin_call(&self) -> Result<(CallId, oneshot::Receiver<Result<Reply>>)> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(Error::ConnectionLost);
        }
        let call = inner.next_call;
        inner.next_call += 1;
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(call, tx);
        Ok((call, rx))
    }

    /// Delivers a reply. Returns `false` for an unknown call.
    pub fn resolve(&self, call: CallId, reply: Reply) -> bool {
        let Some(tx) = self.lock().pending.remove(&call) else {
            trace!(call, "Discarding reply for unknown call");
            return false;
        };
        tx.send(Ok(reply)).is_ok()
    }

    /// Forgets a pending call.
    pub fn cancel_call(&self, call: CallId) {
        self.lock().pending.remove(&call);
    }

    /// Returns `true` once the channel was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Marks the channel lost.
    ///
    /// Every live subscriber receives [`TurnEvent::ConnectionLost`] and every
    /// pending call fails with [`Error::ConnectionLost`]. Returns the ids whose
    /// subscriptions were interrupted.
    pub fn close(&self) -> Vec<TurnId> {
        let (subscriptions, pending) = {
            let mut inner = self.lock();
            inner.closed = true;
            (
                std::mem::take(&mut inner.subscriptions),
                std::mem::take(&mut inner.pending),
            )
        };
        for tx in pending.into_values() {
            let _ = tx.send(Err(Error::ConnectionLost));
        }
        let mut interrupted = Vec::with_capacity(subscriptions.len());
        for (turn_id, tx) in subscriptions {
            let _ = tx.send(TurnEvent::ConnectionLost);
            interrupted.push(turn_id);
        }
        debug!(interrupted = interrupted.len(), "Correlator closed");
        interrupted
    }
}
