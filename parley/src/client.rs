//! Session client.
//!
//! [`SessionClient`] owns the client half of a session channel. One reader
//! task applies every server frame to a local mirror of the thread store and
//! then hands turn events to the [`Correlator`], so a subscriber that sees
//! `done` can read the completed turn from the mirror right away.
//!
//! # Example
//!
//! ```rust,ignore
//! let server = Arc::new(SessionServer::new(backend, SessionConfig::default()));
//! let client = SessionClient::connect(&server, UserId::new("ada"));
//!
//! let turn = client
//!     .ask(TaskType::AskQuestion, TaskInput::question("What does `static` mean?"))
//!     .await?
//!     .finish()
//!     .await?;
//! client.submit_feedback(turn.id, Feedback::new(Rating::Helpful)).await?;
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ClientEnd, Correlator, Subscription, TurnEvent};
use crate::error::{Error, Rejection, Result};
use crate::gate::{self, Gate};
use crate::protocol::{
    CallId, ClientFrame, EventPayload, FeedbackRequest, Reply, Request, ResponseEvent, ServerFrame,
};
use crate::server::SessionServer;
use crate::task::{TaskInput, TaskType};
use crate::thread::{ThreadSnapshot, ThreadStore};
use crate::turn::{ConnectionId, Feedback, Turn, TurnId, UserId};

/// Client-side copy of the session state.
#[derive(Debug, Default)]
struct Mirror {
    store: Mutex<ThreadStore>,
    gate: Gate,
    updated: Notify,
}

impl Mirror {
    fn store(&self) -> MutexGuard<'_, ThreadStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_event(&self, event: &ResponseEvent) {
        let id = event.component_id;
        let mut store = self.store();
        match &event.payload {
            EventPayload::Response(record) => {
                if let Err(e) = store.apply_snapshot(id, record.clone()) {
                    debug!(turn_id = %id, error = %e, "Snapshot for turn missing from mirror");
                }
            }
            EventPayload::Done => {
                if let Err(e) = store.complete(id) {
                    debug!(turn_id = %id, error = %e, "Completion for turn missing from mirror");
                }
            }
            EventPayload::Error(_) => {
                store.discard(id);
            }
        }
    }

    fn suggestions_for(&self, turn_id: TurnId) -> Option<Vec<String>> {
        let store = self.store();
        let root_id = store.turn(turn_id)?.root_id();
        let latest = store.latest_completed(root_id).map(|turn| turn.id);
        if latest.is_some_and(|id| id != turn_id) {
            return Some(Vec::new());
        }
        store
            .thread(root_id)
            .filter(|thread| thread.suggestions_from == Some(turn_id))
            .map(|thread| thread.suggestions.clone())
    }

    fn notify(&self) {
        self.updated.notify_waiters();
    }
}

/// Client half of a user session.
#[derive(Debug)]
pub struct SessionClient {
    user_id: UserId,
    connection_id: ConnectionId,
    tx: mpsc::Sender<ClientFrame>,
    correlator: Arc<Correlator>,
    mirror: Arc<Mirror>,
    reader: JoinHandle<()>,
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl SessionClient {
    /// Starts a client over an existing channel half.
    #[must_use]
    pub fn new(user_id: UserId, end: ClientEnd) -> Self {
        let ClientEnd { tx, rx } = end;
        let correlator = Arc::new(Correlator::new());
        let mirror = Arc::new(Mirror::default());
        let reader = tokio::spawn(read_frames(rx, Arc::clone(&correlator), Arc::clone(&mirror)));
        Self {
            user_id,
            connection_id: ConnectionId::new(),
            tx,
            correlator,
            mirror,
            reader,
        }
    }

    /// Opens an in-process connection to `server`.
    #[must_use]
    pub fn connect(server: &Arc<SessionServer>, user_id: UserId) -> Self {
        let (end, _) = server.connect(user_id.clone());
        Self::new(user_id, end)
    }

    /// The user this session belongs to.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Id of this connection.
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Cached gate state: the last state the server reported, closed early
    /// while a local turn awaits completion or feedback.
    #[must_use]
    pub fn gate_open(&self) -> bool {
        self.mirror.gate.is_open() && gate::is_open(&self.mirror.store())
    }

    /// Observes gate states reported by the server.
    #[must_use]
    pub fn watch_gate(&self) -> watch::Receiver<bool> {
        self.mirror.gate.watch()
    }

    /// Returns `true` once the channel was lost.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.correlator.is_closed()
    }

    /// Asks a new root question.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::GateClosed`] if the cached gate is closed,
    /// [`Rejection::InvalidInput`] for incomplete input, or
    /// [`Error::ConnectionLost`] if the channel is gone. The server may still
    /// refuse the request; that arrives as [`TurnEvent::Rejected`].
    pub async fn ask(&self, task: TaskType, input: TaskInput) -> Result<TurnHandle> {
        if !self.gate_open() {
            return Err(Rejection::GateClosed.into());
        }
        let id = TurnId::new();
        self.mirror.store().create_root(id, task, input.clone())?;
        info!(turn_id = %id, %task, "Asking");
        self.start(id, id, task, input).await
    }

    /// Asks a follow-up in the thread rooted at `root_id`.
    ///
    /// The slot is allocated by the server with the mirror's follow-up count as
    /// position token. On a conflict the mirror re-syncs the thread from the
    /// server and the conflict is returned, so the caller can retry.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::OutOfOrderFollowUp`] on a position conflict,
    /// [`Rejection::UnknownThread`] for an unknown root, or
    /// [`Error::ConnectionLost`] if the channel is gone.
    pub async fn follow_up(
        &self,
        root_id: TurnId,
        task: TaskType,
        input: TaskInput,
    ) -> Result<TurnHandle> {
        input.validate(task)?;
        let position = self.mirror.store().follow_up_count(root_id)?;

        let reply = self
            .call(|call| ClientFrame::AllocateFollowUp {
                call,
                root_id,
                expected_position: position,
            })
            .await;
        let new_turn_id = match reply {
            Ok(Reply::Allocated { new_turn_id }) => new_turn_id,
            Ok(other) => return Err(unexpected(&other)),
            Err(e) if e.is_conflict() => {
                warn!(%root_id, position, "Follow-up position conflict, re-syncing thread");
                if let Err(sync_error) = self.fetch_thread(root_id).await {
                    warn!(error = %sync_error, "Thread re-sync failed");
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        {
            // A concurrent re-sync may already have mirrored the reserved slot.
            let mut store = self.mirror.store();
            if store.is_reserved(new_turn_id) {
                store.open_follow_up(new_turn_id, task, input.clone())?;
            } else {
                store.create_follow_up(root_id, position, new_turn_id, task, input.clone())?;
            }
        }
        info!(%root_id, turn_id = %new_turn_id, %task, "Asking follow-up");
        self.start(new_turn_id, root_id, task, input).await
    }

    async fn start(
        &self,
        id: TurnId,
        root_id: TurnId,
        task: TaskType,
        input: TaskInput,
    ) -> Result<TurnHandle> {
        let subscription = match self.correlator.subscribe(id) {
            Ok(subscription) => subscription,
            Err(e) => {
                self.mirror.store().discard(id);
                return Err(e);
            }
        };
        let frame = ClientFrame::Request(Request {
            id,
            task,
            data: input,
            from: self.connection_id,
            user_id: self.user_id.clone(),
        });
        if self.tx.send(frame).await.is_err() {
            self.correlator.unsubscribe(id);
            self.mirror.store().discard(id);
            return Err(Error::ConnectionLost);
        }
        Ok(TurnHandle {
            turn_id: id,
            root_id,
            subscription,
            mirror: Arc::clone(&self.mirror),
        })
    }

    /// Rates a completed turn and returns the recomputed gate.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::UnknownTurn`] if the mirror does not know the
    /// turn, [`Rejection::NotCompleted`] if the server has not completed it,
    /// or [`Error::ConnectionLost`] if the channel is gone.
    pub async fn submit_feedback(&self, turn_id: TurnId, feedback: Feedback) -> Result<bool> {
        let root_id = self
            .mirror
            .store()
            .turn(turn_id)
            .map(Turn::root_id)
            .ok_or(Rejection::UnknownTurn(turn_id))?;
        let request = FeedbackRequest::for_turn(root_id, turn_id, feedback.clone());
        let reply = self
            .call(|call| ClientFrame::Feedback {
                call,
                feedback: request,
            })
            .await?;
        let Reply::Gate { open } = reply else {
            return Err(unexpected(&reply));
        };
        if let Err(e) = self.mirror.store().attach_feedback(turn_id, feedback) {
            debug!(%turn_id, error = %e, "Feedback for turn missing from mirror");
        }
        self.mirror.gate.set(open);
        self.mirror.notify();
        Ok(open)
    }

    /// Asks the server for the gate state and caches it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionLost`] if the channel is gone.
    pub async fn refresh_gate(&self) -> Result<bool> {
        let reply = self.call(|call| ClientFrame::GateQuery { call }).await?;
        let Reply::Gate { open } = reply else {
            return Err(unexpected(&reply));
        };
        self.mirror.gate.set(open);
        Ok(open)
    }

    /// Replaces the mirror's copy of a thread with the server's.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::UnknownThread`] if the server has no such thread,
    /// or [`Error::ConnectionLost`] if the channel is gone.
    pub async fn fetch_thread(&self, root_id: TurnId) -> Result<ThreadSnapshot> {
        let reply = self
            .call(|call| ClientFrame::FetchThread { call, root_id })
            .await?;
        let Reply::Thread { snapshot } = reply else {
            return Err(unexpected(&reply));
        };
        self.mirror.store().replace_thread(snapshot.clone());
        self.mirror.notify();
        Ok(snapshot)
    }

    async fn call(&self, frame: impl FnOnce(CallId) -> ClientFrame) -> Result<Reply> {
        let (call, reply) = self.correlator.begin_call()?;
        if self.tx.send(frame(call)).await.is_err() {
            self.correlator.cancel_call(call);
            return Err(Error::ConnectionLost);
        }
        reply.await.map_err(|_| Error::ConnectionLost)??.into_result()
    }

    /// The mirror's copy of a turn.
    #[must_use]
    pub fn turn(&self, id: TurnId) -> Option<Turn> {
        self.mirror.store().turn(id).cloned()
    }

    /// The mirror's copy of a thread.
    #[must_use]
    pub fn thread(&self, root_id: TurnId) -> Option<ThreadSnapshot> {
        self.mirror.store().snapshot(root_id)
    }

    /// Root ids in creation order.
    #[must_use]
    pub fn roots(&self) -> Vec<TurnId> {
        self.mirror.store().roots()
    }

    /// Suggested questions currently shown for a thread.
    #[must_use]
    pub fn suggestions(&self, root_id: TurnId) -> Vec<String> {
        self.mirror
            .store()
            .thread(root_id)
            .map(|thread| thread.suggestions.clone())
            .unwrap_or_default()
    }

    /// Waits up to `within` for suggestions generated for `turn_id`.
    ///
    /// Returns an empty list on timeout or once the turn is superseded.
    pub async fn wait_for_suggestions(&self, turn_id: TurnId, within: Duration) -> Vec<String> {
        let deadline = tokio::time::sleep(within);
        tokio::pin!(deadline);
        loop {
            let notified = self.mirror.updated.notified();
            if let Some(suggestions) = self.mirror.suggestions_for(turn_id) {
                return suggestions;
            }
            if self.correlator.is_closed() {
                return Vec::new();
            }
            tokio::select! {
                () = notified => {}
                () = &mut deadline => return Vec::new(),
            }
        }
    }
}

fn unexpected(reply: &Reply) -> Error {
    Rejection::invalid_input(format!("unexpected reply: {reply:?}")).into()
}

async fn read_frames(
    mut rx: mpsc::Receiver<ServerFrame>,
    correlator: Arc<Correlator>,
    mirror: Arc<Mirror>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            ServerFrame::Event(event) => {
                mirror.apply_event(&event);
                correlator.dispatch(event);
            }
            ServerFrame::Reply { call, reply } => {
                correlator.resolve(call, reply);
            }
            ServerFrame::Gate { open } => {
                mirror.gate.set(open);
            }
            ServerFrame::Suggestions { turn_id, questions } => {
                let stored = mirror.store().set_suggestions(turn_id, questions);
                debug!(%turn_id, stored, "Received suggestions");
            }
        }
        mirror.notify();
    }

    {
        let mut store = mirror.store();
        for id in store.open_turns() {
            store.mark_stalled(id);
        }
    }
    let interrupted = correlator.close();
    mirror.notify();
    warn!(interrupted = interrupted.len(), "Session channel lost");
}

/// A turn in flight.
#[derive(Debug)]
pub struct TurnHandle {
    turn_id: TurnId,
    root_id: TurnId,
    subscription: Subscription,
    mirror: Arc<Mirror>,
}

impl TurnHandle {
    /// Id of the turn.
    #[must_use]
    pub const fn id(&self) -> TurnId {
        self.turn_id
    }

    /// Root of the turn's thread.
    #[must_use]
    pub const fn root_id(&self) -> TurnId {
        self.root_id
    }

    /// Next event, or `None` after the terminal one.
    pub async fn next(&mut self) -> Option<TurnEvent> {
        self.subscription.recv().await
    }

    /// Events of the turn as a stream ending after the terminal event.
    pub fn events(mut self) -> impl Stream<Item = TurnEvent> {
        async_stream::stream! {
            while let Some(event) = self.subscription.recv().await {
                yield event;
            }
        }
    }

    /// Waits for the terminal event and returns the completed turn.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection, or [`Error::ConnectionLost`] if the
    /// channel dropped first.
    pub async fn finish(mut self) -> Result<Turn> {
        while let Some(event) = self.next().await {
            match event {
                TurnEvent::Snapshot(_) => {}
                TurnEvent::Done => {
                    return self
                        .mirror
                        .store()
                        .turn(self.turn_id)
                        .cloned()
                        .ok_or_else(|| Rejection::UnknownTurn(self.turn_id).into());
                }
                TurnEvent::Rejected(rejection) => return Err(rejection.into()),
                TurnEvent::ConnectionLost => return Err(Error::ConnectionLost),
            }
        }
        Err(Error::ConnectionLost)
    }
}
