//! Session server.
//!
//! The server owns, per user, the authoritative [`ThreadStore`] and [`Gate`].
//! Each connection is served by one task that reads [`ClientFrame`]s in order:
//! round trips are answered inline, and every accepted request spawns a turn
//! task that runs the generation and relays its output.
//!
//! A turn task:
//!
//! 1. assembles the prompt from the turn and its thread transcript
//! 2. streams the backend output through the stop-marker truncator
//! 3. re-extracts the record over the whole visible text after each chunk and
//!    sends a `response` event whenever it changed
//! 4. completes the turn, recomputes the gate and sends it, then sends `done`
//! 5. optionally generates follow-up suggestions
//!
//! Backend failures degrade the turn to a `malformed` record; the turn still
//! completes so feedback can reopen the gate. Generation is never cancelled: if
//! the client goes away the result is still stored.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::backend::{CompletionRequest, SharedBackend};
use crate::channel::{ClientEnd, ServerEnd, duplex};
use crate::config::SessionConfig;
use crate::error::Rejection;
use crate::extract::{AnswerRecord, extract};
use crate::gate::Gate;
use crate::prompt::TemplateRegistry;
use crate::protocol::{CallId, ClientFrame, FeedbackRequest, Reply, Request, ResponseEvent, ServerFrame};
use crate::suggest::SuggestionGenerator;
use crate::task::{TaskInput, TaskType};
use crate::thread::{ThreadSnapshot, ThreadStore};
use crate::truncate::StreamTruncator;
use crate::turn::{TurnId, UserId};

/// Server-side state of one user.
#[derive(Debug, Default)]
pub struct UserSession {
    store: Mutex<ThreadStore>,
    gate: Gate,
}

impl UserSession {
    /// Current gate state.
    #[must_use]
    pub fn gate_open(&self) -> bool {
        self.gate.is_open()
    }

    /// Observes gate changes.
    #[must_use]
    pub fn watch_gate(&self) -> tokio::sync::watch::Receiver<bool> {
        self.gate.watch()
    }

    /// Copies one thread.
    pub async fn snapshot(&self, root_id: TurnId) -> Option<ThreadSnapshot> {
        self.store.lock().await.snapshot(root_id)
    }

    /// Runs `f` against the store.
    pub async fn with_store<R>(&self, f: impl FnOnce(&ThreadStore) -> R) -> R {
        f(&*self.store.lock().await)
    }
}

/// Multi-user session server.
pub struct SessionServer {
    backend: SharedBackend,
    templates: Arc<TemplateRegistry>,
    config: SessionConfig,
    suggestions: Option<SuggestionGenerator>,
    users: Mutex<HashMap<UserId, Arc<UserSession>>>,
}

impl std::fmt::Debug for SessionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionServer")
            .field("backend", &self.backend.backend_name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionServer {
    /// Creates a server with the built-in templates.
    #[must_use]
    pub fn new(backend: SharedBackend, config: SessionConfig) -> Self {
        Self::with_templates(backend, config, Arc::new(TemplateRegistry::builtin()))
    }

    /// Creates a server with custom templates.
    #[must_use]
    pub fn with_templates(
        backend: SharedBackend,
        config: SessionConfig,
        templates: Arc<TemplateRegistry>,
    ) -> Self {
        let suggestions = (config.suggestions_enabled && templates.suggestions().is_some())
            .then(|| SuggestionGenerator::new(Arc::clone(&backend), Arc::clone(&templates), &config));
        Self {
            backend,
            templates,
            config,
            suggestions,
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Session configuration.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns (creating if needed) the state of `user_id`.
    pub async fn user(&self, user_id: &UserId) -> Arc<UserSession> {
        Arc::clone(self.users.lock().await.entry(user_id.clone()).or_default())
    }

    /// Opens an in-process connection for `user_id`.
    ///
    /// Returns the client half and the handle of the connection task.
    pub fn connect(self: &Arc<Self>, user_id: UserId) -> (ClientEnd, JoinHandle<()>) {
        let (client, server) = duplex(self.config.channel_capacity);
        let handle = tokio::spawn(Arc::clone(self).serve(user_id, server));
        (client, handle)
    }

    /// Serves one connection until the client half closes.
    pub async fn serve(self: Arc<Self>, user_id: UserId, end: ServerEnd) {
        let ServerEnd { tx, mut rx } = end;
        let session = self.user(&user_id).await;
        info!(user_id = %user_id, "Connection opened");

        while let Some(frame) = rx.recv().await {
            match frame {
                ClientFrame::Request(request) => {
                    self.handle_request(&user_id, &session, &tx, request).await;
                }
                ClientFrame::AllocateFollowUp {
                    call,
                    root_id,
                    expected_position,
                } => {
                    let reply = Self::allocate_follow_up(&session, root_id, expected_position).await;
                    send(&tx, reply_frame(call, reply)).await;
                }
                ClientFrame::Feedback { call, feedback } => {
                    let reply = Self::submit_feedback(&session, &feedback).await;
                    send(&tx, reply_frame(call, reply)).await;
                }
                ClientFrame::GateQuery { call } => {
                    let open = session.gate.is_open();
                    send(&tx, reply_frame(call, Ok(Reply::Gate { open }))).await;
                }
                ClientFrame::FetchThread { call, root_id } => {
                    let reply = session
                        .snapshot(root_id)
                        .await
                        .map(|snapshot| Reply::Thread { snapshot })
                        .ok_or(Rejection::UnknownThread(root_id));
                    send(&tx, reply_frame(call, reply)).await;
                }
            }
        }
        info!(user_id = %user_id, "Connection closed");
    }

    async fn handle_request(
        self: &Arc<Self>,
        user_id: &UserId,
        session: &Arc<UserSession>,
        tx: &mpsc::Sender<ServerFrame>,
        request: Request,
    ) {
        let turn_id = request.id;
        match self.open_turn(user_id, session, request).await {
            Ok((task, gate_changed)) => {
                if let Some(open) = gate_changed {
                    send(tx, ServerFrame::Gate { open }).await;
                }
                let span = info_span!("turn", turn_id = %turn_id, task = %task);
                tokio::spawn(
                    Arc::clone(self)
                        .run_turn(Arc::clone(session), tx.clone(), turn_id, task)
                        .instrument(span),
                );
            }
            Err(rejection) => {
                warn!(%turn_id, %rejection, "Request rejected");
                send(tx, ServerFrame::Event(ResponseEvent::error(turn_id, rejection))).await;
            }
        }
    }

    /// Opens the turn for an incoming request.
    ///
    /// A request whose id is a reserved follow-up slot opens that slot; any
    /// other request is a root and must pass the gate. Returns the task and,
    /// if the gate changed, its new state.
    async fn open_turn(
        &self,
        user_id: &UserId,
        session: &UserSession,
        request: Request,
    ) -> Result<(TaskType, Option<bool>), Rejection> {
        if &request.user_id != user_id {
            return Err(Rejection::invalid_input(format!(
                "request for user {} on a connection of user {user_id}",
                request.user_id
            )));
        }
        let Request { id, task, data, .. } = request;
        let mut store = session.store.lock().await;

        let reserved = store.is_reserved(id);
        if reserved {
            store.open_follow_up(id, task, data)?;
        } else {
            session.gate.check_root()?;
            store.create_root(id, task, data)?;
        }
        let was_open = session.gate.is_open();
        let open = session.gate.recompute(&store);
        info!(turn_id = %id, %task, follow_up = reserved, "Turn opened");
        Ok((task, (open != was_open).then_some(open)))
    }

    async fn allocate_follow_up(
        session: &UserSession,
        root_id: TurnId,
        expected_position: usize,
    ) -> Result<Reply, Rejection> {
        let new_turn_id = TurnId::new();
        session
            .store
            .lock()
            .await
            .reserve_follow_up(root_id, expected_position, new_turn_id)?;
        Ok(Reply::Allocated { new_turn_id })
    }

    async fn submit_feedback(
        session: &UserSession,
        feedback: &FeedbackRequest,
    ) -> Result<Reply, Rejection> {
        let mut store = session.store.lock().await;
        let target = feedback.target();
        let turn = store.turn(target).ok_or(Rejection::UnknownTurn(target))?;
        if turn.root_id() != feedback.response_id {
            return Err(Rejection::UnknownTurn(target));
        }
        store.attach_feedback(target, feedback.feedback())?;
        let open = session.gate.recompute(&store);
        info!(turn_id = %target, rating = %feedback.rating, gate_open = open, "Feedback recorded");
        Ok(Reply::Gate { open })
    }

    async fn run_turn(
        self: Arc<Self>,
        session: Arc<UserSession>,
        tx: mpsc::Sender<ServerFrame>,
        turn_id: TurnId,
        task: TaskType,
    ) {
        let prompt = {
            let store = session.store.lock().await;
            let input = store
                .turn(turn_id)
                .map_or_else(TaskInput::default, |turn| turn.input.clone());
            store
                .ancestors(turn_id)
                .and_then(|ancestors| self.templates.assemble(task, &input, &ancestors))
        };

        let record = match prompt {
            Ok(prompt) => {
                let request = CompletionRequest {
                    prompt: prompt.text,
                    stop: prompt.stop.clone(),
                    max_tokens: self.config.max_tokens,
                    temperature: self.config.temperature,
                };
                let truncator = StreamTruncator::new(prompt.stop);
                self.stream_answer(&session, &tx, turn_id, task, &request, truncator)
                    .await
            }
            Err(rejection) => {
                warn!(%rejection, "Prompt assembly failed");
                degraded(task, "")
            }
        };
        publish(&session, &tx, turn_id, record).await;

        let completed = {
            let mut store = session.store.lock().await;
            let completed = store.complete(turn_id).ok().cloned();
            let open = session.gate.recompute(&store);
            completed.map(|turn| (turn, open))
        };
        let Some((turn, open)) = completed else {
            send(&tx, ServerFrame::Event(ResponseEvent::done(turn_id))).await;
            return;
        };
        // The gate goes out first so a client that rates right after `done`
        // never receives a stale state afterwards.
        send(&tx, ServerFrame::Gate { open }).await;
        send(&tx, ServerFrame::Event(ResponseEvent::done(turn_id))).await;
        info!(malformed = turn.output.as_ref().is_some_and(|o| o.malformed), "Turn completed");

        let Some(generator) = &self.suggestions else {
            return;
        };
        if turn.output.as_ref().is_none_or(AnswerRecord::is_unstructured) {
            debug!("Skipping suggestions for unstructured answer");
            return;
        }
        match generator.generate(&turn).await {
            Ok(questions) if !questions.is_empty() => {
                let stored = session
                    .store
                    .lock()
                    .await
                    .set_suggestions(turn_id, questions.clone());
                if stored {
                    send(&tx, ServerFrame::Suggestions { turn_id, questions }).await;
                }
            }
            Ok(_) => debug!("No suggestions generated"),
            Err(e) => warn!(error = %e, "Suggestion generation failed"),
        }
    }

    /// Streams the answer and returns the final record.
    ///
    /// Intermediate records are published as they change; the returned one is
    /// published by the caller.
    async fn stream_answer(
        &self,
        session: &UserSession,
        tx: &mpsc::Sender<ServerFrame>,
        turn_id: TurnId,
        task: TaskType,
        request: &CompletionRequest,
        mut truncator: StreamTruncator,
    ) -> AnswerRecord {
        let mut stream = match self.backend.generate(request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, backend = self.backend.backend_name(), "Backend failed to start");
                return degraded(task, "");
            }
        };

        let mut last: Option<AnswerRecord> = None;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(error = %e, "Backend stream failed");
                    return degraded(task, truncator.visible());
                }
            };
            truncator.push(&chunk);
            let record = extract(task, truncator.visible());
            if last.as_ref() != Some(&record) {
                publish(session, tx, turn_id, record.clone()).await;
                last = Some(record);
            }
            if truncator.is_cut() {
                debug!(cut_at = truncator.cut_at(), "Stop marker reached");
                break;
            }
        }
        last.unwrap_or_else(|| extract(task, truncator.visible()))
    }
}

fn degraded(task: TaskType, visible: &str) -> AnswerRecord {
    let mut record = extract(task, visible);
    record.malformed = true;
    record
}

/// Stores a snapshot and sends it, unless it equals the stored one or the
/// turn no longer accepts snapshots.
async fn publish(
    session: &UserSession,
    tx: &mpsc::Sender<ServerFrame>,
    turn_id: TurnId,
    record: AnswerRecord,
) {
    let applied = {
        let mut store = session.store.lock().await;
        let unchanged = store
            .turn(turn_id)
            .and_then(|turn| turn.output.as_ref())
            .is_some_and(|output| output == &record);
        !unchanged && store.apply_snapshot(turn_id, record.clone()).unwrap_or(false)
    };
    if applied {
        send(tx, ServerFrame::Event(ResponseEvent::response(turn_id, record))).await;
    }
}

fn reply_frame(call: CallId, reply: Result<Reply, Rejection>) -> ServerFrame {
    let reply = reply.unwrap_or_else(|rejection| {
        debug!(call, %rejection, "Round trip rejected");
        rejection.into()
    });
    ServerFrame::Reply { call, reply }
}

async fn send(tx: &mpsc::Sender<ServerFrame>, frame: ServerFrame) {
    if tx.send(frame).await.is_err() {
        debug!("Client gone, frame dropped");
    }
}
