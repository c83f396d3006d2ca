//! End-to-end session tests: a server and clients over the in-process channel,
//! generating with the scripted backend.

#![allow(clippy::unwrap_used, clippy::panic, clippy::clone_on_ref_ptr)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use futures::StreamExt;
use parley::prelude::*;
use parley::protocol::FeedbackRequest;

const SUGGESTION_END: &str = "// [end-suggestions]";

/// Answers every turn prompt with `answer` and every suggestion prompt with
/// a numbered list.
fn backend(answer: &'static str) -> ScriptedBackend {
    ScriptedBackend::new().with_responder(move |request| {
        if request.stop.markers().iter().any(|m| m == SUGGESTION_END) {
            Script::chunks([
                " What is `NULL`?\n2. How do I free memory?\n",
                "3. What is a dangling pointer?\n4. never shown",
            ])
        } else {
            Script::text(answer, 7)
        }
    })
}

/// Logs with `RUST_LOG=parley=debug cargo test -- --nocapture`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn server_with(backend: ScriptedBackend, config: SessionConfig) -> Arc<SessionServer> {
    init_tracing();
    Arc::new(SessionServer::new(Arc::new(backend), config))
}

fn quiet_config() -> SessionConfig {
    SessionConfig::default().with_suggestions(false)
}

const ANSWER: &str = "A pointer holds an address, see `&x`.\"\n// [end-question-answer]\n";

async fn ask_and_finish(client: &SessionClient, question: &str) -> anyhow::Result<Turn> {
    let turn = client
        .ask(TaskType::AskQuestion, TaskInput::question(question))
        .await?
        .finish()
        .await?;
    Ok(turn)
}

mod gate {
    use super::*;

    /// A second root is refused until the first answer is rated.
    #[tokio::test]
    async fn root_questions_wait_for_feedback() -> anyhow::Result<()> {
        let server = server_with(backend(ANSWER), quiet_config());
        let client = SessionClient::connect(&server, UserId::new("ada"));

        let first = ask_and_finish(&client, "What is a pointer?").await?;
        assert!(first.state.is_completed());
        assert!(!client.gate_open());

        let refused = client
            .ask(TaskType::AskQuestion, TaskInput::question("And arrays?"))
            .await;
        assert!(refused.unwrap_err().is_gate_closed());

        let open = client
            .submit_feedback(first.id, Feedback::new(Rating::Helpful))
            .await?;
        assert!(open);
        assert!(client.refresh_gate().await?);

        let second = ask_and_finish(&client, "And arrays?").await?;
        assert_ne!(second.id, first.id);
        assert_eq!(client.roots(), [first.id, second.id]);
        Ok(())
    }

    /// The server enforces the gate even when a client's cache says open.
    #[tokio::test]
    async fn server_refuses_root_from_stale_client() -> anyhow::Result<()> {
        let server = server_with(backend(ANSWER), quiet_config());
        let user = UserId::new("ada");
        let first_client = SessionClient::connect(&server, user.clone());
        let second_client = SessionClient::connect(&server, user.clone());

        ask_and_finish(&first_client, "What is a pointer?").await?;
        assert!(second_client.gate_open(), "second client has not heard yet");

        let handle = second_client
            .ask(TaskType::AskQuestion, TaskInput::question("And arrays?"))
            .await?;
        let id = handle.id();
        let err = handle.finish().await.unwrap_err();
        assert!(err.is_gate_closed());
        assert!(second_client.turn(id).is_none(), "refused root is discarded");
        assert!(!server.user(&user).await.gate_open());
        Ok(())
    }

    /// Rating is rejected before completion.
    #[tokio::test]
    async fn feedback_requires_completion() -> anyhow::Result<()> {
        let slow = ScriptedBackend::new()
            .with_delay(Duration::from_millis(20))
            .with_script(Script::text(ANSWER, 4));
        let server = server_with(slow, quiet_config());
        let client = SessionClient::connect(&server, UserId::new("ada"));

        let handle = client
            .ask(TaskType::AskQuestion, TaskInput::question("What is a pointer?"))
            .await?;
        let err = client
            .submit_feedback(handle.id(), Feedback::new(Rating::Helpful))
            .await
            .unwrap_err();
        assert_eq!(err.as_rejection(), Some(&Rejection::NotCompleted(handle.id())));
        handle.finish().await?;
        Ok(())
    }
}

mod follow_ups {
    use super::*;

    #[tokio::test]
    async fn follow_up_prompt_carries_the_transcript() -> anyhow::Result<()> {
        let scripted = Arc::new(backend(ANSWER));
        let server = Arc::new(SessionServer::new(scripted.clone(), quiet_config()));
        let client = SessionClient::connect(&server, UserId::new("ada"));

        let root = ask_and_finish(&client, "What is a pointer?").await?;
        let follow = client
            .follow_up(root.id, TaskType::AskQuestion, TaskInput::question("Show an example"))
            .await?
            .finish()
            .await?;
        assert_eq!(follow.parent_id, Some(root.id));

        let requests = scripted.requests().await;
        let prompt = &requests.last().context("no follow-up request")?.prompt;
        let earlier = prompt
            .find("What is a pointer?")
            .context("root question missing")?;
        let later = prompt.find("Show an example").context("follow-up missing")?;
        assert!(earlier < later);
        assert!(prompt.contains("A pointer holds an address"));

        let thread = client.thread(root.id).context("thread missing")?;
        assert_eq!(thread.thread.follow_ups, [follow.id]);
        Ok(())
    }

    /// Follow-ups are not gated: an unrated root still accepts them.
    #[tokio::test]
    async fn follow_ups_bypass_the_gate() -> anyhow::Result<()> {
        let server = server_with(backend(ANSWER), quiet_config());
        let client = SessionClient::connect(&server, UserId::new("ada"));

        let root = ask_and_finish(&client, "What is a pointer?").await?;
        assert!(!client.gate_open());
        let follow = client
            .follow_up(root.id, TaskType::AskQuestion, TaskInput::question("Why?"))
            .await?
            .finish()
            .await?;
        assert!(follow.state.is_completed());
        Ok(())
    }

    /// Two connections race for the same slot; the loser re-syncs and retries.
    #[tokio::test]
    async fn stale_position_conflicts_then_resyncs() -> anyhow::Result<()> {
        let server = server_with(backend(ANSWER), quiet_config());
        let user = UserId::new("ada");
        let first_client = SessionClient::connect(&server, user.clone());
        let second_client = SessionClient::connect(&server, user.clone());

        let root = ask_and_finish(&first_client, "What is a pointer?").await?;
        second_client.fetch_thread(root.id).await?;

        let winner = first_client
            .follow_up(root.id, TaskType::AskQuestion, TaskInput::question("first"))
            .await?
            .finish()
            .await?;

        let Err(conflict) = second_client
            .follow_up(root.id, TaskType::AskQuestion, TaskInput::question("second"))
            .await
        else {
            bail!("stale position was accepted");
        };
        assert!(conflict.is_conflict());
        assert_eq!(
            conflict.as_rejection(),
            Some(&Rejection::OutOfOrderFollowUp {
                root_id: root.id,
                expected: 0,
                actual: 1
            })
        );

        let retried = second_client
            .follow_up(root.id, TaskType::AskQuestion, TaskInput::question("second"))
            .await?
            .finish()
            .await?;
        let snapshot = server
            .user(&user)
            .await
            .snapshot(root.id)
            .await
            .context("server thread missing")?;
        assert_eq!(snapshot.thread.follow_ups, [winner.id, retried.id]);
        Ok(())
    }

    /// Two follow-ups racing for one position on the same client: the winner
    /// still streams after the loser's re-sync rewrites the mirror.
    #[tokio::test]
    async fn concurrent_follow_ups_keep_the_winner() -> anyhow::Result<()> {
        let server = server_with(backend(ANSWER), quiet_config());
        let user = UserId::new("ada");
        let client = SessionClient::connect(&server, user.clone());
        let root = ask_and_finish(&client, "What is a pointer?").await?;

        let (left, right) = tokio::join!(
            client.follow_up(root.id, TaskType::AskQuestion, TaskInput::question("left")),
            client.follow_up(root.id, TaskType::AskQuestion, TaskInput::question("right")),
        );
        let (handle, conflict) = match (left, right) {
            (Ok(handle), Err(conflict)) | (Err(conflict), Ok(handle)) => (handle, conflict),
            (Ok(_), Ok(_)) => bail!("both follow-ups took the same position"),
            (Err(a), Err(b)) => bail!("both follow-ups failed: {a}, {b}"),
        };
        assert!(conflict.is_conflict());

        let winner = handle.finish().await?;
        assert!(winner.state.is_completed());

        let retried = client
            .follow_up(root.id, TaskType::AskQuestion, TaskInput::question("again"))
            .await?
            .finish()
            .await?;
        let snapshot = server
            .user(&user)
            .await
            .snapshot(root.id)
            .await
            .context("server thread missing")?;
        assert_eq!(snapshot.thread.follow_ups, [winner.id, retried.id]);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_thread_is_rejected() {
        let server = server_with(backend(ANSWER), quiet_config());
        let client = SessionClient::connect(&server, UserId::new("ada"));
        let missing = TurnId::new();
        let err = client
            .follow_up(missing, TaskType::AskQuestion, TaskInput::question("?"))
            .await
            .unwrap_err();
        assert_eq!(err.as_rejection(), Some(&Rejection::UnknownThread(missing)));
    }
}

mod streaming {
    use super::*;

    /// Snapshots grow monotonically and the last one equals the final record.
    #[tokio::test]
    async fn explain_code_streams_growing_snapshots() -> anyhow::Result<()> {
        let answer = concat!(
            "Prints a greeting.\"\n",
            "\"code\": [\n",
            "  [\"#include <stdio.h>\", \"makes `printf` available\"],\n",
            "  [\"int main(void) {\", \"program entry point\"],\n",
            "  [\"    printf(\\\"hi\\\\n\\\");\", \"writes the text\"],\n",
            "  [\"}\"],\n",
            "]\n",
            "// [end-code-explanation]\n",
            "// [code]: \"leaked\"",
        );
        let server = server_with(
            ScriptedBackend::new().with_script(Script::text(answer, 5)),
            quiet_config(),
        );
        let client = SessionClient::connect(&server, UserId::new("ada"));

        let handle = client
            .ask(
                TaskType::ExplainCode,
                TaskInput::code("#include <stdio.h>\nint main(void) {\n    printf(\"hi\\n\");\n}"),
            )
            .await?;
        let id = handle.id();
        let events: Vec<TurnEvent> = handle.events().collect().await;
        assert_eq!(events.last(), Some(&TurnEvent::Done));

        let snapshots: Vec<&AnswerRecord> = events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::Snapshot(record) => Some(record),
                _ => None,
            })
            .collect();
        assert!(snapshots.len() > 1);
        for pair in snapshots.windows(2) {
            assert_ne!(pair[0], pair[1], "unchanged snapshots are not resent");
            let lines = |r: &AnswerRecord| r.code_parts.first().map_or(0, |p| p.lines.len());
            assert!(lines(pair[0]) <= lines(pair[1]));
        }

        let turn = client.turn(id).context("turn missing")?;
        let output = turn.output.context("no output")?;
        assert_eq!(&output, *snapshots.last().context("no snapshot")?);
        assert_eq!(output.answer.as_deref(), Some("Prints a greeting."));
        assert_eq!(output.code_parts[0].lines.len(), 4);
        assert!(!output.raw.contains("leaked"));
        Ok(())
    }

    /// A backend failure mid-stream still completes the turn, flagged malformed.
    #[tokio::test]
    async fn backend_failure_degrades_the_turn() -> anyhow::Result<()> {
        let failing = ScriptedBackend::new().with_script(
            Script::chunks(["Pointers store ", "addr"]).then_fail(BackendError::stream("reset")),
        );
        let server = server_with(failing, quiet_config());
        let client = SessionClient::connect(&server, UserId::new("ada"));

        let turn = ask_and_finish(&client, "What is a pointer?").await?;
        let output = turn.output.context("no output")?;
        assert!(output.malformed);
        assert_eq!(output.raw, "Pointers store addr");
        assert_eq!(output.display_text(), "Pointers store addr");

        assert!(
            client
                .submit_feedback(turn.id, Feedback::new(Rating::NotHelpful).with_reason("cut off"))
                .await?
        );
        Ok(())
    }
}

mod suggestions {
    use super::*;

    #[tokio::test]
    async fn completed_turn_receives_suggestions() -> anyhow::Result<()> {
        let server = server_with(backend(ANSWER), SessionConfig::default());
        let client = SessionClient::connect(&server, UserId::new("ada"));

        let turn = ask_and_finish(&client, "What is a pointer?").await?;
        let suggestions = client
            .wait_for_suggestions(turn.id, Duration::from_secs(5))
            .await;
        assert_eq!(
            suggestions,
            [
                "What is `NULL`?",
                "How do I free memory?",
                "What is a dangling pointer?"
            ]
        );
        assert_eq!(client.suggestions(turn.id), suggestions);
        Ok(())
    }

    #[tokio::test]
    async fn disabled_suggestions_never_arrive() -> anyhow::Result<()> {
        let server = server_with(backend(ANSWER), quiet_config());
        let client = SessionClient::connect(&server, UserId::new("ada"));
        let turn = ask_and_finish(&client, "What is a pointer?").await?;
        let suggestions = client
            .wait_for_suggestions(turn.id, Duration::from_millis(50))
            .await;
        assert!(suggestions.is_empty());
        Ok(())
    }
}

mod channel {
    use super::*;

    /// Events for ids nobody subscribed to are dropped without side effects.
    #[tokio::test]
    async fn unknown_ids_are_discarded() -> anyhow::Result<()> {
        let (client_end, server_end) = duplex(8);
        let client = SessionClient::new(UserId::new("ada"), client_end);

        let stranger = TurnId::new();
        server_end
            .tx
            .send(ServerFrame::Event(ResponseEvent::response(
                stranger,
                AnswerRecord::raw_only("not yours"),
            )))
            .await?;
        server_end
            .tx
            .send(ServerFrame::Event(ResponseEvent::done(stranger)))
            .await?;
        server_end.tx.send(ServerFrame::Gate { open: true }).await?;

        let mut gate = client.watch_gate();
        let _ = tokio::time::timeout(Duration::from_millis(50), gate.changed()).await;
        assert!(client.turn(stranger).is_none());
        assert!(!client.is_disconnected());
        drop(server_end.rx);
        Ok(())
    }

    /// Losing the channel mid-stream ends the turn locally as stalled.
    #[tokio::test]
    async fn connection_lost_mid_stream() -> anyhow::Result<()> {
        let (client_end, mut server_end) = duplex(8);
        let client = SessionClient::new(UserId::new("ada"), client_end);

        let mut handle = client
            .ask(TaskType::AskQuestion, TaskInput::question("What is a pointer?"))
            .await?;
        let Some(ClientFrame::Request(request)) = server_end.rx.recv().await else {
            bail!("expected a request frame");
        };
        assert_eq!(request.id, handle.id());
        assert_eq!(request.user_id, *client.user_id());

        server_end
            .tx
            .send(ServerFrame::Event(ResponseEvent::response(
                request.id,
                extract(TaskType::AskQuestion, "A pointer"),
            )))
            .await?;
        assert!(matches!(handle.next().await, Some(TurnEvent::Snapshot(_))));

        drop(server_end);
        assert_eq!(handle.next().await, Some(TurnEvent::ConnectionLost));
        assert_eq!(handle.next().await, None);

        let turn = client.turn(request.id).context("turn missing")?;
        assert_eq!(turn.state, TurnState::Stalled);
        assert!(client.is_disconnected());
        assert!(matches!(
            client
                .follow_up(request.id, TaskType::AskQuestion, TaskInput::question("?"))
                .await,
            Err(Error::ConnectionLost)
        ));
        Ok(())
    }

    /// Feedback for a follow-up names its root.
    #[tokio::test]
    async fn follow_up_feedback_names_root() -> anyhow::Result<()> {
        let server = server_with(backend(ANSWER), quiet_config());
        let client = SessionClient::connect(&server, UserId::new("ada"));
        let root = ask_and_finish(&client, "What is a pointer?").await?;
        client
            .submit_feedback(root.id, Feedback::new(Rating::Helpful))
            .await?;
        let follow = client
            .follow_up(root.id, TaskType::AskQuestion, TaskInput::question("More?"))
            .await?
            .finish()
            .await?;

        let request = FeedbackRequest::for_turn(root.id, follow.id, Feedback::new(Rating::Somewhat));
        assert_eq!(request.follow_up_id, Some(follow.id));
        assert!(!client.gate_open(), "unrated follow-up closes the gate");
        assert!(
            client
                .submit_feedback(follow.id, Feedback::new(Rating::Somewhat))
                .await?
        );
        assert!(client.gate_open());
        Ok(())
    }
}
