//! Interactive chat session.
//!
//! Plain lines ask a root question with the current task; slash commands
//! follow up, rate answers, switch tasks and threads. The server runs in the
//! same process, connected over the in-process session channel.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parley::prelude::*;
use parley::task::InputField;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::error::{CliError, Result};

const HELP: &str = "\
Commands:
  <text>                 ask a new question with the current task
  /f <text>              follow up in the current thread
  /pick <n>              follow up with suggestion <n>
  /rate <rating> [why]   rate the last answer (helpful, somewhat, not_helpful)
  /task <type>           switch task (ask-question, ask-from-code, explain-code, fix-code, write-code)
  /code <path>           load code for code tasks
  /code                  forget the loaded code
  /threads               list threads
  /switch <n>            make thread <n> current
  /gate                  show whether a new question may be asked
  /help                  show this help
  /quit                  leave";

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask a root question.
    Ask(String),
    /// Follow up in the current thread.
    FollowUp(String),
    /// Follow up with a numbered suggestion (1-based).
    Pick(usize),
    /// Rate the last answer.
    Rate {
        /// The rating.
        rating: Rating,
        /// Optional reason.
        reason: Option<String>,
    },
    /// Switch the task type.
    Task(TaskType),
    /// Load code from a file.
    Code(PathBuf),
    /// Forget the loaded code.
    ClearCode,
    /// List threads.
    Threads,
    /// Make a thread current (1-based).
    Switch(usize),
    /// Show the gate.
    Gate,
    /// Show help.
    Help,
    /// Leave the session.
    Quit,
    /// Blank line.
    Nothing,
}

impl Command {
    /// Parses one input line.
    ///
    /// # Errors
    ///
    /// Returns a usage message for unknown commands or bad arguments.
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Nothing);
        }
        let Some(command) = line.strip_prefix('/') else {
            return Ok(Self::Ask(line.to_string()));
        };

        let (name, rest) = command
            .split_once(char::is_whitespace)
            .map_or((command, ""), |(name, rest)| (name, rest.trim()));

        match name {
            "f" | "follow" => non_empty(rest, "/f needs a question").map(Self::FollowUp),
            "pick" => index(rest).map(Self::Pick),
            "rate" => {
                let (rating, reason) = rest
                    .split_once(char::is_whitespace)
                    .map_or((rest, None), |(r, why)| (r, Some(why.trim().to_string())));
                Ok(Self::Rate {
                    rating: parse_rating(rating)?,
                    reason: reason.filter(|r| !r.is_empty()),
                })
            }
            "task" => rest
                .parse::<TaskType>()
                .map(Self::Task)
                .map_err(|e| e.to_string()),
            "code" if rest.is_empty() => Ok(Self::ClearCode),
            "code" => Ok(Self::Code(PathBuf::from(rest))),
            "threads" => Ok(Self::Threads),
            "switch" => index(rest).map(Self::Switch),
            "gate" => Ok(Self::Gate),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" | "q" => Ok(Self::Quit),
            other => Err(format!("unknown command '/{other}', try /help")),
        }
    }
}

fn non_empty(text: &str, message: &str) -> std::result::Result<String, String> {
    if text.is_empty() {
        Err(message.to_string())
    } else {
        Ok(text.to_string())
    }
}

fn index(text: &str) -> std::result::Result<usize, String> {
    match text.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("expected a number from 1, got '{text}'")),
    }
}

/// Parses a rating word.
///
/// # Errors
///
/// Returns a usage message for anything else.
pub fn parse_rating(text: &str) -> std::result::Result<Rating, String> {
    match text {
        "helpful" | "+" | "good" => Ok(Rating::Helpful),
        "somewhat" | "~" => Ok(Rating::Somewhat),
        "not_helpful" | "not-helpful" | "-" | "bad" => Ok(Rating::NotHelpful),
        other => Err(format!(
            "unknown rating '{other}', use helpful, somewhat or not_helpful"
        )),
    }
}

/// Interactive session state.
pub struct Chat {
    client: SessionClient,
    task: TaskType,
    code: Option<String>,
    current: Option<TurnId>,
    last: Option<TurnId>,
    suggestions_wait: Option<Duration>,
    prompt: String,
}

impl std::fmt::Debug for Chat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chat")
            .field("task", &self.task)
            .field("current", &self.current)
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}

impl Chat {
    /// Connects a client for `user` to `server`.
    pub fn new(server: &Arc<SessionServer>, user: UserId, suggestions_wait: Option<Duration>) -> Self {
        Self {
            client: SessionClient::connect(server, user),
            task: TaskType::AskQuestion,
            code: None,
            current: None,
            last: None,
            suggestions_wait,
            prompt: "> ".to_string(),
        }
    }

    /// Sets the starting task.
    #[must_use]
    pub const fn with_task(mut self, task: TaskType) -> Self {
        self.task = task;
        self
    }

    /// Sets the loaded code.
    #[must_use]
    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    /// Sets the input prompt.
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Reads commands from stdin until `/quit` or end of input.
    ///
    /// # Errors
    ///
    /// Returns an error if stdin fails or the session channel is lost.
    pub async fn run(&mut self) -> Result<()> {
        println!("Parley chat | task: {} | /help for commands\n", self.task);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            print!("{}", self.prompt);
            std::io::stdout().flush()?;

            let Some(line) = lines.next_line().await? else {
                println!();
                return Ok(());
            };

            match Command::parse(&line) {
                Ok(Command::Quit) => return Ok(()),
                Ok(command) => match self.execute(command).await {
                    Ok(()) => {}
                    Err(CliError::Session(Error::ConnectionLost)) => {
                        return Err(Error::ConnectionLost.into());
                    }
                    Err(e) => println!("error: {e}"),
                },
                Err(usage) => println!("{usage}"),
            }
        }
    }

    /// Executes one command.
    ///
    /// # Errors
    ///
    /// Returns the session's rejection or failure for the command.
    pub async fn execute(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Nothing | Command::Quit => Ok(()),
            Command::Help => {
                println!("{HELP}");
                Ok(())
            }
            Command::Ask(text) => self.ask(&text).await,
            Command::FollowUp(text) => self.follow_up(&text).await,
            Command::Pick(n) => {
                let root = self.current_root()?;
                let suggestions = self.client.suggestions(root);
                let question = suggestions
                    .get(n - 1)
                    .cloned()
                    .ok_or_else(|| CliError::usage(format!("no suggestion {n}")))?;
                println!("{question}");
                self.follow_up(&question).await
            }
            Command::Rate { rating, reason } => {
                let turn_id = self
                    .last
                    .ok_or_else(|| CliError::usage("nothing to rate yet"))?;
                let mut feedback = Feedback::new(rating);
                if let Some(reason) = reason {
                    feedback = feedback.with_reason(reason);
                }
                let open = self.client.submit_feedback(turn_id, feedback).await?;
                println!("rated {rating}; {}", gate_line(open));
                Ok(())
            }
            Command::Task(task) => {
                self.task = task;
                let needs_code = task.required_fields().contains(&InputField::Code);
                if needs_code && self.code.is_none() {
                    println!("task: {task} (load code with /code <path>)");
                } else {
                    println!("task: {task}");
                }
                Ok(())
            }
            Command::Code(path) => {
                let code = tokio::fs::read_to_string(&path).await?;
                println!("loaded {} lines from {}", code.lines().count(), path.display());
                self.code = Some(code);
                Ok(())
            }
            Command::ClearCode => {
                self.code = None;
                println!("code cleared");
                Ok(())
            }
            Command::Threads => {
                self.print_threads();
                Ok(())
            }
            Command::Switch(n) => {
                let root = self
                    .client
                    .roots()
                    .get(n - 1)
                    .copied()
                    .ok_or_else(|| CliError::usage(format!("no thread {n}")))?;
                self.current = Some(root);
                println!("current thread: {n}");
                Ok(())
            }
            Command::Gate => {
                let open = self.client.refresh_gate().await?;
                println!("{}", gate_line(open));
                Ok(())
            }
        }
    }

    /// Asks a root question and streams the answer.
    ///
    /// # Errors
    ///
    /// Returns the rejection if the gate is closed or the input is incomplete.
    pub async fn ask(&mut self, text: &str) -> Result<()> {
        let input = self.input(text);
        let handle = match self.client.ask(self.task, input).await {
            Ok(handle) => handle,
            Err(Error::Rejected(Rejection::GateClosed)) => {
                return Err(CliError::usage(
                    "rate the last answer first (/rate helpful|somewhat|not_helpful)",
                ));
            }
            Err(e) => return Err(e.into()),
        };
        self.current = Some(handle.root_id());
        self.stream(handle).await
    }

    async fn follow_up(&mut self, text: &str) -> Result<()> {
        let root = self.current_root()?;
        let input = self.input(text);
        let handle = self.client.follow_up(root, self.task, input).await?;
        self.stream(handle).await
    }

    fn current_root(&self) -> Result<TurnId> {
        self.current
            .ok_or_else(|| CliError::usage("no current thread, ask a question first"))
    }

    fn input(&self, text: &str) -> TaskInput {
        let mut input = TaskInput::default();
        let text = text.trim();
        if !text.is_empty() {
            input.question = Some(text.to_string());
        }
        if self.task.required_fields().contains(&InputField::Code) {
            input.code.clone_from(&self.code);
        }
        input
    }

    async fn stream(&mut self, mut handle: TurnHandle) -> Result<()> {
        let turn_id = handle.id();
        let mut shown = String::new();

        while let Some(event) = handle.next().await {
            match event {
                TurnEvent::Snapshot(record) => show_delta(&mut shown, record.display_text())?,
                TurnEvent::Done => {
                    println!();
                    if let Some(turn) = self.client.turn(turn_id) {
                        print_details(&turn);
                    }
                    self.last = Some(turn_id);
                    self.show_suggestions(turn_id).await;
                    return Ok(());
                }
                TurnEvent::Rejected(rejection) => {
                    println!();
                    return Err(rejection.into());
                }
                TurnEvent::ConnectionLost => {
                    println!();
                    return Err(Error::ConnectionLost.into());
                }
            }
        }
        Err(Error::ConnectionLost.into())
    }

    async fn show_suggestions(&self, turn_id: TurnId) {
        let Some(within) = self.suggestions_wait else {
            return;
        };
        let questions = self.client.wait_for_suggestions(turn_id, within).await;
        if questions.is_empty() {
            debug!(%turn_id, "No suggestions arrived");
            return;
        }
        println!("\nYou could ask next (/pick <n>):");
        for (index, question) in questions.iter().enumerate() {
            println!("  {}. {question}", index + 1);
        }
    }

    fn print_threads(&self) {
        let roots = self.client.roots();
        if roots.is_empty() {
            println!("no threads yet");
            return;
        }
        for (index, root) in roots.iter().enumerate() {
            let Some(snapshot) = self.client.thread(*root) else {
                warn!(%root, "Thread vanished from the mirror");
                continue;
            };
            let marker = if self.current == Some(*root) { '*' } else { ' ' };
            let title = snapshot
                .turns
                .first()
                .map(|turn| preview(turn.input.question.as_deref().unwrap_or("(code)")))
                .unwrap_or_default();
            println!(
                "{marker}{:>3}. {title} ({} follow-ups)",
                index + 1,
                snapshot.thread.follow_up_count()
            );
        }
    }
}

fn gate_line(open: bool) -> &'static str {
    if open {
        "new questions allowed"
    } else {
        "rate the last answer before asking a new question"
    }
}

/// Prints the part of `current` not yet on screen.
///
/// Snapshots replace each other; when the new text does not extend what was
/// printed, it is printed again in full on a fresh line.
fn show_delta(shown: &mut String, current: &str) -> Result<()> {
    let mut stdout = std::io::stdout();
    if let Some(rest) = current.strip_prefix(shown.as_str()) {
        write!(stdout, "{rest}")?;
    } else {
        write!(stdout, "\n{current}")?;
    }
    stdout.flush()?;
    current.clone_into(shown);
    Ok(())
}

fn print_details(turn: &Turn) {
    let Some(record) = turn.output.as_ref() else {
        return;
    };
    for (index, part) in record.code_parts.iter().enumerate() {
        println!("\n[code {}]", index + 1);
        for line in &part.lines {
            match &line.explanation {
                Some(explanation) => println!("  {:<40} // {explanation}", line.code),
                None => println!("  {}", line.code),
            }
        }
    }
    if !record.functions.is_empty() {
        println!("\n[functions]");
        for function in &record.functions {
            match &function.summary {
                Some(summary) => println!("  {}: {summary}", function.name),
                None => println!("  {}", function.name),
            }
        }
    }
    if !record.examples.is_empty() {
        println!("\n[examples]");
        for example in &record.examples {
            println!("  {example}");
        }
    }
    if record.malformed {
        println!("\n(the answer did not follow the expected format and is shown as raw text)");
    }
}

fn preview(text: &str) -> String {
    const WIDTH: usize = 60;
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > WIDTH {
        format!("{}...", line.chars().take(WIDTH).collect::<String>())
    } else {
        line.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    mod parsing {
        use super::*;

        #[test]
        fn plain_text_asks() {
            assert_eq!(
                Command::parse("  what is a trait?  ").unwrap(),
                Command::Ask("what is a trait?".to_string())
            );
            assert_eq!(Command::parse("   ").unwrap(), Command::Nothing);
        }

        #[test]
        fn follow_up_needs_text() {
            assert_eq!(
                Command::parse("/f and lifetimes?").unwrap(),
                Command::FollowUp("and lifetimes?".to_string())
            );
            assert!(Command::parse("/f").is_err());
        }

        #[test]
        fn rate_with_and_without_reason() {
            assert_eq!(
                Command::parse("/rate helpful").unwrap(),
                Command::Rate {
                    rating: Rating::Helpful,
                    reason: None
                }
            );
            assert_eq!(
                Command::parse("/rate - too vague").unwrap(),
                Command::Rate {
                    rating: Rating::NotHelpful,
                    reason: Some("too vague".to_string())
                }
            );
            assert!(Command::parse("/rate meh").is_err());
        }

        #[test]
        fn numbers_start_at_one() {
            assert_eq!(Command::parse("/pick 2").unwrap(), Command::Pick(2));
            assert!(Command::parse("/pick 0").is_err());
            assert!(Command::parse("/switch x").is_err());
        }

        #[test]
        fn task_tokens_match_the_wire() {
            assert_eq!(
                Command::parse("/task fix-code").unwrap(),
                Command::Task(TaskType::FixCode)
            );
            assert!(Command::parse("/task refactor").is_err());
        }

        #[test]
        fn code_with_and_without_path() {
            assert_eq!(
                Command::parse("/code src/main.rs").unwrap(),
                Command::Code(PathBuf::from("src/main.rs"))
            );
            assert_eq!(Command::parse("/code").unwrap(), Command::ClearCode);
            assert!(Command::parse("/frobnicate").is_err());
        }
    }

    mod session {
        use super::*;
        use crate::offline;

        fn chat() -> Chat {
            let server = Arc::new(SessionServer::new(
                Arc::new(offline::backend()),
                SessionConfig::default().with_suggestions(false),
            ));
            Chat::new(&server, UserId::new("tester"), None)
        }

        #[tokio::test]
        async fn gate_blocks_second_question_until_rated() {
            let mut chat = chat();
            chat.execute(Command::Ask("first".to_string())).await.unwrap();

            let err = chat
                .execute(Command::Ask("second".to_string()))
                .await
                .unwrap_err();
            assert!(matches!(err, CliError::Usage(_)));

            chat.execute(Command::Rate {
                rating: Rating::Helpful,
                reason: None,
            })
            .await
            .unwrap();
            chat.execute(Command::Ask("second".to_string())).await.unwrap();
            assert_eq!(chat.client.roots().len(), 2);
        }

        #[tokio::test]
        async fn follow_up_extends_current_thread() {
            let mut chat = chat();
            assert!(chat
                .execute(Command::FollowUp("too early".to_string()))
                .await
                .is_err());

            chat.execute(Command::Ask("root".to_string())).await.unwrap();
            chat.execute(Command::FollowUp("more".to_string()))
                .await
                .unwrap();

            let root = chat.current.unwrap();
            let snapshot = chat.client.thread(root).unwrap();
            assert_eq!(snapshot.thread.follow_up_count(), 1);
            assert_eq!(chat.last, snapshot.thread.follow_ups.last().copied());
        }

        #[tokio::test]
        async fn code_tasks_need_loaded_code() {
            let mut chat = chat().with_task(TaskType::ExplainCode);
            let err = chat.execute(Command::Ask("what?".to_string())).await;
            assert!(matches!(
                err,
                Err(CliError::Session(Error::Rejected(Rejection::InvalidInput(_))))
            ));

            let mut chat = chat
                .with_code(Some("let x = 1;\n".to_string()))
                .with_task(TaskType::ExplainCode);
            chat.execute(Command::Ask("what?".to_string())).await.unwrap();
            let turn = chat.client.turn(chat.last.unwrap()).unwrap();
            assert_eq!(turn.output.unwrap().code_parts.len(), 1);
        }
    }

    #[test]
    fn delta_appends_growing_text() {
        let mut shown = String::new();
        show_delta(&mut shown, "Hel").unwrap();
        show_delta(&mut shown, "Hello").unwrap();
        assert_eq!(shown, "Hello");
        show_delta(&mut shown, "Bye").unwrap();
        assert_eq!(shown, "Bye");
    }

    #[test]
    fn long_titles_are_shortened() {
        let title = preview(&"x".repeat(100));
        assert_eq!(title.chars().count(), 63);
        assert_eq!(preview("short\nsecond line"), "short");
    }
}
