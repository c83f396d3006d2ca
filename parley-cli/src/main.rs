//! Parley CLI - interactive question/answer sessions
//!
//! Runs a session server and client in one process and talks to an
//! OpenAI-compatible completion endpoint, or to a canned backend with
//! `--offline`.

#![allow(clippy::print_stdout)] // CLI program intentionally uses stdout

mod chat;
mod config;
mod error;
mod offline;

use clap::{Args, Parser, Subcommand};
use config::{ParleyConfig, config_path as default_config_path, init_config, load_config};
use error::{CliError, Result};
use parley::config::IssueLevel;
use parley::prelude::*;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Parley - streaming question/answer sessions over a completion backend
#[derive(Parser)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, env = "PARLEY_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive session
    Chat(ChatArgs),

    /// Print the assembled prompt for a task
    Prompt(PromptArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the chat command
#[derive(Args)]
struct ChatArgs {
    /// Use the canned offline backend instead of a completion endpoint
    #[arg(long)]
    offline: bool,

    /// Question to ask first
    #[arg(short, long)]
    message: Option<String>,

    /// Exit after answering --message
    #[arg(long, requires = "message")]
    once: bool,

    /// Starting task type
    #[arg(short, long, default_value = "ask-question", value_parser = parse_task)]
    task: TaskType,

    /// File with code for code tasks
    #[arg(long)]
    code_file: Option<PathBuf>,

    /// Model to use (overrides config)
    #[arg(short = 'M', long)]
    model: Option<String>,

    /// User id of the session (overrides config)
    #[arg(short, long)]
    user: Option<String>,

    /// Do not generate follow-up suggestions
    #[arg(long)]
    no_suggestions: bool,
}

/// Arguments for the prompt command
#[derive(Args)]
struct PromptArgs {
    /// Task type
    #[arg(short, long, value_parser = parse_task)]
    task: TaskType,

    /// Question text
    #[arg(short, long)]
    question: Option<String>,

    /// File with code
    #[arg(long)]
    code_file: Option<PathBuf>,

    /// Print the prompt and its stop markers as JSON
    #[arg(long)]
    json: bool,
}

/// Arguments for the config command
#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Show configuration file path
    Path,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Validate configuration
    Validate,
}

fn parse_task(s: &str) -> std::result::Result<TaskType, String> {
    s.parse::<TaskType>().map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");

    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging with the given verbosity level.
///
/// Logs go to stderr so they do not interleave with streamed answers.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "parley_cli={level},parley={level},{}",
            if verbosity >= 3 { "debug" } else { "warn" }
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity >= 2)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Chat(args) => cmd_chat(args, cli.config).await,
        Commands::Prompt(args) => cmd_prompt(args).await,
        Commands::Config(args) => cmd_config(args, cli.config).await,
    }
}

/// Start an interactive session.
async fn cmd_chat(args: ChatArgs, config_path: Option<PathBuf>) -> Result<()> {
    let mut config = load_config(config_path.as_deref()).await?;

    if let Some(model) = args.model {
        config.backend.model = Some(model);
    }
    if let Some(user) = args.user {
        config.chat.user = user;
    }
    if args.no_suggestions {
        config.session.suggestions_enabled = false;
    }
    report_issues(&config, args.offline)?;

    let backend = create_backend(&config, args.offline)?;
    let session = config.session.clone();
    let suggestions_wait = session
        .suggestions_enabled
        .then(|| Duration::from_secs(config.chat.suggestion_wait_secs));
    let server = Arc::new(SessionServer::new(backend, session));

    let code = match args.code_file {
        Some(path) => Some(tokio::fs::read_to_string(path).await?),
        None => None,
    };

    let prompt = config.chat.prompt;
    let mut chat = chat::Chat::new(&server, UserId::new(config.chat.user), suggestions_wait)
        .with_task(args.task)
        .with_code(code)
        .with_prompt(prompt.clone());

    if let Some(message) = args.message {
        println!("{prompt}{message}");
        chat.ask(&message).await?;
        if args.once {
            return Ok(());
        }
    }

    chat.run().await
}

/// Creates the completion backend.
///
/// `--offline` always wins; otherwise an API key is required.
fn create_backend(config: &ParleyConfig, offline: bool) -> Result<SharedBackend> {
    if offline {
        tracing::info!("Using offline backend");
        return Ok(Arc::new(offline::backend()));
    }

    let openai = config.backend.openai().ok_or_else(|| {
        CliError::usage(
            "No API key configured. Set PARLEY_API_KEY or OPENAI_API_KEY, or pass --offline",
        )
    })?;
    tracing::info!(model = %openai.model, base_url = %openai.base_url, "Using completion endpoint");
    Ok(Arc::new(OpenAiCompletions::new(openai)?))
}

/// Logs warnings and fails on errors.
fn report_issues(config: &ParleyConfig, offline: bool) -> Result<()> {
    let mut errors = Vec::new();
    for issue in config.validate() {
        match issue.level {
            IssueLevel::Error => errors.push(issue.to_string()),
            IssueLevel::Warning if offline && issue.path == "backend.api_key" => {}
            IssueLevel::Warning => tracing::warn!("{issue}"),
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(config::ConfigError::Invalid(errors.join("; ")).into())
    }
}

/// Print an assembled prompt.
async fn cmd_prompt(args: PromptArgs) -> Result<()> {
    let mut input = TaskInput {
        question: args.question,
        code: None,
    };
    if let Some(path) = args.code_file {
        input.code = Some(tokio::fs::read_to_string(path).await?);
    }

    let prompt = assemble(args.task, &input, &[])?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&prompt)?);
    } else {
        println!("{}", prompt.text);
        println!();
        println!("stop markers: {:?}", prompt.stop.markers());
    }
    Ok(())
}

/// Configuration management.
async fn cmd_config(args: ConfigArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config_file = config_path.unwrap_or_else(default_config_path);

    match args.command {
        ConfigCommands::Path => {
            println!("{}", config_file.display());
        }
        ConfigCommands::Show => {
            let mut config = load_config(Some(&config_file)).await?;
            if config.backend.api_key.is_some() {
                config.backend.api_key = Some("<redacted>".to_string());
            }
            let content = toml::to_string_pretty(&config).map_err(config::ConfigError::from)?;
            println!("# {}", config_file.display());
            println!("{content}");
            print_env_status("PARLEY_API_KEY");
            print_env_status("OPENAI_API_KEY");
            print_env_status("PARLEY_BASE_URL");
            print_env_status("PARLEY_MODEL");
        }
        ConfigCommands::Init { force } => {
            if init_config(&config_file, force).await? {
                println!("Configuration created: {}", config_file.display());
                println!();
                println!("Next steps:");
                println!("  1. export PARLEY_API_KEY=<key>");
                println!("  2. parley chat");
            } else {
                println!("Configuration already exists at: {}", config_file.display());
                println!("Use --force to overwrite.");
            }
        }
        ConfigCommands::Validate => {
            if !config_file.exists() {
                println!("note: {} does not exist, checking defaults", config_file.display());
            }
            let config = load_config(Some(&config_file)).await?;
            let issues = config.validate();
            for issue in &issues {
                println!("{issue}");
            }
            if config.is_valid() {
                println!("Configuration is valid");
            } else {
                return Err(CliError::usage("configuration has errors"));
            }
        }
    }

    Ok(())
}

/// Print environment variable status.
fn print_env_status(name: &str) {
    let status = if std::env::var(name).is_ok() {
        "set"
    } else {
        "-"
    };
    println!("# {name}: {status}");
}
