use std::collections::BTreeSet;
use std::io::{self, Write};
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use colored::Colorize;
use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::{Context, Editor, Helper};
use shellmate_cli::{
    exec, render_suggestions, translate_command, ChatSession, Cli, CliError, Commands,
    SessionError, Settings, SuggestedCommand,
};
use shellmate_context::WindowManager;
use shellmate_runtime::{create_backend, ChatBackend};
use tracing::{debug, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CHAT_PROMPT: &str = "you> ";
const CMD_PROMPT: &str = "cmd> ";

const REPL_COMMANDS: &[&str] = &["/clear", "/tokens", "/help", "exit", "quit"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplCommand {
    Input(String),
    Clear,
    Tokens,
    Help,
    Exit,
    Empty,
    Unknown(String),
}

#[derive(Default)]
struct ReplHelper;

impl Helper for ReplHelper {}
impl Hinter for ReplHelper {
    type Hint = String;
}
impl Highlighter for ReplHelper {}
impl Validator for ReplHelper {}

impl Completer for ReplHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let pos = pos.min(line.len());
        let input = &line[..pos];
        // Only the first word of a line can be a REPL command.
        if input.trim_start().contains(char::is_whitespace) {
            return Ok((pos, Vec::new()));
        }
        let start = input.len() - input.trim_start().len();
        let prefix = &input[start..];

        let pairs = complete_candidates(prefix)
            .into_iter()
            .map(|candidate| Pair {
                display: candidate.to_string(),
                replacement: candidate.to_string(),
            })
            .collect();
        Ok((start, pairs))
    }
}

fn parse_command(line: &str) -> ReplCommand {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }

    match line {
        "exit" | "quit" => ReplCommand::Exit,
        "/help" | "?" => ReplCommand::Help,
        "/clear" => ReplCommand::Clear,
        "/tokens" => ReplCommand::Tokens,
        _ if line.starts_with('/') && !line.contains(char::is_whitespace) => {
            ReplCommand::Unknown(format!("unknown command: {line}"))
        }
        _ => ReplCommand::Input(line.to_string()),
    }
}

fn help_text() -> String {
    [
        "Commands:",
        "  /clear       Forget the conversation so far",
        "  /tokens      Show the estimated size of the conversation",
        "  /help        Show this help",
        "  exit | quit  Leave shellmate",
        "Anything else is sent to the model.",
    ]
    .join("\n")
}

fn complete_candidates(prefix: &str) -> BTreeSet<&'static str> {
    REPL_COMMANDS
        .iter()
        .copied()
        .filter(|command| command.starts_with(prefix))
        .collect()
}

fn init_tracing() {
    let filter = EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()));
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("SHELLMATE_LOG_FORMAT").is_ok_and(|format| format == "json") {
        registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(io::stderr)).init();
    }
}

fn new_editor() -> anyhow::Result<Editor<ReplHelper, DefaultHistory>> {
    let mut editor = Editor::<ReplHelper, DefaultHistory>::new()
        .context("failed to start the line editor")?;
    editor.set_helper(Some(ReplHelper));
    Ok(editor)
}

fn report(err: &CliError) {
    eprintln!("{} {err}", "error:".red());
    if let Some(hint) = err.hint() {
        eprintln!("{} {hint}", "hint:".yellow());
    }
}

/// What to do with a set of suggested commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SuggestionAction {
    Execute,
    Revise,
    Quit,
}

fn parse_action(answer: &str) -> Option<SuggestionAction> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "e" | "execute" => Some(SuggestionAction::Execute),
        "r" | "revise" => Some(SuggestionAction::Revise),
        "q" | "quit" | "exit" => Some(SuggestionAction::Quit),
        _ => None,
    }
}

fn parse_confirmation(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Read a prompt answer through the editor; Ctrl-C and Ctrl-D give `None`.
fn ask(
    editor: &mut Editor<ReplHelper, DefaultHistory>,
    prompt: &str,
) -> anyhow::Result<Option<String>> {
    match editor.readline(prompt) {
        Ok(answer) => Ok(Some(answer)),
        Err(ReadlineError::Interrupted | ReadlineError::Eof) => Ok(None),
        Err(err) => Err(err).context("failed to read input"),
    }
}

fn choose_action(
    editor: &mut Editor<ReplHelper, DefaultHistory>,
    execute: bool,
) -> anyhow::Result<SuggestionAction> {
    if execute {
        let confirmed = ask(editor, "Run these commands? [y/N] ")?
            .is_some_and(|answer| parse_confirmation(&answer));
        return Ok(if confirmed {
            SuggestionAction::Execute
        } else {
            SuggestionAction::Revise
        });
    }

    loop {
        let Some(answer) = ask(editor, "[e]xecute, [r]evise, [q]uit: ")? else {
            return Ok(SuggestionAction::Quit);
        };
        match parse_action(&answer) {
            Some(action) => return Ok(action),
            None => println!("{} answer e, r or q", "warning:".yellow()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is normal.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        if let Some(cli_err) = err.downcast_ref::<CliError>() {
            if let Some(hint) = cli_err.hint() {
                eprintln!("{} {hint}", "hint:".yellow());
            }
        }
        return Err(err);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::from_cli(&cli)?;
    let backend: Arc<dyn ChatBackend> = Arc::from(
        create_backend(settings.profile.backend, settings.backend_settings())
            .map_err(CliError::from)?,
    );
    info!(
        model = settings.profile.alias,
        backend = backend.name(),
        "backend ready"
    );

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => chat_repl(backend, settings).await,
        Commands::Cmd {
            fast,
            execute,
            request,
        } => {
            let manager = settings.window_manager();
            let initial = (!request.is_empty()).then(|| request.join(" "));
            command_loop(
                backend.as_ref(),
                &manager,
                &settings,
                fast,
                execute,
                initial,
            )
            .await
        }
    }
}

async fn chat_repl(backend: Arc<dyn ChatBackend>, settings: Settings) -> anyhow::Result<()> {
    let mut editor = new_editor()?;
    let mut session = ChatSession::new(backend, settings);
    println!(
        "{}",
        format!(
            "shellmate chat with {}. Type /help for commands.",
            session.settings().profile.alias
        )
        .bright_green()
    );

    // Text of a failed round, offered back for editing on the next prompt.
    let mut retry: Option<String> = None;
    loop {
        let line = match retry.take() {
            Some(text) => editor.readline_with_initial(CHAT_PROMPT, (text.as_str(), "")),
            None => editor.readline(CHAT_PROMPT),
        };
        let line = match line {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => {
                println!();
                break;
            }
            Err(err) => return Err(err).context("failed to read input"),
        };
        if !line.trim().is_empty() {
            let _ = editor.add_history_entry(line.trim());
        }

        match parse_command(&line) {
            ReplCommand::Input(text) => {
                if let Err(err) = chat_round(&mut session, &text).await {
                    report(&CliError::from(err));
                    retry = Some(text);
                }
            }
            ReplCommand::Clear => {
                session.reset();
                println!("{}", "conversation cleared".green());
            }
            ReplCommand::Tokens => match session.estimated_tokens() {
                Ok(tokens) => println!(
                    "{} {tokens} / {} input tokens",
                    "conversation:".bright_blue(),
                    session.settings().window.input_budget()
                ),
                Err(err) => report(&CliError::from(err)),
            },
            ReplCommand::Help => println!("{}", help_text().bright_blue()),
            ReplCommand::Exit => break,
            ReplCommand::Empty => {}
            ReplCommand::Unknown(message) => {
                println!("{} {message}", "warning:".yellow());
                println!("{}", "Type /help for available commands.".yellow());
            }
        }
    }

    debug!(session = %session.id(), turns = session.conversation().len(), "chat ended");
    Ok(())
}

async fn chat_round(session: &mut ChatSession, text: &str) -> Result<(), SessionError> {
    let mut streamed = false;
    let result = session
        .round(text, |delta| {
            streamed = true;
            print!("{delta}");
            let _ = io::stdout().flush();
        })
        .await;
    if streamed {
        println!();
    }

    let outcome = result?;
    if !outcome.within_budget {
        eprintln!(
            "{} message exceeds the {}-token input budget even after trimming; the reply may be cut short",
            "warning:".yellow(),
            session.settings().window.input_budget()
        );
    }
    if outcome.evicted > 0 {
        debug!(evicted = outcome.evicted, "older turns dropped to fit the window");
    }
    Ok(())
}

/// Translate requests until the user quits. `initial` is sent straight away;
/// after that each request is read from the prompt, pre-filled with the last
/// one when the user chose to revise it.
async fn command_loop(
    backend: &dyn ChatBackend,
    manager: &WindowManager,
    settings: &Settings,
    fast: bool,
    execute: bool,
    initial: Option<String>,
) -> anyhow::Result<()> {
    let mut editor = new_editor()?;
    let one_shot = initial.is_some();
    if !one_shot {
        println!(
            "{}",
            "Describe what you want to do. Type exit to quit.".bright_green()
        );
    }

    let mut pending = initial;
    let mut draft: Option<String> = None;
    loop {
        let request = match pending.take() {
            Some(request) => request,
            None => {
                let line = match draft.take() {
                    Some(text) => editor.readline_with_initial(CMD_PROMPT, (text.as_str(), "")),
                    None => editor.readline(CMD_PROMPT),
                };
                let line = match line {
                    Ok(line) => line,
                    Err(ReadlineError::Interrupted | ReadlineError::Eof) => {
                        println!();
                        break;
                    }
                    Err(err) => return Err(err).context("failed to read input"),
                };
                match parse_command(&line) {
                    ReplCommand::Input(request) => request,
                    ReplCommand::Exit => break,
                    ReplCommand::Empty => continue,
                    ReplCommand::Help => {
                        println!("{}", "Type a request, or exit to quit.".bright_blue());
                        continue;
                    }
                    ReplCommand::Clear | ReplCommand::Tokens => {
                        println!("{} only available in chat", "warning:".yellow());
                        continue;
                    }
                    ReplCommand::Unknown(message) => {
                        println!("{} {message}", "warning:".yellow());
                        continue;
                    }
                }
            }
        };
        let _ = editor.add_history_entry(request.as_str());

        let commands = match translate_command(backend, manager, settings, &request, fast).await {
            Ok(commands) => commands,
            Err(err) => {
                report(&CliError::from(err));
                println!("{}", "Revise the request, or type exit to quit.".yellow());
                draft = Some(request);
                continue;
            }
        };
        print!("{}", render_suggestions(&commands));

        match choose_action(&mut editor, execute)? {
            SuggestionAction::Execute => {
                run_commands(&commands).await;
                if one_shot {
                    break;
                }
            }
            SuggestionAction::Revise => draft = Some(request),
            SuggestionAction::Quit => break,
        }
    }
    Ok(())
}

async fn run_commands(commands: &[SuggestedCommand]) {
    match exec::execute_all(commands).await {
        Ok(outcomes) => {
            for outcome in outcomes.iter().filter(|outcome| !outcome.success()) {
                eprintln!(
                    "{} `{}` exited with {}",
                    "warning:".yellow(),
                    outcome.command,
                    outcome.status
                );
            }
        }
        Err(err) => report(&err),
    }
}
