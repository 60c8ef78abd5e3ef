pub mod commands;
pub mod config;
pub mod exec;
pub mod prompts;
pub mod session;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use shellmate_context::ExhaustionPolicy;
use shellmate_runtime::BackendError;
use thiserror::Error;

pub use commands::{parse_suggestion, CommandParseError, SuggestedCommand};
pub use config::{ModelProfile, Settings};
pub use session::{translate_command, ChatSession, RoundOutcome, SessionError};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "shellmate",
    version,
    about = "Terminal assistant backed by hosted or local LLMs",
    long_about = "Chat with an LLM from the terminal, or turn a natural-language request into shell commands"
)]
pub struct Cli {
    #[arg(
        long,
        short,
        global = true,
        env = "SHELLMATE_MODEL",
        default_value = "gpt35",
        help = "Model alias (gpt35, gpt4, claude, gemini, mistral-q4, mistral-q6, zephyr, openchat, gemma, mistral)"
    )]
    pub model: String,
    #[arg(
        long,
        global = true,
        default_value_t = 0.1,
        help = "Sampling temperature for chat replies"
    )]
    pub temperature: f32,
    #[arg(
        long,
        global = true,
        env = "SHELLMATE_BASE_URL",
        help = "Override the backend base URL"
    )]
    pub base_url: Option<String>,
    #[arg(long, global = true, help = "Override the model's context window size in tokens")]
    pub max_context_tokens: Option<usize>,
    #[arg(long, global = true, help = "Override the tokens reserved for the reply")]
    pub reserved_output_tokens: Option<usize>,
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OverflowPolicy::Fail,
        help = "What to do when a message cannot fit the context window"
    )]
    pub on_overflow: OverflowPolicy,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    #[command(about = "Start an interactive chat (default)")]
    Chat,
    #[command(about = "Translate a request into shell commands")]
    Cmd {
        #[arg(long, help = "Ask only for the commands, without explanations")]
        fast: bool,
        #[arg(
            long,
            help = "Skip the execute/revise menu and ask for a y/N confirmation to run the commands"
        )]
        execute: bool,
        #[arg(
            trailing_var_arg = true,
            num_args = 0..,
            help = "Request in plain language; omit to enter interactive mode"
        )]
        request: Vec<String>,
    },
}

/// Behaviour when trimming cannot bring a conversation under budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OverflowPolicy {
    /// Refuse to send and keep the conversation as it was
    Fail,
    /// Send the trimmed conversation anyway
    BestEffort,
}

impl From<OverflowPolicy> for ExhaustionPolicy {
    fn from(policy: OverflowPolicy) -> Self {
        match policy {
            OverflowPolicy::Fail => ExhaustionPolicy::FailFast,
            OverflowPolicy::BestEffort => ExhaustionPolicy::BestEffort,
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Extra line to show the user, e.g. how to provide a missing API key.
    pub fn hint(&self) -> Option<String> {
        match self {
            CliError::Backend(BackendError::MissingCredential(var))
            | CliError::Session(SessionError::Backend(BackendError::MissingCredential(var))) => {
                Some(format!("set it with: export {var}=<your key>"))
            }
            CliError::Session(SessionError::Backend(err)) | CliError::Backend(err)
                if err.is_rate_limited() =>
            {
                Some("the backend is rate limiting requests, try again shortly".to_string())
            }
            _ => None,
        }
    }
}

/// Numbered, colourised listing of suggested commands with their explanations.
pub fn render_suggestions(commands: &[SuggestedCommand]) -> String {
    let mut output = String::new();
    for (i, cmd) in commands.iter().enumerate() {
        output.push_str(&format!(
            "{} {}\n",
            format!("{}.", i + 1).cyan(),
            cmd.command.green().bold()
        ));
        for line in cmd.explanations.iter().chain(&cmd.arg_explanations) {
            output.push_str(&format!("   {}\n", line.dimmed()));
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::{render_suggestions, Cli, CliError, Commands, OverflowPolicy, SuggestedCommand};
    use clap::Parser;
    use shellmate_runtime::BackendError;

    #[test]
    fn cli_defaults_to_chat() {
        let cli = Cli::parse_from(["shellmate", "--model", "gpt35"]);

        assert!(cli.command.is_none());
        assert_eq!(cli.on_overflow, OverflowPolicy::Fail);
        assert!((cli.temperature - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn cli_parses_cmd_request_words() {
        let cli = Cli::parse_from([
            "shellmate",
            "cmd",
            "--fast",
            "-m",
            "claude",
            "find",
            "large",
            "files",
        ]);

        assert_eq!(cli.model, "claude");
        match cli.command {
            Some(Commands::Cmd {
                fast,
                execute,
                request,
            }) => {
                assert!(fast);
                assert!(!execute);
                assert_eq!(request.join(" "), "find large files");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_rejects_unknown_overflow_policy() {
        let result = Cli::try_parse_from(["shellmate", "--on-overflow", "truncate"]);

        assert!(result.is_err());
    }

    #[test]
    fn missing_credential_hint_names_export() {
        let err = CliError::Backend(BackendError::MissingCredential("OPENAI_API_KEY".to_string()));

        assert_eq!(
            err.hint().as_deref(),
            Some("set it with: export OPENAI_API_KEY=<your key>")
        );
        assert!(CliError::Config("x".to_string()).hint().is_none());
    }

    #[test]
    fn render_suggestions_numbers_commands_and_explanations() {
        let rendered = render_suggestions(&[
            SuggestedCommand {
                command: "df -h".to_string(),
                explanations: vec!["`df` reports disk usage.".to_string()],
                arg_explanations: vec!["`-h` prints human-readable sizes.".to_string()],
            },
            SuggestedCommand::bare("du -sh ."),
        ]);

        assert!(rendered.contains("df -h"));
        assert!(rendered.contains("`-h` prints human-readable sizes."));
        assert!(rendered.contains("du -sh ."));
        assert_eq!(rendered.lines().count(), 4);
    }
}
