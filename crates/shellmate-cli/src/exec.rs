//! Running suggested commands in the user's shell

use std::process::ExitStatus;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::commands::SuggestedCommand;
use crate::CliError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub command: String,
    pub status: ExitStatus,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Run one command line through `sh -c` with inherited stdio.
pub async fn run_shell(command: &str) -> Result<ExitStatus, CliError> {
    debug!(command, "running shell command");
    let status = Command::new("sh").arg("-c").arg(command).status().await?;
    Ok(status)
}

/// Run every command in order. A failing command is reported and the rest
/// still run.
pub async fn execute_all(commands: &[SuggestedCommand]) -> Result<Vec<ExecOutcome>, CliError> {
    let mut outcomes = Vec::with_capacity(commands.len());
    for cmd in commands {
        let status = run_shell(&cmd.command).await?;
        if !status.success() {
            warn!(command = %cmd.command, code = ?status.code(), "command failed");
        }
        outcomes.push(ExecOutcome {
            command: cmd.command.clone(),
            status,
        });
    }
    Ok(outcomes)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_shell_reports_exit_code() {
        let status = run_shell("exit 3").await.unwrap();

        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn execute_all_continues_after_failure() {
        let commands = [
            SuggestedCommand::bare("false"),
            SuggestedCommand::bare("true"),
        ];

        let outcomes = execute_all(&commands).await.unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].success());
        assert!(outcomes[1].success());
        assert_eq!(outcomes[1].command, "true");
    }
}
