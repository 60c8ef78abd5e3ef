//! Parsing of command-translation replies

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuggestedCommand {
    pub command: String,
    pub explanations: Vec<String>,
    pub arg_explanations: Vec<String>,
}

impl SuggestedCommand {
    pub fn bare(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            explanations: Vec::new(),
            arg_explanations: Vec::new(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("could not find commands for this request")]
    NoCommands,
    #[error("could not parse model response: {0}")]
    Unparseable(String),
}

#[derive(Debug, Deserialize)]
struct RawSuggestion {
    #[serde(default)]
    error: Value,
    commands: Option<Vec<RawCommand>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Bare(String),
    Detailed {
        cmd_to_execute: String,
        #[serde(default)]
        cmd_explanations: Vec<String>,
        #[serde(default)]
        arg_explanations: Vec<String>,
    },
}

impl From<RawCommand> for SuggestedCommand {
    fn from(raw: RawCommand) -> Self {
        match raw {
            RawCommand::Bare(command) => SuggestedCommand::bare(command),
            RawCommand::Detailed {
                cmd_to_execute,
                cmd_explanations,
                arg_explanations,
            } => SuggestedCommand {
                command: cmd_to_execute,
                explanations: cmd_explanations,
                arg_explanations,
            },
        }
    }
}

/// Cut a reply down to its JSON object, dropping markdown fences and any
/// prose around it.
pub fn clean_model_output(raw: &str) -> &str {
    let trimmed = raw.trim();
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}

fn error_flag_set(flag: &Value) -> bool {
    match flag {
        Value::Bool(set) => *set,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}

/// Parse either reply shape: detailed (`cmd_to_execute` objects) or fast
/// (plain strings).
pub fn parse_suggestion(raw: &str) -> Result<Vec<SuggestedCommand>, CommandParseError> {
    let cleaned = clean_model_output(raw);
    let parsed: RawSuggestion = serde_json::from_str(cleaned)
        .map_err(|err| CommandParseError::Unparseable(err.to_string()))?;

    if error_flag_set(&parsed.error) {
        return Err(CommandParseError::NoCommands);
    }

    let commands: Vec<SuggestedCommand> = parsed
        .commands
        .unwrap_or_default()
        .into_iter()
        .map(SuggestedCommand::from)
        .filter(|cmd| !cmd.command.trim().is_empty())
        .collect();

    if commands.is_empty() {
        return Err(CommandParseError::NoCommands);
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_detailed_reply() {
        let raw = r#"{"input": "show disk usage", "error": 0, "commands": [
            {"seq": 1, "cmd_to_execute": "df -h", "cmd_explanations": ["`df` reports file system usage."],
             "arg_explanations": ["`-h` prints human-readable sizes."]}
        ]}"#;

        let commands = parse_suggestion(raw).unwrap();

        assert_eq!(
            commands,
            vec![SuggestedCommand {
                command: "df -h".to_string(),
                explanations: vec!["`df` reports file system usage.".to_string()],
                arg_explanations: vec!["`-h` prints human-readable sizes.".to_string()],
            }]
        );
    }

    #[test]
    fn parses_fast_reply_inside_markdown_fence() {
        let raw = "```json\n{\"commands\": [\"git status\", \"git log -1\"]}\n```";

        let commands = parse_suggestion(raw).unwrap();

        assert_eq!(
            commands,
            vec![
                SuggestedCommand::bare("git status"),
                SuggestedCommand::bare("git log -1")
            ]
        );
    }

    #[test]
    fn error_flag_means_no_commands() {
        assert_eq!(
            parse_suggestion(r#"{"input": "hello", "error": 1}"#),
            Err(CommandParseError::NoCommands)
        );
        assert_eq!(
            parse_suggestion(r#"{"error": true, "commands": ["ls"]}"#),
            Err(CommandParseError::NoCommands)
        );
    }

    #[test]
    fn missing_or_empty_commands_mean_no_commands() {
        assert_eq!(
            parse_suggestion(r#"{"error": 0}"#),
            Err(CommandParseError::NoCommands)
        );
        assert_eq!(
            parse_suggestion(r#"{"commands": ["  "]}"#),
            Err(CommandParseError::NoCommands)
        );
    }

    #[test]
    fn malformed_json_is_unparseable() {
        let err = parse_suggestion("Sure! Run `ls -la` to list files.").unwrap_err();

        assert!(matches!(err, CommandParseError::Unparseable(_)));
    }

    #[test]
    fn clean_model_output_strips_surrounding_prose() {
        assert_eq!(
            clean_model_output("Here you go:\n{\"commands\": []}\nEnjoy"),
            "{\"commands\": []}"
        );
        assert_eq!(clean_model_output("  no json  "), "no json");
    }
}
