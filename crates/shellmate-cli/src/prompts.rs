//! Priming conversations for chat and command translation.
//!
//! Both conversations start with a fixed priming region that the window
//! manager never evicts; the constants below give its length.

use shellmate_context::{Conversation, Turn};

/// Chat priming is just the system turn.
pub const CHAT_EVICTION_INDEX: usize = 1;

/// Command priming pins the system turn, the format instruction and its ack.
pub const COMMAND_EVICTION_INDEX: usize = 3;

/// Platform string used in the few-shot examples.
pub const EXAMPLE_PLATFORM: &str = "macOS-13.3.1-x86-64bit";

/// Temperature for command translation; near-deterministic output parses best.
pub const COMMAND_TEMPERATURE: f32 = 0.01;

pub const CHAT_SYSTEM_PROMPT: &str = "You are Shellmate, an assistant for software developers \
working in a terminal. Answer precisely and concisely. Format code, commands and file paths \
as Markdown.";

pub const COMMAND_SYSTEM_PROMPT: &str = "You are Shellmate, a system that turns natural-language \
requests into command-line commands for the user's platform. You only ever reply with JSON.";

const COMMAND_INSTRUCTION: &str = r#"For every request, reply with one JSON object and nothing else, using this format:
{"input": "<the request>", "error": 0, "commands": [{"seq": 1, "cmd_to_execute": "<command>", "cmd_explanations": ["<what the command does>"], "arg_explanations": ["<what each argument does>"]}]}
List the commands in the order they must run. If the request cannot be fulfilled with command-line commands, reply with {"input": "<the request>", "error": 1}."#;

const COMMAND_INSTRUCTION_FAST: &str = r#"For every request, reply with one JSON object and nothing else, using this format:
{"commands": ["<first command>", "<second command>"]}
List the commands in the order they must run. If the request cannot be fulfilled with command-line commands, reply with {"error": 1}."#;

const ACKNOWLEDGEMENT: &str = "Understood!";

const CONDA_REQUEST: &str = "install conda";
const SEARCH_REQUEST: &str = "search ~/Documents directory for any .py file that begins with 'test'";
const PROCESS_REQUEST: &str = "list all processes using more than 50 MB of memory";
const UNKNOWN_REQUEST: &str = "the quick brown fox jumped over";

const CONDA_EXAMPLE: &str = r#"{"input": "install conda", "error": 0, "commands": [{"seq": 1, "cmd_to_execute": "curl -O https://repo.anaconda.com/miniconda/Miniconda3-latest-MacOSX-x86_64.sh", "cmd_explanations": ["The `curl` command is used to issue web requests, e.g. download web pages."], "arg_explanations": ["`-O` specifies that we want to save the response to a file.", "`https://repo.anaconda.com/miniconda/Miniconda3-latest-MacOSX-x86_64.sh` is the URL of the file we want to download."]}, {"seq": 2, "cmd_to_execute": "bash Miniconda3-latest-MacOSX-x86_64.sh", "cmd_explanations": ["The `bash` command is used to execute shell scripts."], "arg_explanations": ["`Miniconda3-latest-MacOSX-x86_64.sh` is the name of the file we want to execute."]}]}"#;

const SEARCH_EXAMPLE: &str = r#"{"input": "search the ~/Documents/ directory for any .py file that begins with 'test'", "error": 0, "commands": [{"seq": 1, "cmd_to_execute": "find ~/Documents/ -name 'test*.py'", "cmd_explanations": ["`find` is used to list files."], "arg_explanations": ["`~/Documents` specifies the folder to search in.", "`-name 'test*.py'` specifies that we want to search for files starting with `test` and ending with `.py`."]}]}"#;

const UNKNOWN_EXAMPLE: &str = r#"{"input": "the quick brown fox jumped over", "error": 1}"#;

const CONDA_EXAMPLE_FAST: &str = r#"{"commands": ["curl -O https://repo.anaconda.com/miniconda/Miniconda3-latest-MacOSX-x86_64.sh", "bash Miniconda3-latest-MacOSX-x86_64.sh"]}"#;

const SEARCH_EXAMPLE_FAST: &str = r#"{"commands": ["find ~/Documents/ -name 'test*.py'"]}"#;

const PROCESS_EXAMPLE_FAST: &str = r#"{"commands": ["ps -axm -o %mem,rss,comm | awk '$1 > 0.5 { printf(\"%.0fMB\\t%s\\n\", $2/1024, $3); }'"]}"#;

const UNKNOWN_EXAMPLE_FAST: &str = r#"{"error": 1}"#;

/// Wrap a natural-language request in the command-translation instruction.
pub fn format_user_request(request: &str, platform: &str) -> String {
    format!(
        "Provide the appropriate command-line commands that can be executed on a {platform} machine for the user request: \"{request}\"."
    )
}

/// Platform description of the machine we are running on, e.g. `linux-x86_64`.
pub fn user_platform() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

pub fn chat_conversation() -> Conversation {
    Conversation::from_turns([Turn::system(CHAT_SYSTEM_PROMPT)])
}

/// System turn, format instruction, acknowledgement, then few-shot pairs.
pub fn command_conversation(fast: bool) -> Conversation {
    let (instruction, examples): (&str, &[(&str, &str)]) = if fast {
        (
            COMMAND_INSTRUCTION_FAST,
            &[
                (CONDA_REQUEST, CONDA_EXAMPLE_FAST),
                (SEARCH_REQUEST, SEARCH_EXAMPLE_FAST),
                (PROCESS_REQUEST, PROCESS_EXAMPLE_FAST),
                (UNKNOWN_REQUEST, UNKNOWN_EXAMPLE_FAST),
            ],
        )
    } else {
        (
            COMMAND_INSTRUCTION,
            &[
                (CONDA_REQUEST, CONDA_EXAMPLE),
                (SEARCH_REQUEST, SEARCH_EXAMPLE),
                (UNKNOWN_REQUEST, UNKNOWN_EXAMPLE),
            ],
        )
    };

    let mut conversation = Conversation::from_turns([
        Turn::system(COMMAND_SYSTEM_PROMPT),
        Turn::user(instruction),
        Turn::assistant(ACKNOWLEDGEMENT),
    ]);
    for (request, answer) in examples {
        conversation.push(Turn::user(format_user_request(request, EXAMPLE_PLATFORM)));
        conversation.push(Turn::assistant(*answer));
    }
    conversation
}
