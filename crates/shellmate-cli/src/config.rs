//! Model profiles and resolved runtime settings

use shellmate_context::{
    ContextWindow, EvictionGranularity, ExhaustionPolicy, TokenEstimator, WindowManager,
};
use shellmate_runtime::{BackendKind, BackendSettings};

use crate::{Cli, CliError};

const STANDARD_WINDOW: ContextWindow = ContextWindow {
    max_context_tokens: 4000,
    reserved_output_tokens: 1024,
};

/// Everything needed to talk to one model alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelProfile {
    pub alias: &'static str,
    pub backend: BackendKind,
    /// Model id sent on the wire
    pub wire_model: &'static str,
    /// OpenAI model whose token accounting approximates this one
    pub estimation_model: &'static str,
    pub window: ContextWindow,
    /// `Pair` for APIs that require the first non-system message to come
    /// from the user
    pub granularity: EvictionGranularity,
}

const fn openai(alias: &'static str, wire_model: &'static str) -> ModelProfile {
    ModelProfile {
        alias,
        backend: BackendKind::OpenAI,
        wire_model,
        estimation_model: wire_model,
        window: STANDARD_WINDOW,
        granularity: EvictionGranularity::Turn,
    }
}

const fn local(alias: &'static str, wire_model: &'static str) -> ModelProfile {
    ModelProfile {
        alias,
        backend: BackendKind::Local,
        wire_model,
        estimation_model: "gpt-3.5-turbo",
        window: STANDARD_WINDOW,
        granularity: EvictionGranularity::Turn,
    }
}

const fn hugging_face(alias: &'static str, wire_model: &'static str) -> ModelProfile {
    ModelProfile {
        alias,
        backend: BackendKind::HuggingFace,
        wire_model,
        estimation_model: "gpt-3.5-turbo",
        window: ContextWindow {
            max_context_tokens: 4000,
            reserved_output_tokens: 384,
        },
        granularity: EvictionGranularity::Pair,
    }
}

pub const PROFILES: &[ModelProfile] = &[
    openai("gpt35", "gpt-3.5-turbo"),
    openai("gpt4", "gpt-4"),
    ModelProfile {
        alias: "claude",
        backend: BackendKind::Anthropic,
        wire_model: "claude-3-haiku-20240307",
        estimation_model: "gpt-4-turbo",
        window: ContextWindow {
            max_context_tokens: 3800,
            reserved_output_tokens: 1024,
        },
        granularity: EvictionGranularity::Pair,
    },
    ModelProfile {
        alias: "gemini",
        backend: BackendKind::Gemini,
        wire_model: "gemini-pro",
        estimation_model: "gpt-4-turbo",
        window: STANDARD_WINDOW,
        granularity: EvictionGranularity::Pair,
    },
    local("mistral-q4", "mistral-7b-instruct-v0.2.Q4_K_M.gguf"),
    local("mistral-q6", "mistral-7b-instruct-v0.2.Q6_K.gguf"),
    hugging_face("zephyr", "HuggingFaceH4/zephyr-7b-beta"),
    hugging_face("openchat", "openchat/openchat-3.5-0106"),
    hugging_face("gemma", "google/gemma-7b-it"),
    hugging_face("mistral", "mistralai/Mistral-7B-Instruct-v0.2"),
];

impl ModelProfile {
    pub fn lookup(alias: &str) -> Result<Self, CliError> {
        let wanted = alias.trim().to_ascii_lowercase();
        PROFILES
            .iter()
            .find(|profile| profile.alias == wanted)
            .copied()
            .ok_or_else(|| {
                CliError::InvalidArgument(format!(
                    "unsupported model '{alias}', expected one of: {}",
                    supported_aliases().join(", ")
                ))
            })
    }
}

pub fn supported_aliases() -> Vec<&'static str> {
    PROFILES.iter().map(|profile| profile.alias).collect()
}

/// Command-line options resolved against the selected profile.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub profile: ModelProfile,
    pub window: ContextWindow,
    pub temperature: f32,
    pub policy: ExhaustionPolicy,
    pub base_url: Option<String>,
}

impl Settings {
    pub fn new(profile: ModelProfile) -> Self {
        Self {
            profile,
            window: profile.window,
            temperature: 0.1,
            policy: ExhaustionPolicy::default(),
            base_url: None,
        }
    }

    pub fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        let profile = ModelProfile::lookup(&cli.model)?;

        if !(0.0..=2.0).contains(&cli.temperature) {
            return Err(CliError::InvalidArgument(format!(
                "temperature must be between 0 and 2, got {}",
                cli.temperature
            )));
        }

        let window = ContextWindow::new(
            cli.max_context_tokens
                .unwrap_or(profile.window.max_context_tokens),
            cli.reserved_output_tokens
                .unwrap_or(profile.window.reserved_output_tokens),
        );
        if window.input_budget() == 0 {
            return Err(CliError::Config(format!(
                "reserved output tokens ({}) leave no input budget in a {}-token window",
                window.reserved_output_tokens, window.max_context_tokens
            )));
        }

        Ok(Self {
            profile,
            window,
            temperature: cli.temperature,
            policy: cli.on_overflow.into(),
            base_url: cli.base_url.clone(),
        })
    }

    /// Backend connection settings, with the API key read from the environment.
    pub fn backend_settings(&self) -> BackendSettings {
        BackendSettings::from_env(self.profile.backend).with_base_url(self.base_url.clone())
    }

    pub fn window_manager(&self) -> WindowManager {
        WindowManager::new(TokenEstimator::openai())
            .with_granularity(self.profile.granularity)
            .with_policy(self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OverflowPolicy;
    use clap::Parser;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("shellmate").chain(args.iter().copied()))
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let profile = ModelProfile::lookup(" Claude ").unwrap();

        assert_eq!(profile.backend, BackendKind::Anthropic);
        assert_eq!(profile.window.input_budget(), 2776);
        assert_eq!(profile.estimation_model, "gpt-4-turbo");
    }

    #[test]
    fn unknown_alias_lists_supported_models() {
        let err = ModelProfile::lookup("bloom").unwrap_err();

        let message = err.to_string();
        assert!(message.contains("bloom"));
        assert!(message.contains("gpt35"));
        assert!(message.contains("zephyr"));
    }

    #[test]
    fn aliases_are_unique() {
        let mut aliases = supported_aliases();
        aliases.sort_unstable();
        aliases.dedup();

        assert_eq!(aliases.len(), PROFILES.len());
    }

    #[test]
    fn hugging_face_profiles_evict_in_pairs() {
        for profile in PROFILES.iter().filter(|p| p.backend == BackendKind::HuggingFace) {
            assert_eq!(profile.granularity, EvictionGranularity::Pair);
            assert_eq!(profile.window.reserved_output_tokens, 384);
        }
    }

    #[test]
    fn user_first_backends_evict_in_pairs() {
        for alias in ["claude", "gemini"] {
            let profile = ModelProfile::lookup(alias).unwrap();

            assert_eq!(profile.granularity, EvictionGranularity::Pair, "{alias}");
        }
    }

    #[test]
    fn window_overrides_apply_on_top_of_profile() {
        let cli = parse(&[
            "--model",
            "gpt4",
            "--max-context-tokens",
            "8000",
            "--on-overflow",
            "best-effort",
        ]);

        let settings = Settings::from_cli(&cli).unwrap();

        assert_eq!(settings.profile.wire_model, "gpt-4");
        assert_eq!(settings.window, ContextWindow::new(8000, 1024));
        assert_eq!(settings.policy, ExhaustionPolicy::BestEffort);
        assert_eq!(cli.on_overflow, OverflowPolicy::BestEffort);
    }

    #[test]
    fn reservation_swallowing_window_is_rejected() {
        let cli = parse(&[
            "--model",
            "gpt35",
            "--max-context-tokens",
            "1000",
            "--reserved-output-tokens",
            "1000",
        ]);

        let err = Settings::from_cli(&cli).unwrap_err();

        assert!(matches!(err, CliError::Config(_)));
    }

    #[test]
    fn out_of_range_temperature_is_rejected() {
        let cli = parse(&["--model", "gpt35", "--temperature", "3.5"]);

        assert!(matches!(
            Settings::from_cli(&cli),
            Err(CliError::InvalidArgument(_))
        ));
    }
}
