use std::str::FromStr;

use tracing::warn;

use crate::{
    AnthropicBackend, BackendError, ChatBackend, GeminiBackend, HuggingFaceBackend, OpenAIBackend,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    OpenAI,
    Anthropic,
    Gemini,
    HuggingFace,
    Local,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::OpenAI => "openai",
            BackendKind::Anthropic => "anthropic",
            BackendKind::Gemini => "gemini",
            BackendKind::HuggingFace => "huggingface",
            BackendKind::Local => "local",
        }
    }

    /// Environment variable holding this backend's API key, if it takes one.
    pub fn api_key_env(self) -> Option<&'static str> {
        match self {
            BackendKind::OpenAI => Some("OPENAI_API_KEY"),
            BackendKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            BackendKind::Gemini => Some("GOOGLE_API_KEY"),
            BackendKind::HuggingFace => Some("HUGGING_FACE_API_KEY"),
            BackendKind::Local => None,
        }
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(BackendKind::OpenAI),
            "anthropic" | "claude" => Ok(BackendKind::Anthropic),
            "gemini" | "google" => Ok(BackendKind::Gemini),
            "huggingface" | "hf" => Ok(BackendKind::HuggingFace),
            "local" | "llama.cpp" | "llamacpp" => Ok(BackendKind::Local),
            _ => Err(BackendError::Message(format!(
                "unsupported backend '{value}', expected one of: openai, anthropic, gemini, huggingface, local"
            ))),
        }
    }
}

/// Connection settings for one backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl BackendSettings {
    /// Read the backend's API key from the environment.
    pub fn from_env(kind: BackendKind) -> Self {
        let api_key = kind
            .api_key_env()
            .and_then(|name| std::env::var(name).ok())
            .filter(|key| !key.trim().is_empty());

        Self {
            api_key,
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }
}

pub fn create_backend(
    kind: BackendKind,
    settings: BackendSettings,
) -> Result<Box<dyn ChatBackend>, BackendError> {
    let BackendSettings { api_key, base_url } = settings;

    let required_key = || match (&api_key, kind.api_key_env()) {
        (Some(key), _) if !key.trim().is_empty() => Ok(key.clone()),
        (_, Some(env)) => Err(BackendError::MissingCredential(env.to_string())),
        (_, None) => Err(BackendError::Message(format!(
            "backend '{}' does not take an API key",
            kind.as_str()
        ))),
    };

    let backend: Box<dyn ChatBackend> = match kind {
        BackendKind::OpenAI => {
            let backend = OpenAIBackend::new(required_key()?);
            Box::new(match base_url {
                Some(url) => backend.with_base_url(url),
                None => backend,
            })
        }
        BackendKind::Local => {
            let backend = OpenAIBackend::local();
            Box::new(match base_url {
                Some(url) => backend.with_base_url(url),
                None => backend,
            })
        }
        BackendKind::Anthropic => {
            let backend = AnthropicBackend::new(required_key()?);
            Box::new(match base_url {
                Some(url) => backend.with_base_url(url),
                None => backend,
            })
        }
        BackendKind::Gemini => {
            let backend = GeminiBackend::new(required_key()?);
            Box::new(match base_url {
                Some(url) => backend.with_base_url(url),
                None => backend,
            })
        }
        BackendKind::HuggingFace => {
            let backend = HuggingFaceBackend::new(api_key.clone());
            if !backend.is_authenticated() {
                warn!("no Hugging Face API key set; requests are subject to anonymous rate limits");
            }
            Box::new(match base_url {
                Some(url) => backend.with_base_url(url),
                None => backend,
            })
        }
    };

    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::{create_backend, BackendKind, BackendSettings};
    use crate::BackendError;
    use std::str::FromStr;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn keyed(key: &str) -> BackendSettings {
        BackendSettings {
            api_key: Some(key.to_string()),
            base_url: None,
        }
    }

    #[test]
    fn parses_backend_kind_aliases() {
        assert_eq!(BackendKind::from_str("openai").unwrap(), BackendKind::OpenAI);
        assert_eq!(BackendKind::from_str("Claude").unwrap(), BackendKind::Anthropic);
        assert_eq!(BackendKind::from_str("google").unwrap(), BackendKind::Gemini);
        assert_eq!(BackendKind::from_str("hf").unwrap(), BackendKind::HuggingFace);
        assert_eq!(BackendKind::from_str(" llama.cpp ").unwrap(), BackendKind::Local);
        assert!(BackendKind::from_str("bloom").is_err());
    }

    #[test]
    fn create_backend_returns_expected_runtime_name() {
        assert_eq!(create_backend(BackendKind::OpenAI, keyed("k1")).unwrap().name(), "openai");
        assert_eq!(
            create_backend(BackendKind::Anthropic, keyed("k2")).unwrap().name(),
            "anthropic"
        );
        assert_eq!(create_backend(BackendKind::Gemini, keyed("k3")).unwrap().name(), "gemini");
        assert_eq!(
            create_backend(BackendKind::Local, BackendSettings::default())
                .unwrap()
                .name(),
            "local"
        );
    }

    #[test]
    fn hugging_face_key_is_optional() {
        let backend = create_backend(BackendKind::HuggingFace, BackendSettings::default()).unwrap();

        assert_eq!(backend.name(), "huggingface");
    }

    #[test]
    fn missing_required_key_names_the_variable() {
        let err = create_backend(BackendKind::Anthropic, BackendSettings::default())
            .err()
            .unwrap();

        assert_eq!(
            err,
            BackendError::MissingCredential("ANTHROPIC_API_KEY".to_string())
        );
        assert!(err
            .to_string()
            .contains("missing required environment variable 'ANTHROPIC_API_KEY'"));
    }

    #[test]
    fn blank_key_counts_as_missing() {
        let err = create_backend(BackendKind::OpenAI, keyed("   ")).err().unwrap();

        assert_eq!(err, BackendError::MissingCredential("OPENAI_API_KEY".to_string()));
    }

    #[test]
    fn settings_from_env_reads_backend_key() {
        let _guard = env_lock().lock().unwrap();
        std::env::set_var("GOOGLE_API_KEY", "test-key");

        let settings = BackendSettings::from_env(BackendKind::Gemini);
        assert_eq!(settings.api_key.as_deref(), Some("test-key"));
        assert!(create_backend(BackendKind::Gemini, settings).is_ok());

        std::env::remove_var("GOOGLE_API_KEY");
    }

    #[test]
    fn settings_from_env_ignores_empty_key() {
        let _guard = env_lock().lock().unwrap();
        std::env::set_var("OPENAI_API_KEY", "");

        let settings = BackendSettings::from_env(BackendKind::OpenAI);
        assert!(settings.api_key.is_none());

        std::env::remove_var("OPENAI_API_KEY");
    }
}
