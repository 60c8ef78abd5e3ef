//! Chat rounds and one-shot command translation

use std::sync::Arc;

use futures::StreamExt;
use shellmate_context::{ContextError, Conversation, Turn, WindowFit, WindowManager};
use shellmate_runtime::{BackendError, ChatBackend, ChatRequest, StreamChunk};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commands::{parse_suggestion, CommandParseError, SuggestedCommand};
use crate::config::Settings;
use crate::prompts::{self, CHAT_EVICTION_INDEX, COMMAND_EVICTION_INDEX, COMMAND_TEMPERATURE};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Command(#[from] CommandParseError),
}

/// What one committed chat round cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOutcome {
    pub reply: String,
    pub input_tokens: usize,
    pub max_output_tokens: u32,
    pub evicted: usize,
    /// False only under the best-effort policy when trimming fell short
    pub within_budget: bool,
}

/// Trim `conversation` for sending and size the reply allowance.
fn fit_request(
    manager: &WindowManager,
    settings: &Settings,
    conversation: &mut Conversation,
    eviction_index: usize,
    temperature: f32,
) -> Result<(ChatRequest, WindowFit), SessionError> {
    let fit = manager.check_reduce_context(
        conversation,
        settings.window.input_budget(),
        settings.profile.estimation_model,
        eviction_index,
    )?;
    let max_tokens = u32::try_from(settings.window.output_budget(fit.tokens)).unwrap_or(u32::MAX);

    let request = ChatRequest {
        turns: conversation.turns().to_vec(),
        model: settings.profile.wire_model.to_string(),
        max_tokens,
        temperature,
    };
    Ok((request, fit))
}

/// A multi-turn chat with one backend.
///
/// The conversation only changes when a round completes: a failed round
/// leaves it exactly as it was before the user's text was submitted.
pub struct ChatSession {
    id: Uuid,
    backend: Arc<dyn ChatBackend>,
    manager: WindowManager,
    settings: Settings,
    conversation: Conversation,
}

impl ChatSession {
    pub fn new(backend: Arc<dyn ChatBackend>, settings: Settings) -> Self {
        let manager = settings.window_manager();
        Self::with_manager(backend, manager, settings)
    }

    pub fn with_manager(
        backend: Arc<dyn ChatBackend>,
        manager: WindowManager,
        settings: Settings,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend,
            manager,
            settings,
            conversation: prompts::chat_conversation(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Drop every live turn and start over from the priming region.
    pub fn reset(&mut self) {
        self.conversation.truncate(CHAT_EVICTION_INDEX);
        info!(session = %self.id, "conversation cleared");
    }

    /// Estimated input tokens of the conversation as it stands.
    pub fn estimated_tokens(&self) -> Result<usize, SessionError> {
        Ok(self.manager.estimator().estimate(
            self.conversation.turns(),
            self.settings.profile.estimation_model,
        )?)
    }

    /// Run one round, handing each streamed delta to `on_delta` as it arrives.
    pub async fn round<F>(&mut self, user_text: &str, mut on_delta: F) -> Result<RoundOutcome, SessionError>
    where
        F: FnMut(&str),
    {
        let mut working = self.conversation.clone();
        working.push(Turn::user(user_text));

        let (request, fit) = fit_request(
            &self.manager,
            &self.settings,
            &mut working,
            CHAT_EVICTION_INDEX,
            self.settings.temperature,
        )?;
        if !fit.is_within_budget() {
            warn!(
                session = %self.id,
                tokens = fit.tokens,
                limit = self.settings.window.input_budget(),
                "sending over-budget conversation"
            );
        }
        let max_output_tokens = request.max_tokens;
        debug!(
            session = %self.id,
            backend = self.backend.name(),
            input_tokens = fit.tokens,
            evicted = fit.evicted.len(),
            max_output_tokens,
            "sending chat round"
        );

        let mut stream = self.backend.send_stream(request).await?;
        let mut reply = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Delta { text } => {
                    on_delta(&text);
                    reply.push_str(&text);
                }
                StreamChunk::Done => break,
            }
        }

        working.push(Turn::assistant(reply.clone()));
        self.conversation = working;

        Ok(RoundOutcome {
            reply,
            input_tokens: fit.tokens,
            max_output_tokens,
            evicted: fit.evicted.len(),
            within_budget: fit.is_within_budget(),
        })
    }
}

/// Translate one natural-language request into shell commands.
///
/// Each request gets a fresh priming conversation and is sent without
/// streaming at a near-zero temperature.
pub async fn translate_command(
    backend: &dyn ChatBackend,
    manager: &WindowManager,
    settings: &Settings,
    request: &str,
    fast: bool,
) -> Result<Vec<SuggestedCommand>, SessionError> {
    let mut conversation = prompts::command_conversation(fast);
    conversation.push(Turn::user(prompts::format_user_request(
        request,
        &prompts::user_platform(),
    )));

    let (chat_request, fit) = fit_request(
        manager,
        settings,
        &mut conversation,
        COMMAND_EVICTION_INDEX,
        COMMAND_TEMPERATURE,
    )?;
    debug!(
        backend = backend.name(),
        input_tokens = fit.tokens,
        evicted = fit.evicted.len(),
        fast,
        "translating command request"
    );

    let response = backend.send(chat_request).await?;
    parse_suggestion(&response.content).map_err(|err| {
        warn!(error = %err, output = %response.content, "model reply did not contain commands");
        SessionError::from(err)
    })
}
