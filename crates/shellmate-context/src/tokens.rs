//! Token estimation
//!
//! Estimates how many input tokens a list of turns costs once serialized for
//! a chat model. The count is built from a per-family fixed overhead table
//! plus a sub-word tokenization of each field, so it never calls the model.
//! The overhead values follow the published chat-format accounting for the
//! GPT families; other providers reuse one of those snapshots as a proxy.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conversation::Turn;
use crate::error::{ContextError, ContextResult};

/// Every reply is primed with `<|start|>assistant<|message|>`.
pub const REPLY_PRIMER_TOKENS: usize = 3;

/// Sub-word encoder for a single model family.
pub trait TokenEncoder: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;

    fn count(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// Hands out an encoder for a model identifier.
pub trait TokenizerProvider: Send + Sync {
    fn encoder_for(&self, model: &str) -> ContextResult<Arc<dyn TokenEncoder>>;
}

/// Fixed per-message costs layered on top of the encoded text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageOverhead {
    pub tokens_per_message: i64,
    /// Added when a turn carries a `name`. Negative when the name replaces the role.
    pub tokens_per_name: i64,
}

impl MessageOverhead {
    pub const fn new(tokens_per_message: i64, tokens_per_name: i64) -> Self {
        Self {
            tokens_per_message,
            tokens_per_name,
        }
    }
}

/// Dated snapshots of one model family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFamily {
    /// Substring that identifies the family in a model id, e.g. `gpt-4`.
    pub name: String,
    /// Snapshot used for ids that match the family but no known snapshot.
    pub current_snapshot: String,
    pub snapshots: Vec<(String, MessageOverhead)>,
}

impl ModelFamily {
    pub fn new(name: impl Into<String>, current_snapshot: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current_snapshot: current_snapshot.into(),
            snapshots: Vec::new(),
        }
    }

    pub fn snapshot(mut self, id: impl Into<String>, overhead: MessageOverhead) -> Self {
        self.snapshots.push((id.into(), overhead));
        self
    }

    fn overhead_of(&self, id: &str) -> Option<MessageOverhead> {
        self.snapshots
            .iter()
            .find(|(snapshot, _)| snapshot == id)
            .map(|(_, overhead)| *overhead)
    }
}

/// Immutable overhead table handed to the estimator.
///
/// Families are matched in order, so put more specific names first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTable {
    families: Vec<ModelFamily>,
}

/// A model id resolved to a concrete snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub snapshot: String,
    pub overhead: MessageOverhead,
}

impl ModelTable {
    pub fn new(families: Vec<ModelFamily>) -> Self {
        Self { families }
    }

    /// GPT-3.5 and GPT-4 snapshots with their chat-format overheads.
    pub fn openai_defaults() -> Self {
        let standard = MessageOverhead::new(3, 1);
        Self::new(vec![
            ModelFamily::new("gpt-3.5-turbo", "gpt-3.5-turbo-0613")
                .snapshot("gpt-3.5-turbo-0613", standard)
                .snapshot("gpt-3.5-turbo-16k-0613", standard)
                // every message follows <|start|>{role/name}\n{content}<|end|>\n
                .snapshot("gpt-3.5-turbo-0301", MessageOverhead::new(4, -1)),
            ModelFamily::new("gpt-4", "gpt-4-0613")
                .snapshot("gpt-4-0314", standard)
                .snapshot("gpt-4-32k-0314", standard)
                .snapshot("gpt-4-0613", standard)
                .snapshot("gpt-4-32k-0613", standard),
        ])
    }

    pub fn families(&self) -> &[ModelFamily] {
        &self.families
    }

    /// Exact snapshot first, then the first family whose name occurs in `model`.
    pub fn resolve(&self, model: &str) -> ContextResult<ResolvedModel> {
        for family in &self.families {
            if let Some(overhead) = family.overhead_of(model) {
                return Ok(ResolvedModel {
                    snapshot: model.to_string(),
                    overhead,
                });
            }
        }

        for family in &self.families {
            if model.contains(family.name.as_str()) {
                let overhead = family
                    .overhead_of(&family.current_snapshot)
                    .ok_or_else(|| ContextError::UnsupportedModel(model.to_string()))?;
                debug!(
                    model,
                    snapshot = %family.current_snapshot,
                    "model may change over time, estimating with current snapshot"
                );
                return Ok(ResolvedModel {
                    snapshot: family.current_snapshot.clone(),
                    overhead,
                });
            }
        }

        Err(ContextError::UnsupportedModel(model.to_string()))
    }
}

impl Default for ModelTable {
    fn default() -> Self {
        Self::openai_defaults()
    }
}

/// Approximate input-token counter for a conversation.
#[derive(Clone)]
pub struct TokenEstimator {
    table: ModelTable,
    provider: Arc<dyn TokenizerProvider>,
}

impl std::fmt::Debug for TokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEstimator")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl TokenEstimator {
    pub fn new(table: ModelTable, provider: Arc<dyn TokenizerProvider>) -> Self {
        Self { table, provider }
    }

    /// OpenAI overhead table with tiktoken encoders.
    #[cfg(feature = "tiktoken")]
    pub fn openai() -> Self {
        Self::new(ModelTable::openai_defaults(), Arc::new(TiktokenProvider::new()))
    }

    pub fn table(&self) -> &ModelTable {
        &self.table
    }

    /// Estimated input tokens for `turns`, including the reply primer.
    pub fn estimate(&self, turns: &[Turn], model: &str) -> ContextResult<usize> {
        let resolved = self.table.resolve(model)?;
        let encoder = self.provider.encoder_for(&resolved.snapshot)?;

        let body: i64 = turns
            .iter()
            .map(|turn| raw_turn_cost(encoder.as_ref(), resolved.overhead, turn))
            .sum();

        Ok(clamp(body + REPLY_PRIMER_TOKENS as i64))
    }

    /// Tokens a single turn adds to an estimate, without the reply primer.
    pub fn turn_cost(&self, turn: &Turn, model: &str) -> ContextResult<usize> {
        let resolved = self.table.resolve(model)?;
        let encoder = self.provider.encoder_for(&resolved.snapshot)?;
        Ok(clamp(raw_turn_cost(
            encoder.as_ref(),
            resolved.overhead,
            turn,
        )))
    }
}

fn raw_turn_cost(encoder: &dyn TokenEncoder, overhead: MessageOverhead, turn: &Turn) -> i64 {
    let mut tokens = overhead.tokens_per_message;
    tokens += encoder.count(turn.role().as_str()) as i64;
    tokens += encoder.count(turn.content()) as i64;
    if let Some(name) = turn.name() {
        tokens += encoder.count(name) as i64;
        tokens += overhead.tokens_per_name;
    }
    tokens
}

fn clamp(tokens: i64) -> usize {
    usize::try_from(tokens).unwrap_or(0)
}

#[cfg(feature = "tiktoken")]
pub use self::bpe::TiktokenProvider;

#[cfg(feature = "tiktoken")]
mod bpe {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, PoisonError};

    use tracing::warn;

    use super::{TokenEncoder, TokenizerProvider};
    use crate::error::{ContextError, ContextResult};

    /// BPE encoders from `tiktoken-rs`, cached per model id.
    #[derive(Default)]
    pub struct TiktokenProvider {
        cache: Mutex<HashMap<String, Arc<dyn TokenEncoder>>>,
    }

    impl TiktokenProvider {
        pub fn new() -> Self {
            Self::default()
        }
    }

    struct TiktokenEncoder {
        bpe: tiktoken_rs::CoreBPE,
    }

    impl TokenEncoder for TiktokenEncoder {
        fn encode(&self, text: &str) -> Vec<u32> {
            self.bpe
                .encode_with_special_tokens(text)
                .into_iter()
                .map(|token| token as u32)
                .collect()
        }
    }

    impl TokenizerProvider for TiktokenProvider {
        fn encoder_for(&self, model: &str) -> ContextResult<Arc<dyn TokenEncoder>> {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(encoder) = cache.get(model) {
                return Ok(Arc::clone(encoder));
            }

            let bpe = if let Ok(bpe) = tiktoken_rs::get_bpe_from_model(model) {
                bpe
            } else {
                warn!(model, "model not found, using cl100k_base encoding");
                tiktoken_rs::cl100k_base().map_err(|err| ContextError::Tokenizer(err.to_string()))?
            };

            let encoder: Arc<dyn TokenEncoder> = Arc::new(TiktokenEncoder { bpe });
            cache.insert(model.to_string(), Arc::clone(&encoder));
            Ok(encoder)
        }
    }
}
