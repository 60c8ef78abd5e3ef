//! Shellmate Context Management - conversation windowing and token estimation
//!
//! This crate provides:
//! - Turn and conversation types
//! - Model-aware token estimation (tiktoken-backed, feature-gated)
//! - Oldest-first eviction that keeps a conversation under an input budget
//! - Output-token budgeting

pub mod conversation;
pub mod error;
pub mod manager;
pub mod tokens;
pub mod window;

pub use conversation::{Conversation, Role, Turn};
pub use error::{ContextError, ContextResult};
pub use manager::{EvictionGranularity, ExhaustionPolicy, FitState, WindowFit, WindowManager};
pub use tokens::{
    MessageOverhead, ModelFamily, ModelTable, ResolvedModel, TokenEncoder, TokenEstimator,
    TokenizerProvider, REPLY_PRIMER_TOKENS,
};
#[cfg(feature = "tiktoken")]
pub use tokens::TiktokenProvider;
pub use window::ContextWindow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::conversation::{Conversation, Role, Turn};
    pub use crate::error::{ContextError, ContextResult};
    pub use crate::manager::{ExhaustionPolicy, WindowManager};
    pub use crate::tokens::TokenEstimator;
    pub use crate::window::ContextWindow;
}
