//! Context window budgeting

use serde::{Deserialize, Serialize};

/// Context window configuration for one backend model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextWindow {
    /// Maximum tokens the model accepts for input plus output
    pub max_context_tokens: usize,
    /// Floor on the tokens left for the model's reply
    pub reserved_output_tokens: usize,
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self {
            max_context_tokens: 4000,
            reserved_output_tokens: 1024,
        }
    }
}

impl ContextWindow {
    pub fn new(max_context_tokens: usize, reserved_output_tokens: usize) -> Self {
        Self {
            max_context_tokens,
            reserved_output_tokens,
        }
    }

    /// Input token budget the window manager trims against.
    pub fn input_budget(&self) -> usize {
        self.max_context_tokens
            .saturating_sub(self.reserved_output_tokens)
    }

    /// Output allowance for a request whose trimmed input measured `n_input_tokens`.
    ///
    /// Never below `reserved_output_tokens`; input headroom left unused is
    /// handed to the reply.
    pub fn output_budget(&self, n_input_tokens: usize) -> usize {
        self.reserved_output_tokens
            .max(self.max_context_tokens.saturating_sub(n_input_tokens))
    }
}
