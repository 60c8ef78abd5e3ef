//! Concrete backend adapters

pub mod anthropic;
pub mod gemini;
pub mod huggingface;
pub mod openai;

pub use anthropic::AnthropicBackend;
pub use gemini::GeminiBackend;
pub use huggingface::HuggingFaceBackend;
pub use openai::OpenAIBackend;
