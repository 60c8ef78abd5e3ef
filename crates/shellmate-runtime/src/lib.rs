//! Backend abstractions for chat-style language models.
//!
//! Every adapter speaks [`ChatBackend`]: a trimmed, role-tagged turn list goes
//! in, either a whole reply or a stream of text deltas comes out.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use shellmate_context::Turn;
use thiserror::Error;

pub mod providers;
pub mod registry;

pub use providers::{AnthropicBackend, GeminiBackend, HuggingFaceBackend, OpenAIBackend};
pub use registry::{create_backend, BackendKind, BackendSettings};

/// One request to a backend: the already-trimmed turns plus sampling knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub turns: Vec<Turn>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: Option<String>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamChunk {
    Delta { text: String },
    Done,
}

pub type BackendStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, BackendError>> + Send>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("failed to decode backend response: {0}")]
    Decode(String),
    #[error("missing required environment variable '{0}'")]
    MissingCredential(String),
    #[error("mock backend has no queued response")]
    MockQueueEmpty,
    #[error("backend error: {0}")]
    Message(String),
}

impl BackendError {
    /// True for HTTP 429 responses.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, BackendError::HttpStatus { status: 429, .. })
    }
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, req: ChatRequest) -> Result<ChatResponse, BackendError>;

    async fn send_stream(&self, req: ChatRequest) -> Result<BackendStream, BackendError>;
}

pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "falling back to default http client");
            reqwest::Client::new()
        })
}

/// Scripted backend for tests. Records every request it receives.
#[derive(Debug, Default)]
pub struct MockBackend {
    send_queue: Mutex<VecDeque<Result<ChatResponse, BackendError>>>,
    stream_queue: Mutex<VecDeque<Result<Vec<StreamChunk>, BackendError>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_send(&self, result: Result<ChatResponse, BackendError>) {
        self.send_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
    }

    pub fn enqueue_stream(&self, result: Result<Vec<StreamChunk>, BackendError>) {
        self.stream_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
    }

    /// Convenience for a stream that yields `parts` as deltas, then `Done`.
    pub fn enqueue_reply(&self, parts: &[&str]) {
        let mut chunks: Vec<StreamChunk> = parts
            .iter()
            .map(|part| StreamChunk::Delta {
                text: (*part).to_string(),
            })
            .collect();
        chunks.push(StreamChunk::Done);
        self.enqueue_stream(Ok(chunks));
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, req: ChatRequest) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(req);
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn send(&self, req: ChatRequest) -> Result<ChatResponse, BackendError> {
        self.record(req);
        self.send_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(Err(BackendError::MockQueueEmpty))
    }

    async fn send_stream(&self, req: ChatRequest) -> Result<BackendStream, BackendError> {
        self.record(req);
        let next = self
            .stream_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(Err(BackendError::MockQueueEmpty))?;

        Ok(Box::pin(stream::iter(next.into_iter().map(Ok))))
    }
}
