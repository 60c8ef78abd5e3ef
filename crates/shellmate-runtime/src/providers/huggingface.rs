//! Hugging Face text-generation-inference adapter.
//!
//! TGI takes a single prompt string, so the turns are rendered into a
//! `User:` / `Assistant:` transcript and the reply is cut where the model
//! starts writing the next user line.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest_eventsource::{Event, RequestBuilderExt};
use serde::{Deserialize, Serialize};
use shellmate_context::{Role, Turn};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::{
    http_client, BackendError, BackendStream, ChatBackend, ChatRequest, ChatResponse, StreamChunk,
};

const DEFAULT_HF_BASE_URL: &str = "https://api-inference.huggingface.co";
const USER_MARKER: &str = "User:";

#[derive(Debug, Clone)]
pub struct HuggingFaceBackend {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl HuggingFaceBackend {
    /// Without a key the public inference API applies a low rate limit.
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: http_client(Duration::from_secs(25)),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            base_url: DEFAULT_HF_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.api_key.is_some()
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{}", self.base_url.trim_end_matches('/'), model)
    }

    fn post(&self, model: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(self.endpoint(model));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn payload(req: ChatRequest, stream: bool) -> (String, TgiRequest) {
        (
            req.model,
            TgiRequest {
                inputs: render_transcript(&req.turns),
                parameters: TgiParameters {
                    max_new_tokens: req.max_tokens,
                    temperature: (req.temperature > 0.0).then_some(req.temperature),
                    return_full_text: false,
                },
                stream,
            },
        )
    }

    async fn parse_error_response(status: StatusCode, response: reqwest::Response) -> BackendError {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unable to read body>".to_string());

        let parsed = serde_json::from_str::<TgiErrorEnvelope>(&body)
            .ok()
            .map(|err| err.error)
            .unwrap_or_else(|| body.clone());

        BackendError::HttpStatus {
            status: status.as_u16(),
            body: parsed,
        }
    }
}

/// Render turns as a plain-text transcript ending with an open assistant line.
pub fn render_transcript(turns: &[Turn]) -> String {
    let mut preamble = Vec::new();
    let mut lines = Vec::new();

    for turn in turns {
        match turn.role() {
            Role::System => preamble.push(turn.content()),
            Role::User => lines.push(format!("User: {}", turn.content())),
            Role::Assistant => lines.push(format!("Assistant: {}", turn.content())),
        }
    }

    let mut prompt = preamble.join("\n");
    if !prompt.is_empty() {
        prompt.push('\n');
    }
    prompt.push_str(&lines.join("\n"));
    prompt.push_str("\nAssistant:");
    prompt
}

/// Incremental cutter for generated text that runs past the assistant's turn.
///
/// Text that could be the start of a `User:` marker is held back until the
/// next token decides it.
#[derive(Debug, Default)]
pub struct TranscriptCutoff {
    generated: String,
    emitted: usize,
    stopped: bool,
}

impl TranscriptCutoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one token. Returns the text that is now safe to show, and whether
    /// generation should stop.
    pub fn push(&mut self, text: &str) -> (String, bool) {
        if self.stopped {
            return (String::new(), true);
        }
        self.generated.push_str(text);

        let marker = self
            .generated
            .match_indices(USER_MARKER)
            .map(|(idx, _)| idx)
            .find(|idx| *idx > 0);
        if let Some(idx) = marker {
            let end = self.generated[..idx].trim_end().len().max(self.emitted);
            let out = self.generated[self.emitted..end].to_string();
            self.emitted = end;
            self.stopped = true;
            return (out, true);
        }

        let safe = (self.generated.len() - held_back(&self.generated)).max(self.emitted);
        let out = self.generated[self.emitted..safe].to_string();
        self.emitted = safe;
        (out, false)
    }

    /// Release anything still held back once the stream has ended.
    pub fn finish(&mut self) -> String {
        if self.stopped {
            return String::new();
        }
        self.stopped = true;
        let out = self.generated[self.emitted..].to_string();
        self.emitted = self.generated.len();
        out
    }
}

/// Bytes at the end of `text` that may still turn into a marker: a partial
/// `User:` plus the whitespace in front of it.
fn held_back(text: &str) -> usize {
    let partial = (1..USER_MARKER.len())
        .rev()
        .find(|len| text.ends_with(&USER_MARKER[..*len]))
        .unwrap_or(0);
    let before = &text[..text.len() - partial];
    text.len() - before.trim_end().len()
}

/// Apply the same cut to a complete, non-streamed generation.
fn cut_at_user_marker(text: &str) -> &str {
    match text
        .match_indices(USER_MARKER)
        .map(|(idx, _)| idx)
        .find(|idx| *idx > 0)
    {
        Some(idx) => text[..idx].trim_end(),
        None => text,
    }
}

#[async_trait]
impl ChatBackend for HuggingFaceBackend {
    fn name(&self) -> &'static str {
        "huggingface"
    }

    async fn send(&self, req: ChatRequest) -> Result<ChatResponse, BackendError> {
        let (model, payload) = Self::payload(req, false);
        let response = self
            .post(&model)
            .json(&payload)
            .send()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::parse_error_response(status, response).await);
        }

        let body: Vec<TgiGeneration> = response
            .json()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))?;

        let generated = body
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Decode("missing generation in response".to_string()))?
            .generated_text;

        Ok(ChatResponse {
            content: cut_at_user_marker(&generated).trim().to_string(),
            model: Some(model),
            finish_reason: None,
        })
    }

    async fn send_stream(&self, req: ChatRequest) -> Result<BackendStream, BackendError> {
        let (model, payload) = Self::payload(req, true);
        let mut event_source = self
            .post(&model)
            .json(&payload)
            .eventsource()
            .map_err(|err| BackendError::Transport(err.to_string()))?;

        let (tx, rx) = mpsc::channel::<Result<StreamChunk, BackendError>>(32);
        tokio::spawn(async move {
            let mut cutoff = TranscriptCutoff::new();

            while let Some(event) = event_source.next().await {
                match event {
                    Ok(Event::Open) => continue,
                    Ok(Event::Message(message)) => {
                        let chunk = match serde_json::from_str::<TgiStreamEvent>(&message.data) {
                            Ok(chunk) => chunk,
                            Err(err) => {
                                let _ = tx.send(Err(BackendError::Decode(err.to_string()))).await;
                                event_source.close();
                                break;
                            }
                        };

                        if chunk.token.special {
                            debug!(token = %chunk.token.text, "skipping special token");
                        } else {
                            let (text, stop) = cutoff.push(&chunk.token.text);
                            if !text.is_empty() {
                                let _ = tx.send(Ok(StreamChunk::Delta { text })).await;
                            }
                            if stop {
                                event_source.close();
                                break;
                            }
                        }

                        if chunk.generated_text.is_some() {
                            event_source.close();
                            break;
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                        let _ = tx
                            .send(Err(Self::parse_error_response(status, response).await))
                            .await;
                        event_source.close();
                        break;
                    }
                    Err(err) => {
                        let _ = tx.send(Err(BackendError::Transport(err.to_string()))).await;
                        event_source.close();
                        break;
                    }
                }
            }

            let rest = cutoff.finish();
            if !rest.is_empty() {
                let _ = tx.send(Ok(StreamChunk::Delta { text: rest })).await;
            }
            let _ = tx.send(Ok(StreamChunk::Done)).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[derive(Debug, Serialize)]
struct TgiRequest {
    inputs: String,
    parameters: TgiParameters,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct TgiParameters {
    max_new_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    return_full_text: bool,
}

#[derive(Debug, Deserialize)]
struct TgiGeneration {
    generated_text: String,
}

#[derive(Debug, Deserialize)]
struct TgiStreamEvent {
    token: TgiToken,
    generated_text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgiToken {
    text: String,
    #[serde(default)]
    special: bool,
}

#[derive(Debug, Deserialize)]
struct TgiErrorEnvelope {
    error: String,
}
