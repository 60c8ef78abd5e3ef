use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest_eventsource::{Event, RequestBuilderExt};
use serde::{Deserialize, Serialize};
use shellmate_context::Role;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    http_client, BackendError, BackendStream, ChatBackend, ChatRequest, ChatResponse, StreamChunk,
};

const ANTHROPIC_MESSAGES_PATH: &str = "/v1/messages";
const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    api_version: String,
}

impl AnthropicBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: http_client(Duration::from_secs(60)),
            api_key: api_key.into(),
            base_url: DEFAULT_ANTHROPIC_BASE_URL.to_string(),
            api_version: DEFAULT_ANTHROPIC_VERSION.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            ANTHROPIC_MESSAGES_PATH
        )
    }

    fn post(&self) -> reqwest::RequestBuilder {
        self.client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
    }

    /// The messages API has no system role; system turns move to `system`.
    fn payload(req: ChatRequest, stream: bool) -> AnthropicMessageRequest {
        let (system, rest): (Vec<_>, Vec<_>) = req
            .turns
            .into_iter()
            .partition(|turn| turn.role() == Role::System);

        let system = system
            .iter()
            .map(|turn| turn.content())
            .collect::<Vec<_>>()
            .join("\n\n");

        AnthropicMessageRequest {
            model: req.model,
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            system: (!system.is_empty()).then_some(system),
            stream,
            messages: rest
                .into_iter()
                .map(|turn| AnthropicInputMessage {
                    role: turn.role().as_str(),
                    content: vec![AnthropicInputBlock {
                        kind: "text",
                        text: turn.content().to_string(),
                    }],
                })
                .collect(),
        }
    }

    async fn parse_error_response(status: StatusCode, response: reqwest::Response) -> BackendError {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unable to read body>".to_string());

        let parsed = serde_json::from_str::<AnthropicErrorEnvelope>(&body)
            .ok()
            .map(|err| err.error.message)
            .unwrap_or_else(|| body.clone());

        BackendError::HttpStatus {
            status: status.as_u16(),
            body: parsed,
        }
    }
}

#[async_trait]
impl ChatBackend for AnthropicBackend {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn send(&self, req: ChatRequest) -> Result<ChatResponse, BackendError> {
        let payload = Self::payload(req, false);
        let response = self
            .post()
            .json(&payload)
            .send()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::parse_error_response(status, response).await);
        }

        let body: AnthropicMessageResponse = response
            .json()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))?;

        let content = body
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<String>();

        Ok(ChatResponse {
            content,
            model: Some(body.model),
            finish_reason: body.stop_reason,
        })
    }

    async fn send_stream(&self, req: ChatRequest) -> Result<BackendStream, BackendError> {
        let payload = Self::payload(req, true);
        let mut event_source = self
            .post()
            .json(&payload)
            .eventsource()
            .map_err(|err| BackendError::Transport(err.to_string()))?;

        let (tx, rx) = mpsc::channel::<Result<StreamChunk, BackendError>>(32);
        tokio::spawn(async move {
            let mut done_sent = false;

            while let Some(event) = event_source.next().await {
                match event {
                    Ok(Event::Open) => continue,
                    Ok(Event::Message(message)) => match message.event.as_str() {
                        "message_stop" => {
                            let _ = tx.send(Ok(StreamChunk::Done)).await;
                            done_sent = true;
                            event_source.close();
                            break;
                        }
                        "error" => {
                            let err =
                                match serde_json::from_str::<AnthropicErrorEnvelope>(&message.data) {
                                    Ok(envelope) => BackendError::Message(envelope.error.message),
                                    Err(err) => BackendError::Decode(err.to_string()),
                                };
                            let _ = tx.send(Err(err)).await;
                            event_source.close();
                            break;
                        }
                        "content_block_delta" => {
                            let delta =
                                match serde_json::from_str::<AnthropicStreamDelta>(&message.data) {
                                    Ok(value) => value,
                                    Err(err) => {
                                        let _ = tx
                                            .send(Err(BackendError::Decode(err.to_string())))
                                            .await;
                                        event_source.close();
                                        break;
                                    }
                                };

                            if let Some(text) = delta.delta.text {
                                if !text.is_empty() {
                                    let _ = tx.send(Ok(StreamChunk::Delta { text })).await;
                                }
                            }
                        }
                        _ => {}
                    },
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

            if !done_sent {
                let _ = tx.send(Ok(StreamChunk::Done)).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessageRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    messages: Vec<AnthropicInputMessage>,
}

#[derive(Debug, Serialize)]
struct AnthropicInputMessage {
    role: &'static str,
    content: Vec<AnthropicInputBlock>,
}

#[derive(Debug, Serialize)]
struct AnthropicInputBlock {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageResponse {
    model: String,
    content: Vec<AnthropicContentBlock>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamDelta {
    delta: AnthropicDeltaText,
}

#[derive(Debug, Deserialize)]
struct AnthropicDeltaText {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorEnvelope {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
}
