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

const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Clone)]
pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: http_client(Duration::from_secs(60)),
            api_key: api_key.into(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn generate_endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            model
        )
    }

    fn stream_endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url.trim_end_matches('/'),
            model
        )
    }

    /// Key goes in a header: reqwest error text echoes the request URL.
    fn post(&self, url: String) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
    }

    fn payload(req: ChatRequest) -> (String, GeminiGenerateRequest) {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();

        for turn in req.turns {
            let part = GeminiPart {
                text: turn.content().to_string(),
            };
            match turn.role() {
                Role::System => system_parts.push(part),
                Role::User => contents.push(GeminiContent {
                    role: Some("user"),
                    parts: vec![part],
                }),
                Role::Assistant => contents.push(GeminiContent {
                    role: Some("model"),
                    parts: vec![part],
                }),
            }
        }

        (
            req.model,
            GeminiGenerateRequest {
                system_instruction: (!system_parts.is_empty()).then(|| GeminiContent {
                    role: None,
                    parts: system_parts,
                }),
                contents,
                generation_config: GeminiGenerationConfig {
                    max_output_tokens: req.max_tokens,
                    temperature: req.temperature,
                },
            },
        )
    }

    async fn parse_error_response(status: StatusCode, response: reqwest::Response) -> BackendError {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unable to read body>".to_string());

        let parsed = serde_json::from_str::<GeminiErrorEnvelope>(&body)
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
impl ChatBackend for GeminiBackend {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn send(&self, req: ChatRequest) -> Result<ChatResponse, BackendError> {
        let (model, payload) = Self::payload(req);

        let response = self
            .post(self.generate_endpoint(&model))
            .json(&payload)
            .send()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::parse_error_response(status, response).await);
        }

        let body: GeminiGenerateResponse = response
            .json()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))?;

        let first_candidate = body
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Decode("missing candidate in response".to_string()))?;

        let content = first_candidate
            .content
            .parts
            .into_iter()
            .map(|part| part.text)
            .collect::<String>();

        Ok(ChatResponse {
            content,
            model: Some(model),
            finish_reason: first_candidate.finish_reason,
        })
    }

    async fn send_stream(&self, req: ChatRequest) -> Result<BackendStream, BackendError> {
        let (model, payload) = Self::payload(req);
        let mut event_source = self
            .post(self.stream_endpoint(&model))
            .json(&payload)
            .eventsource()
            .map_err(|err| BackendError::Transport(err.to_string()))?;

        let (tx, rx) = mpsc::channel::<Result<StreamChunk, BackendError>>(32);
        tokio::spawn(async move {
            let mut done_sent = false;

            while let Some(event) = event_source.next().await {
                match event {
                    Ok(Event::Open) => continue,
                    Ok(Event::Message(message)) => {
                        let chunk =
                            match serde_json::from_str::<GeminiGenerateResponse>(&message.data) {
                                Ok(chunk) => chunk,
                                Err(err) => {
                                    let _ = tx.send(Err(BackendError::Decode(err.to_string()))).await;
                                    event_source.close();
                                    break;
                                }
                            };

                        if let Some(candidate) = chunk.candidates.into_iter().next() {
                            for part in candidate.content.parts {
                                if !part.text.is_empty() {
                                    let _ = tx.send(Ok(StreamChunk::Delta { text: part.text })).await;
                                }
                            }

                            if candidate.finish_reason.is_some() {
                                let _ = tx.send(Ok(StreamChunk::Done)).await;
                                done_sent = true;
                                event_source.close();
                                break;
                            }
                        }
                    }
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
struct GeminiGenerateRequest {
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GeminiGenerateResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: GeminiCandidateContent,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorEnvelope {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
}
