//! OpenAI chat completions adapter.
//!
//! Also drives a local llama.cpp server, which speaks the same wire protocol
//! without an API key.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest_eventsource::{Event, RequestBuilderExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    http_client, BackendError, BackendStream, ChatBackend, ChatRequest, ChatResponse, StreamChunk,
};

const OPENAI_CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_LOCAL_BASE_URL: &str = "http://127.0.0.1:8080";

#[derive(Debug, Clone)]
pub struct OpenAIBackend {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    name: &'static str,
}

impl OpenAIBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: http_client(Duration::from_secs(60)),
            api_key: Some(api_key.into()),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            name: "openai",
        }
    }

    /// Unauthenticated adapter for a llama.cpp server on the local machine.
    pub fn local() -> Self {
        Self {
            client: http_client(Duration::from_secs(60)),
            api_key: None,
            base_url: DEFAULT_LOCAL_BASE_URL.to_string(),
            name: "local",
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
            OPENAI_CHAT_COMPLETIONS_PATH
        )
    }

    fn post(&self) -> reqwest::RequestBuilder {
        let builder = self.client.post(self.endpoint());
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn payload(req: ChatRequest, stream: bool) -> OpenAIChatCompletionRequest {
        OpenAIChatCompletionRequest {
            model: req.model,
            messages: req
                .turns
                .into_iter()
                .map(|turn| OpenAIChatMessage {
                    role: turn.role().as_str(),
                    content: turn.content().to_string(),
                    name: turn.name().map(str::to_string),
                })
                .collect(),
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            stream,
        }
    }

    async fn parse_error_response(status: StatusCode, response: reqwest::Response) -> BackendError {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unable to read body>".to_string());

        let parsed = serde_json::from_str::<OpenAIErrorEnvelope>(&body)
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
impl ChatBackend for OpenAIBackend {
    fn name(&self) -> &'static str {
        self.name
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

        let body: OpenAIChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))?;

        let first_choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Decode("missing choice in response".to_string()))?;

        Ok(ChatResponse {
            content: first_choice.message.content.unwrap_or_default(),
            model: body.model,
            finish_reason: first_choice.finish_reason,
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
                    Ok(Event::Message(message)) => {
                        if message.data == "[DONE]" {
                            let _ = tx.send(Ok(StreamChunk::Done)).await;
                            done_sent = true;
                            event_source.close();
                            break;
                        }

                        let chunk =
                            match serde_json::from_str::<OpenAIChatCompletionChunk>(&message.data) {
                                Ok(chunk) => chunk,
                                Err(err) => {
                                    let _ = tx.send(Err(BackendError::Decode(err.to_string()))).await;
                                    event_source.close();
                                    break;
                                }
                            };

                        if let Some(choice) = chunk.choices.into_iter().next() {
                            if let Some(text) = choice.delta.content {
                                if !text.is_empty() {
                                    let _ = tx.send(Ok(StreamChunk::Delta { text })).await;
                                }
                            }

                            if choice.finish_reason.is_some() {
                                let _ = tx.send(Ok(StreamChunk::Done)).await;
                                done_sent = true;
                                event_source.close();
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(stream_error(err).await)).await;
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

/// Map an event-source failure, keeping the status and error message of a
/// rejected request.
async fn stream_error(err: reqwest_eventsource::Error) -> BackendError {
    match err {
        reqwest_eventsource::Error::InvalidStatusCode(status, response) => {
            OpenAIBackend::parse_error_response(status, response).await
        }
        other => BackendError::Transport(other.to_string()),
    }
}

#[derive(Debug, Serialize)]
struct OpenAIChatCompletionRequest {
    model: String,
    messages: Vec<OpenAIChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIChatMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatCompletionResponse {
    model: Option<String>,
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatCompletionChunk {
    choices: Vec<OpenAIChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChunkChoice {
    delta: OpenAIChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChunkDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorEnvelope {
    error: OpenAIErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::OpenAIBackend;
    use crate::{ChatBackend, ChatRequest, StreamChunk};
    use futures::StreamExt;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;
    use shellmate_context::Turn;

    fn network_tests_enabled() -> bool {
        matches!(std::env::var("SHELLMATE_RUN_NETWORK_TESTS"), Ok(value) if value == "1")
    }

    fn request() -> ChatRequest {
        ChatRequest {
            turns: vec![Turn::system("You are terse."), Turn::user("Say hello")],
            model: "gpt-3.5-turbo".to_string(),
            max_tokens: 32,
            temperature: 0.2,
        }
    }

    #[test]
    fn payload_keeps_turn_order_and_roles() {
        let payload = serde_json::to_value(OpenAIBackend::payload(request(), false)).unwrap();

        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][1]["role"], "user");
        assert_eq!(payload["messages"][1]["content"], "Say hello");
        assert_eq!(payload["max_tokens"], 32);
        assert!(payload["messages"][0].get("name").is_none());
    }

    #[test]
    fn local_backend_defaults_to_llama_cpp_address() {
        let backend = OpenAIBackend::local();

        assert_eq!(backend.name(), "local");
        assert_eq!(backend.endpoint(), "http://127.0.0.1:8080/v1/chat/completions");
    }

    #[tokio::test]
    async fn send_calls_openai_chat_completions_endpoint() {
        if !network_tests_enabled() {
            eprintln!("skipping network test: set SHELLMATE_RUN_NETWORK_TESTS=1 to enable");
            return;
        }

        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("authorization", "Bearer test-key")
                    .body_includes("\"stream\":false");
                then.status(200).json_body(json!({
                    "id": "chatcmpl-1",
                    "object": "chat.completion",
                    "model": "gpt-3.5-turbo",
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": "Hello there"},
                        "finish_reason": "stop"
                    }]
                }));
            })
            .await;

        let backend = OpenAIBackend::new("test-key").with_base_url(server.base_url());
        let response = backend.send(request()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.content, "Hello there");
        assert_eq!(response.model.as_deref(), Some("gpt-3.5-turbo"));
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn send_stream_reads_sse_and_emits_delta_chunks() {
        if !network_tests_enabled() {
            eprintln!("skipping network test: set SHELLMATE_RUN_NETWORK_TESTS=1 to enable");
            return;
        }

        let server = MockServer::start_async().await;
        let sse = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n"
        );

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .body_includes("\"stream\":true");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(sse);
            })
            .await;

        let backend = OpenAIBackend::local().with_base_url(server.base_url());
        let mut stream = backend.send_stream(request()).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        let done = stream.next().await.unwrap().unwrap();

        mock.assert_async().await;
        assert_eq!(first, StreamChunk::Delta { text: "Hel".to_string() });
        assert_eq!(second, StreamChunk::Delta { text: "lo".to_string() });
        assert_eq!(done, StreamChunk::Done);
    }

    #[tokio::test]
    async fn send_maps_non_success_status_to_backend_error() {
        if !network_tests_enabled() {
            eprintln!("skipping network test: set SHELLMATE_RUN_NETWORK_TESTS=1 to enable");
            return;
        }

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(429).json_body(json!({
                    "error": {
                        "message": "Rate limit exceeded",
                        "type": "rate_limit_error"
                    }
                }));
            })
            .await;

        let backend = OpenAIBackend::new("test-key").with_base_url(server.base_url());
        let err = backend.send(request()).await.unwrap_err();

        assert!(err.is_rate_limited());
        assert!(err.to_string().contains("Rate limit exceeded"));
    }
}
