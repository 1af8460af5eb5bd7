//! Transport to the chat backend.
//!
//! The session controller only talks to the [`ChatBackend`] trait, so turns
//! can be driven by the real HTTP client or by a scripted backend in tests.

use crate::error::{ChatError, Result};
use crate::protocol::{ChatRequest, VisionChatRequest, VisionChatResponse};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{StatusCode, header};
use std::pin::Pin;
use tracing::{debug, info};

/// Raw body of a streaming response, as delivered by the network.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

const MAX_ERROR_BODY: usize = 512;

/// The two endpoints a chat turn can use.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Opens the event-stream response for a text-only turn.
    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream>;

    /// Sends a turn with images and waits for the whole answer.
    async fn send_vision(&self, request: &VisionChatRequest) -> Result<VisionChatResponse>;
}

/// [`ChatBackend`] over HTTP using `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpChatBackend {
    client: reqwest::Client,
    chat_url: String,
    vision_url: String,
}

impl HttpChatBackend {
    /// Creates a client for a backend rooted at `base_url`.
    ///
    /// The streaming endpoint is `{base_url}/api/v1/chat` and the vision
    /// endpoint is `{base_url}/api/chat`.
    pub fn new(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            client: reqwest::Client::new(),
            chat_url: format!("{}/api/v1/chat", base),
            vision_url: format!("{}/api/chat", base),
        }
    }

    /// Points vision requests somewhere other than the default route.
    pub fn with_vision_url(mut self, url: impl Into<String>) -> Self {
        self.vision_url = url.into();
        self
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }

    pub fn vision_url(&self) -> &str {
        &self.vision_url
    }
}

/// Turns a non-success response into [`ChatError::HttpStatus`].
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        body.truncate(cut);
    }
    Err(ChatError::HttpStatus {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream> {
        debug!(url = %self.chat_url, conversation_id = %request.conversation_id, "Opening chat stream");
        let response = self
            .client
            .post(&self.chat_url)
            .header(header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Err(ChatError::MissingBody);
        }

        info!(status = %response.status(), "Chat stream opened");
        Ok(Box::pin(
            response.bytes_stream().map(|item| item.map_err(ChatError::from)),
        ))
    }

    async fn send_vision(&self, request: &VisionChatRequest) -> Result<VisionChatResponse> {
        info!(
            url = %self.vision_url,
            images = request.images.len(),
            "Sending vision request"
        );
        let response = self
            .client
            .post(&self.vision_url)
            .json(request)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| ChatError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ImageAttachment, Language};
    use futures::TryStreamExt;
    use wiremock::matchers::{body_json, header as header_matcher, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chat_request() -> ChatRequest {
        ChatRequest {
            message: "Xin chào".to_string(),
            conversation_id: "conv-1".to_string(),
            language: Language::Vi,
        }
    }

    #[test]
    fn test_endpoint_urls() {
        let backend = HttpChatBackend::new("http://localhost:8000/");
        assert_eq!(backend.chat_url(), "http://localhost:8000/api/v1/chat");
        assert_eq!(backend.vision_url(), "http://localhost:8000/api/chat");

        let backend = backend.with_vision_url("http://vision.local/api/chat");
        assert_eq!(backend.vision_url(), "http://vision.local/api/chat");
    }

    #[tokio::test]
    async fn test_open_stream_posts_json_and_yields_body() {
        let server = MockServer::start().await;
        let body = "data: {\"type\":\"done\"}\n\n";
        Mock::given(method("POST"))
            .and(path("/api/v1/chat"))
            .and(header_matcher("accept", "text/event-stream"))
            .and(body_json(serde_json::json!({
                "message": "Xin chào",
                "conversation_id": "conv-1",
                "language": "vi"
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpChatBackend::new(&server.uri());
        let stream = backend.open_stream(&chat_request()).await.unwrap();
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        let received: Vec<u8> = chunks.concat();
        assert_eq!(received, body.as_bytes());
    }

    #[tokio::test]
    async fn test_open_stream_maps_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let backend = HttpChatBackend::new(&server.uri());
        match backend.open_stream(&chat_request()).await {
            Err(ChatError::HttpStatus { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("Expected HttpStatus error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_open_stream_no_content_is_missing_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let backend = HttpChatBackend::new(&server.uri());
        let result = backend.open_stream(&chat_request()).await;
        assert!(matches!(result, Err(ChatError::MissingBody)));
    }

    #[tokio::test]
    async fn test_send_vision_parses_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "answer": "Đây là logo của trường.",
                "confidence": 0.75,
                "source_references": [{"chunk_id": "3", "relevance_score": 0.85}]
            })))
            .mount(&server)
            .await;

        let backend = HttpChatBackend::new(&server.uri());
        let request = VisionChatRequest {
            message: "Ảnh này là gì?".to_string(),
            conversation_id: "conv-1".to_string(),
            language: Language::Vi,
            images: vec![ImageAttachment {
                base64: "aGVsbG8=".to_string(),
                mime_type: "image/png".to_string(),
                name: "logo.png".to_string(),
            }],
        };
        let response = backend.send_vision(&request).await.unwrap();
        assert_eq!(response.text(), Some("Đây là logo của trường."));
        assert_eq!(response.confidence, Some(0.75));
        assert_eq!(response.source_references.len(), 1);
    }

    #[tokio::test]
    async fn test_send_vision_rejects_non_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let backend = HttpChatBackend::new(&server.uri());
        let request = VisionChatRequest {
            message: "?".to_string(),
            conversation_id: "conv-1".to_string(),
            language: Language::En,
            images: vec![],
        };
        let result = backend.send_vision(&request).await;
        assert!(matches!(result, Err(ChatError::InvalidResponse(_))));
    }
}
