//! Wire types for the chat backend.
//!
//! This module defines the events carried by the streaming endpoint, the
//! request bodies sent to both chat endpoints, and the one-shot response
//! returned by the vision endpoint.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One parsed `data:` frame from the streaming chat endpoint.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    /// Session correlation id, which may differ from the one the client chose.
    Metadata { conversation_id: String },
    /// Transient progress text, superseded by the next status or a terminal event.
    Status {
        #[serde(default)]
        message: String,
    },
    /// Retrieval provenance for the answer.
    Sources {
        #[serde(default)]
        source_references: Vec<SourceReference>,
        #[serde(default)]
        confidence: f64,
    },
    /// An incremental piece of the answer text.
    AnswerChunk {
        #[serde(default)]
        content: String,
    },
    /// Non-text payloads, finalized once per turn.
    Complete {
        #[serde(default)]
        attachments: Vec<FileAttachment>,
        #[serde(default)]
        chart_data: Vec<ChartData>,
    },
    /// Explicit end of stream.
    Done,
    /// Terminal failure reported by the backend.
    Error {
        #[serde(default)]
        message: String,
    },
}

impl ProtocolEvent {
    /// Whether this event ends the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProtocolEvent::Done | ProtocolEvent::Error { .. })
    }

    /// Short tag used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolEvent::Metadata { .. } => "metadata",
            ProtocolEvent::Status { .. } => "status",
            ProtocolEvent::Sources { .. } => "sources",
            ProtocolEvent::AnswerChunk { .. } => "answer_chunk",
            ProtocolEvent::Complete { .. } => "complete",
            ProtocolEvent::Done => "done",
            ProtocolEvent::Error { .. } => "error",
        }
    }
}

/// A retrieved document chunk backing part of an answer.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct SourceReference {
    #[serde(deserialize_with = "string_or_number")]
    pub chunk_id: String,
    #[serde(default)]
    pub relevance_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Any additional fields the backend attaches.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SourceReference {
    pub fn new(chunk_id: impl Into<String>, relevance_score: f64) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            relevance_score,
            document_id: None,
            document_title: None,
            content: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Accepts `"12"` or `12` for identifiers the backend may emit either way.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, found {}",
            other
        ))),
    }
}

/// A downloadable file produced alongside an answer.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct FileAttachment {
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_url: String,
    #[serde(default)]
    pub file_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

/// Chart payload rendered by the UI. Datasets are kept as raw JSON.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ChartData {
    #[serde(default, rename = "type")]
    pub chart_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub datasets: Vec<serde_json::Value>,
}

/// Reply language requested from the backend.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Vi,
    En,
}

impl Language {
    /// The fixed text shown when a turn fails or produces no answer.
    pub fn apology(&self) -> &'static str {
        match self {
            Language::Vi => "Xin lỗi, đã có lỗi xảy ra khi xử lý câu hỏi của bạn. Vui lòng thử lại sau.",
            Language::En => "Sorry, something went wrong while processing your question. Please try again later.",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Vi => write!(f, "vi"),
            Language::En => write!(f, "en"),
        }
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "vi" => Ok(Language::Vi),
            "en" => Ok(Language::En),
            other => Err(format!("unsupported language '{}', expected 'vi' or 'en'", other)),
        }
    }
}

/// An inline image sent with a vision request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ImageAttachment {
    pub base64: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub name: String,
}

/// Body of a streaming chat request.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub message: String,
    pub conversation_id: String,
    pub language: Language,
}

/// Body of a one-shot vision request.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct VisionChatRequest {
    pub message: String,
    pub conversation_id: String,
    pub language: Language,
    pub images: Vec<ImageAttachment>,
}

/// Whole-response body returned by the vision endpoint.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct VisionChatResponse {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub source_references: Vec<SourceReference>,
    #[serde(default)]
    pub attachments: Vec<FileAttachment>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub chart_data: Vec<ChartData>,
}

impl VisionChatResponse {
    /// The answer text, preferring `response` over `answer`. Empty strings count as absent.
    pub fn text(&self) -> Option<&str> {
        self.response
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.answer.as_deref().filter(|s| !s.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_deserialization_by_type_tag() {
        let event: ProtocolEvent =
            serde_json::from_str(r#"{"type":"answer_chunk","content":"Chào"}"#).unwrap();
        assert_eq!(
            event,
            ProtocolEvent::AnswerChunk {
                content: "Chào".to_string()
            }
        );

        let event: ProtocolEvent = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert_eq!(event, ProtocolEvent::Done);
        assert!(event.is_terminal());
    }

    #[test]
    fn test_sources_event_keeps_extra_fields() {
        let json = r#"{"type":"sources","source_references":[{"chunk_id":"12","relevance_score":0.9,"document_title":"Tuyển sinh","page":3}],"confidence":0.7}"#;
        let event: ProtocolEvent = serde_json::from_str(json).unwrap();
        match event {
            ProtocolEvent::Sources {
                source_references,
                confidence,
            } => {
                assert_eq!(confidence, 0.7);
                assert_eq!(source_references.len(), 1);
                let reference = &source_references[0];
                assert_eq!(reference.chunk_id, "12");
                assert_eq!(reference.document_title.as_deref(), Some("Tuyển sinh"));
                assert_eq!(reference.extra.get("page"), Some(&serde_json::json!(3)));
            }
            other => panic!("Expected sources event, got {:?}", other),
        }
    }

    #[test]
    fn test_numeric_chunk_id_is_accepted() {
        let reference: SourceReference =
            serde_json::from_str(r#"{"chunk_id":42,"relevance_score":1}"#).unwrap();
        assert_eq!(reference.chunk_id, "42");
        assert_eq!(reference.relevance_score, 1.0);
    }

    #[test]
    fn test_complete_event_defaults_missing_fields() {
        let event: ProtocolEvent = serde_json::from_str(r#"{"type":"complete"}"#).unwrap();
        assert_eq!(
            event,
            ProtocolEvent::Complete {
                attachments: vec![],
                chart_data: vec![]
            }
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = serde_json::from_str::<ProtocolEvent>(r#"{"type":"heartbeat"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_language_parsing_and_display() {
        assert_eq!("VI".parse::<Language>().unwrap(), Language::Vi);
        assert_eq!(" en ".parse::<Language>().unwrap(), Language::En);
        assert!("fr".parse::<Language>().is_err());
        assert_eq!(Language::En.to_string(), "en");
        assert_eq!(serde_json::to_string(&Language::Vi).unwrap(), "\"vi\"");
    }

    #[test]
    fn test_chat_request_wire_format() {
        let request = ChatRequest {
            message: "Xin chào".to_string(),
            conversation_id: "conv-1".to_string(),
            language: Language::Vi,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"message": "Xin chào", "conversation_id": "conv-1", "language": "vi"})
        );
    }

    #[test]
    fn test_image_attachment_uses_camel_case_mime_type() {
        let image = ImageAttachment {
            base64: "aGVsbG8=".to_string(),
            mime_type: "image/png".to_string(),
            name: "a.png".to_string(),
        };
        let json = serde_json::to_string(&image).unwrap();
        assert!(json.contains("\"mimeType\":\"image/png\""));
    }

    #[test]
    fn test_vision_response_prefers_response_over_answer() {
        let body: VisionChatResponse =
            serde_json::from_str(r#"{"response":"","answer":"Đây là ảnh"}"#).unwrap();
        assert_eq!(body.text(), Some("Đây là ảnh"));

        let body: VisionChatResponse =
            serde_json::from_str(r#"{"response":"A","answer":"B"}"#).unwrap();
        assert_eq!(body.text(), Some("A"));

        let body: VisionChatResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(body.text(), None);
    }

    #[test]
    fn test_incomplete_elements_keep_their_neighbours() {
        let sources: ProtocolEvent = serde_json::from_str(
            r#"{"type":"sources","source_references":[{"chunk_id":"1","relevance_score":0.93},{"chunk_id":"2"}]}"#,
        )
        .unwrap();
        match sources {
            ProtocolEvent::Sources {
                source_references, ..
            } => {
                assert_eq!(source_references.len(), 2);
                assert_eq!(source_references[0].relevance_score, 0.93);
                assert_eq!(source_references[1].relevance_score, 0.0);
            }
            other => panic!("Expected Sources, got {:?}", other),
        }

        let complete: ProtocolEvent = serde_json::from_str(
            r#"{"type":"complete","attachments":[{"file_url":"/files/a.pdf"},{"file_name":"b.pdf","file_url":"/files/b.pdf"}]}"#,
        )
        .unwrap();
        match complete {
            ProtocolEvent::Complete { attachments, .. } => {
                assert_eq!(attachments.len(), 2);
                assert_eq!(attachments[0].file_name, "");
                assert_eq!(attachments[1].file_name, "b.pdf");
            }
            other => panic!("Expected Complete, got {:?}", other),
        }
    }
}
