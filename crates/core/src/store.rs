//! Conversation State Store
//!
//! An ordered, append-then-patch log of the messages in one conversation.
//! Messages are never removed; assistant placeholders are mutated in place
//! by the turn that created them.

use crate::protocol::{ChartData, FileAttachment, ImageAttachment, SourceReference};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One message in the conversation.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Sources shown to the user (filtered, sorted, capped).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_references: Option<Vec<SourceReference>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Numeric ids of every retrieved chunk, for feedback and document lookups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_ids: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<FileAttachment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_data: Option<Vec<ChartData>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_images: Option<Vec<ImageAttachment>>,
    /// For assistant messages, the question that produced them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_query: Option<String>,
    pub is_streaming: bool,
}

impl Message {
    fn new(role: Role, content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content,
            timestamp: Utc::now(),
            source_references: None,
            confidence: None,
            chunk_ids: None,
            attachments: None,
            chart_data: None,
            uploaded_images: None,
            user_query: None,
            is_streaming: false,
        }
    }
}

/// Fields to shallow-merge into an existing message. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub source_references: Option<Vec<SourceReference>>,
    pub confidence: Option<f64>,
    pub chunk_ids: Option<Vec<i64>>,
    pub attachments: Option<Vec<FileAttachment>>,
    pub chart_data: Option<Vec<ChartData>>,
    pub is_streaming: Option<bool>,
}

impl MessagePatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    fn apply_to(self, message: &mut Message) {
        if let Some(content) = self.content {
            message.content = content;
        }
        if let Some(refs) = self.source_references {
            message.source_references = Some(refs);
        }
        if let Some(confidence) = self.confidence {
            message.confidence = Some(confidence);
        }
        if let Some(ids) = self.chunk_ids {
            message.chunk_ids = Some(ids);
        }
        if let Some(attachments) = self.attachments {
            message.attachments = Some(attachments);
        }
        if let Some(charts) = self.chart_data {
            message.chart_data = Some(charts);
        }
        if let Some(streaming) = self.is_streaming {
            message.is_streaming = streaming;
        }
    }
}

/// The messages of one conversation plus its effective conversation id.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    conversation_id: String,
    messages: Vec<Message>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}

impl ConversationStore {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            messages: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Adopts the id the backend reported for this conversation.
    pub fn set_conversation_id(&mut self, id: impl Into<String>) {
        self.conversation_id = id.into();
    }

    pub fn append_user(
        &mut self,
        content: impl Into<String>,
        images: Option<Vec<ImageAttachment>>,
    ) -> Message {
        let mut message = Message::new(Role::User, content.into());
        message.uploaded_images = images.filter(|imgs| !imgs.is_empty());
        self.messages.push(message.clone());
        message
    }

    /// Adds an empty, streaming assistant message answering `user_query`.
    pub fn append_assistant_placeholder(&mut self, user_query: impl Into<String>) -> Message {
        let mut message = Message::new(Role::Assistant, String::new());
        message.user_query = Some(user_query.into());
        message.is_streaming = true;
        self.messages.push(message.clone());
        message
    }

    /// Merges `patch` into the message with `id`. Returns `false` if no such message exists.
    pub fn patch(&mut self, id: Uuid, patch: MessagePatch) -> bool {
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                patch.apply_to(message);
                true
            }
            None => {
                tracing::debug!(message_id = %id, "Ignoring patch for unknown message");
                false
            }
        }
    }

    pub fn get(&self, id: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The newest assistant message, which is the only one the UI animates.
    pub fn last_assistant_id(&self) -> Option<Uuid> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.id)
    }

    /// The question an assistant message answered, used to regenerate it.
    pub fn user_query_for(&self, id: Uuid) -> Option<&str> {
        self.get(id).and_then(|m| m.user_query.as_deref())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
