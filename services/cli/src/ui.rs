//! Terminal side of the turn observer port, plus plain-text formatting.

use std::sync::Arc;
use tokio::sync::mpsc;
use unichat_core::protocol::{FileAttachment, SourceReference};
use unichat_core::session::TurnObserver;
use unichat_core::store::{Message, Role};
use uuid::Uuid;

/// Something the session reported while a turn was running.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Status { message_id: Uuid, text: String },
    Content { message_id: Uuid, content: String },
    Sources { message_id: Uuid, sources: Vec<SourceReference> },
    Error { message_id: Uuid, message: String },
}

impl UiEvent {
    pub fn message_id(&self) -> Uuid {
        match self {
            UiEvent::Status { message_id, .. }
            | UiEvent::Content { message_id, .. }
            | UiEvent::Sources { message_id, .. }
            | UiEvent::Error { message_id, .. } => *message_id,
        }
    }
}

/// Forwards observer callbacks to the render loop over a channel.
pub struct TerminalObserver {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl TerminalObserver {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn send(&self, event: UiEvent) {
        // The receiver only goes away on shutdown.
        let _ = self.tx.send(event);
    }
}

impl TurnObserver for TerminalObserver {
    fn on_sources_ready(&self, message_id: Uuid, sources: &[SourceReference]) {
        self.send(UiEvent::Sources {
            message_id,
            sources: sources.to_vec(),
        });
    }

    fn on_turn_error(&self, message_id: Uuid, message: &str) {
        self.send(UiEvent::Error {
            message_id,
            message: message.to_string(),
        });
    }

    fn on_status(&self, message_id: Uuid, status: &str) {
        self.send(UiEvent::Status {
            message_id,
            text: status.to_string(),
        });
    }

    fn on_content(&self, message_id: Uuid, content: &str) {
        self.send(UiEvent::Content {
            message_id,
            content: content.to_string(),
        });
    }
}

/// Turns successive typewriter frames into terminal writes.
///
/// Frames normally only grow, so only the new suffix is written. A frame that
/// is not an extension of what is on screen (an apology replacing a partial
/// answer) is written in full on a fresh line.
#[derive(Debug, Default)]
pub struct FramePrinter {
    printed: String,
}

impl FramePrinter {
    pub fn delta(&mut self, frame: &str) -> String {
        if let Some(suffix) = frame.strip_prefix(self.printed.as_str()) {
            let out = suffix.to_string();
            self.printed.push_str(suffix);
            out
        } else {
            self.printed = frame.to_string();
            format!("\n{}", frame)
        }
    }

    pub fn printed(&self) -> &str {
        &self.printed
    }
}

pub fn format_sources(sources: &[SourceReference]) -> String {
    if sources.is_empty() {
        return "No sources for this answer.".to_string();
    }
    let mut out = String::from("Sources:");
    for (i, source) in sources.iter().enumerate() {
        let title = source
            .document_title
            .as_deref()
            .or(source.document_id.as_deref())
            .unwrap_or("untitled document");
        out.push_str(&format!(
            "\n  [{}] {} (chunk {}, relevance {:.0}%)",
            i + 1,
            title,
            source.chunk_id,
            source.relevance_score * 100.0
        ));
    }
    out
}

pub fn format_attachments(attachments: &[FileAttachment]) -> String {
    let mut out = String::from("Attachments:");
    for file in attachments {
        out.push_str(&format!("\n  {} {}", file.file_name, file.file_url));
    }
    out
}

pub fn format_message(message: &Message) -> String {
    let who = match message.role {
        Role::User => "you",
        Role::Assistant => "assistant",
    };
    let mut line = format!(
        "[{}] {}: {}",
        message.timestamp.format("%H:%M:%S"),
        who,
        message.content
    );
    if let Some(images) = &message.uploaded_images {
        let names: Vec<&str> = images.iter().map(|i| i.name.as_str()).collect();
        line.push_str(&format!(" (images: {})", names.join(", ")));
    }
    if message.is_streaming {
        line.push_str(" ...");
    }
    line
}
