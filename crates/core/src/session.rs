//! Stream Session Controller
//!
//! Drives one chat turn end to end: opens the stream (or the one-shot vision
//! request when images are attached), feeds bytes through the UTF-8 decoder
//! and SSE parser, applies each event to a [`TurnAccumulator`], and keeps the
//! turn's placeholder message in the [`ConversationStore`] up to date.
//!
//! Every turn ends in a terminal state. Failures of any kind replace the
//! message content with the apology text; nothing escapes to the caller.

use crate::backend::{ByteStream, ChatBackend};
use crate::decoder::Utf8StreamDecoder;
use crate::error::{ChatError, Result};
use crate::protocol::{
    ChartData, ChatRequest, FileAttachment, ImageAttachment, Language, ProtocolEvent,
    SourceReference, VisionChatRequest, VisionChatResponse,
};
use crate::sse::SseParser;
use crate::store::{ConversationStore, MessagePatch};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Minimum relevance score for a source to be shown.
pub const MIN_RELEVANCE: f64 = 0.8;
/// Maximum number of sources shown for one answer.
pub const MAX_DISPLAYED_SOURCES: usize = 5;

/// UI collaborators the controller reports to.
#[cfg_attr(test, mockall::automock)]
pub trait TurnObserver: Send + Sync {
    /// Sources for a turn are known; open or refresh the sources panel.
    fn on_sources_ready(&self, message_id: Uuid, sources: &[SourceReference]);

    /// A turn failed. `message` is diagnostic detail, not the bubble text.
    fn on_turn_error(&self, message_id: Uuid, message: &str);

    /// Transient progress text from the backend.
    fn on_status(&self, _message_id: Uuid, _status: &str) {}

    /// The message content grew.
    fn on_content(&self, _message_id: Uuid, _content: &str) {}
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub min_relevance: f64,
    pub max_sources: usize,
    /// Fail the turn when no bytes arrive for this long. `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_relevance: MIN_RELEVANCE,
            max_sources: MAX_DISPLAYED_SOURCES,
            idle_timeout: None,
        }
    }
}

/// What the user asked in one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    pub query: String,
    pub language: Language,
    pub images: Vec<ImageAttachment>,
}

impl TurnRequest {
    pub fn text(query: impl Into<String>, language: Language) -> Self {
        Self {
            query: query.into(),
            language,
            images: Vec::new(),
        }
    }
}

/// A turn whose placeholder exists but whose request has not been sent yet.
#[derive(Debug, Clone)]
pub struct PendingTurn {
    pub message_id: Uuid,
    pub request: TurnRequest,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed { message_id: Uuid },
    Failed { message_id: Uuid, error: String },
    Cancelled { message_id: Uuid },
}

impl TurnOutcome {
    pub fn message_id(&self) -> Uuid {
        match self {
            TurnOutcome::Completed { message_id }
            | TurnOutcome::Failed { message_id, .. }
            | TurnOutcome::Cancelled { message_id } => *message_id,
        }
    }
}

/// Keeps sources at or above `min_relevance`, best first, at most `max`.
pub fn display_sources(
    sources: &[SourceReference],
    min_relevance: f64,
    max: usize,
) -> Vec<SourceReference> {
    let mut shown: Vec<SourceReference> = sources
        .iter()
        .filter(|s| s.relevance_score >= min_relevance)
        .cloned()
        .collect();
    shown.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
    shown.truncate(max);
    shown
}

/// Parses every `chunk_id` as an integer, skipping ones that are not.
pub fn numeric_chunk_ids(sources: &[SourceReference]) -> Vec<i64> {
    sources
        .iter()
        .filter_map(|s| s.chunk_id.trim().parse::<i64>().ok())
        .collect()
}

/// What changed after applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The turn was already terminal; nothing changed.
    Ignored,
    ConversationId,
    Status,
    Sources,
    Content,
    Complete,
    Done,
    Failed,
}

/// Per-turn state built from protocol events.
///
/// Metadata and sources are last-write-wins. Once `done` or `error` has been
/// applied, every later event is ignored.
#[derive(Debug, Clone)]
pub struct TurnAccumulator {
    min_relevance: f64,
    max_sources: usize,
    content: String,
    conversation_id: Option<String>,
    status: Option<String>,
    sources: Vec<SourceReference>,
    displayed_sources: Vec<SourceReference>,
    confidence: Option<f64>,
    attachments: Option<Vec<FileAttachment>>,
    chart_data: Option<Vec<ChartData>>,
    error: Option<String>,
    terminal: bool,
    events_applied: usize,
}

impl TurnAccumulator {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            min_relevance: config.min_relevance,
            max_sources: config.max_sources,
            content: String::new(),
            conversation_id: None,
            status: None,
            sources: Vec::new(),
            displayed_sources: Vec::new(),
            confidence: None,
            attachments: None,
            chart_data: None,
            error: None,
            terminal: false,
            events_applied: 0,
        }
    }

    pub fn apply(&mut self, event: ProtocolEvent) -> Applied {
        if self.terminal {
            debug!(kind = event.kind(), "Ignoring event after terminal state");
            return Applied::Ignored;
        }
        self.events_applied += 1;

        match event {
            ProtocolEvent::Metadata { conversation_id } => {
                self.conversation_id = Some(conversation_id);
                Applied::ConversationId
            }
            ProtocolEvent::Status { message } => {
                self.status = Some(message);
                Applied::Status
            }
            ProtocolEvent::Sources {
                source_references,
                confidence,
            } => {
                self.set_sources(source_references, Some(confidence));
                Applied::Sources
            }
            ProtocolEvent::AnswerChunk { content } => {
                self.content.push_str(&content);
                Applied::Content
            }
            ProtocolEvent::Complete {
                attachments,
                chart_data,
            } => {
                self.attachments = Some(attachments);
                self.chart_data = Some(chart_data);
                Applied::Complete
            }
            ProtocolEvent::Done => {
                self.terminal = true;
                Applied::Done
            }
            ProtocolEvent::Error { message } => {
                self.terminal = true;
                self.error = Some(message);
                Applied::Failed
            }
        }
    }

    /// Takes the whole answer from a vision response.
    pub fn absorb_vision(&mut self, response: VisionChatResponse) {
        if let Some(text) = response.text() {
            self.content = text.to_string();
        }
        if let Some(id) = response.conversation_id {
            self.conversation_id = Some(id);
        }
        self.set_sources(response.source_references, response.confidence);
        self.attachments = Some(response.attachments);
        self.chart_data = Some(response.chart_data);
        self.terminal = true;
    }

    fn set_sources(&mut self, sources: Vec<SourceReference>, confidence: Option<f64>) {
        self.displayed_sources = display_sources(&sources, self.min_relevance, self.max_sources);
        self.sources = sources;
        if confidence.is_some() {
            self.confidence = confidence;
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    /// Every source the backend sent, unfiltered.
    pub fn sources(&self) -> &[SourceReference] {
        &self.sources
    }

    pub fn displayed_sources(&self) -> &[SourceReference] {
        &self.displayed_sources
    }

    pub fn confidence(&self) -> Option<f64> {
        self.confidence
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn events_applied(&self) -> usize {
        self.events_applied
    }

    /// The reconciliation write made when a turn completes.
    pub fn final_patch(&self, apology: &str) -> MessagePatch {
        let content = if self.content.is_empty() {
            apology.to_string()
        } else {
            self.content.clone()
        };
        MessagePatch {
            content: Some(content),
            source_references: Some(self.displayed_sources.clone()),
            confidence: self.confidence,
            chunk_ids: Some(numeric_chunk_ids(&self.sources)),
            attachments: self.attachments.clone(),
            chart_data: self.chart_data.clone(),
            is_streaming: Some(false),
        }
    }
}

enum Ended {
    Completed,
    Cancelled,
}

enum Flow {
    Continue,
    Stop,
}

/// Runs chat turns against one conversation.
pub struct StreamSession {
    backend: Arc<dyn ChatBackend>,
    store: Arc<Mutex<ConversationStore>>,
    observer: Arc<dyn TurnObserver>,
    config: SessionConfig,
}

impl StreamSession {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        store: Arc<Mutex<ConversationStore>>,
        observer: Arc<dyn TurnObserver>,
        config: SessionConfig,
    ) -> Self {
        Self {
            backend,
            store,
            observer,
            config,
        }
    }

    pub fn store(&self) -> &Arc<Mutex<ConversationStore>> {
        &self.store
    }

    /// Records the user message and an empty assistant placeholder.
    ///
    /// The returned id is stable for the whole turn, so the UI can render the
    /// streaming state before any network traffic.
    pub async fn start_turn(&self, request: TurnRequest) -> PendingTurn {
        let mut store = self.store.lock().await;
        let images = (!request.images.is_empty()).then(|| request.images.clone());
        store.append_user(request.query.clone(), images);
        let placeholder = store.append_assistant_placeholder(request.query.clone());
        PendingTurn {
            message_id: placeholder.id,
            request,
        }
    }

    /// Starts and runs a turn in one call.
    pub async fn submit(&self, request: TurnRequest, cancel: CancellationToken) -> TurnOutcome {
        let pending = self.start_turn(request).await;
        self.run_turn(pending, cancel).await
    }

    /// Adds a fresh placeholder that re-asks the question behind `message_id`.
    ///
    /// Returns `None` if `message_id` is unknown or has no recorded question.
    pub async fn prepare_regenerate(
        &self,
        message_id: Uuid,
        language: Language,
    ) -> Option<PendingTurn> {
        let mut store = self.store.lock().await;
        let query = store.user_query_for(message_id)?.to_string();
        let placeholder = store.append_assistant_placeholder(query.clone());
        info!(original = %message_id, regenerated = %placeholder.id, "Regenerating answer");
        Some(PendingTurn {
            message_id: placeholder.id,
            request: TurnRequest::text(query, language),
        })
    }

    /// Asks the same question as an earlier assistant message, as a new turn.
    pub async fn regenerate(
        &self,
        message_id: Uuid,
        language: Language,
        cancel: CancellationToken,
    ) -> Option<TurnOutcome> {
        let pending = self.prepare_regenerate(message_id, language).await?;
        Some(self.run_turn(pending, cancel).await)
    }

    /// Runs a started turn to a terminal state.
    pub async fn run_turn(&self, pending: PendingTurn, cancel: CancellationToken) -> TurnOutcome {
        let PendingTurn {
            message_id,
            request,
        } = pending;
        let conversation_id = self.store.lock().await.conversation_id().to_string();
        let span = info_span!("chat_turn", %message_id, %conversation_id);

        async move {
            let mut acc = TurnAccumulator::new(&self.config);
            info!(
                language = %request.language,
                images = request.images.len(),
                "Turn started"
            );

            let result = if request.images.is_empty() {
                self.stream_turn(message_id, &request, conversation_id, &mut acc, &cancel)
                    .await
            } else {
                self.vision_turn(message_id, &request, conversation_id, &mut acc, &cancel)
                    .await
            };

            let apology = request.language.apology();
            match result {
                Ok(Ended::Completed) => {
                    self.store
                        .lock()
                        .await
                        .patch(message_id, acc.final_patch(apology));
                    info!(
                        events = acc.events_applied(),
                        chars = acc.content().chars().count(),
                        sources = acc.displayed_sources().len(),
                        "Turn completed"
                    );
                    TurnOutcome::Completed { message_id }
                }
                Ok(Ended::Cancelled) => {
                    let content = if acc.content().is_empty() {
                        apology.to_string()
                    } else {
                        acc.content().to_string()
                    };
                    self.store.lock().await.patch(
                        message_id,
                        MessagePatch {
                            content: Some(content),
                            is_streaming: Some(false),
                            ..Default::default()
                        },
                    );
                    info!(events = acc.events_applied(), "Turn cancelled");
                    TurnOutcome::Cancelled { message_id }
                }
                Err(e) => {
                    error!(error = %e, events = acc.events_applied(), "Turn failed");
                    self.store.lock().await.patch(
                        message_id,
                        MessagePatch {
                            content: Some(apology.to_string()),
                            is_streaming: Some(false),
                            ..Default::default()
                        },
                    );
                    let detail = e.to_string();
                    self.observer.on_turn_error(message_id, &detail);
                    TurnOutcome::Failed {
                        message_id,
                        error: detail,
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn stream_turn(
        &self,
        message_id: Uuid,
        request: &TurnRequest,
        conversation_id: String,
        acc: &mut TurnAccumulator,
        cancel: &CancellationToken,
    ) -> Result<Ended> {
        let body = ChatRequest {
            message: request.query.clone(),
            conversation_id,
            language: request.language,
        };

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Ended::Cancelled),
            opened = self.within_idle_limit(self.backend.open_stream(&body)) => opened?,
        };

        let mut decoder = Utf8StreamDecoder::new();
        let mut parser = SseParser::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Ended::Cancelled),
                next = self.next_chunk(&mut stream) => next?,
            };
            let Some(bytes) = next else {
                break;
            };

            let text = decoder.decode(&bytes);
            for event in parser.add_data(&text) {
                if cancel.is_cancelled() {
                    return Ok(Ended::Cancelled);
                }
                if let Flow::Stop = self.apply_event(message_id, acc, event).await? {
                    return Ok(Ended::Completed);
                }
            }
        }

        // The body ended without a `done` frame; parse what is left.
        let tail = decoder.finish();
        let mut events = parser.add_data(&tail);
        events.extend(parser.flush());
        for event in events {
            if cancel.is_cancelled() {
                return Ok(Ended::Cancelled);
            }
            if let Flow::Stop = self.apply_event(message_id, acc, event).await? {
                return Ok(Ended::Completed);
            }
        }

        if !acc.is_terminal() {
            warn!("Stream ended without a done event");
        }
        Ok(Ended::Completed)
    }

    async fn next_chunk(&self, stream: &mut ByteStream) -> Result<Option<Bytes>> {
        self.within_idle_limit(async { stream.next().await.transpose() })
            .await
    }

    /// Fails with [`ChatError::IdleTimeout`] if `fut` outlasts the idle timeout.
    async fn within_idle_limit<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match self.config.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| ChatError::IdleTimeout(limit))?,
            None => fut.await,
        }
    }

    async fn apply_event(
        &self,
        message_id: Uuid,
        acc: &mut TurnAccumulator,
        event: ProtocolEvent,
    ) -> Result<Flow> {
        match acc.apply(event) {
            Applied::Ignored => {}
            Applied::ConversationId => {
                if let Some(id) = acc.conversation_id() {
                    debug!(conversation_id = %id, "Backend assigned conversation id");
                    self.store.lock().await.set_conversation_id(id);
                }
            }
            Applied::Status => {
                if let Some(status) = acc.status() {
                    self.observer.on_status(message_id, status);
                }
            }
            Applied::Sources => {
                self.store.lock().await.patch(
                    message_id,
                    MessagePatch {
                        source_references: Some(acc.displayed_sources().to_vec()),
                        confidence: acc.confidence(),
                        ..Default::default()
                    },
                );
                debug!(
                    received = acc.sources().len(),
                    shown = acc.displayed_sources().len(),
                    "Sources received"
                );
                self.observer
                    .on_sources_ready(message_id, acc.displayed_sources());
            }
            Applied::Content => {
                self.store
                    .lock()
                    .await
                    .patch(message_id, MessagePatch::content(acc.content()));
                self.observer.on_content(message_id, acc.content());
            }
            Applied::Complete => {
                self.store.lock().await.patch(
                    message_id,
                    MessagePatch {
                        attachments: acc.attachments.clone(),
                        chart_data: acc.chart_data.clone(),
                        ..Default::default()
                    },
                );
            }
            Applied::Done => return Ok(Flow::Stop),
            Applied::Failed => {
                let message = acc.error().unwrap_or_default().to_string();
                return Err(ChatError::Backend(message));
            }
        }
        Ok(Flow::Continue)
    }

    async fn vision_turn(
        &self,
        message_id: Uuid,
        request: &TurnRequest,
        conversation_id: String,
        acc: &mut TurnAccumulator,
        cancel: &CancellationToken,
    ) -> Result<Ended> {
        let body = VisionChatRequest {
            message: request.query.clone(),
            conversation_id,
            language: request.language,
            images: request.images.clone(),
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Ended::Cancelled),
            response = self.within_idle_limit(self.backend.send_vision(&body)) => response?,
        };

        acc.absorb_vision(response);
        if let Some(id) = acc.conversation_id() {
            self.store.lock().await.set_conversation_id(id);
        }
        if !acc.displayed_sources().is_empty() {
            self.observer
                .on_sources_ready(message_id, acc.displayed_sources());
        }
        Ok(Ended::Completed)
    }
}
