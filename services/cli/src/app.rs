//! The interactive chat loop: one [`StreamSession`] rendered to a writer.

use crate::commands::{Command, HELP, parse_command};
use crate::config::Config;
use crate::images::load_image;
use crate::ui::{
    FramePrinter, TerminalObserver, UiEvent, format_attachments, format_message, format_sources,
};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use unichat_core::backend::{ChatBackend, HttpChatBackend};
use unichat_core::protocol::{ImageAttachment, Language, SourceReference};
use unichat_core::session::{PendingTurn, SessionConfig, StreamSession, TurnOutcome, TurnRequest};
use unichat_core::store::ConversationStore;
use unichat_core::typewriter::TypewriterTask;
use uuid::Uuid;

/// Whether the REPL should keep reading input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Continue,
    Quit,
}

pub struct App<W: Write> {
    session: Arc<StreamSession>,
    events: mpsc::UnboundedReceiver<UiEvent>,
    out: W,
    language: Language,
    typewriter_speed: Duration,
    queued_images: Vec<ImageAttachment>,
    last_sources: Vec<SourceReference>,
}

impl<W: Write> App<W> {
    /// Wires an HTTP backend, a fresh conversation and the terminal observer.
    pub fn new(config: &Config, out: W) -> Self {
        let backend: Arc<dyn ChatBackend> = Arc::new(
            HttpChatBackend::new(&config.backend_url).with_vision_url(config.vision_url.clone()),
        );
        let session_config = SessionConfig {
            idle_timeout: config.idle_timeout,
            ..SessionConfig::default()
        };
        Self::with_backend(
            backend,
            session_config,
            config.language,
            config.typewriter_speed,
            out,
        )
    }

    pub fn with_backend(
        backend: Arc<dyn ChatBackend>,
        session_config: SessionConfig,
        language: Language,
        typewriter_speed: Duration,
        out: W,
    ) -> Self {
        let store = ConversationStore::default();
        info!(conversation_id = %store.conversation_id(), "Conversation created");
        let (observer, events) = TerminalObserver::channel();
        let session = Arc::new(StreamSession::new(
            backend,
            Arc::new(Mutex::new(store)),
            observer,
            session_config,
        ));
        Self {
            session,
            events,
            out,
            language,
            typewriter_speed,
            queued_images: Vec::new(),
            last_sources: Vec::new(),
        }
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// Attaches an image to the next question.
    pub fn queue_image(&mut self, image: ImageAttachment) {
        self.queued_images.push(image);
    }

    pub fn queued_images(&self) -> &[ImageAttachment] {
        &self.queued_images
    }

    pub fn store(&self) -> &Arc<Mutex<ConversationStore>> {
        self.session.store()
    }

    pub fn out(&self) -> &W {
        &self.out
    }

    /// Interprets one line of input.
    pub async fn handle_line(&mut self, line: &str) -> io::Result<Next> {
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(e) => {
                writeln!(self.out, "{}", e)?;
                return Ok(Next::Continue);
            }
        };

        match command {
            Command::Empty => {}
            Command::Ask(query) => {
                self.ask(query).await?;
            }
            Command::Image(path) => match load_image(&path) {
                Ok(image) => {
                    writeln!(
                        self.out,
                        "Attached {} ({}). It will be sent with your next question.",
                        image.name, image.mime_type
                    )?;
                    self.queue_image(image);
                }
                Err(e) => writeln!(self.out, "{}", e)?,
            },
            Command::Lang(language) => {
                self.language = language;
                writeln!(self.out, "Language set to {}.", language)?;
            }
            Command::Regenerate => {
                if self.regenerate().await?.is_none() {
                    writeln!(self.out, "Nothing to regenerate yet.")?;
                }
            }
            Command::Sources => {
                let text = format_sources(&self.last_sources);
                writeln!(self.out, "{}", text)?;
            }
            Command::History => self.print_history().await?,
            Command::Help => writeln!(self.out, "{}", HELP)?,
            Command::Quit => return Ok(Next::Quit),
        }
        Ok(Next::Continue)
    }

    /// Sends a question, with any queued images, and renders the answer.
    pub async fn ask(&mut self, query: String) -> io::Result<TurnOutcome> {
        let request = TurnRequest {
            query,
            language: self.language,
            images: std::mem::take(&mut self.queued_images),
        };
        let pending = self.session.start_turn(request).await;
        self.drive(pending).await
    }

    /// Re-asks the question behind the latest assistant message.
    pub async fn regenerate(&mut self) -> io::Result<Option<TurnOutcome>> {
        let last = self.session.store().lock().await.last_assistant_id();
        let Some(message_id) = last else {
            return Ok(None);
        };
        match self.session.prepare_regenerate(message_id, self.language).await {
            Some(pending) => self.drive(pending).await.map(Some),
            None => Ok(None),
        }
    }

    /// Runs a turn in the background and animates its message until the
    /// turn has ended and the reveal has caught up.
    async fn drive(&mut self, pending: PendingTurn) -> io::Result<TurnOutcome> {
        let message_id = pending.message_id;
        let cancel = CancellationToken::new();
        let mut turn = tokio::spawn({
            let session = self.session.clone();
            let cancel = cancel.clone();
            async move { session.run_turn(pending, cancel).await }
        });

        let typewriter = TypewriterTask::spawn(self.typewriter_speed, true);
        let mut frames = typewriter.subscribe();
        let mut printer = FramePrinter::default();
        let mut outcome: Option<TurnOutcome> = None;
        let mut final_text: Option<String> = None;
        let mut sources: Option<Vec<SourceReference>> = None;
        let mut turn_error: Option<String> = None;

        write!(self.out, "assistant> ")?;
        self.out.flush()?;

        loop {
            tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c(), if outcome.is_none() && !cancel.is_cancelled() => {
                    info!(%message_id, "Cancelling turn");
                    cancel.cancel();
                }
                Some(event) = self.events.recv() => {
                    if event.message_id() != message_id {
                        continue;
                    }
                    match event {
                        UiEvent::Status { text, .. } => {
                            debug!(status = %text, "Backend status");
                            if printer.printed().is_empty() {
                                write!(self.out, "({}) ", text)?;
                                self.out.flush()?;
                            }
                        }
                        UiEvent::Content { content, .. } => {
                            if outcome.is_none() {
                                typewriter.set_text(content);
                            }
                        }
                        UiEvent::Sources { sources: shown, .. } => sources = Some(shown),
                        UiEvent::Error { message, .. } => turn_error = Some(message),
                    }
                }
                joined = &mut turn, if outcome.is_none() => {
                    let result = match joined {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(error = %e, "Turn task ended abnormally");
                            TurnOutcome::Failed { message_id, error: e.to_string() }
                        }
                    };
                    let text = self.message_content(message_id).await;
                    typewriter.set_text(text.clone());
                    final_text = Some(text);
                    outcome = Some(result);
                }
                changed = frames.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let frame = frames.borrow_and_update().clone();
                    let delta = printer.delta(&frame.text);
                    write!(self.out, "{}", delta)?;
                    self.out.flush()?;
                    if frame.is_complete && final_text.as_deref() == Some(frame.text.as_str()) {
                        break;
                    }
                }
            }
        }
        writeln!(self.out)?;

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => TurnOutcome::Failed {
                message_id,
                error: "renderer stopped before the turn ended".to_string(),
            },
        };

        if let TurnOutcome::Cancelled { .. } = outcome {
            writeln!(self.out, "(stopped)")?;
        }
        if let Some(detail) = turn_error {
            writeln!(self.out, "[error] {}", detail)?;
        }
        self.show_follow_up(message_id, sources).await?;
        Ok(outcome)
    }

    async fn message_content(&self, message_id: Uuid) -> String {
        self.session
            .store()
            .lock()
            .await
            .get(message_id)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    /// Prints sources and attachments once the answer is fully on screen.
    async fn show_follow_up(
        &mut self,
        message_id: Uuid,
        reported: Option<Vec<SourceReference>>,
    ) -> io::Result<()> {
        let (stored, attachments) = {
            let store = self.session.store().lock().await;
            match store.get(message_id) {
                Some(m) => (m.source_references.clone(), m.attachments.clone()),
                None => (None, None),
            }
        };

        let shown = stored.or(reported).unwrap_or_default();
        if !shown.is_empty() {
            writeln!(self.out, "{}", format_sources(&shown))?;
        }
        self.last_sources = shown;

        if let Some(files) = attachments.filter(|f| !f.is_empty()) {
            writeln!(self.out, "{}", format_attachments(&files))?;
        }
        Ok(())
    }

    async fn print_history(&mut self) -> io::Result<()> {
        let lines: Vec<String> = {
            let store = self.session.store().lock().await;
            store.messages().iter().map(format_message).collect()
        };
        if lines.is_empty() {
            writeln!(self.out, "No messages yet.")?;
        }
        for line in lines {
            writeln!(self.out, "{}", line)?;
        }
        Ok(())
    }
}
