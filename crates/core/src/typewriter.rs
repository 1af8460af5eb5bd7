//! Typewriter Renderer
//!
//! Reveals already-fetched text one character at a time. The target text may
//! keep growing while the reveal is running; the cursor only ever moves
//! forward, so appended chunks continue the animation instead of restarting it.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Cursor state of a reveal. Counts characters, not bytes.
#[derive(Debug, Clone)]
pub struct Typewriter {
    text: String,
    char_count: usize,
    cursor: usize,
    enabled: bool,
}

impl Typewriter {
    /// A disabled typewriter shows the full text immediately.
    pub fn new(enabled: bool) -> Self {
        Self {
            text: String::new(),
            char_count: 0,
            cursor: 0,
            enabled,
        }
    }

    /// Replaces the target text. The cursor keeps its position, clamped to the new length.
    pub fn set_text(&mut self, text: &str) {
        if self.text == text {
            return;
        }
        self.text.clear();
        self.text.push_str(text);
        self.char_count = text.chars().count();
        if !self.enabled || self.cursor > self.char_count {
            self.cursor = self.char_count;
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.cursor = self.char_count;
        }
    }

    /// Reveals one more character. Returns `false` once caught up.
    pub fn tick(&mut self) -> bool {
        if self.cursor < self.char_count {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    /// The currently visible prefix.
    pub fn displayed(&self) -> &str {
        if self.cursor >= self.char_count {
            return &self.text;
        }
        let end = self
            .text
            .char_indices()
            .nth(self.cursor)
            .map(|(i, _)| i)
            .unwrap_or(self.text.len());
        &self.text[..end]
    }

    /// Whether the reveal has caught up with the latest known text.
    pub fn is_complete(&self) -> bool {
        self.cursor >= self.char_count
    }

    pub fn target(&self) -> &str {
        &self.text
    }
}

/// A snapshot published by [`TypewriterTask`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypewriterFrame {
    pub text: String,
    pub is_complete: bool,
}

/// Runs a [`Typewriter`] on a tokio interval.
///
/// Dropping the handle aborts the timer task.
pub struct TypewriterTask {
    text_tx: watch::Sender<String>,
    frame_rx: watch::Receiver<TypewriterFrame>,
    handle: JoinHandle<()>,
}

impl TypewriterTask {
    /// Spawns the reveal loop. `speed` is the delay between characters.
    pub fn spawn(speed: Duration, enabled: bool) -> Self {
        let (text_tx, mut text_rx) = watch::channel(String::new());
        let (frame_tx, frame_rx) = watch::channel(TypewriterFrame {
            text: String::new(),
            is_complete: true,
        });

        let handle = tokio::spawn(async move {
            let mut typewriter = Typewriter::new(enabled);
            let mut ticker = tokio::time::interval(speed);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = text_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let was_complete = typewriter.is_complete();
                        let text = text_rx.borrow_and_update().clone();
                        typewriter.set_text(&text);
                        if was_complete {
                            ticker.reset();
                        }
                    }
                    _ = ticker.tick(), if !typewriter.is_complete() => {
                        typewriter.tick();
                    }
                }
                frame_tx.send_replace(TypewriterFrame {
                    text: typewriter.displayed().to_string(),
                    is_complete: typewriter.is_complete(),
                });
            }
        });

        Self {
            text_tx,
            frame_rx,
            handle,
        }
    }

    /// Updates the target text, typically the message's accumulated content.
    pub fn set_text(&self, text: impl Into<String>) {
        self.text_tx.send_replace(text.into());
    }

    /// The latest published frame.
    pub fn frame(&self) -> TypewriterFrame {
        self.frame_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TypewriterFrame> {
        self.frame_rx.clone()
    }
}

impl Drop for TypewriterTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
