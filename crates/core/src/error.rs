use std::time::Duration;

/// Failures of a single chat turn.
///
/// All of these end the turn the same way for the user (the apology text);
/// the variants exist so logs can tell them apart.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Backend returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("Response has no body")]
    MissingBody,
    #[error("Backend reported an error: {0}")]
    Backend(String),
    #[error("No data received for {0:?}")]
    IdleTimeout(Duration),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;
