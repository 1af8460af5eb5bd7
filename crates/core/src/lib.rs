//! Unichat Core
//!
//! The streaming chat pipeline behind the university assistant: the SSE frame
//! parser, the per-turn stream session controller, the conversation store
//! and the typewriter renderer. Everything UI-specific is reached through the
//! [`session::TurnObserver`] port, and the network through
//! [`backend::ChatBackend`].

pub mod backend;
pub mod decoder;
pub mod error;
pub mod protocol;
pub mod session;
pub mod sse;
pub mod store;
pub mod typewriter;

pub use error::{ChatError, Result};
