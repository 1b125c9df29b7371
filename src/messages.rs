//! User-visible notifications. The page owns the actual banner; the core only
//! hands it messages.

use std::sync::{Mutex, PoisonError};

use tracing::{debug, error, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Error,
    Notice,
    /// Diagnostic detail, e.g. a remote stack trace. Shown for debugging.
    Debug,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserMessage {
    pub kind: MessageKind,
    pub message: String,
}

impl UserMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Error,
            message: message.into(),
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Notice,
            message: message.into(),
        }
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Debug,
            message: message.into(),
        }
    }
}

pub trait Messages: Send + Sync + 'static {
    fn add_message(&self, message: UserMessage);
}

/// Writes messages to the log. Useful headless.
#[derive(Default)]
pub struct LogMessages;

impl Messages for LogMessages {
    fn add_message(&self, message: UserMessage) {
        match message.kind {
            MessageKind::Error => error!(text = %message.message, "user message"),
            MessageKind::Notice => info!(text = %message.message, "user message"),
            MessageKind::Debug => debug!(text = %message.message, "user message"),
        }
    }
}

/// Keeps every message in memory.
#[derive(Default)]
pub struct MessageLog {
    messages: Mutex<Vec<UserMessage>>,
}

impl MessageLog {
    pub fn messages(&self) -> Vec<UserMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Messages for MessageLog {
    fn add_message(&self, message: UserMessage) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }
}
