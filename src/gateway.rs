//! Write gateway: the single entry point for new messages.

use crate::error::{Result, SyncError, ValidationError};
use crate::store::MessageStore;
use crate::types::Message;
use std::sync::Arc;
use tracing::debug;

/// Validates and forwards writes to a [`MessageStore`].
#[derive(Clone)]
pub struct WriteGateway {
    store: Arc<MessageStore>,
}

impl WriteGateway {
    pub fn new(store: Arc<MessageStore>) -> Self {
        Self { store }
    }

    /// Trim `raw_text` and append it.
    ///
    /// Blank input fails with [`ValidationError::BlankText`] before the
    /// store is touched.
    pub fn send(&self, raw_text: &str) -> Result<Message> {
        let text = raw_text.trim();
        if text.is_empty() {
            debug!("rejected blank message");
            return Err(ValidationError::BlankText.into());
        }
        self.store.append(text)
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }
}

/// Where a message is in its life, as seen from outside the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendState {
    /// Being edited on the client, not sent yet.
    Draft,
    /// Handed to the gateway.
    Pending,
    /// Stored and broadcast.
    Committed(Message),
    /// Refused; nothing changed.
    Rejected(ValidationError),
}

impl SendState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SendState::Committed(_) | SendState::Rejected(_))
    }
}

/// A client's text input.
///
/// The buffer is cleared only after a committed send. A rejected send
/// leaves the text in place so it can be corrected.
#[derive(Clone, Debug, Default)]
pub struct Draft {
    text: String,
}

impl Draft {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    /// Whether a send button for this draft should be enabled.
    pub fn can_submit(&self) -> bool {
        !self.text.trim().is_empty()
    }

    /// Send the draft through `gateway`.
    ///
    /// Returns the terminal state. Errors other than validation (e.g. a
    /// failed log write) are returned as-is and also leave the text intact.
    pub fn submit(&mut self, gateway: &WriteGateway) -> Result<SendState> {
        match gateway.send(&self.text) {
            Ok(message) => {
                self.text.clear();
                Ok(SendState::Committed(message))
            }
            Err(SyncError::Validation(reason)) => Ok(SendState::Rejected(reason)),
            Err(e) => Err(e),
        }
    }
}
