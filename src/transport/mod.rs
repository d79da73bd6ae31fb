//! Chat transport abstraction
//!
//! The core talks to the messaging platform only through `ChatTransport`
//! (outbound) and `UpdateSource` (inbound). Inbound platform payloads are
//! converted into `InboundEvent`s before they reach the dispatcher.

pub mod telegram;

pub use telegram::TelegramTransport;

use async_trait::async_trait;
use serde::Serialize;

use crate::providers::ProviderError;

pub type UserId = i64;
pub type ChatId = i64;
pub type MessageId = i64;

/// Inline action button (navigation)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

/// Keyboard attached to an outgoing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyMarkup {
    /// Quick-pick reply keyboard, rows of plain button labels
    Keyboard(Vec<Vec<String>>),
    /// Inline action rows attached to the message itself
    Inline(Vec<Vec<InlineButton>>),
    /// Hide a previously shown reply keyboard
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Photo,
    Document,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_id: String,
    pub kind: AttachmentKind,
    pub file_name: Option<String>,
}

impl Attachment {
    /// Extension used for the uploaded asset
    pub fn extension(&self) -> String {
        match self.kind {
            AttachmentKind::Photo => "jpg".to_string(),
            AttachmentKind::Document => self
                .file_name
                .as_deref()
                .and_then(|name| name.rsplit_once('.'))
                .map(|(stem, ext)| (stem, ext.to_ascii_lowercase()))
                .filter(|(stem, ext)| {
                    !stem.is_empty()
                        && !ext.is_empty()
                        && ext.len() <= 8
                        && ext.chars().all(|c| c.is_ascii_alphanumeric())
                })
                .map(|(_, ext)| ext)
                .unwrap_or_else(|| "bin".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// `/start`
    Start,
    /// `/cancel` or the word "cancel"
    Cancel,
    /// `/folder`: re-pick the assets folder
    ChangeAssetsFolder,
    Text(String),
    Attachment(Attachment),
    /// Inline button press
    Callback {
        query_id: String,
        message_id: Option<MessageId>,
        data: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub user_id: UserId,
    pub chat_id: ChatId,
    /// Display name used in greetings
    pub user_name: String,
    pub kind: EventKind,
}

/// Classify a text message. Commands may carry a `@botname` suffix.
pub fn parse_text(text: &str) -> EventKind {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("cancel") {
        return EventKind::Cancel;
    }
    if let Some(command) = trimmed.strip_prefix('/') {
        let name = command
            .split_whitespace()
            .next()
            .unwrap_or("")
            .split('@')
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        match name.as_str() {
            "start" => return EventKind::Start,
            "cancel" => return EventKind::Cancel,
            "folder" => return EventKind::ChangeAssetsFolder,
            _ => {}
        }
    }
    EventKind::Text(text.to_string())
}

/// Outbound messaging operations
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        markup: Option<&ReplyMarkup>,
    ) -> Result<MessageId, ProviderError>;

    /// Replace text and inline keyboard of a message sent earlier
    async fn edit_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        markup: Option<&ReplyMarkup>,
    ) -> Result<(), ProviderError>;

    async fn answer_callback(&self, query_id: &str, text: Option<&str>) -> Result<(), ProviderError>;

    async fn download_attachment(&self, file_id: &str) -> Result<Vec<u8>, ProviderError>;
}

/// Inbound event stream
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Wait for the next batch of events (may be empty on timeout)
    async fn next_batch(&self) -> Result<Vec<InboundEvent>, ProviderError>;
}
