//! Telegram Bot API transport
//!
//! Implements ChatTransport and UpdateSource over the Bot API using
//! long polling (`getUpdates`).
//!
//! API Base: https://api.telegram.org
//! Method URL: {base}/bot{token}/{method}
//! File URL: {base}/file/bot{token}/{file_path}

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, warn};

use super::{
    parse_text, Attachment, AttachmentKind, ChatId, ChatTransport, EventKind, InboundEvent,
    MessageId, ReplyMarkup, UpdateSource,
};
use crate::providers::{sanitize_api_error, ProviderError};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

// ─── API Types ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: i64,
    message: Option<TgMessage>,
    callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    from: Option<TgUser>,
    chat: TgChat,
    text: Option<String>,
    photo: Option<Vec<TgPhotoSize>>,
    document: Option<TgDocument>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    first_name: String,
    last_name: Option<String>,
}

impl TgUser {
    fn full_name(&self) -> String {
        match &self.last_name {
            Some(last) => format!("{} {}", self.first_name, last),
            None => self.first_name.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgPhotoSize {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct TgDocument {
    file_id: String,
    file_name: Option<String>,
}

/// Callback queries may reference a message too old to be delivered in
/// full; only chat and id are needed.
#[derive(Debug, Deserialize)]
struct TgCallbackMessage {
    message_id: i64,
    chat: TgChat,
}

#[derive(Debug, Deserialize)]
struct TgCallbackQuery {
    id: String,
    from: TgUser,
    message: Option<TgCallbackMessage>,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgSentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct TgFile {
    file_path: Option<String>,
}

/// Convert one update into an event the dispatcher understands.
/// Updates without a sender or with unsupported content are dropped.
fn to_event(update: TgUpdate) -> Option<InboundEvent> {
    if let Some(query) = update.callback_query {
        let chat_id = query.message.as_ref().map(|m| m.chat.id).unwrap_or(query.from.id);
        return Some(InboundEvent {
            user_id: query.from.id,
            chat_id,
            user_name: query.from.full_name(),
            kind: EventKind::Callback {
                query_id: query.id,
                message_id: query.message.map(|m| m.message_id),
                data: query.data.unwrap_or_default(),
            },
        });
    }

    let message = update.message?;
    let from = message.from?;
    let kind = if let Some(text) = message.text {
        parse_text(&text)
    } else if let Some(largest) = message.photo.and_then(|sizes| sizes.into_iter().last()) {
        // Sizes are ordered smallest first
        EventKind::Attachment(Attachment {
            file_id: largest.file_id,
            kind: AttachmentKind::Photo,
            file_name: None,
        })
    } else if let Some(doc) = message.document {
        EventKind::Attachment(Attachment {
            file_id: doc.file_id,
            kind: AttachmentKind::Document,
            file_name: doc.file_name,
        })
    } else {
        debug!("Ignoring message {} with unsupported content", message.message_id);
        return None;
    };

    Some(InboundEvent {
        user_id: from.id,
        chat_id: message.chat.id,
        user_name: from.full_name(),
        kind,
    })
}

fn markup_json(markup: &ReplyMarkup) -> serde_json::Value {
    match markup {
        ReplyMarkup::Keyboard(rows) => {
            let keyboard: Vec<Vec<serde_json::Value>> = rows
                .iter()
                .map(|row| row.iter().map(|label| json!({ "text": label })).collect())
                .collect();
            json!({ "keyboard": keyboard, "resize_keyboard": true })
        }
        ReplyMarkup::Inline(rows) => json!({ "inline_keyboard": rows }),
        ReplyMarkup::Remove => json!({ "remove_keyboard": true }),
    }
}

fn is_not_modified(err: &ProviderError) -> bool {
    matches!(err, ProviderError::Other(description) if description.contains("message is not modified"))
}

// ─── Transport ───────────────────────────────────────────────────────────

pub struct TelegramTransport {
    client: reqwest::Client,
    api_base: String,
    token: SecretString,
    poll_timeout_secs: u64,
    next_offset: AtomicI64,
}

impl TelegramTransport {
    pub fn new(token: SecretString, api_base: &str, poll_timeout_secs: u64) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            // Long polling holds the request open for poll_timeout_secs
            .timeout(std::time::Duration::from_secs(poll_timeout_secs + 30))
            .connect_timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| ProviderError::ConnectionFailed(format!("HTTP client init failed: {}", e)))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
            poll_timeout_secs,
            next_offset: AtomicI64::new(0),
        })
    }

    /// Method URL. Contains the bot token: never log it.
    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token.expose_secret(), method)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &serde_json::Value) -> Result<T, ProviderError> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(body)
            .send()
            .await
            // reqwest errors embed the URL, and with it the token
            .map_err(|e| ProviderError::ConnectionFailed(format!("{}: {}", method, e.without_url())))?;

        let status = response.status();
        let envelope: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(format!("{}: {}", method, e.without_url())))?;

        if !envelope.ok {
            let description = sanitize_api_error(&envelope.description.unwrap_or_default());
            return Err(match status.as_u16() {
                401 | 404 => ProviderError::AuthenticationFailed(format!("{}: {}", method, description)),
                s if s >= 500 => ProviderError::ServerError(format!("{}: {}", method, description)),
                _ => ProviderError::Other(format!("{} failed: {}", method, description)),
            });
        }
        envelope
            .result
            .ok_or_else(|| ProviderError::ParseError(format!("{}: empty result", method)))
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        markup: Option<&ReplyMarkup>,
    ) -> Result<MessageId, ProviderError> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if let Some(markup) = markup {
            body["reply_markup"] = markup_json(markup);
        }
        let sent: TgSentMessage = self.call("sendMessage", &body).await?;
        Ok(sent.message_id)
    }

    async fn edit_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        markup: Option<&ReplyMarkup>,
    ) -> Result<(), ProviderError> {
        let mut body = json!({ "chat_id": chat_id, "message_id": message_id, "text": text });
        // editMessageText only accepts inline keyboards
        if let Some(inline) = markup.filter(|m| matches!(m, ReplyMarkup::Inline(_))) {
            body["reply_markup"] = markup_json(inline);
        }
        match self.call::<serde_json::Value>("editMessageText", &body).await {
            Ok(_) => Ok(()),
            // Re-rendering the same listing is not a failure
            Err(e) if is_not_modified(&e) => {
                debug!("Message {} already shows this view", message_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn answer_callback(&self, query_id: &str, text: Option<&str>) -> Result<(), ProviderError> {
        let mut body = json!({ "callback_query_id": query_id });
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        let _: bool = self.call("answerCallbackQuery", &body).await?;
        Ok(())
    }

    async fn download_attachment(&self, file_id: &str) -> Result<Vec<u8>, ProviderError> {
        let file: TgFile = self.call("getFile", &json!({ "file_id": file_id })).await?;
        let file_path = file
            .file_path
            .ok_or_else(|| ProviderError::NotFound("Attachment is no longer available".to_string()))?;
        let url = format!("{}/file/bot{}/{}", self.api_base, self.token.expose_secret(), file_path);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProviderError::ConnectionFailed(format!("download: {}", e.without_url())))?;
        if !response.status().is_success() {
            return Err(ProviderError::ServerError(format!("download failed: {}", response.status())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::ConnectionFailed(format!("download: {}", e.without_url())))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl UpdateSource for TelegramTransport {
    async fn next_batch(&self) -> Result<Vec<InboundEvent>, ProviderError> {
        let body = json!({
            "offset": self.next_offset.load(Ordering::SeqCst),
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message", "callback_query"],
        });
        let updates: Vec<serde_json::Value> = self.call("getUpdates", &body).await?;

        let mut events = Vec::with_capacity(updates.len());
        for raw in updates {
            // Advance past every update, including ones that fail to parse
            if let Some(id) = raw.get("update_id").and_then(|v| v.as_i64()) {
                self.next_offset.fetch_max(id + 1, Ordering::SeqCst);
            }
            match serde_json::from_value::<TgUpdate>(raw) {
                Ok(update) => {
                    let update_id = update.update_id;
                    if let Some(event) = to_event(update) {
                        events.push(event);
                    } else {
                        debug!("Update {} produced no event", update_id);
                    }
                }
                Err(e) => warn!("Skipping malformed update: {}", e),
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(json: &str) -> TgUpdate {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_text_message_to_event() {
        let event = to_event(update(
            r#"{"update_id":1,"message":{"message_id":10,"from":{"id":7,"first_name":"Ada","last_name":"L"},
                "chat":{"id":70},"text":"/start"}}"#,
        ))
        .unwrap();
        assert_eq!(event.user_id, 7);
        assert_eq!(event.chat_id, 70);
        assert_eq!(event.user_name, "Ada L");
        assert_eq!(event.kind, EventKind::Start);
    }

    #[test]
    fn test_photo_uses_largest_size() {
        let event = to_event(update(
            r#"{"update_id":2,"message":{"message_id":11,"from":{"id":7,"first_name":"Ada"},
                "chat":{"id":70},"photo":[{"file_id":"small"},{"file_id":"large"}]}}"#,
        ))
        .unwrap();
        match event.kind {
            EventKind::Attachment(a) => {
                assert_eq!(a.file_id, "large");
                assert_eq!(a.kind, AttachmentKind::Photo);
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_callback_query_to_event() {
        let event = to_event(update(
            r#"{"update_id":3,"callback_query":{"id":"q1","from":{"id":7,"first_name":"Ada"},
                "message":{"message_id":12,"chat":{"id":70}},"data":"nfs:n:docs"}}"#,
        ))
        .unwrap();
        assert_eq!(
            event.kind,
            EventKind::Callback {
                query_id: "q1".into(),
                message_id: Some(12),
                data: "nfs:n:docs".into()
            }
        );
    }

    #[test]
    fn test_unsupported_message_dropped() {
        let sticker = update(
            r#"{"update_id":4,"message":{"message_id":13,"from":{"id":7,"first_name":"Ada"},
                "chat":{"id":70},"sticker":{"file_id":"s"}}}"#,
        );
        assert!(to_event(sticker).is_none());
    }

    #[test]
    fn test_markup_json_shapes() {
        let keyboard = markup_json(&ReplyMarkup::Keyboard(vec![vec!["a".into(), "b".into()]]));
        assert_eq!(keyboard["keyboard"][0][1]["text"], "b");
        assert_eq!(keyboard["resize_keyboard"], true);
        let inline = markup_json(&ReplyMarkup::Inline(vec![vec![super::super::InlineButton {
            text: "x".into(),
            callback_data: "nfs:n:x".into(),
        }]]));
        assert_eq!(inline["inline_keyboard"][0][0]["callback_data"], "nfs:n:x");
        assert_eq!(markup_json(&ReplyMarkup::Remove)["remove_keyboard"], true);
    }

    #[test]
    fn test_unchanged_edit_is_not_an_error() {
        assert!(is_not_modified(&ProviderError::Other(
            "editMessageText failed: Bad Request: message is not modified".to_string()
        )));
        assert!(!is_not_modified(&ProviderError::Other(
            "editMessageText failed: Bad Request: message to edit not found".to_string()
        )));
        assert!(!is_not_modified(&ProviderError::ServerError("message is not modified".to_string())));
    }
}
