//! Telegram Bot API transport.
//!
//! `ChatTransport` is the seam the dispatcher talks through; `TelegramClient`
//! implements it over plain HTTPS calls to `api.telegram.org`.

use crate::protocol::{ApiResponse, File, OutgoingMessage, Update, User};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram rejects messages above 4096 characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Bot API download limit for `getFile`.
pub const MAX_DOWNLOAD_BYTES: u64 = 20 * 1024 * 1024;

const REQUEST_TIMEOUT_SECS: u64 = 30;
const LONG_POLL_GRACE_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{method}: request failed: {source}")]
    Http {
        method: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} rejected by Telegram: {description}")]
    Api { method: String, description: String },

    #[error("{method} returned an unexpected response: {message}")]
    Decode { method: String, message: String },
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(&self, message: OutgoingMessage) -> Result<(), TransportError>;

    /// Acknowledge a button press, optionally with a toast text.
    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Fetch the contents of an uploaded document.
    async fn download_document(&self, file_id: &str) -> Result<Vec<u8>, TransportError>;
}

pub struct TelegramClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl TelegramClient {
    pub fn new(token: impl Into<String>) -> Result<Self, TransportError> {
        Self::with_api_base(token, DEFAULT_API_BASE)
    }

    pub fn with_api_base(
        token: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|source| TransportError::Http {
                method: "build client".to_string(),
                source,
            })?;
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_base, self.token, file_path)
    }

    // The request URL embeds the bot token, so it is stripped from errors.
    fn http_error(method: &str, source: reqwest::Error) -> TransportError {
        TransportError::Http {
            method: method.to_string(),
            source: source.without_url(),
        }
    }

    async fn call<P: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
        timeout: Option<Duration>,
    ) -> Result<T, TransportError> {
        let mut request = self.http.post(self.method_url(method)).json(params);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Self::http_error(method, e))?;
        let body = response
            .text()
            .await
            .map_err(|e| Self::http_error(method, e))?;
        let envelope: ApiResponse<T> =
            serde_json::from_str(&body).map_err(|e| TransportError::Decode {
                method: method.to_string(),
                message: e.to_string(),
            })?;

        if !envelope.ok {
            return Err(TransportError::Api {
                method: method.to_string(),
                description: envelope
                    .description
                    .unwrap_or_else(|| format!("error code {:?}", envelope.error_code)),
            });
        }

        envelope.result.ok_or_else(|| TransportError::Decode {
            method: method.to_string(),
            message: "result is missing".to_string(),
        })
    }

    /// Verify the bot token.
    pub async fn get_me(&self) -> Result<User, TransportError> {
        self.call("getMe", &json!({}), None).await
    }

    /// Long-poll for updates after `offset`.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TransportError> {
        let mut params = json!({
            "timeout": timeout_secs,
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(offset) = offset {
            params["offset"] = json!(offset);
        }
        let timeout = Duration::from_secs(timeout_secs + LONG_POLL_GRACE_SECS);
        self.call("getUpdates", &params, Some(timeout)).await
    }

    pub async fn set_webhook(&self, url: &str) -> Result<(), TransportError> {
        let params = json!({
            "url": url,
            "allowed_updates": ["message", "callback_query"],
        });
        let _: bool = self.call("setWebhook", &params, None).await?;
        Ok(())
    }

    /// Long polling only works while no webhook is registered.
    pub async fn delete_webhook(&self) -> Result<(), TransportError> {
        let _: bool = self
            .call("deleteWebhook", &json!({ "drop_pending_updates": false }), None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn send_message(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        let chunks = split_message(&message.text, MAX_MESSAGE_CHARS);
        let last = chunks.len().saturating_sub(1);
        // A cut can land inside a Markdown entity, so split bodies go out as plain text.
        let parse_mode = if last == 0 { message.parse_mode } else { None };
        for (index, chunk) in chunks.into_iter().enumerate() {
            // The keyboard belongs under the final chunk.
            let part = OutgoingMessage {
                chat_id: message.chat_id,
                text: chunk,
                parse_mode,
                reply_markup: if index == last {
                    message.reply_markup.clone()
                } else {
                    None
                },
            };
            let _: serde_json::Value = self.call("sendMessage", &part, None).await?;
        }
        Ok(())
    }

    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), TransportError> {
        let mut params = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            params["text"] = json!(text);
        }
        let _: bool = self.call("answerCallbackQuery", &params, None).await?;
        Ok(())
    }

    async fn download_document(&self, file_id: &str) -> Result<Vec<u8>, TransportError> {
        let file: File = self
            .call("getFile", &json!({ "file_id": file_id }), None)
            .await?;
        if let Some(size) = file.file_size {
            if size > MAX_DOWNLOAD_BYTES {
                return Err(TransportError::Api {
                    method: "getFile".to_string(),
                    description: format!("file is too big ({} bytes)", size),
                });
            }
        }
        let file_path = file.file_path.ok_or_else(|| TransportError::Decode {
            method: "getFile".to_string(),
            message: "file_path is missing".to_string(),
        })?;

        let response = self
            .http
            .get(self.file_url(&file_path))
            .send()
            .await
            .map_err(|e| Self::http_error("download file", e))?
            .error_for_status()
            .map_err(|e| Self::http_error("download file", e))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::http_error("download file", e))?;
        Ok(bytes.to_vec())
    }
}

/// Split long messages at line boundaries to respect platform limits.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.lines() {
        let line_len = line.chars().count();
        if current_len + line_len + 1 > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            // Handle single lines longer than max_chars
            if line_len > max_chars {
                let chars: Vec<char> = line.chars().collect();
                for piece in chars.chunks(max_chars) {
                    chunks.push(piece.iter().collect());
                }
                continue;
            }
        }
        if !current.is_empty() {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_message_short() {
        assert_eq!(split_message("Hello world", 100), vec!["Hello world"]);
        assert_eq!(split_message("", 100), vec![""]);
    }

    #[test]
    fn test_split_message_multiline() {
        let chunks = split_message("Line 1\nLine 2\nLine 3\nLine 4", 15);
        assert_eq!(chunks, vec!["Line 1\nLine 2", "Line 3\nLine 4"]);
    }

    #[test]
    fn test_split_message_long_single_line() {
        let text = "a".repeat(250);
        let chunks = split_message(&text, 100);
        let lens: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(lens, vec![100, 100, 50]);
    }

    #[test]
    fn test_split_message_counts_chars_not_bytes() {
        let text = format!("{}\n{}", "é".repeat(8), "ü".repeat(8));
        let chunks = split_message(&text, 10);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 8);
    }

    #[test]
    fn test_urls_embed_token() {
        let client = TelegramClient::with_api_base("123:ABC", "http://localhost:9/").unwrap();
        assert_eq!(client.method_url("getMe"), "http://localhost:9/bot123:ABC/getMe");
        assert_eq!(
            client.file_url("documents/file_1.js"),
            "http://localhost:9/file/bot123:ABC/documents/file_1.js"
        );
    }
}
