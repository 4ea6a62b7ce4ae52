//! Telegram alert delivery.
//!
//! Alert bodies routinely exceed Telegram's 4,096-character message limit
//! (stack traces, violation lists), so the sender splits on line boundaries
//! and delivers the chunks sequentially. A failed chunk fails the aggregate
//! send but is not retried.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Telegram's hard per-message character limit.
pub const TELEGRAM_MAX_MESSAGE_LEN: usize = 4_096;

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("telegram request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("telegram rejected the message: {0}")]
    Rejected(String),
}

/// Bot credentials plus the destination chat.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    /// Overridable for tests; defaults to the public Bot API.
    pub api_base_url: String,
}

impl TelegramConfig {
    #[must_use]
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            api_base_url: "https://api.telegram.org".to_owned(),
        }
    }

    #[must_use]
    pub fn with_api_base_url(mut self, base: impl Into<String>) -> Self {
        self.api_base_url = base.into();
        self
    }
}

/// Subset of the Bot API response we care about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Split a message into chunks of at most `max_len` characters, breaking on
/// line boundaries. Lines longer than `max_len` are hard-split. Joining the
/// chunks with newlines yields the original line set.
#[must_use]
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    let mut push_line = |line: &str, chunks: &mut Vec<String>, current: &mut String| {
        if !current.is_empty() && current.chars().count() + 1 + line.chars().count() > max_len {
            chunks.push(std::mem::take(current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    };

    for line in text.split('\n') {
        if line.chars().count() <= max_len {
            push_line(line, &mut chunks, &mut current);
            continue;
        }
        // Oversized single line: hard-split into max_len pieces.
        let mut buf = String::new();
        for ch in line.chars() {
            buf.push(ch);
            if buf.chars().count() == max_len {
                push_line(&buf, &mut chunks, &mut current);
                buf.clear();
            }
        }
        if !buf.is_empty() {
            push_line(&buf, &mut chunks, &mut current);
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Strip message content and chat ids out of a Bot API response so it can
/// be logged.
#[must_use]
pub fn redact_response(resp: &SendResponse) -> String {
    let message_id = resp
        .result
        .as_ref()
        .and_then(|r| r.get("message_id"))
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    serde_json::json!({
        "ok": resp.ok,
        "message_id": message_id,
        "description": resp.description,
    })
    .to_string()
}

/// Telegram Bot API client.
#[derive(Debug, Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramClient {
    #[must_use]
    pub fn new(http: reqwest::Client, config: TelegramConfig) -> Self {
        Self { http, config }
    }

    fn send_message_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.bot_token
        )
    }

    /// Send one message as-is. The caller is responsible for the length
    /// limit; prefer [`TelegramClient::send_chunked`].
    pub async fn send_message(&self, text: &str) -> Result<SendResponse, TelegramError> {
        let resp: SendResponse = self
            .http
            .post(self.send_message_url())
            .json(&serde_json::json!({
                "chat_id": self.config.chat_id,
                "text": text,
            }))
            .send()
            .await?
            .json()
            .await?;
        if resp.ok {
            Ok(resp)
        } else {
            Err(TelegramError::Rejected(
                resp.description.unwrap_or_else(|| "unknown error".to_owned()),
            ))
        }
    }

    /// Split the message per [`split_message`] and send the chunks in
    /// order. Returns the per-chunk responses; the first failing chunk
    /// fails the whole send without retrying.
    pub async fn send_chunked(&self, text: &str) -> Result<Vec<SendResponse>, TelegramError> {
        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_LEN);
        let mut responses = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            match self.send_message(chunk).await {
                Ok(resp) => responses.push(resp),
                Err(e) => {
                    warn!(sent = responses.len(), total = chunks.len(), "telegram chunk send failed");
                    return Err(e);
                }
            }
        }
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn chunks_respect_max_len() {
        let text = "line\n".repeat(2_000);
        let parts = split_message(text.trim_end(), 500);
        assert!(parts.len() > 1);
        assert!(parts.iter().all(|p| !p.is_empty() && p.chars().count() <= 500));
    }

    #[test]
    fn joining_chunks_preserves_lines() {
        let text = "alpha\nbeta\ngamma\ndelta";
        let parts = split_message(text, 11);
        let joined = parts.join("\n");
        assert_eq!(joined, text);
    }

    #[test]
    fn oversized_single_line_is_hard_split() {
        let text = "a".repeat(TELEGRAM_MAX_MESSAGE_LEN + 10);
        let parts = split_message(&text, TELEGRAM_MAX_MESSAGE_LEN);
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.chars().count() <= TELEGRAM_MAX_MESSAGE_LEN));
    }

    #[test]
    fn short_message_is_one_chunk() {
        assert_eq!(split_message("hello", 100), vec!["hello"]);
    }

    #[test]
    fn redaction_drops_message_text() {
        let resp = SendResponse {
            ok: true,
            result: Some(serde_json::json!({"message_id": 42, "text": "secret"})),
            description: None,
        };
        let redacted = redact_response(&resp);
        assert!(redacted.contains("42"));
        assert!(!redacted.contains("secret"));
    }

    #[tokio::test]
    async fn sends_chunks_sequentially() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/bot[^/]+/sendMessage$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "result": {"message_id": 1},
            })))
            .expect(2)
            .mount(&server)
            .await;

        let client = TelegramClient::new(
            reqwest::Client::new(),
            TelegramConfig::new("token", "chat").with_api_base_url(server.uri()),
        );
        let long_line = "x".repeat(TELEGRAM_MAX_MESSAGE_LEN);
        let text = format!("{long_line}\ntail");
        let responses = client.send_chunked(&text).await.unwrap();
        assert_eq!(responses.len(), 2);
    }

    #[tokio::test]
    async fn rejected_message_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": false,
                "description": "chat not found",
            })))
            .mount(&server)
            .await;

        let client = TelegramClient::new(
            reqwest::Client::new(),
            TelegramConfig::new("token", "chat").with_api_base_url(server.uri()),
        );
        let err = client.send_message("hi").await.unwrap_err();
        assert!(matches!(err, TelegramError::Rejected(msg) if msg.contains("chat not found")));
    }
}
