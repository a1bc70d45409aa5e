//! Telegram transport: outbound notifications and inbound command polling.
//!
//! Deliberately thin. Parsing and authorisation of commands live in the
//! application layer; this module only moves text in and out of the
//! Telegram HTTP API. Sends are best-effort: a dead chat must never stall
//! the watcher, so failures are logged and swallowed.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::domain::ports::Notifier;
use crate::infrastructure::config::TelegramConfig;

/// Long-poll window for getUpdates.
const POLL_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    from: Option<User>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
}

/// One inbound command text with its sender.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub user_id: i64,
    pub text: String,
}

/// Outbound notifications into the configured chat.
#[derive(Clone)]
pub struct TelegramNotifier {
    http: reqwest::Client,
    base_url: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(cfg: &TelegramConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url: format!("https://api.telegram.org/bot{}", cfg.bot_token),
            chat_id: cfg.chat_id.clone(),
        }
    }

    pub async fn send_startup(&self, version: &str) {
        self.send(&format!(
            "🤖 <b>Trading bot started</b>\nVersion: {version}\nKill switch is OFF until /resume."
        ))
        .await;
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) {
        let url = format!("{}/sendMessage", self.base_url);
        let payload = json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        match self.http.post(&url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("notification sent");
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                error!(%status, body = %body.chars().take(200).collect::<String>(), "sendMessage failed");
            }
            Err(e) => {
                error!(error = %e, "sendMessage transport error");
            }
        }
    }
}

/// Notifier that drops everything. Used in tests and headless dry runs.
#[derive(Default, Clone)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send(&self, _text: &str) {}
}

/// Long-polling receiver for operator commands.
pub struct TelegramBot {
    http: reqwest::Client,
    base_url: String,
    offset: i64,
}

impl TelegramBot {
    pub fn new(cfg: &TelegramConfig) -> Self {
        let http = reqwest::Client::builder()
            // long poll plus headroom
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url: format!("https://api.telegram.org/bot{}", cfg.bot_token),
            offset: 0,
        }
    }

    /// Drop updates that accumulated while the process was down, so a
    /// restart does not replay stale commands.
    pub async fn flush_backlog(&mut self) {
        match self.fetch_updates(0, 0).await {
            Ok(updates) => {
                if let Some(last) = updates.last() {
                    self.offset = last.update_id + 1;
                    info!(flushed = updates.len(), offset = self.offset, "old updates flushed");
                }
            }
            Err(e) => warn!(error = %e, "failed to flush old updates"),
        }
    }

    /// One long-poll round. Returns the text messages received and
    /// advances the offset past them.
    pub async fn poll(&mut self) -> Vec<IncomingMessage> {
        let updates = match self.fetch_updates(self.offset, POLL_TIMEOUT_SECS).await {
            Ok(updates) => updates,
            Err(e) => {
                warn!(error = %e, "getUpdates failed");
                tokio::time::sleep(Duration::from_secs(3)).await;
                return Vec::new();
            }
        };

        let mut messages = Vec::new();
        for update in updates {
            self.offset = update.update_id + 1;
            let Some(message) = update.message else { continue };
            let (Some(text), Some(from)) = (message.text, message.from) else { continue };
            debug!(user_id = from.id, text = %text.chars().take(50).collect::<String>(), "command received");
            messages.push(IncomingMessage { user_id: from.id, text });
        }
        messages
    }

    async fn fetch_updates(&self, offset: i64, timeout: u64) -> Result<Vec<Update>, String> {
        let url = format!("{}/getUpdates", self.base_url);
        let payload = json!({
            "offset": offset,
            "timeout": timeout,
            "allowed_updates": ["message"],
        });

        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }

        let body: ApiResponse<Vec<Update>> = response.json().await.map_err(|e| e.to_string())?;
        if !body.ok {
            return Err(body.description.unwrap_or_else(|| "not ok".to_string()));
        }
        Ok(body.result.unwrap_or_default())
    }
}
