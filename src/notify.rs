//! Operator notifications.
//!
//! Delivery is fire-and-forget from the engine's point of view: callers use
//! [`notify_quietly`], which logs failures and never propagates them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::NotifyError;
use crate::metrics;

const TELEGRAM_API: &str = "https://api.telegram.org";
const TELEGRAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends operator-facing messages.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    /// Deliver one message.
    async fn notify(&self, message: &str) -> Result<(), NotifyError>;
}

/// Telegram bot notifier.
pub struct TelegramNotifier {
    http: reqwest::Client,
    url: String,
    chat_id: String,
    prefix: String,
}

impl std::fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("chat_id", &self.chat_id)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    disable_web_page_preview: bool,
}

impl TelegramNotifier {
    /// Create a notifier for `chat_id` using `token`.
    pub fn new(token: &str, chat_id: &str, prefix: &str) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(TELEGRAM_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            url: format!("{}/bot{}/sendMessage", TELEGRAM_API, token),
            chat_id: chat_id.to_string(),
            prefix: prefix.to_string(),
        })
    }

    fn text(&self, message: &str) -> String {
        if self.prefix.is_empty() {
            message.to_string()
        } else {
            format!("{} {}", self.prefix, message)
        }
    }
}

#[async_trait]
impl NotificationGateway for TelegramNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        let body = SendMessage {
            chat_id: &self.chat_id,
            text: self.text(message),
            disable_web_page_preview: true,
        };

        let response = self.http.post(&self.url).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected { status, body });
        }
        Ok(())
    }
}

/// Writes notifications to the log only.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier {
    prefix: String,
}

impl LogNotifier {
    /// Create a log notifier.
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }
}

#[async_trait]
impl NotificationGateway for LogNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        warn!(prefix = %self.prefix, "OPERATOR ALERT: {}", message);
        Ok(())
    }
}

/// Telegram when both token and chat id are set, log-only otherwise.
pub fn from_config(config: &Config) -> Result<Arc<dyn NotificationGateway>, NotifyError> {
    match (&config.telegram_bot_token, &config.telegram_chat_id) {
        (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
            info!(chat_id = %chat_id, "Telegram notifications enabled");
            Ok(Arc::new(TelegramNotifier::new(
                token,
                chat_id,
                &config.notify_prefix,
            )?))
        }
        _ => {
            info!("Telegram not configured, alerts go to the log");
            Ok(Arc::new(LogNotifier::new(&config.notify_prefix)))
        }
    }
}

/// Send and swallow failures.
pub async fn notify_quietly(gateway: &dyn NotificationGateway, message: &str) {
    if let Err(e) = gateway.notify(message).await {
        metrics::inc_notify_failures();
        warn!(error = %e, "Failed to deliver operator notification");
    }
}
