//! Telegram bot notification channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::{NotifyEvent, SyncSummary};
use crate::NotifyChannel;

/// Environment variable for the bot token.
const ENV_TELEGRAM_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";

/// Environment variable for the destination chat.
const ENV_TELEGRAM_CHAT_ID: &str = "TELEGRAM_CHAT_ID";

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram rejects messages above 4096 characters.
const MAX_MESSAGE_CHARS: usize = 4000;

/// Names listed per section before the rest is summarised.
const MAX_LISTED: usize = 5;

/// Telegram bot notification channel.
pub struct TelegramChannel {
    bot_token: Option<String>,
    chat_id: Option<String>,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    /// Create a Telegram channel for a specific bot and chat.
    ///
    /// A blank token or chat leaves the channel disabled.
    #[must_use]
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        let bot_token = Some(bot_token.into()).filter(|v| !v.trim().is_empty());
        let chat_id = Some(chat_id.into()).filter(|v| !v.trim().is_empty());
        if bot_token.is_none() || chat_id.is_none() {
            debug!("Telegram channel created without a bot token or chat id");
        }
        Self {
            bot_token,
            chat_id,
            api_base: DEFAULT_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the channel at another Bot API host.
    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Render an event as a Telegram HTML message.
    #[must_use]
    pub fn format_message(event: &NotifyEvent) -> String {
        let mut lines = vec![format!(
            "{} <b>{}</b>",
            event.severity().emoji(),
            escape(&event.title())
        )];
        lines.push(String::new());

        match event {
            NotifyEvent::SyncCompleted { summary, .. } => format_summary(summary, &mut lines),
            NotifyEvent::SyncFailed { error, .. } => {
                lines.push(format!("<code>{}</code>", escape(error)));
            }
        }

        lines.push(String::new());
        lines.push(format!(
            "🕐 {}",
            event.timestamp().format("%Y-%m-%d %H:%M:%S UTC")
        ));
        truncate(&lines.join("\n"))
    }
}

fn format_summary(summary: &SyncSummary, lines: &mut Vec<String>) {
    lines.push(format!("✅ Synced: <b>{}</b>", summary.succeeded()));
    lines.push(format!("➖ Unchanged: <b>{}</b>", summary.unchanged));
    lines.push(format!("❌ Errors: <b>{}</b>", summary.errors.len()));
    if summary.skipped > 0 {
        lines.push(format!("⏭ Skipped: <b>{}</b>", summary.skipped));
    }
    lines.push(format!("⏱ {}s of {} hosts", summary.duration_secs, summary.total));

    let sections = [
        ("🆕", "New devices", &summary.created),
        ("🔄", "Changed devices", &summary.updated),
        ("♻️", "Recovered devices", &summary.recovered),
        ("✏️", "Renamed devices", &summary.renamed),
        ("📦", "Decommissioned", &summary.decommissioned),
        ("🗑", "Deleted", &summary.deleted),
        ("🚫", "Rack conflicts", &summary.conflicts),
        ("❌", "Errors", &summary.errors),
        ("⚠️", "Models without rack height", &summary.unmapped_models),
    ];
    for (emoji, heading, names) in sections {
        if names.is_empty() {
            continue;
        }
        lines.push(String::new());
        lines.push(format!("{emoji} <b>{heading} ({}):</b>", names.len()));
        for name in names.iter().take(MAX_LISTED) {
            lines.push(format!("  • <code>{}</code>", escape(name)));
        }
        if names.len() > MAX_LISTED {
            lines.push(format!("  <i>... and {} more</i>", names.len() - MAX_LISTED));
        }
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(MAX_MESSAGE_CHARS - 3).collect();
    cut.push_str("...");
    cut
}

#[async_trait]
impl NotifyChannel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn enabled(&self) -> bool {
        self.bot_token.is_some() && self.chat_id.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let (Some(token), Some(chat_id)) = (&self.bot_token, &self.chat_id) else {
            return Err(ChannelError::NotConfigured(format!(
                "{ENV_TELEGRAM_BOT_TOKEN}/{ENV_TELEGRAM_CHAT_ID}"
            )));
        };

        let payload = SendMessage {
            chat_id,
            text: Self::format_message(event),
            parse_mode: "HTML",
            disable_notification: false,
        };

        debug!(channel = "telegram", event_type = ?event.title(), "Sending notification");

        let url = format!("{}/bot{token}/sendMessage", self.api_base);
        let response = self.client.post(&url).json(&payload).send().await?;

        if response.status().is_success() {
            debug!(channel = "telegram", "Notification sent successfully");
            return Ok(());
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 {
            let retry_after_secs = serde_json::from_str::<ApiError>(&body)
                .ok()
                .and_then(|e| e.parameters)
                .and_then(|p| p.retry_after)
                .unwrap_or(1);
            return Err(ChannelError::RateLimited { retry_after_secs });
        }

        warn!(
            channel = "telegram",
            status = %status,
            body = %body,
            "Telegram sendMessage failed"
        );
        Err(ChannelError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

// =============================================================================
// Bot API types
// =============================================================================

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'static str,
    disable_notification: bool,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}
