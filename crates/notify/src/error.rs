//! Error types for the notification system.

use thiserror::Error;

/// Errors that can occur when delivering a notification.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Required credentials are missing.
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The messaging API answered with a non-success status.
    #[error("Rejected with {status}: {body}")]
    Rejected { status: u16, body: String },
}
