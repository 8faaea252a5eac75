//! Run digest delivery for inventory sync.
//!
//! Callers hand over a [`SyncSummary`] and channels render it. The crate knows
//! nothing about the sync itself.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use notify::{Notifier, NotifyChannel, NotifyEvent, SyncSummary, TelegramChannel};
//!
//! # async fn run() {
//! let telegram: Arc<dyn NotifyChannel> = Arc::new(TelegramChannel::new("token", "-100"));
//! let notifier = Notifier::with_channels(vec![telegram]);
//!
//! // Waits for every channel, so a short-lived process does not cut delivery off
//! let results = notifier
//!     .notify_and_wait(NotifyEvent::SyncCompleted {
//!         summary: SyncSummary::default(),
//!         timestamp: chrono::Utc::now(),
//!     })
//!     .await;
//! # let _ = results;
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`NotifyChannel`] trait defines the interface for notification channels
//! - [`TelegramChannel`] implements Telegram Bot API delivery
//! - [`Notifier`] dispatches events to all enabled channels

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;

pub use channels::telegram::TelegramChannel;
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{NotifyEvent, Severity, SyncSummary};

use std::sync::Arc;
use tracing::{debug, error};

/// Central notification dispatcher.
///
/// The `Notifier` holds the enabled channels and delivers each event to all
/// of them in turn.
pub struct Notifier {
    channels: Vec<Arc<dyn NotifyChannel>>,
    disabled: bool,
}

impl Notifier {
    /// Create a notifier with specific channels.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        Self {
            channels,
            disabled: false,
        }
    }

    /// Create a disabled notifier (for testing or when notifications are off).
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            channels: vec![],
            disabled: true,
        }
    }

    /// Check if any notification channels are enabled.
    #[must_use]
    pub fn has_channels(&self) -> bool {
        !self.disabled && !self.channels.is_empty()
    }

    /// Get the number of enabled channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        if self.disabled {
            0
        } else {
            self.channels.len()
        }
    }

    /// Send a notification and wait for all channels to complete.
    ///
    /// Failures are logged and returned per channel, never propagated.
    pub async fn notify_and_wait(
        &self,
        event: NotifyEvent,
    ) -> Vec<(String, Result<(), ChannelError>)> {
        if !self.has_channels() {
            debug!("No active channels, skipping event");
            return vec![];
        }

        let mut results = vec![];

        for channel in &self.channels {
            if !channel.enabled() {
                debug!(channel = channel.name(), "Channel disabled, skipping");
                continue;
            }
            let channel_name = channel.name().to_string();
            let result = channel.send(&event).await;
            if let Err(e) = &result {
                error!(channel = %channel_name, error = %e, "Failed to send notification");
            }
            results.push((channel_name, result));
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        titles: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotifyChannel for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn enabled(&self) -> bool {
            true
        }

        async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
            self.titles.lock().unwrap().push(event.title());
            Ok(())
        }
    }

    #[test]
    fn test_disabled_notifier() {
        let notifier = Notifier::disabled();
        assert!(!notifier.has_channels());
        assert_eq!(notifier.channel_count(), 0);
    }

    #[test]
    fn test_event_titles_and_severity() {
        let clean = NotifyEvent::SyncCompleted {
            summary: SyncSummary::default(),
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(clean.title(), "Inventory sync finished");
        assert_eq!(clean.severity(), Severity::Info);

        let with_errors = NotifyEvent::SyncCompleted {
            summary: SyncSummary {
                dry_run: true,
                errors: vec!["srv-a: vendor unknown".into()],
                ..SyncSummary::default()
            },
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(with_errors.title(), "Inventory sync finished (dry run)");
        assert_eq!(with_errors.severity(), Severity::Warning);

        let failed = NotifyEvent::SyncFailed {
            error: "down".into(),
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(failed.severity(), Severity::Critical);
    }

    #[tokio::test]
    async fn test_notify_and_wait_reaches_every_channel() {
        let channel = Arc::new(Recording::default());
        let shared: Arc<dyn NotifyChannel> = channel.clone();
        let notifier = Notifier::with_channels(vec![shared]);

        let results = notifier
            .notify_and_wait(NotifyEvent::SyncFailed {
                error: "down".into(),
                timestamp: chrono::Utc::now(),
            })
            .await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());
        assert_eq!(
            channel.titles.lock().unwrap().as_slice(),
            ["Inventory sync failed".to_string()]
        );
    }
}
