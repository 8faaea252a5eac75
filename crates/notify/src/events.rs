//! Notification event types for inventory sync runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity levels for notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - normal operations
    Info,
    /// Warning - something needs attention
    Warning,
    /// Critical - immediate action required
    Critical,
}

impl Severity {
    /// Marker shown in front of the message title.
    #[must_use]
    pub const fn emoji(&self) -> &'static str {
        match self {
            Self::Info => "📊",
            Self::Warning => "⚠️",
            Self::Critical => "🚨",
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }
}

/// Structured outcome of one sync run.
///
/// Callers fill this from their own report type; channels decide how to
/// render it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSummary {
    #[serde(default)]
    pub dry_run: bool,
    pub total: usize,
    #[serde(default)]
    pub created: Vec<String>,
    #[serde(default)]
    pub updated: Vec<String>,
    #[serde(default)]
    pub recovered: Vec<String>,
    /// `old → new` pairs.
    #[serde(default)]
    pub renamed: Vec<String>,
    pub unchanged: usize,
    #[serde(default)]
    pub skipped: usize,
    /// `name: reason` lines.
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub unmapped_models: Vec<String>,
    #[serde(default)]
    pub decommissioned: Vec<String>,
    #[serde(default)]
    pub deleted: Vec<String>,
    pub duration_secs: u64,
}

impl SyncSummary {
    /// Devices written successfully.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.created.len() + self.updated.len() + self.recovered.len()
    }
}

/// Events that can trigger notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    /// A sync run finished, possibly with per-record errors.
    SyncCompleted {
        summary: SyncSummary,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// A sync run could not start or aborted.
    SyncFailed {
        error: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    /// Get a short title for this event type.
    #[must_use]
    pub fn title(&self) -> String {
        match self {
            Self::SyncCompleted { summary, .. } if summary.dry_run => {
                "Inventory sync finished (dry run)".to_string()
            }
            Self::SyncCompleted { .. } => "Inventory sync finished".to_string(),
            Self::SyncFailed { .. } => "Inventory sync failed".to_string(),
        }
    }

    /// Get the severity for this event.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::SyncCompleted { summary, .. } => {
                if summary.errors.is_empty() && summary.conflicts.is_empty() {
                    Severity::Info
                } else {
                    Severity::Warning
                }
            }
            Self::SyncFailed { .. } => Severity::Critical,
        }
    }

    /// Get the timestamp for this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::SyncCompleted { timestamp, .. } | Self::SyncFailed { timestamp, .. } => *timestamp,
        }
    }
}
