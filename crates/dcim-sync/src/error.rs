//! Error taxonomy for a reconciliation run.
//!
//! Each variant carries its own handling rule; the engine decides what to do
//! with a record based on [`SyncError::category`], never on message text.

use thiserror::Error;

use crate::fingerprint::CacheError;
use crate::source::SourceError;
use crate::target::TargetError;

/// Errors raised while reconciling inventory.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Record is missing required identity or inventory fields. Skipped, never retried in-run.
    #[error("Invalid record: {0}")]
    Validation(String),

    /// Manufacturer, model, site or another prerequisite could not be resolved.
    #[error("Dependency resolution failed: {0}")]
    DependencyResolution(String),

    /// The target system rejected or failed a call.
    #[error("Remote error: {0}")]
    Remote(#[from] TargetError),

    /// Fingerprint cache or lifecycle clock failure.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// A rack position is already held by another device.
    #[error("Rack {rack} position {position} is held by {occupant}")]
    Conflict {
        rack: String,
        position: u32,
        occupant: String,
    },

    /// The source inventory could not be collected. Fatal for the run.
    #[error("Source collection failed: {0}")]
    Collection(#[from] SourceError),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Short stable label used in reports and structured logs.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::DependencyResolution(_) => "dependency",
            Self::Remote(_) => "remote",
            Self::Cache(_) => "cache",
            Self::Conflict { .. } => "conflict",
            Self::Collection(_) => "collection",
            Self::Config(_) => "config",
        }
    }
}

/// Result alias for reconciliation operations.
pub type SyncResult<T> = Result<T, SyncError>;
