//! Run orchestration.
//!
//! One run collects the source, classifies every record, reconciles the new
//! and changed ones strictly in order, and finishes with the lifecycle pass.
//! Records are grouped into batches only for progress logging.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::dependents::DependencyResolver;
use crate::detect::{ChangeDetector, ChangeKind, Detection};
use crate::error::{SyncError, SyncResult};
use crate::fingerprint::{FingerprintStore, LastSeenStore};
use crate::lifecycle::LifecycleManager;
use crate::model::{FieldChange, SourceRecord};
use crate::rack::{Placement, RackArbiter, RackConflict};
use crate::resolve::{EntityResolver, IdentityEvent, Resolution};
use crate::rollback::{RollbackCoordinator, RollbackLedger};
use crate::source::{Collector, SourceSystem};
use crate::target::dry_run::DryRun;
use crate::target::TargetSystem;
use crate::upsert::{UpsertEngine, UpsertOutcome};

/// How a run ended, as a process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Clean,
    CompletedWithErrors,
    /// Could not reach a remote system or hit a fatal error.
    FailedToStart,
    Interrupted,
}

impl ExitStatus {
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::FailedToStart => 1,
            Self::CompletedWithErrors => 2,
            Self::Interrupted => 130,
        }
    }
}

/// A device and the attributes that changed on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceChanges {
    pub name: String,
    pub changes: Vec<FieldChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rename {
    pub from: String,
    pub to: String,
}

/// A record that could not be reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordError {
    pub name: String,
    pub external_id: String,
    pub category: &'static str,
    pub reason: String,
}

impl RecordError {
    fn new(record: &SourceRecord, error: &SyncError) -> Self {
        Self {
            name: record.name.clone(),
            external_id: record.external_id.clone(),
            category: error.category(),
            reason: error.to_string(),
        }
    }
}

/// Everything a run did, for logging and the notifier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub dry_run: bool,
    pub total: usize,
    pub created: Vec<String>,
    pub updated: Vec<DeviceChanges>,
    pub recovered: Vec<DeviceChanges>,
    pub renamed: Vec<Rename>,
    pub unchanged: usize,
    /// Records rejected by validation.
    pub skipped: Vec<RecordError>,
    pub errors: Vec<RecordError>,
    pub conflicts: Vec<RackConflict>,
    pub unmapped_models: Vec<String>,
    pub decommissioned: Vec<String>,
    pub deleted: Vec<String>,
    /// Source-side differences against the cached snapshot.
    pub source_changes: Vec<DeviceChanges>,
    pub duration_secs: f64,
}

impl SyncReport {
    /// Skipped records do not count as errors.
    #[must_use]
    pub fn exit_status(&self) -> ExitStatus {
        if self.errors.is_empty() {
            ExitStatus::Clean
        } else {
            ExitStatus::CompletedWithErrors
        }
    }

    /// Devices written this run.
    #[must_use]
    pub fn written(&self) -> usize {
        self.created.len() + self.updated.len() + self.recovered.len()
    }
}

/// Record-level checks applied before anything else touches a record.
///
/// # Errors
/// Returns [`SyncError::Validation`] when the id or name is blank or the
/// source sent no inventory block.
pub fn validate_record(record: &SourceRecord) -> SyncResult<()> {
    if record.external_id.trim().is_empty() {
        return Err(SyncError::Validation(format!("{} has no external id", record.name)));
    }
    if record.name.trim().is_empty() {
        return Err(SyncError::Validation(format!(
            "host {} has no name",
            record.external_id
        )));
    }
    if record.inventory.is_none() {
        return Err(SyncError::Validation(format!(
            "{} has inventory collection disabled",
            record.name
        )));
    }
    let inventory = record.inventory();
    if inventory.vendor.is_none() || inventory.model.is_none() {
        debug!(name = %record.name, "Record has no vendor or model in inventory");
    }
    Ok(())
}

/// Per-run components. Dependency caches die with this value.
struct Pipeline {
    resolver: EntityResolver,
    dependencies: DependencyResolver,
    arbiter: RackArbiter,
    upsert: UpsertEngine,
    rollback: RollbackCoordinator,
}

pub struct SyncEngine {
    config: SyncConfig,
    source: Arc<dyn SourceSystem>,
    target: Arc<dyn TargetSystem>,
    fingerprints: Arc<dyn FingerprintStore>,
    clock: Arc<dyn LastSeenStore>,
}

impl SyncEngine {
    /// Build an engine. With `config.dry_run` set the target is wrapped so no
    /// write ever reaches it.
    #[must_use]
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn SourceSystem>,
        target: Arc<dyn TargetSystem>,
        fingerprints: Arc<dyn FingerprintStore>,
        clock: Arc<dyn LastSeenStore>,
    ) -> Self {
        let target: Arc<dyn TargetSystem> = if config.dry_run {
            Arc::new(DryRun::new(target))
        } else {
            target
        };
        Self {
            config,
            source,
            target,
            fingerprints,
            clock,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Probe both remote systems.
    ///
    /// # Errors
    /// Returns the first failing reachability check.
    pub async fn check(&self) -> SyncResult<()> {
        self.source.check().await?;
        self.target.check().await?;
        info!(
            source = self.source.name(),
            target = self.target.name(),
            "Remote systems reachable"
        );
        Ok(())
    }

    /// Run once against the wall clock.
    ///
    /// # Errors
    /// See [`SyncEngine::run_at`].
    pub async fn run(&self) -> SyncResult<SyncReport> {
        self.run_at(Utc::now()).await
    }

    /// Run once with `now` as the current time.
    ///
    /// Per-record failures are collected in the report. Only configuration
    /// and collection failures abort the run.
    ///
    /// # Errors
    /// Returns [`SyncError::Config`] or [`SyncError::Collection`].
    pub async fn run_at(&self, now: DateTime<Utc>) -> SyncResult<SyncReport> {
        self.config.ensure_valid()?;
        let started = Instant::now();
        let dry_run = self.config.dry_run;
        if dry_run {
            info!("Dry run, no changes will be written");
        }

        let records = Collector::new(self.source.clone(), self.config.filter.clone(), self.config.limit)
            .collect()
            .await?;

        let mut report = SyncReport {
            dry_run,
            total: records.len(),
            ..SyncReport::default()
        };

        let detector = ChangeDetector::new(self.fingerprints.clone(), self.config.cache.ttl_secs).read_only(dry_run);
        let mut active = HashSet::new();
        let mut pending: Vec<(SourceRecord, Detection)> = Vec::new();

        for record in records {
            if !record.external_id.trim().is_empty() {
                active.insert(record.external_id.trim().to_string());
            }
            if let Err(e) = validate_record(&record) {
                warn!(name = %record.name, reason = %e, "Skipping record");
                report.skipped.push(RecordError::new(&record, &e));
                continue;
            }

            let detection = detector.classify(&record).await;
            match &detection.kind {
                ChangeKind::Unchanged => {
                    report.unchanged += 1;
                    continue;
                }
                ChangeKind::Changed { changes } if !changes.is_empty() => {
                    report.source_changes.push(DeviceChanges {
                        name: record.name.clone(),
                        changes: changes.clone(),
                    });
                }
                ChangeKind::Changed { .. } | ChangeKind::New => {}
            }
            pending.push((record, detection));
        }

        info!(
            total = report.total,
            pending = pending.len(),
            unchanged = report.unchanged,
            skipped = report.skipped.len(),
            "Change detection complete"
        );

        let mut pipeline = self.pipeline();
        let batch_size = self.config.batch_size.max(1);
        let batches = pending.len().div_ceil(batch_size);

        for (index, batch) in pending.chunks(batch_size).enumerate() {
            info!(batch = index + 1, batches, size = batch.len(), "Processing batch");
            for (record, detection) in batch {
                let mut ledger = RollbackLedger::new();
                match self
                    .sync_record(record, &mut pipeline, &mut ledger, &mut report, now)
                    .await
                {
                    Ok(()) => detector.commit(&record.external_id, detection).await,
                    Err(e) => {
                        if !ledger.is_empty() {
                            pipeline.rollback.compensate(ledger).await;
                        }
                        if matches!(e, SyncError::Validation(_)) {
                            warn!(
                                name = %record.name,
                                external_id = %record.external_id,
                                error = %e,
                                "Skipping record"
                            );
                            report.skipped.push(RecordError::new(record, &e));
                            continue;
                        }
                        error!(
                            name = %record.name,
                            external_id = %record.external_id,
                            category = e.category(),
                            error = %e,
                            "Failed to sync record"
                        );
                        report.errors.push(RecordError::new(record, &e));
                    }
                }
            }
        }

        report.unmapped_models = pipeline.dependencies.unmapped_models();
        if !report.unmapped_models.is_empty() {
            warn!(
                models = ?report.unmapped_models,
                "Models without a rack height mapping used the generic height"
            );
        }

        let lifecycle = LifecycleManager::new(
            self.target.clone(),
            self.clock.clone(),
            self.fingerprints.clone(),
            self.config.lifecycle.clone(),
            self.config.fields.external_id_field.clone(),
        )
        .dry_run(dry_run)
        .partial(self.config.limit.is_some());
        match lifecycle.run(&active, now).await {
            Ok(outcome) => {
                report.decommissioned = outcome.decommissioned;
                report.deleted = outcome.deleted;
            }
            Err(e) => {
                error!(error = %e, "Lifecycle pass failed");
                report.errors.push(RecordError {
                    name: "lifecycle".to_string(),
                    external_id: String::new(),
                    category: e.category(),
                    reason: e.to_string(),
                });
            }
        }

        report.duration_secs = started.elapsed().as_secs_f64();
        info!(
            created = report.created.len(),
            updated = report.updated.len(),
            recovered = report.recovered.len(),
            renamed = report.renamed.len(),
            unchanged = report.unchanged,
            skipped = report.skipped.len(),
            errors = report.errors.len(),
            conflicts = report.conflicts.len(),
            decommissioned = report.decommissioned.len(),
            deleted = report.deleted.len(),
            duration_secs = report.duration_secs,
            "Sync complete"
        );
        Ok(report)
    }

    fn pipeline(&self) -> Pipeline {
        let field = &self.config.fields.external_id_field;
        Pipeline {
            resolver: EntityResolver::new(self.target.clone(), field.clone()),
            dependencies: DependencyResolver::new(self.target.clone(), self.config.mapping.clone()),
            arbiter: RackArbiter::new(self.target.clone(), self.config.racks.check_conflicts, field.clone()),
            upsert: UpsertEngine::new(
                self.target.clone(),
                self.config.fields.clone(),
                self.config.network.clone(),
            ),
            rollback: RollbackCoordinator::new(self.target.clone()),
        }
    }

    async fn sync_record(
        &self,
        record: &SourceRecord,
        pipeline: &mut Pipeline,
        ledger: &mut RollbackLedger,
        report: &mut SyncReport,
        now: DateTime<Utc>,
    ) -> SyncResult<()> {
        let existing = match pipeline.resolver.resolve(record).await? {
            Resolution::Existing { device, event } => {
                if let Some(IdentityEvent::Renamed { from, to }) = event {
                    report.renamed.push(Rename { from, to });
                }
                Some(device)
            }
            Resolution::Absent => None,
        };

        let deps = pipeline.dependencies.resolve(record).await?;
        let placement = pipeline
            .arbiter
            .arbitrate(
                &record.name,
                &record.external_id,
                deps.rack.as_ref(),
                record.rack_position(),
                existing.as_ref(),
            )
            .await?;

        let outcome = pipeline
            .upsert
            .upsert(record, existing.as_ref(), &deps, &placement, ledger, now)
            .await?;

        if let Placement::Conflict(conflict) = placement {
            report.conflicts.push(conflict);
        }
        let name = record.name.clone();
        match outcome {
            UpsertOutcome::Created { .. } => {
                info!(name = %name, site = %deps.site_name, model = %deps.model, "New device");
                report.created.push(name);
            }
            UpsertOutcome::Updated { changes } => {
                info!(name = %name, changes = changes.len(), "Updated device");
                report.updated.push(DeviceChanges { name, changes });
            }
            UpsertOutcome::Recovered { changes } => {
                report.recovered.push(DeviceChanges { name, changes });
            }
            UpsertOutcome::Unchanged => {
                debug!(name = %name, "Device already in sync");
                report.unchanged += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Inventory;
    use crate::source::SourceError;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitStatus::Clean.code(), 0);
        assert_eq!(ExitStatus::FailedToStart.code(), 1);
        assert_eq!(ExitStatus::CompletedWithErrors.code(), 2);
        assert_eq!(ExitStatus::Interrupted.code(), 130);
    }

    #[test]
    fn test_report_exit_status_ignores_skips() {
        let record = SourceRecord::new("100", "srv-a");
        let error = SyncError::Validation("no inventory".into());
        let mut report = SyncReport {
            skipped: vec![RecordError::new(&record, &error)],
            ..SyncReport::default()
        };
        assert_eq!(report.exit_status(), ExitStatus::Clean);

        report.errors.push(RecordError::new(
            &record,
            &SyncError::Collection(SourceError::Unavailable("down".into())),
        ));
        assert_eq!(report.exit_status(), ExitStatus::CompletedWithErrors);
    }

    #[test]
    fn test_validation() {
        assert!(validate_record(&SourceRecord::new("100", "srv-a")).is_ok());
        assert!(validate_record(&SourceRecord::new(" ", "srv-a")).is_err());
        assert!(validate_record(&SourceRecord::new("100", "")).is_err());

        let disabled = SourceRecord::new("100", "srv-a").without_inventory();
        let err = validate_record(&disabled).unwrap_err();
        assert_eq!(err.category(), "validation");

        let partial = SourceRecord::new("100", "srv-a").with_inventory(Inventory {
            vendor: Some("Dell".into()),
            ..Inventory::default()
        });
        assert!(validate_record(&partial).is_ok());
    }
}
