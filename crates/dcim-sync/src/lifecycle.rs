//! Ageing out devices that disappeared from the source.
//!
//! Only devices in a managed role that carry an external id are considered.
//! Absence is measured against a last-seen clock kept outside the target, so
//! a device's first absence only starts the clock.
//!
//! Decommissioning a device drops its cached fingerprint. Recovery happens in
//! the upsert step, which only sees records the change detector lets through,
//! so a returning host must read as new whatever the cache TTL.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::LifecycleConfig;
use crate::error::SyncResult;
use crate::fingerprint::{FingerprintStore, LastSeenStore};
use crate::model::{cf, Device, DeviceStatus};
use crate::normalize::slugify;
use crate::target::{EntityKind, Fields, Query, TargetSystem};

/// Names touched by one lifecycle pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleReport {
    pub decommissioned: Vec<String>,
    pub deleted: Vec<String>,
}

pub struct LifecycleManager {
    target: Arc<dyn TargetSystem>,
    clock: Arc<dyn LastSeenStore>,
    fingerprints: Arc<dyn FingerprintStore>,
    config: LifecycleConfig,
    external_id_field: String,
    dry_run: bool,
    partial: bool,
}

impl LifecycleManager {
    #[must_use]
    pub fn new(
        target: Arc<dyn TargetSystem>,
        clock: Arc<dyn LastSeenStore>,
        fingerprints: Arc<dyn FingerprintStore>,
        config: LifecycleConfig,
        external_id_field: impl Into<String>,
    ) -> Self {
        Self {
            target,
            clock,
            fingerprints,
            config,
            external_id_field: external_id_field.into(),
            dry_run: false,
            partial: false,
        }
    }

    /// Leave the last-seen clock untouched.
    #[must_use]
    pub const fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// The active set does not cover the whole source (a capped listing).
    /// Clocks are still refreshed for the ids seen, but nothing is aged.
    #[must_use]
    pub const fn partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    /// Refresh the clock for `active` ids and step every absent managed device.
    ///
    /// # Errors
    /// Returns [`crate::SyncError::Remote`] when managed devices cannot be
    /// listed. Failures on a single device only warn.
    pub async fn run(&self, active: &HashSet<String>, now: DateTime<Utc>) -> SyncResult<LifecycleReport> {
        let mut report = LifecycleReport::default();
        if !self.config.enabled {
            debug!("Lifecycle pass disabled");
            return Ok(report);
        }

        if !self.dry_run {
            for external_id in active {
                if let Err(e) = self.clock.set_last_seen(external_id, now).await {
                    warn!(external_id = %external_id, error = %e, "Failed to refresh last seen");
                }
            }
        }

        if self.partial {
            info!(
                refreshed = active.len(),
                "Source listing was capped, skipping decommission and deletion"
            );
            return Ok(report);
        }

        for device in self.managed_devices().await? {
            let Some(external_id) = device.external_id(&self.external_id_field) else {
                continue;
            };
            if active.contains(&external_id) {
                continue;
            }

            let step = match device.status {
                DeviceStatus::Active | DeviceStatus::Offline => {
                    self.age(&device, &external_id, now, &mut report).await
                }
                DeviceStatus::Decommissioning => self.expire(&device, now, &mut report).await,
                DeviceStatus::Deleted | DeviceStatus::Other => Ok(()),
            };
            if let Err(e) = step {
                warn!(device = %device.name, external_id = %external_id, error = %e, "Lifecycle step failed");
            }
        }

        info!(
            decommissioned = report.decommissioned.len(),
            deleted = report.deleted.len(),
            "Lifecycle pass complete"
        );
        Ok(report)
    }

    async fn managed_devices(&self) -> SyncResult<Vec<Device>> {
        let mut devices = BTreeMap::new();
        for role in &self.config.managed_roles {
            let Some(role) = self
                .target
                .get(EntityKind::Role, &Query::new().eq("slug", slugify(role)))
                .await?
            else {
                debug!(role = %role, "Managed role does not exist");
                continue;
            };
            for object in self
                .target
                .list(EntityKind::Device, &Query::new().eq("role_id", role.id))
                .await?
            {
                match Device::from_object(&object) {
                    Ok(device) => {
                        devices.insert(device.id, device);
                    }
                    Err(e) => warn!(id = object.id, error = %e, "Skipping malformed device"),
                }
            }
        }
        Ok(devices.into_values().collect())
    }

    async fn age(
        &self,
        device: &Device,
        external_id: &str,
        now: DateTime<Utc>,
        report: &mut LifecycleReport,
    ) -> SyncResult<()> {
        let Some(last_seen) = self.clock.get_last_seen(external_id).await? else {
            debug!(device = %device.name, "First absence, starting clock");
            if !self.dry_run {
                self.clock.set_last_seen(external_id, now).await?;
            }
            return Ok(());
        };

        let absent = now - last_seen;
        if absent <= Duration::days(i64::from(self.config.decommission_after_days)) {
            return Ok(());
        }

        let patch = status_patch("decommissioning", json!(stamp(now)));
        self.target.update(device.reference(), patch).await?;
        info!(
            device = %device.name,
            absent_days = absent.num_days(),
            "Device moved to decommissioning"
        );
        if !self.dry_run {
            if let Err(e) = self.fingerprints.remove_fingerprint(external_id).await {
                warn!(external_id, error = %e, "Failed to drop fingerprint, recovery waits for its TTL");
            }
        }
        report.decommissioned.push(device.name.clone());
        Ok(())
    }

    async fn expire(&self, device: &Device, now: DateTime<Utc>, report: &mut LifecycleReport) -> SyncResult<()> {
        let Some(since) = device.decommissioned_at() else {
            let mut custom = Fields::new();
            custom.insert(cf::DECOMMISSIONED_AT.into(), json!(stamp(now)));
            let mut patch = Fields::new();
            patch.insert("custom_fields".into(), json!(custom));
            self.target.update(device.reference(), patch).await?;
            warn!(device = %device.name, "Decommissioning device had no timestamp, stamped now");
            return Ok(());
        };

        if !self.config.delete_decommissioned {
            return Ok(());
        }

        if now - since <= Duration::days(i64::from(self.config.delete_after_days)) {
            return Ok(());
        }
        self.target.delete(device.reference()).await?;
        info!(device = %device.name, since = %since, "Deleted decommissioned device");
        report.deleted.push(device.name.clone());
        Ok(())
    }
}

fn stamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn status_patch(status: &str, decommissioned_at: serde_json::Value) -> Fields {
    let mut custom = Fields::new();
    custom.insert(cf::DECOMMISSIONED_AT.into(), decommissioned_at);
    let mut patch = Fields::new();
    patch.insert("status".into(), json!(status));
    patch.insert("custom_fields".into(), json!(custom));
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{Fingerprint, MemoryStore};
    use crate::model::SourceRecord;
    use crate::target::memory::MemoryTarget;
    use crate::target::ObjectRef;
    use serde_json::Value;

    struct Fixture {
        target: Arc<MemoryTarget>,
        clock: Arc<MemoryStore>,
        role: u64,
    }

    impl Fixture {
        fn new() -> Self {
            let target = Arc::new(MemoryTarget::new());
            let role = target.seed(EntityKind::Role, fields(json!({"name": "Server", "slug": "server"})));
            Self {
                target,
                clock: Arc::new(MemoryStore::new()),
                role,
            }
        }

        fn device(&self, name: &str, external_id: &str, status: &str) -> u64 {
            self.target.seed(
                EntityKind::Device,
                fields(json!({
                    "name": name,
                    "role": self.role,
                    "status": status,
                    "custom_fields": {"zabbix_hostid": external_id}
                })),
            )
        }

        fn manager(&self, config: LifecycleConfig) -> LifecycleManager {
            LifecycleManager::new(
                self.target.clone(),
                self.clock.clone(),
                self.clock.clone(),
                config,
                "zabbix_hostid",
            )
        }

        fn status(&self, id: u64) -> DeviceStatus {
            self.load(id).status
        }

        fn load(&self, id: u64) -> Device {
            Device::from_object(&self.target.object(ObjectRef::new(EntityKind::Device, id)).unwrap()).unwrap()
        }
    }

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn at(day: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::days(day)
    }

    #[tokio::test]
    async fn test_first_absence_starts_clock() {
        let fx = Fixture::new();
        let id = fx.device("srv-a", "100", "active");

        let report = fx.manager(LifecycleConfig::default()).run(&HashSet::new(), at(0)).await.unwrap();
        assert!(report.decommissioned.is_empty());
        assert_eq!(fx.status(id), DeviceStatus::Active);
        assert_eq!(fx.clock.get_last_seen("100").await.unwrap(), Some(at(0)));
    }

    #[tokio::test]
    async fn test_threshold_is_exclusive() {
        let fx = Fixture::new();
        let id = fx.device("srv-a", "100", "active");
        let manager = fx.manager(LifecycleConfig::default());

        manager.run(&HashSet::from(["100".to_string()]), at(0)).await.unwrap();

        manager.run(&HashSet::new(), at(30)).await.unwrap();
        assert_eq!(fx.status(id), DeviceStatus::Active);

        let report = manager.run(&HashSet::new(), at(31)).await.unwrap();
        assert_eq!(report.decommissioned, vec!["srv-a".to_string()]);
        let device = fx.load(id);
        assert_eq!(device.status, DeviceStatus::Decommissioning);
        assert_eq!(device.decommissioned_at(), Some(at(31)));
    }

    #[tokio::test]
    async fn test_present_devices_are_left_alone() {
        let fx = Fixture::new();
        let id = fx.device("srv-a", "100", "active");
        fx.clock.set_last_seen("100", at(0)).await.unwrap();

        let active = HashSet::from(["100".to_string()]);
        fx.manager(LifecycleConfig::default()).run(&active, at(90)).await.unwrap();
        assert_eq!(fx.status(id), DeviceStatus::Active);
        assert_eq!(fx.clock.get_last_seen("100").await.unwrap(), Some(at(90)));
    }

    #[tokio::test]
    async fn test_unmanaged_devices_are_out_of_scope() {
        let fx = Fixture::new();
        let other_role = fx
            .target
            .seed(EntityKind::Role, fields(json!({"name": "Switch", "slug": "switch"})));
        let switch = fx.target.seed(
            EntityKind::Device,
            fields(json!({
                "name": "sw-1",
                "role": other_role,
                "status": "active",
                "custom_fields": {"zabbix_hostid": "300"}
            })),
        );
        let untagged = fx.target.seed(
            EntityKind::Device,
            fields(json!({"name": "manual", "role": fx.role, "status": "active", "custom_fields": {}})),
        );
        fx.clock.set_last_seen("300", at(0)).await.unwrap();

        fx.manager(LifecycleConfig::default()).run(&HashSet::new(), at(90)).await.unwrap();
        assert_eq!(fx.status(switch), DeviceStatus::Active);
        assert_eq!(fx.status(untagged), DeviceStatus::Active);
    }

    #[tokio::test]
    async fn test_deletion_after_second_threshold() {
        let fx = Fixture::new();
        let id = fx.device("srv-a", "100", "decommissioning");
        fx.target
            .update(
                ObjectRef::new(EntityKind::Device, id),
                fields(json!({"custom_fields": {"decommissioned_at": stamp(at(0))}})),
            )
            .await
            .unwrap();

        let keep = fx.manager(LifecycleConfig::default());
        keep.run(&HashSet::new(), at(60)).await.unwrap();
        assert_eq!(fx.target.objects(EntityKind::Device).len(), 1, "deletion is off by default");

        let delete = fx.manager(LifecycleConfig {
            delete_decommissioned: true,
            ..LifecycleConfig::default()
        });
        delete.run(&HashSet::new(), at(30)).await.unwrap();
        assert_eq!(fx.target.objects(EntityKind::Device).len(), 1);

        let report = delete.run(&HashSet::new(), at(31)).await.unwrap();
        assert_eq!(report.deleted, vec!["srv-a".to_string()]);
        assert!(fx.target.objects(EntityKind::Device).is_empty());
    }

    #[tokio::test]
    async fn test_missing_stamp_is_restamped() {
        let fx = Fixture::new();
        let id = fx.device("srv-a", "100", "decommissioning");

        fx.manager(LifecycleConfig::default())
            .run(&HashSet::new(), at(5))
            .await
            .unwrap();
        assert_eq!(fx.load(id).decommissioned_at(), Some(at(5)));
        assert_eq!(fx.status(id), DeviceStatus::Decommissioning);
    }

    #[tokio::test]
    async fn test_decommission_drops_fingerprint() {
        let fx = Fixture::new();
        fx.device("srv-a", "100", "active");
        let fingerprint = Fingerprint::of(&SourceRecord::new("100", "srv-a"));
        fx.clock.set_fingerprint("100", &fingerprint, u64::MAX).await.unwrap();
        fx.clock.set_last_seen("100", at(0)).await.unwrap();

        let manager = fx.manager(LifecycleConfig::default());
        manager.run(&HashSet::new(), at(30)).await.unwrap();
        assert!(fx.clock.get_fingerprint("100").await.unwrap().is_some());

        manager.run(&HashSet::new(), at(31)).await.unwrap();
        assert!(fx.clock.get_fingerprint("100").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_pass_refreshes_but_never_ages() {
        let fx = Fixture::new();
        let seen = fx.device("srv-a", "100", "active");
        let unseen = fx.device("srv-b", "101", "active");
        fx.clock.set_last_seen("101", at(0)).await.unwrap();

        let report = fx
            .manager(LifecycleConfig::default())
            .partial(true)
            .run(&HashSet::from(["100".to_string()]), at(90))
            .await
            .unwrap();

        assert!(report.decommissioned.is_empty());
        assert_eq!(fx.status(seen), DeviceStatus::Active);
        assert_eq!(fx.status(unseen), DeviceStatus::Active);
        assert_eq!(fx.clock.get_last_seen("100").await.unwrap(), Some(at(90)));
        assert_eq!(fx.clock.get_last_seen("101").await.unwrap(), Some(at(0)));
    }

    #[tokio::test]
    async fn test_dry_run_leaves_clock_alone() {
        let fx = Fixture::new();
        fx.device("srv-a", "100", "active");
        let manager = fx.manager(LifecycleConfig::default()).dry_run(true);

        manager.run(&HashSet::from(["200".to_string()]), at(0)).await.unwrap();
        assert!(fx.clock.get_last_seen("100").await.unwrap().is_none());
        assert!(fx.clock.get_last_seen("200").await.unwrap().is_none());
    }
}
