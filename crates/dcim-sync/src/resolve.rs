//! Mapping a source record to its target device.
//!
//! The external id tag is authoritative. Lookup by display name is only a
//! fallback for devices created before tagging existed, and it backfills the
//! tag so the fallback is used at most once per device.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{SyncError, SyncResult};
use crate::model::{Device, SourceRecord};
use crate::target::{EntityKind, Fields, Query, TargetSystem};

/// Identity repair performed while resolving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityEvent {
    Renamed { from: String, to: String },
    /// External id written onto a device found by name.
    Backfilled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Existing {
        device: Device,
        event: Option<IdentityEvent>,
    },
    Absent,
}

pub struct EntityResolver {
    target: Arc<dyn TargetSystem>,
    external_id_field: String,
}

impl EntityResolver {
    #[must_use]
    pub fn new(target: Arc<dyn TargetSystem>, external_id_field: impl Into<String>) -> Self {
        Self {
            target,
            external_id_field: external_id_field.into(),
        }
    }

    /// Find the device for `record`, renaming or backfilling as needed.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when the name belongs to a device
    /// tagged with another external id, and [`SyncError::Remote`] on target failures.
    pub async fn resolve(&self, record: &SourceRecord) -> SyncResult<Resolution> {
        let by_id = Query::new().eq(format!("cf_{}", self.external_id_field), &record.external_id);
        let mut tagged: Vec<Device> = self
            .target
            .list(EntityKind::Device, &by_id)
            .await?
            .iter()
            .map(Device::from_object)
            .collect::<Result<_, _>>()?;

        if !tagged.is_empty() {
            tagged.sort_by_key(|d| d.id);
            if tagged.len() > 1 {
                warn!(
                    external_id = %record.external_id,
                    ids = ?tagged.iter().map(|d| d.id).collect::<Vec<_>>(),
                    "Several devices carry the same external id, using the oldest"
                );
            }
            let mut device = tagged.swap_remove(0);
            let event = if device.name == record.name {
                None
            } else {
                Some(self.rename(&mut device, &record.name).await?)
            };
            return Ok(Resolution::Existing { device, event });
        }

        let Some(object) = self
            .target
            .get(EntityKind::Device, &Query::new().eq("name", &record.name))
            .await?
        else {
            return Ok(Resolution::Absent);
        };
        let mut device = Device::from_object(&object)?;

        if let Some(other) = device.external_id(&self.external_id_field) {
            return Err(SyncError::Validation(format!(
                "device {} already belongs to external id {other}",
                record.name
            )));
        }

        self.backfill(&mut device, &record.external_id).await?;
        Ok(Resolution::Existing {
            device,
            event: Some(IdentityEvent::Backfilled),
        })
    }

    async fn rename(&self, device: &mut Device, name: &str) -> SyncResult<IdentityEvent> {
        let mut patch = Fields::new();
        patch.insert("name".into(), json!(name));
        self.target.update(device.reference(), patch).await?;

        let from = std::mem::replace(&mut device.name, name.to_string());
        device.attributes.insert("name".into(), json!(name));
        info!(id = device.id, from = %from, to = %name, "Renamed device");
        Ok(IdentityEvent::Renamed {
            from,
            to: name.to_string(),
        })
    }

    async fn backfill(&self, device: &mut Device, external_id: &str) -> SyncResult<()> {
        let mut custom = Fields::new();
        custom.insert(self.external_id_field.clone(), json!(external_id));
        let mut patch = Fields::new();
        patch.insert("custom_fields".into(), Value::Object(custom));
        self.target.update(device.reference(), patch).await?;

        device
            .custom_fields
            .insert(self.external_id_field.clone(), json!(external_id));
        info!(id = device.id, name = %device.name, external_id, "Backfilled external id");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::memory::MemoryTarget;

    fn seed(target: &MemoryTarget, fields: Value) -> u64 {
        target.seed(EntityKind::Device, fields.as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn test_absent() {
        let target = Arc::new(MemoryTarget::new());
        let resolver = EntityResolver::new(target, "zabbix_hostid");
        let resolution = resolver.resolve(&SourceRecord::new("100", "srv-a")).await.unwrap();
        assert_eq!(resolution, Resolution::Absent);
    }

    #[tokio::test]
    async fn test_found_by_id_without_changes() {
        let target = Arc::new(MemoryTarget::new());
        seed(&target, json!({"name": "srv-a", "custom_fields": {"zabbix_hostid": "100"}}));
        let resolver = EntityResolver::new(target.clone(), "zabbix_hostid");

        let Resolution::Existing { device, event } =
            resolver.resolve(&SourceRecord::new("100", "srv-a")).await.unwrap()
        else {
            panic!("expected a device");
        };
        assert_eq!(device.name, "srv-a");
        assert!(event.is_none());
        assert_eq!(target.calls().updates, 0);
    }

    #[tokio::test]
    async fn test_rename_keeps_identity() {
        let target = Arc::new(MemoryTarget::new());
        let id = seed(&target, json!({"name": "srv-old", "custom_fields": {"zabbix_hostid": "100"}}));
        let resolver = EntityResolver::new(target.clone(), "zabbix_hostid");

        let Resolution::Existing { device, event } =
            resolver.resolve(&SourceRecord::new("100", "srv-new")).await.unwrap()
        else {
            panic!("expected a device");
        };
        assert_eq!(device.id, id);
        assert_eq!(device.name, "srv-new");
        assert_eq!(
            event,
            Some(IdentityEvent::Renamed {
                from: "srv-old".into(),
                to: "srv-new".into()
            })
        );
        assert_eq!(target.objects(EntityKind::Device).len(), 1);
        assert_eq!(target.objects(EntityKind::Device)[0].name(), Some("srv-new"));
    }

    #[tokio::test]
    async fn test_name_fallback_backfills_id() {
        let target = Arc::new(MemoryTarget::new());
        seed(&target, json!({"name": "srv-a", "custom_fields": {}}));
        let resolver = EntityResolver::new(target.clone(), "zabbix_hostid");

        let Resolution::Existing { device, event } =
            resolver.resolve(&SourceRecord::new("100", "srv-a")).await.unwrap()
        else {
            panic!("expected a device");
        };
        assert_eq!(event, Some(IdentityEvent::Backfilled));
        assert_eq!(device.external_id("zabbix_hostid").as_deref(), Some("100"));

        // The next lookup goes by id.
        let again = resolver.resolve(&SourceRecord::new("100", "srv-a")).await.unwrap();
        assert!(matches!(again, Resolution::Existing { event: None, .. }));
    }

    #[tokio::test]
    async fn test_name_held_by_other_id_is_rejected() {
        let target = Arc::new(MemoryTarget::new());
        seed(&target, json!({"name": "srv-a", "custom_fields": {"zabbix_hostid": "999"}}));
        let resolver = EntityResolver::new(target, "zabbix_hostid");

        let err = resolver.resolve(&SourceRecord::new("100", "srv-a")).await.unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[tokio::test]
    async fn test_duplicate_ids_pick_oldest() {
        let target = Arc::new(MemoryTarget::new());
        let first = seed(&target, json!({"name": "srv-a", "custom_fields": {"zabbix_hostid": "100"}}));
        seed(&target, json!({"name": "srv-a-dup", "custom_fields": {"zabbix_hostid": "100"}}));
        let resolver = EntityResolver::new(target, "zabbix_hostid");

        let Resolution::Existing { device, .. } =
            resolver.resolve(&SourceRecord::new("100", "srv-a")).await.unwrap()
        else {
            panic!("expected a device");
        };
        assert_eq!(device.id, first);
    }
}
