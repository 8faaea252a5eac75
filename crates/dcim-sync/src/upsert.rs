//! Desired state and device writes.
//!
//! The engine builds the full attribute set a device should have, drops every
//! protected name, and writes only what differs from the current device. The
//! management interface and primary address are reconciled on every call.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::{FieldPolicy, NetworkConfig, StaleAddressPolicy};
use crate::dependents::Dependencies;
use crate::error::SyncResult;
use crate::model::{cf, value_text, Device, DeviceStatus, FieldChange, SourceRecord, SourceStatus};
use crate::normalize::{host_part, non_empty, normalize_memory};
use crate::rack::Placement;
use crate::rollback::RollbackLedger;
use crate::target::{EntityKind, Fields, Query, RemoteObject, TargetSystem};

/// What a single upsert did to the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created { id: u64 },
    Updated { changes: Vec<FieldChange> },
    /// A decommissioning device came back.
    Recovered { changes: Vec<FieldChange> },
    Unchanged,
}

/// Attributes a device should carry, after protection filtering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredState {
    pub fields: Fields,
    pub custom_fields: Fields,
}

pub struct UpsertEngine {
    target: Arc<dyn TargetSystem>,
    policy: FieldPolicy,
    network: NetworkConfig,
}

impl UpsertEngine {
    #[must_use]
    pub fn new(target: Arc<dyn TargetSystem>, policy: FieldPolicy, network: NetworkConfig) -> Self {
        Self {
            target,
            policy,
            network,
        }
    }

    /// Full desired attribute set for `record`.
    #[must_use]
    pub fn desired_state(&self, record: &SourceRecord, deps: &Dependencies, placement: &Placement) -> DesiredState {
        let inventory = record.inventory();
        let mut fields = Fields::new();
        fields.insert("name".into(), json!(record.name));
        fields.insert("device_type".into(), json!(deps.device_type_id));
        fields.insert("role".into(), json!(deps.role_id));
        fields.insert("site".into(), json!(deps.site_id));
        if let Some(location) = deps.location_id {
            fields.insert("location".into(), json!(location));
        }
        fields.insert("platform".into(), json!(deps.platform_id));
        fields.insert("status".into(), json!(device_status(record.status).as_str()));
        if let Some(serial) = non_empty(inventory.serial.as_deref()) {
            fields.insert("serial".into(), json!(serial));
        }
        if let Some(tag) = non_empty(inventory.asset_tag.as_deref()) {
            fields.insert("asset_tag".into(), json!(tag));
        }

        match placement {
            Placement::Assigned { rack, position } => {
                fields.insert("rack".into(), json!(rack));
                fields.insert("position".into(), json!(position));
                fields.insert("face".into(), json!("front"));
            }
            Placement::Unplaced { rack: Some(rack) } => {
                fields.insert("rack".into(), json!(rack));
                fields.insert("position".into(), Value::Null);
                fields.insert("face".into(), Value::Null);
            }
            Placement::Unplaced { rack: None } => {}
            Placement::Conflict(_) => {
                fields.insert("rack".into(), Value::Null);
                fields.insert("position".into(), Value::Null);
                fields.insert("face".into(), Value::Null);
            }
        }

        let mut custom_fields = Fields::new();
        let memory = inventory
            .memory
            .as_deref()
            .and_then(normalize_memory)
            .map(|gb| gb.to_string());
        let texts = [
            (cf::CPU_MODEL, inventory.cpu.as_deref()),
            (cf::MEMORY_SIZE, memory.as_deref()),
            (cf::OS_NAME, inventory.os_name.as_deref()),
            (cf::OS_VERSION, inventory.os_version.as_deref()),
            (cf::CLUSTER, inventory.cluster.as_deref()),
            (cf::RACK_LOCATION, inventory.location.as_deref()),
            (cf::RACK_NAME, inventory.rack_name.as_deref()),
            (cf::RACK_UNIT, inventory.rack_unit.as_deref()),
        ];
        for (name, value) in texts {
            if let Some(value) = non_empty(value) {
                custom_fields.insert(name.into(), json!(value));
            }
        }
        custom_fields.insert(self.policy.external_id_field.clone(), json!(record.external_id));

        fields.retain(|name, _| !self.policy.is_protected(name));
        custom_fields.retain(|name, _| !self.policy.is_protected(name));
        DesiredState { fields, custom_fields }
    }

    /// Create or update the device for `record` and reconcile its primary address.
    ///
    /// Everything created is recorded in `ledger` so a caller can compensate
    /// when a later step fails.
    ///
    /// # Errors
    /// Returns [`crate::SyncError::Remote`] when any target call fails.
    pub async fn upsert(
        &self,
        record: &SourceRecord,
        existing: Option<&Device>,
        deps: &Dependencies,
        placement: &Placement,
        ledger: &mut RollbackLedger,
        now: DateTime<Utc>,
    ) -> SyncResult<UpsertOutcome> {
        let desired = self.desired_state(record, deps, placement);
        match existing {
            None => self.create(record, desired, ledger, now).await,
            Some(device) => self.update(record, device, desired, ledger, now).await,
        }
    }

    async fn create(
        &self,
        record: &SourceRecord,
        desired: DesiredState,
        ledger: &mut RollbackLedger,
        now: DateTime<Utc>,
    ) -> SyncResult<UpsertOutcome> {
        let DesiredState {
            mut fields,
            mut custom_fields,
        } = desired;
        self.stamp(&mut custom_fields, now);
        fields.insert("custom_fields".into(), Value::Object(custom_fields));

        let object = self.target.create(EntityKind::Device, fields).await?;
        ledger.created_device(object.id, &record.name);
        info!(id = object.id, name = %record.name, "Created device");

        let device = Device::from_object(&object)?;
        self.sync_primary_address(record, &device, ledger).await?;
        Ok(UpsertOutcome::Created { id: object.id })
    }

    async fn update(
        &self,
        record: &SourceRecord,
        device: &Device,
        desired: DesiredState,
        ledger: &mut RollbackLedger,
        now: DateTime<Utc>,
    ) -> SyncResult<UpsertOutcome> {
        let mut changes = Vec::new();

        let mut patch = Fields::new();
        for (name, value) in desired.fields {
            let (current, wanted) = (device.field_text(&name), value_text(&value));
            if current != wanted {
                changes.push(FieldChange::new(name.as_str(), current, wanted));
                patch.insert(name, value);
            }
        }

        let mut custom = Fields::new();
        for (name, value) in desired.custom_fields {
            let (current, wanted) = (device.custom_field_text(&name), value_text(&value));
            if current != wanted {
                changes.push(FieldChange::new(name.as_str(), current, wanted));
                custom.insert(name, value);
            }
        }

        let recovering = device.status == DeviceStatus::Decommissioning && patch.contains_key("status");
        if recovering
            && !self.policy.is_protected(cf::DECOMMISSIONED_AT)
            && device.custom_field(cf::DECOMMISSIONED_AT).is_some()
        {
            changes.push(FieldChange::new(
                cf::DECOMMISSIONED_AT,
                device.custom_field_text(cf::DECOMMISSIONED_AT),
                "",
            ));
            custom.insert(cf::DECOMMISSIONED_AT.into(), Value::Null);
        }

        if !patch.is_empty() || !custom.is_empty() {
            self.stamp(&mut custom, now);
            patch.insert("custom_fields".into(), Value::Object(custom));
            self.target.update(device.reference(), patch).await?;
            debug!(id = device.id, name = %device.name, changes = changes.len(), "Updated device");
        }

        if let Some(change) = self.sync_primary_address(record, device, ledger).await? {
            changes.push(change);
        }

        Ok(if changes.is_empty() {
            UpsertOutcome::Unchanged
        } else if recovering {
            info!(id = device.id, name = %device.name, "Device recovered from decommissioning");
            UpsertOutcome::Recovered { changes }
        } else {
            UpsertOutcome::Updated { changes }
        })
    }

    fn stamp(&self, custom: &mut Fields, now: DateTime<Utc>) {
        if !self.policy.is_protected(cf::LAST_SYNC) {
            custom.insert(
                cf::LAST_SYNC.into(),
                json!(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        }
    }

    /// Point the device's primary address at the source's primary address.
    ///
    /// Returns the change when the address moved. Nothing is written when the
    /// current primary already matches or the source has no usable address.
    async fn sync_primary_address(
        &self,
        record: &SourceRecord,
        device: &Device,
        ledger: &mut RollbackLedger,
    ) -> SyncResult<Option<FieldChange>> {
        let Some(address) = record.primary_address() else {
            return Ok(None);
        };

        let current = match device.primary_ip4 {
            Some(id) => {
                self.target
                    .get(EntityKind::IpAddress, &Query::new().eq("id", id))
                    .await?
            }
            None => None,
        };
        let current_host = current
            .as_ref()
            .and_then(|ip| ip.str_field("address"))
            .map(|a| host_part(a).to_string());
        if current_host.as_deref() == Some(address) {
            return Ok(None);
        }

        let interface = self.ensure_interface(device, ledger).await?;
        let ip = self.ensure_address(address, interface, &device.name, ledger).await?;

        let mut patch = Fields::new();
        patch.insert("primary_ip4".into(), json!(ip));
        self.target.update(device.reference(), patch).await?;
        info!(
            id = device.id,
            name = %device.name,
            from = current_host.as_deref().unwrap_or("none"),
            to = address,
            "Primary address assigned"
        );

        if let Some(old) = current.filter(|old| old.id != ip) {
            self.retire(&old).await;
        }
        Ok(Some(FieldChange::new(
            "primary_ip4",
            current_host.unwrap_or_default(),
            address,
        )))
    }

    async fn ensure_interface(&self, device: &Device, ledger: &mut RollbackLedger) -> SyncResult<u64> {
        let query = Query::new()
            .eq("device_id", device.id)
            .eq("name", &self.network.interface_name);
        if let Some(existing) = self.target.get(EntityKind::Interface, &query).await? {
            return Ok(existing.id);
        }

        let fields = object_fields(json!({
            "device": device.id,
            "name": self.network.interface_name,
            "type": self.network.interface_type,
            "enabled": true,
            "description": "Management interface",
        }));
        let created = self.target.create(EntityKind::Interface, fields).await?;
        ledger.created_interface(created.id);
        debug!(device = %device.name, id = created.id, "Created management interface");
        Ok(created.id)
    }

    async fn ensure_address(
        &self,
        address: &str,
        interface: u64,
        device_name: &str,
        ledger: &mut RollbackLedger,
    ) -> SyncResult<u64> {
        if let Some(existing) = self
            .target
            .get(EntityKind::IpAddress, &Query::new().eq("address", address))
            .await?
        {
            if existing.ref_id("assigned_object_id") != Some(interface) {
                let patch = object_fields(json!({
                    "assigned_object_type": "dcim.interface",
                    "assigned_object_id": interface,
                }));
                self.target.update(existing.reference(), patch).await?;
                debug!(address, interface, "Reassigned address");
            }
            return Ok(existing.id);
        }

        let fields = object_fields(json!({
            "address": format!("{address}/32"),
            "status": "active",
            "assigned_object_type": "dcim.interface",
            "assigned_object_id": interface,
            "description": format!("Primary IP for {device_name}"),
        }));
        let created = self.target.create(EntityKind::IpAddress, fields).await?;
        ledger.created_address(created.id);
        Ok(created.id)
    }

    /// Apply the stale address policy. Failures only warn.
    async fn retire(&self, old: &RemoteObject) {
        let reference = old.reference();
        let result = match self.network.stale_address {
            StaleAddressPolicy::Keep => return,
            StaleAddressPolicy::Deprecate => {
                self.target
                    .update(reference, object_fields(json!({"status": "deprecated"})))
                    .await
            }
            StaleAddressPolicy::Delete => self.target.delete(reference).await,
        };
        match result {
            Ok(()) => info!(
                address = old.str_field("address").unwrap_or_default(),
                policy = ?self.network.stale_address,
                "Retired previous primary address"
            ),
            Err(e) => warn!(target = %reference, error = %e, "Failed to retire previous address"),
        }
    }
}

const fn device_status(status: SourceStatus) -> DeviceStatus {
    match status {
        SourceStatus::Active => DeviceStatus::Active,
        SourceStatus::Inactive => DeviceStatus::Offline,
    }
}

fn object_fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}
