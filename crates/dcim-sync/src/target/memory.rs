//! In-process target used by tests and local dry runs.
//!
//! Filters follow the REST adapter's vocabulary so the engine cannot tell
//! the two apart: `<reference>_id` compares the referenced id, `cf_<name>`
//! compares a custom field, `address` compares the host part only.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{EntityKind, Fields, ObjectRef, Query, RemoteObject, TargetError, TargetSystem};
use crate::model::value_text;
use crate::normalize::host_part;

/// Write operation kinds, used for call counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    List,
    Create,
    Update,
    Delete,
}

/// Number of write calls received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl CallCounts {
    #[must_use]
    pub const fn writes(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<(EntityKind, u64), Fields>,
    next_id: u64,
    calls: CallCounts,
    updates_by_kind: BTreeMap<EntityKind, usize>,
    faults: Vec<(Operation, EntityKind)>,
}

impl State {
    fn take_fault(&mut self, op: Operation, kind: EntityKind) -> Result<(), TargetError> {
        if let Some(index) = self.faults.iter().position(|f| *f == (op, kind)) {
            self.faults.remove(index);
            return Err(TargetError::Fault(format!("{op:?} {kind}")));
        }
        Ok(())
    }
}

/// Target backed by a map of objects.
#[derive(Default)]
pub struct MemoryTarget {
    state: Mutex<State>,
}

impl MemoryTarget {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1,
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an object directly, bypassing call counting. Returns its id.
    pub fn seed(&self, kind: EntityKind, fields: Fields) -> u64 {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.objects.insert((kind, id), fields);
        id
    }

    /// Every stored object of `kind`, ordered by id.
    #[must_use]
    pub fn objects(&self, kind: EntityKind) -> Vec<RemoteObject> {
        self.lock()
            .objects
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((k, id), fields)| RemoteObject::new(*k, *id, fields.clone()))
            .collect()
    }

    #[must_use]
    pub fn object(&self, target: ObjectRef) -> Option<RemoteObject> {
        self.lock()
            .objects
            .get(&(target.kind, target.id))
            .map(|fields| RemoteObject::new(target.kind, target.id, fields.clone()))
    }

    #[must_use]
    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Update calls received for one entity kind.
    #[must_use]
    pub fn updates_of(&self, kind: EntityKind) -> usize {
        self.lock().updates_by_kind.get(&kind).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        let mut state = self.lock();
        state.calls = CallCounts::default();
        state.updates_by_kind.clear();
    }

    /// Fail the next `op` on `kind` with [`TargetError::Fault`].
    pub fn fail_next(&self, op: Operation, kind: EntityKind) {
        self.lock().faults.push((op, kind));
    }
}

fn field_matches(fields: &Fields, key: &str, expected: &str) -> bool {
    if let Some(custom) = key.strip_prefix("cf_") {
        return fields
            .get("custom_fields")
            .and_then(|cf| cf.get(custom))
            .is_some_and(|v| value_text(v) == expected);
    }
    if key == "address" {
        return fields
            .get("address")
            .is_some_and(|v| host_part(&value_text(v)) == host_part(expected));
    }
    if let Some(reference) = key.strip_suffix("_id") {
        let candidates = match reference {
            "interface" => vec!["assigned_object_id"],
            "role" => vec!["role", "device_role"],
            other => vec![other],
        };
        return candidates
            .into_iter()
            .filter_map(|name| fields.get(name))
            .any(|v| value_text(v) == expected);
    }
    fields.get(key).is_some_and(|v| value_text(v) == expected)
}

#[async_trait]
impl TargetSystem for MemoryTarget {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list(&self, kind: EntityKind, query: &Query) -> Result<Vec<RemoteObject>, TargetError> {
        let mut state = self.lock();
        state.take_fault(Operation::List, kind)?;
        Ok(state
            .objects
            .iter()
            .filter(|((k, id), fields)| {
                *k == kind
                    && query.params().iter().all(|(key, value)| {
                        if key == "id" {
                            id.to_string() == *value
                        } else {
                            field_matches(fields, key, value)
                        }
                    })
            })
            .map(|((k, id), fields)| RemoteObject::new(*k, *id, fields.clone()))
            .collect())
    }

    async fn create(&self, kind: EntityKind, fields: Fields) -> Result<RemoteObject, TargetError> {
        let mut state = self.lock();
        state.take_fault(Operation::Create, kind)?;
        let id = state.next_id;
        state.next_id += 1;
        state.calls.creates += 1;
        state.objects.insert((kind, id), fields.clone());
        debug!(kind = %kind, id, "Created object");
        Ok(RemoteObject::new(kind, id, fields))
    }

    async fn update(&self, target: ObjectRef, fields: Fields) -> Result<(), TargetError> {
        let mut state = self.lock();
        state.take_fault(Operation::Update, target.kind)?;
        state.calls.updates += 1;
        *state.updates_by_kind.entry(target.kind).or_default() += 1;

        let current = state
            .objects
            .get_mut(&(target.kind, target.id))
            .ok_or_else(|| TargetError::NotFound(target.to_string()))?;

        for (key, value) in fields {
            if key == "custom_fields" {
                if let (Some(Value::Object(existing)), Value::Object(patch)) =
                    (current.get_mut("custom_fields"), &value)
                {
                    existing.extend(patch.clone());
                    continue;
                }
            }
            current.insert(key, value);
        }
        Ok(())
    }

    async fn delete(&self, target: ObjectRef) -> Result<(), TargetError> {
        let mut state = self.lock();
        state.take_fault(Operation::Delete, target.kind)?;
        state.calls.deletes += 1;
        state
            .objects
            .remove(&(target.kind, target.id))
            .ok_or_else(|| TargetError::NotFound(target.to_string()))?;

        // Interfaces go with their device.
        if target.kind == EntityKind::Device {
            let device = target.id.to_string();
            state.objects.retain(|(kind, _), fields| {
                *kind != EntityKind::Interface
                    || !fields.get("device").is_some_and(|v| value_text(v) == device)
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_filters() {
        let target = MemoryTarget::new();
        target.seed(
            EntityKind::Device,
            fields(json!({
                "name": "srv-a",
                "rack": {"id": 4},
                "position": 12.0,
                "role": 2,
                "custom_fields": {"zabbix_hostid": "100"}
            })),
        );
        target.seed(EntityKind::Device, fields(json!({"name": "srv-b", "rack": 5})));

        let by_cf = Query::new().eq("cf_zabbix_hostid", "100");
        assert_eq!(target.list(EntityKind::Device, &by_cf).await.unwrap().len(), 1);

        let by_slot = Query::new().eq("rack_id", 4).eq("position", 12);
        assert_eq!(target.list(EntityKind::Device, &by_slot).await.unwrap().len(), 1);

        let by_role = Query::new().eq("role_id", 2);
        assert_eq!(target.list(EntityKind::Device, &by_role).await.unwrap().len(), 1);

        let nothing = Query::new().eq("name", "srv-c");
        assert!(target.get(EntityKind::Device, &nothing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_address_filter_ignores_prefix_length() {
        let target = MemoryTarget::new();
        target.seed(EntityKind::IpAddress, fields(json!({"address": "10.11.5.5/32"})));
        let query = Query::new().eq("address", "10.11.5.5");
        assert_eq!(target.list(EntityKind::IpAddress, &query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_merges_custom_fields() {
        let target = MemoryTarget::new();
        let id = target.seed(
            EntityKind::Device,
            fields(json!({"name": "srv-a", "custom_fields": {"a": "1", "b": "2"}})),
        );
        let device = ObjectRef::new(EntityKind::Device, id);
        target
            .update(device, fields(json!({"custom_fields": {"b": "3"}})))
            .await
            .unwrap();

        let stored = target.object(device).unwrap();
        assert_eq!(stored.fields["custom_fields"], json!({"a": "1", "b": "3"}));
        assert_eq!(target.calls().updates, 1);
        assert_eq!(target.updates_of(EntityKind::Device), 1);
    }

    #[tokio::test]
    async fn test_fault_injection_fires_once() {
        let target = MemoryTarget::new();
        target.fail_next(Operation::Create, EntityKind::IpAddress);

        let first = target.create(EntityKind::IpAddress, Fields::new()).await;
        assert!(matches!(first, Err(TargetError::Fault(_))));
        assert!(target.create(EntityKind::IpAddress, Fields::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_device_delete_cascades_interfaces() {
        let target = MemoryTarget::new();
        let device = target.seed(EntityKind::Device, fields(json!({"name": "srv-a"})));
        target.seed(EntityKind::Interface, fields(json!({"name": "mgmt0", "device": device})));

        target
            .delete(ObjectRef::new(EntityKind::Device, device))
            .await
            .unwrap();
        assert!(target.objects(EntityKind::Interface).is_empty());
    }
}
