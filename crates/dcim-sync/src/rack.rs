//! Rack position arbitration.
//!
//! A position already held by a different device is never taken over. The
//! device being synced is placed without rack and position instead, and the
//! conflict is reported.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::dependents::RackRef;
use crate::error::{SyncError, SyncResult};
use crate::model::Device;
use crate::target::{EntityKind, Query, TargetSystem};

/// A refused rack assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RackConflict {
    pub device: String,
    pub rack: String,
    pub position: u32,
    pub occupant: String,
}

impl From<&RackConflict> for SyncError {
    fn from(conflict: &RackConflict) -> Self {
        Self::Conflict {
            rack: conflict.rack.clone(),
            position: conflict.position,
            occupant: conflict.occupant.clone(),
        }
    }
}

/// Outcome of arbitration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Assigned { rack: u64, position: u32 },
    /// Rack without a position, or no rack at all.
    Unplaced { rack: Option<u64> },
    Conflict(RackConflict),
}

pub struct RackArbiter {
    target: Arc<dyn TargetSystem>,
    check_conflicts: bool,
    external_id_field: String,
}

impl RackArbiter {
    #[must_use]
    pub fn new(target: Arc<dyn TargetSystem>, check_conflicts: bool, external_id_field: impl Into<String>) -> Self {
        Self {
            target,
            check_conflicts,
            external_id_field: external_id_field.into(),
        }
    }

    /// Decide where `device_name` may sit.
    ///
    /// `current` is the device's existing target entity, if any; it never
    /// conflicts with itself.
    ///
    /// # Errors
    /// Returns [`SyncError::Remote`] when occupants cannot be listed.
    pub async fn arbitrate(
        &self,
        device_name: &str,
        external_id: &str,
        rack: Option<&RackRef>,
        position: Option<u32>,
        current: Option<&Device>,
    ) -> SyncResult<Placement> {
        let Some(rack) = rack else {
            return Ok(Placement::Unplaced { rack: None });
        };
        let Some(position) = position else {
            return Ok(Placement::Unplaced { rack: Some(rack.id) });
        };
        if !self.check_conflicts {
            return Ok(Placement::Assigned { rack: rack.id, position });
        }

        let occupants = self
            .target
            .list(
                EntityKind::Device,
                &Query::new().eq("rack_id", rack.id).eq("position", position),
            )
            .await?;

        let occupant = occupants
            .iter()
            .filter(|o| current.map_or(true, |d| d.id != o.id))
            .filter_map(|o| Device::from_object(o).ok())
            .find(|o| o.external_id(&self.external_id_field).as_deref() != Some(external_id));

        match occupant {
            Some(occupant) => {
                let conflict = RackConflict {
                    device: device_name.to_string(),
                    rack: rack.name.clone(),
                    position,
                    occupant: occupant.name,
                };
                warn!(
                    device = %conflict.device,
                    rack = %conflict.rack,
                    position,
                    occupant = %conflict.occupant,
                    "Rack position taken, syncing without placement"
                );
                Ok(Placement::Conflict(conflict))
            }
            None => Ok(Placement::Assigned { rack: rack.id, position }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::memory::MemoryTarget;
    use serde_json::json;

    fn rack() -> RackRef {
        RackRef {
            id: 50,
            name: "R12".into(),
        }
    }

    fn seed_device(target: &MemoryTarget, name: &str, external_id: &str, position: u32) -> u64 {
        target.seed(
            EntityKind::Device,
            json!({
                "name": name,
                "rack": 50,
                "position": position,
                "custom_fields": {"zabbix_hostid": external_id}
            })
            .as_object()
            .cloned()
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_free_position_is_assigned() {
        let target = Arc::new(MemoryTarget::new());
        seed_device(&target, "srv-b", "200", 8);
        let arbiter = RackArbiter::new(target, true, "zabbix_hostid");

        let placement = arbiter
            .arbitrate("srv-a", "100", Some(&rack()), Some(7), None)
            .await
            .unwrap();
        assert_eq!(placement, Placement::Assigned { rack: 50, position: 7 });
    }

    #[tokio::test]
    async fn test_taken_position_conflicts() {
        let target = Arc::new(MemoryTarget::new());
        seed_device(&target, "srv-b", "200", 7);
        let arbiter = RackArbiter::new(target, true, "zabbix_hostid");

        let placement = arbiter
            .arbitrate("srv-a", "100", Some(&rack()), Some(7), None)
            .await
            .unwrap();
        let Placement::Conflict(conflict) = placement else {
            panic!("expected conflict, got {placement:?}");
        };
        assert_eq!(conflict.occupant, "srv-b");
        assert_eq!(SyncError::from(&conflict).category(), "conflict");
    }

    #[tokio::test]
    async fn test_device_does_not_conflict_with_itself() {
        let target = Arc::new(MemoryTarget::new());
        let id = seed_device(&target, "srv-a", "100", 7);
        let current = Device::from_object(
            &target
                .object(crate::target::ObjectRef::new(EntityKind::Device, id))
                .unwrap(),
        )
        .unwrap();
        let arbiter = RackArbiter::new(target, true, "zabbix_hostid");

        let placement = arbiter
            .arbitrate("srv-a", "100", Some(&rack()), Some(7), Some(&current))
            .await
            .unwrap();
        assert_eq!(placement, Placement::Assigned { rack: 50, position: 7 });
    }

    #[tokio::test]
    async fn test_check_disabled_or_no_position() {
        let target = Arc::new(MemoryTarget::new());
        seed_device(&target, "srv-b", "200", 7);

        let unchecked = RackArbiter::new(target.clone(), false, "zabbix_hostid");
        assert_eq!(
            unchecked
                .arbitrate("srv-a", "100", Some(&rack()), Some(7), None)
                .await
                .unwrap(),
            Placement::Assigned { rack: 50, position: 7 }
        );

        let checked = RackArbiter::new(target, true, "zabbix_hostid");
        assert_eq!(
            checked.arbitrate("srv-a", "100", Some(&rack()), None, None).await.unwrap(),
            Placement::Unplaced { rack: Some(50) }
        );
        assert_eq!(
            checked.arbitrate("srv-a", "100", None, Some(7), None).await.unwrap(),
            Placement::Unplaced { rack: None }
        );
    }
}
