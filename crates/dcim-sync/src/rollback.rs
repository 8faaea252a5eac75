//! Compensation for a device pipeline that failed halfway.

use std::sync::Arc;

use tracing::{info, warn};

use crate::target::{EntityKind, ObjectRef, Query, TargetSystem};

/// Objects created for one device during this run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackLedger {
    /// Set only when the device itself was created this run.
    device: Option<(u64, String)>,
    interface: Option<u64>,
    address: Option<u64>,
}

impl RollbackLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created_device(&mut self, id: u64, name: impl Into<String>) {
        self.device = Some((id, name.into()));
    }

    pub fn created_interface(&mut self, id: u64) {
        self.interface = Some(id);
    }

    pub fn created_address(&mut self, id: u64) {
        self.address = Some(id);
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.device.is_none() && self.interface.is_none() && self.address.is_none()
    }
}

pub struct RollbackCoordinator {
    target: Arc<dyn TargetSystem>,
}

impl RollbackCoordinator {
    #[must_use]
    pub fn new(target: Arc<dyn TargetSystem>) -> Self {
        Self { target }
    }

    /// Undo the ledger in reverse creation order. Never fails.
    ///
    /// The device is only deleted when it is the sole device carrying its
    /// name, so an unrelated object with the same name is never touched.
    pub async fn compensate(&self, ledger: RollbackLedger) {
        let mut undone = Vec::new();

        if let Some(id) = ledger.address {
            if self.remove(ObjectRef::new(EntityKind::IpAddress, id)).await {
                undone.push(format!("address #{id}"));
            }
        }
        if let Some(id) = ledger.interface {
            if self.remove(ObjectRef::new(EntityKind::Interface, id)).await {
                undone.push(format!("interface #{id}"));
            }
        }
        if let Some((id, name)) = ledger.device {
            match self
                .target
                .list(EntityKind::Device, &Query::new().eq("name", &name))
                .await
            {
                Ok(same_name) if same_name.len() == 1 && same_name[0].id == id => {
                    if self.remove(ObjectRef::new(EntityKind::Device, id)).await {
                        undone.push(format!("device {name}"));
                    }
                }
                Ok(same_name) => {
                    warn!(
                        device = %name,
                        matches = same_name.len(),
                        "Device name is not unique, leaving device in place"
                    );
                }
                Err(e) => {
                    warn!(device = %name, error = %e, "Rollback lookup failed");
                }
            }
        }

        if !undone.is_empty() {
            info!(undone = ?undone, "Rollback completed");
        }
    }

    async fn remove(&self, target: ObjectRef) -> bool {
        match self.target.delete(target).await {
            Ok(()) => true,
            Err(e) => {
                warn!(target = %target, error = %e, "Rollback delete failed");
                false
            }
        }
    }
}
