//! Fixture source for tests and offline runs.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{InventoryFilter, SourceError, SourceSystem};
use crate::model::SourceRecord;

/// A source host with its template and group memberships.
#[derive(Debug, Clone)]
pub struct SourceHost {
    pub record: SourceRecord,
    pub templates: Vec<String>,
    pub groups: Vec<String>,
}

impl SourceHost {
    /// Host linked to the default hypervisor template.
    #[must_use]
    pub fn hypervisor(record: SourceRecord) -> Self {
        Self {
            record,
            templates: vec!["VMware Hypervisor".to_string()],
            groups: vec!["Hypervisors".to_string()],
        }
    }
}

/// Source serving a fixed, replaceable host list.
pub struct MemorySource {
    hosts: Mutex<Option<Vec<SourceHost>>>,
}

impl MemorySource {
    #[must_use]
    pub fn new(hosts: Vec<SourceHost>) -> Self {
        Self {
            hosts: Mutex::new(Some(hosts)),
        }
    }

    /// Source whose every fetch fails.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            hosts: Mutex::new(None),
        }
    }

    /// Replace the served hosts, as if the monitoring system changed.
    pub fn set_hosts(&self, hosts: Vec<SourceHost>) {
        *self.hosts.lock().unwrap_or_else(PoisonError::into_inner) = Some(hosts);
    }
}

#[async_trait]
impl SourceSystem for MemorySource {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list_inventory_records(
        &self,
        filter: &InventoryFilter,
        limit: Option<usize>,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        let hosts = hosts
            .as_ref()
            .ok_or_else(|| SourceError::Unavailable("memory source offline".into()))?;

        Ok(hosts
            .iter()
            .filter(|host| filter.admits(host.templates.as_slice(), host.groups.as_slice()))
            .take(limit.unwrap_or(usize::MAX))
            .map(|host| host.record.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_filters_hosts() {
        let mut switch = SourceHost::hypervisor(SourceRecord::new("2", "sw-1"));
        switch.groups = vec!["Network".into()];
        let source = MemorySource::new(vec![
            SourceHost::hypervisor(SourceRecord::new("1", "srv-a")),
            switch,
        ]);

        let records = source
            .list_inventory_records(&InventoryFilter::default(), None)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "srv-a");
    }
}
