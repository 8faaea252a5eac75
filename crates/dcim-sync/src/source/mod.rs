//! The monitoring side: the inventory contract and the collector.

pub mod memory;
pub mod zabbix;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::error::{SyncError, SyncResult};
use crate::model::SourceRecord;

/// Errors raised by a [`SourceSystem`].
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("RPC error {code}: {message} {data}")]
    Rpc {
        code: i64,
        message: String,
        data: String,
    },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Source unavailable: {0}")]
    Unavailable(String),
}

/// Template and group based host selection.
///
/// Matching is by substring: a host is admitted when one of its template names
/// contains an included pattern (or no patterns are configured), none contains
/// an excluded template pattern, and none of its group names contains an
/// excluded group pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryFilter {
    #[serde(default = "default_included_templates")]
    pub included_templates: Vec<String>,

    #[serde(default = "default_excluded_templates")]
    pub excluded_templates: Vec<String>,

    #[serde(default = "default_excluded_groups")]
    pub excluded_groups: Vec<String>,
}

fn default_included_templates() -> Vec<String> {
    vec!["VMware Hypervisor".to_string()]
}

fn default_excluded_templates() -> Vec<String> {
    ["Juniper by SNMP", "Template Net SNMP", "Template Module Generic SNMP"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_excluded_groups() -> Vec<String> {
    ["Network", "DataStore", "Virtual machines"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for InventoryFilter {
    fn default() -> Self {
        Self {
            included_templates: default_included_templates(),
            excluded_templates: default_excluded_templates(),
            excluded_groups: default_excluded_groups(),
        }
    }
}

impl InventoryFilter {
    /// Filter that admits every host.
    #[must_use]
    pub const fn allow_all() -> Self {
        Self {
            included_templates: Vec::new(),
            excluded_templates: Vec::new(),
            excluded_groups: Vec::new(),
        }
    }

    /// Whether a host with these templates and groups passes the filter.
    #[must_use]
    pub fn admits<T: AsRef<str>, G: AsRef<str>>(&self, templates: &[T], groups: &[G]) -> bool {
        let contains_any = |names: &[T], patterns: &[String]| {
            names
                .iter()
                .any(|name| patterns.iter().any(|p| name.as_ref().contains(p.as_str())))
        };

        let included = self.included_templates.is_empty()
            || contains_any(templates, &self.included_templates);
        let excluded_template = contains_any(templates, &self.excluded_templates);
        let excluded_group = groups.iter().any(|group| {
            self.excluded_groups
                .iter()
                .any(|p| group.as_ref().contains(p.as_str()))
        });

        included && !excluded_template && !excluded_group
    }
}

/// Read access to the monitoring system's inventory.
#[async_trait]
pub trait SourceSystem: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Active hosts passing `filter`, in source order, at most `limit` of them.
    async fn list_inventory_records(
        &self,
        filter: &InventoryFilter,
        limit: Option<usize>,
    ) -> Result<Vec<SourceRecord>, SourceError>;

    /// Reachability check run before a sync starts.
    async fn check(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Fetches the run's record set.
pub struct Collector {
    source: Arc<dyn SourceSystem>,
    filter: InventoryFilter,
    limit: Option<usize>,
}

impl Collector {
    #[must_use]
    pub fn new(source: Arc<dyn SourceSystem>, filter: InventoryFilter, limit: Option<usize>) -> Self {
        Self {
            source,
            filter,
            limit,
        }
    }

    /// Collect records. Any failure is a hard error for the run.
    ///
    /// # Errors
    /// Returns [`SyncError::Collection`] when the source cannot be read.
    pub async fn collect(&self) -> SyncResult<Vec<SourceRecord>> {
        match self.source.list_inventory_records(&self.filter, self.limit).await {
            Ok(mut records) => {
                if let Some(limit) = self.limit {
                    records.truncate(limit);
                }
                info!(
                    source = self.source.name(),
                    count = records.len(),
                    limit = ?self.limit,
                    "Collected source records"
                );
                Ok(records)
            }
            Err(e) => {
                error!(source = self.source.name(), error = %e, "Source collection failed");
                Err(SyncError::Collection(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::{MemorySource, SourceHost};

    #[test]
    fn test_default_filter() {
        let filter = InventoryFilter::default();
        assert!(filter.admits(&["VMware Hypervisor"], &["Hypervisors"]));
        assert!(filter.admits(&["Template VMware Hypervisor v2"], &["Hypervisors"]));
        assert!(!filter.admits(&["Linux by Zabbix agent"], &["Hypervisors"]));
        assert!(!filter.admits(&["VMware Hypervisor", "Juniper by SNMP"], &["Hypervisors"]));
        assert!(!filter.admits(&["VMware Hypervisor"], &["Virtual machines"]));
    }

    #[test]
    fn test_empty_allow_list_admits_everything_not_denied() {
        let filter = InventoryFilter {
            included_templates: Vec::new(),
            ..InventoryFilter::default()
        };
        assert!(filter.admits::<&str, &str>(&[], &[]));
        assert!(!filter.admits(&["Template Net SNMP"], &["Servers"]));
        assert!(InventoryFilter::allow_all().admits(&["Template Net SNMP"], &["Network"]));
    }

    #[tokio::test]
    async fn test_collector_truncates_in_order() {
        let source = MemorySource::new(
            (1..=5)
                .map(|i| SourceHost::hypervisor(SourceRecord::new(i.to_string(), format!("srv-{i}"))))
                .collect(),
        );
        let collector = Collector::new(Arc::new(source), InventoryFilter::default(), Some(3));

        let records = collector.collect().await.unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_collector_failure_is_hard_error() {
        let collector = Collector::new(
            Arc::new(MemorySource::unavailable()),
            InventoryFilter::default(),
            None,
        );
        let err = collector.collect().await.unwrap_err();
        assert_eq!(err.category(), "collection");
    }
}
