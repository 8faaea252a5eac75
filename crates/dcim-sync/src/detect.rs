//! Change detection against the fingerprint cache.
//!
//! Unchanged records are refreshed immediately so their TTL keeps rolling.
//! New and changed records are only committed once the caller has written
//! them to the target; a failed write leaves the old entry in place and the
//! record is retried on the next run.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::fingerprint::{diff_snapshots, Fingerprint, FingerprintStore};
use crate::model::{FieldChange, SourceRecord};

/// Classification of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    New,
    /// Differs from the cached fingerprint. `changes` is empty when no
    /// snapshot was cached or the cache could not be read.
    Changed { changes: Vec<FieldChange> },
    Unchanged,
}

/// Classification plus the fingerprint to commit after a successful write.
#[derive(Debug, Clone)]
pub struct Detection {
    pub kind: ChangeKind,
    pub fingerprint: Fingerprint,
}

impl Detection {
    #[must_use]
    pub fn needs_sync(&self) -> bool {
        !matches!(self.kind, ChangeKind::Unchanged)
    }
}

pub struct ChangeDetector {
    store: Arc<dyn FingerprintStore>,
    ttl_secs: u64,
    read_only: bool,
}

impl ChangeDetector {
    #[must_use]
    pub fn new(store: Arc<dyn FingerprintStore>, ttl_secs: u64) -> Self {
        Self {
            store,
            ttl_secs,
            read_only: false,
        }
    }

    /// Never write to the store (dry runs).
    #[must_use]
    pub const fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Classify a record. Cache failures classify it as changed.
    pub async fn classify(&self, record: &SourceRecord) -> Detection {
        let fingerprint = Fingerprint::of(record);

        let kind = match self.store.get_fingerprint(&record.external_id).await {
            Ok(None) => ChangeKind::New,
            Ok(Some(cached)) if cached.hash == fingerprint.hash => ChangeKind::Unchanged,
            Ok(Some(cached)) => ChangeKind::Changed {
                changes: diff_snapshots(&cached.snapshot, &fingerprint.snapshot),
            },
            Err(e) => {
                warn!(
                    external_id = %record.external_id,
                    error = %e,
                    "Fingerprint lookup failed, treating record as changed"
                );
                ChangeKind::Changed { changes: Vec::new() }
            }
        };

        debug!(external_id = %record.external_id, kind = ?kind, "Classified record");

        let detection = Detection { kind, fingerprint };
        if detection.kind == ChangeKind::Unchanged {
            self.commit(&record.external_id, &detection).await;
        }
        detection
    }

    /// Store the record's fingerprint with a fresh TTL. Failures only warn.
    pub async fn commit(&self, external_id: &str, detection: &Detection) {
        if self.read_only {
            return;
        }
        if let Err(e) = self
            .store
            .set_fingerprint(external_id, &detection.fingerprint, self.ttl_secs)
            .await
        {
            warn!(external_id, error = %e, "Failed to store fingerprint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::MemoryStore;
    use crate::model::Inventory;

    fn record(os: &str) -> SourceRecord {
        SourceRecord::new("100", "srv-a")
            .with_inventory(Inventory {
                os_name: Some(os.into()),
                ..Inventory::default()
            })
            .with_address("10.11.5.5")
    }

    #[tokio::test]
    async fn test_new_changed_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let detector = ChangeDetector::new(store.clone(), 60);

        let first = detector.classify(&record("ESXi 7")).await;
        assert_eq!(first.kind, ChangeKind::New);
        assert!(store.is_empty(), "new records commit only after a write");
        detector.commit("100", &first).await;

        let second = detector.classify(&record("ESXi 7")).await;
        assert_eq!(second.kind, ChangeKind::Unchanged);
        assert!(!second.needs_sync());

        let third = detector.classify(&record("ESXi 8")).await;
        assert_eq!(
            third.kind,
            ChangeKind::Changed {
                changes: vec![FieldChange::new("os", "ESXi 7", "ESXi 8")]
            }
        );
    }

    #[tokio::test]
    async fn test_cache_failure_fails_open() {
        let store = Arc::new(MemoryStore::new());
        store.set_failing(true);
        let detector = ChangeDetector::new(store, 60);

        let detection = detector.classify(&record("ESXi 7")).await;
        assert_eq!(detection.kind, ChangeKind::Changed { changes: vec![] });
        assert!(detection.needs_sync());
    }

    #[tokio::test]
    async fn test_read_only_never_writes() {
        let store = Arc::new(MemoryStore::new());
        let detector = ChangeDetector::new(store.clone(), 60).read_only(true);

        let detection = detector.classify(&record("ESXi 7")).await;
        detector.commit("100", &detection).await;
        assert!(store.is_empty());
    }
}
