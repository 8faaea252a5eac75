//! Write-suppressing target strategy.
//!
//! Reads pass through to the wrapped target. Creates return objects with
//! synthetic ids drawn from a range real targets never issue; updates and
//! deletes are logged and counted. Queries that filter on a synthetic id
//! short-circuit to an empty result.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{EntityKind, Fields, ObjectRef, Query, RemoteObject, TargetError, TargetSystem};

/// First synthetic id handed out.
pub const SYNTHETIC_ID_BASE: u64 = 1 << 48;

/// Target that never writes.
pub struct DryRun {
    inner: Arc<dyn TargetSystem>,
    next_id: AtomicU64,
    suppressed: AtomicUsize,
}

impl DryRun {
    #[must_use]
    pub fn new(inner: Arc<dyn TargetSystem>) -> Self {
        Self {
            inner,
            next_id: AtomicU64::new(SYNTHETIC_ID_BASE),
            suppressed: AtomicUsize::new(0),
        }
    }

    /// Number of writes swallowed so far.
    #[must_use]
    pub fn suppressed_writes(&self) -> usize {
        self.suppressed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn is_synthetic(id: u64) -> bool {
        id >= SYNTHETIC_ID_BASE
    }

    fn references_synthetic(query: &Query) -> bool {
        query
            .params()
            .iter()
            .filter(|(key, _)| key.ends_with("_id"))
            .filter_map(|(_, value)| value.parse::<u64>().ok())
            .any(Self::is_synthetic)
    }
}

#[async_trait]
impl TargetSystem for DryRun {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    async fn list(&self, kind: EntityKind, query: &Query) -> Result<Vec<RemoteObject>, TargetError> {
        if Self::references_synthetic(query) {
            return Ok(Vec::new());
        }
        self.inner.list(kind, query).await
    }

    async fn create(&self, kind: EntityKind, fields: Fields) -> Result<RemoteObject, TargetError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        info!(
            kind = %kind,
            id,
            name = fields.get("name").and_then(|v| v.as_str()).unwrap_or_default(),
            "[dry-run] Would create"
        );
        Ok(RemoteObject::new(kind, id, fields))
    }

    async fn update(&self, target: ObjectRef, fields: Fields) -> Result<(), TargetError> {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        let keys: Vec<&str> = fields.keys().map(String::as_str).collect();
        info!(target = %target, fields = ?keys, "[dry-run] Would update");
        Ok(())
    }

    async fn delete(&self, target: ObjectRef) -> Result<(), TargetError> {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        info!(target = %target, "[dry-run] Would delete");
        Ok(())
    }

    async fn check(&self) -> Result<(), TargetError> {
        self.inner.check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::memory::MemoryTarget;

    #[tokio::test]
    async fn test_writes_never_reach_inner() {
        let inner = Arc::new(MemoryTarget::new());
        let dry = DryRun::new(inner.clone());

        let created = dry.create(EntityKind::Device, Fields::new()).await.unwrap();
        assert!(DryRun::is_synthetic(created.id));
        dry.update(created.reference(), Fields::new()).await.unwrap();
        dry.delete(created.reference()).await.unwrap();

        assert_eq!(dry.suppressed_writes(), 3);
        assert_eq!(inner.calls().writes(), 0);
        assert!(inner.objects(EntityKind::Device).is_empty());
    }

    #[tokio::test]
    async fn test_synthetic_filters_short_circuit() {
        let inner = Arc::new(MemoryTarget::new());
        inner.fail_next(crate::target::memory::Operation::List, EntityKind::Device);
        let dry = DryRun::new(inner);

        let query = Query::new().eq("rack_id", SYNTHETIC_ID_BASE + 3);
        assert!(dry.list(EntityKind::Device, &query).await.unwrap().is_empty());
    }
}
