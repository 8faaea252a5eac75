//! Content fingerprints and the stores that remember them.
//!
//! A fingerprint is a SHA-256 over the canonical form of a record's
//! significant fields. The canonical form is a sorted map, so attribute
//! order never changes the hash.

pub mod memory;
pub mod redis;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::{FieldChange, SourceRecord};
use crate::normalize::non_empty;

pub use self::memory::{MemoryStore, NullStore};
pub use self::redis::RedisStore;

/// Canonical significant fields of a record.
pub type Snapshot = BTreeMap<String, String>;

/// Errors raised by fingerprint and last-seen stores.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Hash plus the snapshot it was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: String,
    #[serde(default)]
    pub snapshot: Snapshot,
}

impl Fingerprint {
    /// Fingerprint of a source record.
    #[must_use]
    pub fn of(record: &SourceRecord) -> Self {
        let snapshot = snapshot(record);
        Self {
            hash: hash_snapshot(&snapshot),
            snapshot,
        }
    }
}

/// Canonical form of the fields whose change warrants a DCIM write.
#[must_use]
pub fn snapshot(record: &SourceRecord) -> Snapshot {
    let inventory = record.inventory();
    let text = |value: Option<&String>| non_empty(value.map(String::as_str)).unwrap_or_default().to_string();

    let mut snapshot = Snapshot::new();
    snapshot.insert("name".into(), record.name.trim().to_string());
    snapshot.insert("vendor".into(), record.vendor());
    snapshot.insert("model".into(), record.model());
    snapshot.insert("os".into(), text(inventory.os_name.as_ref()));
    snapshot.insert("os_version".into(), text(inventory.os_version.as_ref()));
    snapshot.insert("cpu".into(), text(inventory.cpu.as_ref()));
    snapshot.insert("memory".into(), text(inventory.memory.as_ref()));
    snapshot.insert("cluster".into(), text(inventory.cluster.as_ref()));
    snapshot.insert("location".into(), text(inventory.location.as_ref()));
    snapshot.insert("serial".into(), text(inventory.serial.as_ref()));
    snapshot.insert("asset_tag".into(), text(inventory.asset_tag.as_ref()));
    snapshot.insert("rack_name".into(), text(inventory.rack_name.as_ref()));
    snapshot.insert("rack_unit".into(), text(inventory.rack_unit.as_ref()));
    snapshot.insert(
        "ip".into(),
        record.primary_address().unwrap_or_default().to_string(),
    );
    snapshot.insert("status".into(), record.status.as_str().to_string());
    snapshot
}

/// Hex SHA-256 of a snapshot.
#[must_use]
pub fn hash_snapshot(snapshot: &Snapshot) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in snapshot {
        hasher.update(key.as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.as_bytes());
        hasher.update([0x1e]);
    }
    hex::encode(hasher.finalize())
}

/// Field-by-field differences between two snapshots.
#[must_use]
pub fn diff_snapshots(old: &Snapshot, new: &Snapshot) -> Vec<FieldChange> {
    let mut keys: Vec<&String> = old.keys().chain(new.keys()).collect();
    keys.sort();
    keys.dedup();

    keys.into_iter()
        .filter_map(|key| {
            let before = old.get(key).map_or("", String::as_str);
            let after = new.get(key).map_or("", String::as_str);
            (before != after).then(|| FieldChange::new(key.as_str(), before, after))
        })
        .collect()
}

/// Durable external id → fingerprint map.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    async fn get_fingerprint(&self, external_id: &str) -> Result<Option<Fingerprint>, CacheError>;

    /// Store a fingerprint that expires after `ttl_secs`.
    async fn set_fingerprint(
        &self,
        external_id: &str,
        fingerprint: &Fingerprint,
        ttl_secs: u64,
    ) -> Result<(), CacheError>;

    /// Forget a fingerprint so the record next reads as new.
    async fn remove_fingerprint(&self, external_id: &str) -> Result<(), CacheError>;
}

/// Per-external-id clock used by the lifecycle pass.
#[async_trait]
pub trait LastSeenStore: Send + Sync {
    async fn get_last_seen(&self, external_id: &str) -> Result<Option<DateTime<Utc>>, CacheError>;

    async fn set_last_seen(&self, external_id: &str, at: DateTime<Utc>) -> Result<(), CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Inventory;

    fn record() -> SourceRecord {
        SourceRecord::new("100", "srv-a")
            .with_inventory(Inventory {
                vendor: Some("Dell Inc.".into()),
                model: Some("PowerEdge R640".into()),
                memory: Some("512 GB".into()),
                ..Inventory::default()
            })
            .with_address("10.11.5.5")
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(Fingerprint::of(&record()), Fingerprint::of(&record()));
    }

    #[test]
    fn test_hash_ignores_insertion_order() {
        let forward = Fingerprint::of(&record()).snapshot;
        let mut reversed = Snapshot::new();
        for (key, value) in forward.iter().rev() {
            reversed.insert(key.clone(), value.clone());
        }
        assert_eq!(hash_snapshot(&forward), hash_snapshot(&reversed));
    }

    #[test]
    fn test_vendor_spelling_does_not_change_hash() {
        let mut other = record();
        if let Some(inventory) = other.inventory.as_mut() {
            inventory.vendor = Some("DELL".into());
        }
        assert_eq!(Fingerprint::of(&record()).hash, Fingerprint::of(&other).hash);
    }

    #[test]
    fn test_address_change_changes_hash() {
        let moved = record().with_address("10.13.5.5");
        let before = Fingerprint::of(&record());
        let after = Fingerprint::of(&moved);
        assert_ne!(before.hash, after.hash);

        let changes = diff_snapshots(&before.snapshot, &after.snapshot);
        assert_eq!(changes, vec![FieldChange::new("ip", "10.11.5.5", "10.13.5.5")]);
    }

    #[test]
    fn test_field_separator_prevents_collisions() {
        let mut a = Snapshot::new();
        a.insert("ab".into(), "c".into());
        let mut b = Snapshot::new();
        b.insert("a".into(), "bc".into());
        assert_ne!(hash_snapshot(&a), hash_snapshot(&b));
    }
}
