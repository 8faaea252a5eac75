//! The DCIM side: a generic object store contract plus its implementations.
//!
//! Every entity the engine touches (devices, manufacturers, device types,
//! sites, locations, racks, platforms, roles, interfaces, addresses) goes
//! through the same four calls. Filters use the target's query-parameter
//! vocabulary: `name`, `slug`, `<reference>_id`, `cf_<custom field>`.

pub mod dry_run;
pub mod memory;
pub mod netbox;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Attribute map sent to or received from the target.
pub type Fields = Map<String, Value>;

/// Errors raised by a [`TargetSystem`].
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Malformed object: {0}")]
    Malformed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Injected by test doubles.
    #[error("Injected fault: {0}")]
    Fault(String),
}

/// Kinds of objects stored in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Device,
    Manufacturer,
    DeviceType,
    Site,
    Location,
    Rack,
    Platform,
    Role,
    Interface,
    IpAddress,
}

impl EntityKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Manufacturer => "manufacturer",
            Self::DeviceType => "device_type",
            Self::Site => "site",
            Self::Location => "location",
            Self::Rack => "rack",
            Self::Platform => "platform",
            Self::Role => "role",
            Self::Interface => "interface",
            Self::IpAddress => "ip_address",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to an existing target object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: EntityKind,
    pub id: u64,
}

impl ObjectRef {
    #[must_use]
    pub const fn new(kind: EntityKind, id: u64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// An object as returned by the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub kind: EntityKind,
    pub id: u64,
    pub fields: Fields,
}

impl RemoteObject {
    #[must_use]
    pub const fn new(kind: EntityKind, id: u64, fields: Fields) -> Self {
        Self { kind, id, fields }
    }

    #[must_use]
    pub const fn reference(&self) -> ObjectRef {
        ObjectRef::new(self.kind, self.id)
    }

    /// Display name (`name`, or `address` for IP addresses).
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.str_field("name").or_else(|| self.str_field("address"))
    }

    /// String value of a field. Choice objects (`{"value": ..}`) yield their value.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        match self.fields.get(key)? {
            Value::String(s) => Some(s.as_str()),
            Value::Object(map) => map.get("value").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Id of a referenced object. Accepts a bare id or a nested `{"id": ..}` object.
    #[must_use]
    pub fn ref_id(&self, key: &str) -> Option<u64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::Object(map) => map.get("id").and_then(Value::as_u64),
            _ => None,
        }
    }
}

/// Filter for [`TargetSystem::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    params: Vec<(String, String)>,
}

impl Query {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an exact-match condition.
    #[must_use]
    pub fn eq(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    #[must_use]
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        f.write_str(&parts.join("&"))
    }
}

/// Generic operations on the DCIM system of record.
#[async_trait]
pub trait TargetSystem: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// All objects of `kind` matching every condition in `query`.
    async fn list(&self, kind: EntityKind, query: &Query) -> Result<Vec<RemoteObject>, TargetError>;

    /// First matching object, if any.
    async fn get(&self, kind: EntityKind, query: &Query) -> Result<Option<RemoteObject>, TargetError> {
        Ok(self.list(kind, query).await?.into_iter().next())
    }

    async fn create(&self, kind: EntityKind, fields: Fields) -> Result<RemoteObject, TargetError>;

    /// Apply a partial update.
    async fn update(&self, target: ObjectRef, fields: Fields) -> Result<(), TargetError>;

    async fn delete(&self, target: ObjectRef) -> Result<(), TargetError>;

    /// Reachability check run before a sync starts.
    async fn check(&self) -> Result<(), TargetError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reference_forms() {
        let object = RemoteObject::new(
            EntityKind::Device,
            1,
            json!({
                "name": "srv-a",
                "site": {"id": 4, "name": "DC Almaty"},
                "rack": 9,
                "status": {"value": "active", "label": "Active"}
            })
            .as_object()
            .cloned()
            .unwrap(),
        );
        assert_eq!(object.ref_id("site"), Some(4));
        assert_eq!(object.ref_id("rack"), Some(9));
        assert_eq!(object.ref_id("missing"), None);
        assert_eq!(object.str_field("status"), Some("active"));
        assert_eq!(object.name(), Some("srv-a"));
    }

    #[test]
    fn test_query_display() {
        let query = Query::new().eq("rack_id", 4).eq("position", 12);
        assert_eq!(query.to_string(), "rack_id=4&position=12");
        assert!(!query.is_empty());
    }
}
