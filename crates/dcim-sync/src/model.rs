//! Source records and target devices.
//!
//! A [`SourceRecord`] is what the monitoring system reports for one host. A
//! [`Device`] is the typed view of a DCIM device object, with the custom
//! attribute bag kept as an explicit map rather than dynamic fields.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::normalize::{self, is_valid_ipv4, non_empty};
use crate::target::{EntityKind, Fields, ObjectRef, RemoteObject, TargetError};

/// Custom attribute names written on devices.
pub mod cf {
    pub const CPU_MODEL: &str = "cpu_model";
    pub const MEMORY_SIZE: &str = "memory_size";
    pub const OS_NAME: &str = "os_name";
    pub const OS_VERSION: &str = "os_version";
    pub const CLUSTER: &str = "vsphere_cluster";
    pub const RACK_LOCATION: &str = "rack_location";
    pub const RACK_NAME: &str = "rack_name";
    pub const RACK_UNIT: &str = "rack_unit";
    pub const LAST_SYNC: &str = "last_sync";
    pub const DECOMMISSIONED_AT: &str = "decommissioned_at";
}

/// Host status as reported by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Active,
    Inactive,
}

impl SourceStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

/// One network interface of a source host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub address: String,
    #[serde(default)]
    pub primary: bool,
}

/// Free-text hardware and placement attributes of a source host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub serial: Option<String>,
    pub asset_tag: Option<String>,
    pub cluster: Option<String>,
    pub location: Option<String>,
    pub rack_name: Option<String>,
    pub rack_unit: Option<String>,
}

static EMPTY_INVENTORY: Inventory = Inventory {
    vendor: None,
    model: None,
    os_name: None,
    os_version: None,
    cpu: None,
    memory: None,
    serial: None,
    asset_tag: None,
    cluster: None,
    location: None,
    rack_name: None,
    rack_unit: None,
};

/// A host as reported by the monitoring source. Immutable per fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub external_id: String,
    pub name: String,
    pub status: SourceStatus,
    /// `None` when the source has inventory collection disabled for the host.
    pub inventory: Option<Inventory>,
    #[serde(default)]
    pub interfaces: Vec<NetworkInterface>,
}

impl SourceRecord {
    /// Active record with an empty inventory block and no interfaces.
    #[must_use]
    pub fn new(external_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            name: name.into(),
            status: SourceStatus::Active,
            inventory: Some(Inventory::default()),
            interfaces: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_inventory(mut self, inventory: Inventory) -> Self {
        self.inventory = Some(inventory);
        self
    }

    #[must_use]
    pub fn without_inventory(mut self) -> Self {
        self.inventory = None;
        self
    }

    /// Replace interfaces with a single primary interface.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.interfaces = vec![NetworkInterface {
            address: address.into(),
            primary: true,
        }];
        self
    }

    #[must_use]
    pub const fn with_status(mut self, status: SourceStatus) -> Self {
        self.status = status;
        self
    }

    /// Inventory block, or an empty one when the source sent none.
    #[must_use]
    pub fn inventory(&self) -> &Inventory {
        self.inventory.as_ref().unwrap_or(&EMPTY_INVENTORY)
    }

    /// First valid address flagged primary, else the first valid address.
    #[must_use]
    pub fn primary_address(&self) -> Option<&str> {
        let valid = |iface: &&NetworkInterface| is_valid_ipv4(iface.address.trim());
        self.interfaces
            .iter()
            .filter(|iface| iface.primary)
            .find(valid)
            .or_else(|| self.interfaces.iter().find(valid))
            .map(|iface| iface.address.trim())
    }

    /// Canonical vendor name.
    #[must_use]
    pub fn vendor(&self) -> String {
        normalize::normalize_vendor(self.inventory().vendor.as_deref().unwrap_or_default())
    }

    /// Canonical model name.
    #[must_use]
    pub fn model(&self) -> String {
        normalize::normalize_model(self.inventory().model.as_deref().unwrap_or_default())
    }

    /// Rack name, if the source reports one.
    #[must_use]
    pub fn rack_name(&self) -> Option<&str> {
        non_empty(self.inventory().rack_name.as_deref())
    }

    /// Numeric rack unit position. Text like `"12"` or `"12.0"` is accepted.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn rack_position(&self) -> Option<u32> {
        let raw = non_empty(self.inventory().rack_unit.as_deref())?;
        if let Ok(position) = raw.parse::<u32>() {
            return (position > 0).then_some(position);
        }
        let position: f64 = raw.parse().ok()?;
        (position >= 1.0 && position.fract() == 0.0 && position <= f64::from(u32::MAX))
            .then_some(position as u32)
    }
}

/// Lifecycle status of a target device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Active,
    Offline,
    Decommissioning,
    Deleted,
    /// Any status this system does not manage (planned, staged, ...).
    Other,
}

impl DeviceStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Offline => "offline",
            Self::Decommissioning => "decommissioning",
            Self::Deleted => "deleted",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Self::Active,
            "offline" => Self::Offline,
            "decommissioning" => Self::Decommissioning,
            "deleted" => Self::Deleted,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed view of a target device.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: u64,
    pub name: String,
    pub status: DeviceStatus,
    pub role: Option<u64>,
    pub site: Option<u64>,
    pub rack: Option<u64>,
    pub position: Option<u32>,
    pub primary_ip4: Option<u64>,
    pub custom_fields: Map<String, Value>,
    /// Top-level attributes exactly as the target returned them.
    pub attributes: Fields,
}

impl Device {
    /// Build the typed view from a remote device object.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError::Malformed`] when the object is not a device or has no name.
    pub fn from_object(object: &RemoteObject) -> Result<Self, TargetError> {
        if object.kind != EntityKind::Device {
            return Err(TargetError::Malformed(format!(
                "expected a device, got {}",
                object.kind
            )));
        }
        let name = object
            .name()
            .ok_or_else(|| TargetError::Malformed(format!("device {} has no name", object.id)))?
            .to_string();

        let status = object
            .str_field("status")
            .map_or(DeviceStatus::Active, DeviceStatus::parse);

        let role = object
            .ref_id("role")
            .or_else(|| object.ref_id("device_role"));

        Ok(Self {
            id: object.id,
            name,
            status,
            role,
            site: object.ref_id("site"),
            rack: object.ref_id("rack"),
            position: object.fields.get("position").and_then(position_of),
            primary_ip4: object.ref_id("primary_ip4"),
            custom_fields: object
                .fields
                .get("custom_fields")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            attributes: object.fields.clone(),
        })
    }

    #[must_use]
    pub const fn reference(&self) -> ObjectRef {
        ObjectRef::new(EntityKind::Device, self.id)
    }

    /// Custom attribute value, treating JSON null as absent.
    #[must_use]
    pub fn custom_field(&self, name: &str) -> Option<&Value> {
        self.custom_fields.get(name).filter(|v| !v.is_null())
    }

    /// External id stored in the identity custom field.
    #[must_use]
    pub fn external_id(&self, field: &str) -> Option<String> {
        match self.custom_field(field)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Moment the device entered decommissioning, if stamped.
    #[must_use]
    pub fn decommissioned_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.custom_field(cf::DECOMMISSIONED_AT)?.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Comparable text form of a top-level attribute.
    #[must_use]
    pub fn field_text(&self, name: &str) -> String {
        self.attributes.get(name).map(value_text).unwrap_or_default()
    }

    /// Comparable text form of a custom attribute.
    #[must_use]
    pub fn custom_field_text(&self, name: &str) -> String {
        self.custom_fields.get(name).map(value_text).unwrap_or_default()
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn position_of(value: &Value) -> Option<u32> {
    if let Some(n) = value.as_u64() {
        return u32::try_from(n).ok();
    }
    let f = value.as_f64()?;
    (f >= 0.0 && f.fract() == 0.0 && f <= f64::from(u32::MAX)).then_some(f as u32)
}

/// Text form used to compare desired and current values.
///
/// References compare by id, choice objects by value, and integral floats
/// compare equal to integers (`4.0` and `4`).
#[must_use]
pub fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            #[allow(clippy::cast_possible_truncation)]
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < 1e15 => (f as i64).to_string(),
            _ => n.to_string(),
        },
        Value::Object(map) => map
            .get("value")
            .or_else(|| map.get("id"))
            .map_or_else(|| value.to_string(), value_text),
        Value::Array(_) => value.to_string(),
    }
}

/// One attribute that differs between two states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: String,
    pub new: String,
}

impl FieldChange {
    #[must_use]
    pub fn new(field: impl Into<String>, old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            old: old.into(),
            new: new.into(),
        }
    }
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &str| if v.is_empty() { "(empty)".to_string() } else { v.to_string() };
        write!(f, "{}: {} → {}", self.field, show(&self.old), show(&self.new))
    }
}
