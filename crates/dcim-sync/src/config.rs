//! Run configuration.
//!
//! One [`SyncConfig`] value is loaded (or defaulted) at startup and handed to
//! every component constructor. Defaults reproduce the reference deployment.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::source::InventoryFilter;

fn default_batch_size() -> usize {
    50
}

fn default_site() -> String {
    "DC Konaeva10".to_string()
}

fn default_device_role() -> String {
    "Server".to_string()
}

fn default_role_color() -> String {
    "0000ff".to_string()
}

fn default_generic_u_height() -> u8 {
    2
}

fn default_subnets() -> BTreeMap<String, String> {
    [
        ("10.11", "DC Kabanbay-Batyr28"),
        ("10.127", "DC Almaty"),
        ("10.13", "DC Karaganda"),
        ("10.14", "DC Atyrau"),
        ("10.10", "DC Konaeva10"),
        ("192.168", "DC Konaeva10"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_locations() -> BTreeMap<String, String> {
    [
        ("DC Kabanbay-Batyr28", "city Astana street Kabanbay batyr 28"),
        ("DC Almaty", "city Almaty street Karasay Batyr 55"),
        (
            "DC Karaganda",
            "city Karaganda street 132-й учетный квартал участок 168",
        ),
        ("DC Atyrau", "city Atyrau street XXX"),
        ("DC Konaeva10", "city Astana street Konaeva 10"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_u_heights() -> BTreeMap<String, u8> {
    [
        ("Dell Inc. PowerEdge R640", 1),
        ("Dell Inc. PowerEdge R740", 2),
        ("Dell PowerEdge R640", 1),
        ("Dell PowerEdge R740", 2),
        ("HPE ProLiant DL360 Gen10", 1),
        ("HPE ProLiant DL380 Gen10", 2),
        ("Huawei CH121 V3", 1),
        ("Huawei RH1288 V3", 1),
        ("Huawei RH2288H V3", 2),
        ("Huawei RH5885H V3", 4),
        ("Huawei Technologies Co., Ltd. RH5885H V3", 4),
        ("Huawei Technologies Co., Ltd. To be filled by O.E.M.", 4),
        ("Lenovo J900XBXR", 1),
        ("Lenovo ThinkAgile VX7531 Node", 2),
        ("Lenovo ThinkSystem SR645", 1),
        ("Lenovo ThinkSystem SR650", 2),
        ("VMware Virtual Platform", 0),
        ("Dell Unknown", 2),
        ("HPE Unknown", 2),
        ("Huawei Unknown", 2),
        ("Lenovo Unknown", 2),
        ("Unknown Unknown", 2),
        ("Generic Server", 2),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Platform every synced device is assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub name: String,
    pub manufacturer: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            name: "VMware ESXi".to_string(),
            manufacturer: "VMware".to_string(),
        }
    }
}

/// Lookup tables from source values to DCIM entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingConfig {
    /// First two address octets → site name.
    #[serde(default = "default_subnets")]
    pub subnets: BTreeMap<String, String>,

    #[serde(default = "default_site")]
    pub default_site: String,

    /// Site name → location name.
    #[serde(default = "default_locations")]
    pub locations: BTreeMap<String, String>,

    /// `"<vendor> <model>"` → rack units.
    #[serde(default = "default_u_heights")]
    pub u_heights: BTreeMap<String, u8>,

    #[serde(default = "default_generic_u_height")]
    pub generic_u_height: u8,

    #[serde(default)]
    pub platform: PlatformConfig,

    #[serde(default = "default_device_role")]
    pub device_role: String,

    #[serde(default = "default_role_color")]
    pub role_color: String,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            subnets: default_subnets(),
            default_site: default_site(),
            locations: default_locations(),
            u_heights: default_u_heights(),
            generic_u_height: default_generic_u_height(),
            platform: PlatformConfig::default(),
            device_role: default_device_role(),
            role_color: default_role_color(),
        }
    }
}

impl MappingConfig {
    /// Site mapped from an address's first two octets.
    #[must_use]
    pub fn site_for_subnet(&self, prefix: &str) -> Option<&str> {
        self.subnets.get(prefix).map(String::as_str)
    }

    #[must_use]
    pub fn location_for(&self, site: &str) -> Option<&str> {
        self.locations.get(site).map(String::as_str)
    }

    /// Rack units for a vendor and model.
    ///
    /// Tries `"<vendor> <model>"` first, then any entry naming the model alone.
    #[must_use]
    pub fn u_height(&self, vendor: &str, model: &str) -> Option<u8> {
        let exact = format!("{vendor} {model}").to_lowercase();
        let model = model.to_lowercase();
        let suffix = format!(" {model}");

        self.u_heights
            .iter()
            .find(|(key, _)| key.to_lowercase() == exact)
            .or_else(|| {
                self.u_heights.iter().find(|(key, _)| {
                    let key = key.to_lowercase();
                    key == model || key.ends_with(&suffix)
                })
            })
            .map(|(_, height)| *height)
    }
}

/// Identity field and write protection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPolicy {
    /// Custom field holding the source-issued id.
    #[serde(default = "default_external_id_field")]
    pub external_id_field: String,

    /// Top-level fields and custom attributes this system never writes.
    #[serde(default)]
    pub protected: BTreeSet<String>,
}

fn default_external_id_field() -> String {
    "zabbix_hostid".to_string()
}

impl Default for FieldPolicy {
    fn default() -> Self {
        Self {
            external_id_field: default_external_id_field(),
            protected: BTreeSet::new(),
        }
    }
}

impl FieldPolicy {
    #[must_use]
    pub fn is_protected(&self, field: &str) -> bool {
        self.protected.contains(field)
    }
}

/// What happens to the previous primary address when it changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaleAddressPolicy {
    /// Leave it assigned and untouched.
    #[default]
    Keep,
    /// Set its status to deprecated.
    Deprecate,
    /// Delete it.
    Delete,
}

/// Management interface settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_interface_name")]
    pub interface_name: String,

    #[serde(default = "default_interface_type")]
    pub interface_type: String,

    #[serde(default)]
    pub stale_address: StaleAddressPolicy,
}

fn default_interface_name() -> String {
    "mgmt0".to_string()
}

fn default_interface_type() -> String {
    "1000base-t".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface_name: default_interface_name(),
            interface_type: default_interface_type(),
            stale_address: StaleAddressPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RackConfig {
    #[serde(default = "default_true")]
    pub check_conflicts: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RackConfig {
    fn default() -> Self {
        Self {
            check_conflicts: true,
        }
    }
}

/// Fingerprint cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_ttl_secs() -> u64 {
    86_400
}

fn default_key_prefix() -> String {
    "zabbix_host:".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Decommission and deletion of absent devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Role names whose devices this system may age out.
    #[serde(default = "default_managed_roles")]
    pub managed_roles: Vec<String>,

    #[serde(default = "default_days")]
    pub decommission_after_days: u32,

    #[serde(default = "default_days")]
    pub delete_after_days: u32,

    #[serde(default)]
    pub delete_decommissioned: bool,
}

fn default_managed_roles() -> Vec<String> {
    vec![default_device_role()]
}

fn default_days() -> u32 {
    30
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            managed_roles: default_managed_roles(),
            decommission_after_days: default_days(),
            delete_after_days: default_days(),
            delete_decommissioned: false,
        }
    }
}

/// Everything a run needs to know besides connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub filter: InventoryFilter,

    /// Process at most this many source records.
    #[serde(default)]
    pub limit: Option<usize>,

    /// Records per progress batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub mapping: MappingConfig,

    #[serde(default)]
    pub fields: FieldPolicy,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub racks: RackConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            filter: InventoryFilter::default(),
            limit: None,
            batch_size: default_batch_size(),
            dry_run: false,
            mapping: MappingConfig::default(),
            fields: FieldPolicy::default(),
            network: NetworkConfig::default(),
            racks: RackConfig::default(),
            cache: CacheConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load a YAML configuration file. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns [`SyncError::Config`] if the file cannot be read or parsed.
    pub async fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration");
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SyncError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    /// Parse configuration from YAML text.
    ///
    /// # Errors
    /// Returns [`SyncError::Config`] on malformed YAML.
    pub fn from_yaml(text: &str) -> SyncResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Every problem with this configuration.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.batch_size == 0 {
            problems.push("batch_size must be greater than zero".to_string());
        }
        if self.fields.external_id_field.trim().is_empty() {
            problems.push("fields.external_id_field must not be empty".to_string());
        }
        if self.fields.is_protected(&self.fields.external_id_field) {
            problems.push(format!(
                "fields.protected must not contain the identity field {}",
                self.fields.external_id_field
            ));
        }
        if self.mapping.default_site.trim().is_empty() {
            problems.push("mapping.default_site must not be empty".to_string());
        }
        if self.mapping.device_role.trim().is_empty() {
            problems.push("mapping.device_role must not be empty".to_string());
        }
        for prefix in self.mapping.subnets.keys() {
            let octets: Vec<&str> = prefix.split('.').collect();
            if octets.len() != 2 || octets.iter().any(|o| o.parse::<u8>().is_err()) {
                problems.push(format!("mapping.subnets key {prefix:?} is not two octets"));
            }
        }
        if self.cache.ttl_secs == 0 {
            problems.push("cache.ttl_secs must be greater than zero".to_string());
        }
        if self.network.interface_name.trim().is_empty() {
            problems.push("network.interface_name must not be empty".to_string());
        }
        if self.lifecycle.enabled {
            if self.lifecycle.managed_roles.iter().all(|r| r.trim().is_empty()) {
                problems.push("lifecycle.managed_roles must name at least one role".to_string());
            }
            if self.lifecycle.decommission_after_days == 0 {
                problems.push("lifecycle.decommission_after_days must be greater than zero".to_string());
            }
        } else if self.lifecycle.delete_decommissioned {
            problems.push("lifecycle.delete_decommissioned requires lifecycle.enabled".to_string());
        }

        problems
    }

    /// Fail with every problem at once.
    ///
    /// # Errors
    /// Returns [`SyncError::Config`] listing all problems.
    pub fn ensure_valid(&self) -> SyncResult<()> {
        let problems = self.validate();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Config(problems.join("; ")))
        }
    }
}
