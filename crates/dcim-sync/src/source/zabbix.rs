//! Zabbix JSON-RPC adapter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{InventoryFilter, SourceError, SourceSystem};
use crate::model::{Inventory, NetworkInterface, SourceRecord, SourceStatus};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Inventory fields requested per host.
const INVENTORY_FIELDS: [&str; 12] = [
    "vendor",
    "model",
    "os",
    "os_short",
    "hardware",
    "software_app_a",
    "alias",
    "location",
    "location_lat",
    "location_lon",
    "serialno_a",
    "asset_tag",
];

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct HostInterface {
    #[serde(default)]
    ip: String,
    #[serde(default)]
    main: String,
}

/// Inventory arrives as an object, or as `[]` when collection is disabled.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HostInventory {
    Disabled(Vec<IgnoredAny>),
    Fields(ZabbixInventory),
}

#[derive(Debug, Deserialize)]
struct ZabbixInventory {
    vendor: Option<String>,
    model: Option<String>,
    os: Option<String>,
    os_short: Option<String>,
    hardware: Option<String>,
    software_app_a: Option<String>,
    alias: Option<String>,
    location: Option<String>,
    location_lat: Option<String>,
    location_lon: Option<String>,
    serialno_a: Option<String>,
    asset_tag: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Host {
    hostid: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default, rename = "parentTemplates")]
    parent_templates: Vec<NamedRef>,
    #[serde(default, alias = "groups")]
    hostgroups: Vec<NamedRef>,
    #[serde(default)]
    interfaces: Vec<HostInterface>,
    inventory: Option<HostInventory>,
}

impl Host {
    fn into_record(self) -> SourceRecord {
        let name = if self.name.trim().is_empty() {
            self.host
        } else {
            self.name
        };
        let inventory = match self.inventory {
            Some(HostInventory::Fields(inv)) => Some(Inventory {
                vendor: inv.vendor,
                model: inv.model,
                os_name: inv.os,
                os_version: inv.os_short,
                cpu: inv.hardware,
                memory: inv.software_app_a,
                serial: inv.serialno_a,
                asset_tag: inv.asset_tag,
                cluster: inv.alias,
                location: inv.location,
                rack_name: inv.location_lat,
                rack_unit: inv.location_lon,
            }),
            Some(HostInventory::Disabled(entries)) => {
                debug!(hostid = %self.hostid, entries = entries.len(), "Inventory collection disabled");
                None
            }
            None => None,
        };

        SourceRecord {
            external_id: self.hostid,
            name: name.trim().to_string(),
            status: if self.status == "0" {
                SourceStatus::Active
            } else {
                SourceStatus::Inactive
            },
            inventory,
            interfaces: self
                .interfaces
                .into_iter()
                .map(|iface| NetworkInterface {
                    address: iface.ip,
                    primary: iface.main == "1",
                })
                .collect(),
        }
    }
}

/// Zabbix API client.
pub struct Zabbix {
    client: Client,
    endpoint: String,
    username: String,
    password: String,
    token: RwLock<Option<String>>,
    request_id: AtomicU64,
}

impl Zabbix {
    /// Create a client that logs in with a user and password on first use.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/api_jsonrpc.php", base_url.into().trim_end_matches('/')),
            username: username.into(),
            password: password.into(),
            token: RwLock::new(None),
            request_id: AtomicU64::new(1),
        })
    }

    async fn call_raw(&self, method: &str, params: Value, token: Option<&str>) -> Result<Value, SourceError> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        debug!(method, id, "JSON-RPC request");

        let mut request = self.client.post(&self.endpoint).json(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        }));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?.error_for_status()?;
        let body: RpcResponse = response.json().await?;

        if let Some(error) = body.error {
            warn!(method, code = error.code, message = %error.message, "JSON-RPC error");
            return Err(SourceError::Rpc {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }
        body.result
            .ok_or_else(|| SourceError::Unavailable(format!("{method} returned no result")))
    }

    async fn login(&self) -> Result<String, SourceError> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }

        let result = self
            .call_raw(
                "user.login",
                json!({"username": self.username, "password": self.password}),
                None,
            )
            .await
            .map_err(|e| match e {
                SourceError::Rpc { message, data, .. } => SourceError::Auth(format!("{message} {data}")),
                other => other,
            })?;
        let token = result
            .as_str()
            .ok_or_else(|| SourceError::Auth("user.login returned no token".into()))?
            .to_string();

        info!(user = %self.username, "Logged in to Zabbix");
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, SourceError> {
        let token = self.login().await?;
        let result = self.call_raw(method, params, Some(&token)).await?;
        Ok(serde_json::from_value(result)?)
    }
}

#[async_trait]
impl SourceSystem for Zabbix {
    fn name(&self) -> &'static str {
        "zabbix"
    }

    async fn list_inventory_records(
        &self,
        filter: &InventoryFilter,
        limit: Option<usize>,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let hosts: Vec<Host> = self
            .call(
                "host.get",
                json!({
                    "output": ["hostid", "host", "name", "status"],
                    "selectParentTemplates": ["templateid", "name"],
                    "selectInventory": INVENTORY_FIELDS,
                    "selectInterfaces": ["ip", "type", "main"],
                    "selectHostGroups": ["groupid", "name"],
                }),
            )
            .await?;

        let total = hosts.len();
        let records: Vec<SourceRecord> = hosts
            .into_iter()
            .filter(|host| {
                let templates: Vec<&str> = host.parent_templates.iter().map(|t| t.name.as_str()).collect();
                let groups: Vec<&str> = host.hostgroups.iter().map(|g| g.name.as_str()).collect();
                filter.admits(templates.as_slice(), groups.as_slice())
            })
            .take(limit.unwrap_or(usize::MAX))
            .map(Host::into_record)
            .collect();

        info!(total, selected = records.len(), "Fetched Zabbix hosts");
        Ok(records)
    }

    async fn check(&self) -> Result<(), SourceError> {
        self.login().await.map(|_| ())
    }
}
