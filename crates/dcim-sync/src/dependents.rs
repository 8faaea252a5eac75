//! Get-or-create of the objects a device references.
//!
//! A resolver lives for one run. Every object it finds or creates is cached
//! under its normalized key, so a value seen twice in a run costs one
//! remote lookup and at most one create. Nothing is persisted.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::MappingConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::SourceRecord;
use crate::normalize::{extract_model, slugify, subnet_prefix, UNKNOWN};
use crate::target::{EntityKind, Fields, Query, TargetSystem};

/// A rack a device is placed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RackRef {
    pub id: u64,
    pub name: String,
}

/// Everything a device needs before it can be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependencies {
    pub site_id: u64,
    pub site_name: String,
    pub location_id: Option<u64>,
    pub manufacturer_id: u64,
    pub device_type_id: u64,
    /// Canonical model name the device type was resolved under.
    pub model: String,
    pub u_height: u8,
    pub platform_id: u64,
    pub role_id: u64,
    pub rack: Option<RackRef>,
}

fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

pub struct DependencyResolver {
    target: Arc<dyn TargetSystem>,
    mapping: MappingConfig,
    cache: HashMap<(EntityKind, String), u64>,
    unmapped: BTreeSet<String>,
}

impl DependencyResolver {
    #[must_use]
    pub fn new(target: Arc<dyn TargetSystem>, mapping: MappingConfig) -> Self {
        Self {
            target,
            mapping,
            cache: HashMap::new(),
            unmapped: BTreeSet::new(),
        }
    }

    /// Vendor and model pairs that fell back to the generic height this run.
    #[must_use]
    pub fn unmapped_models(&self) -> Vec<String> {
        self.unmapped.iter().cloned().collect()
    }

    /// Resolve or create every dependency of `record`.
    ///
    /// # Errors
    /// Returns [`SyncError::DependencyResolution`] when the site is missing, the
    /// vendor is unknown, or the target fails.
    pub async fn resolve(&mut self, record: &SourceRecord) -> SyncResult<Dependencies> {
        let (site_id, site_name) = self.site(record).await?;

        let location_id = match self.mapping.location_for(&site_name).map(str::to_string) {
            Some(location) => Some(self.location(&location, site_id).await?),
            None => None,
        };

        let vendor = record.vendor();
        if vendor == UNKNOWN {
            return Err(SyncError::DependencyResolution(format!(
                "vendor unknown for {}",
                record.name
            )));
        }
        let manufacturer_id = self.manufacturer(&vendor).await?;
        let (model, u_height) = self.model_and_height(record, &vendor);
        let device_type_id = self
            .device_type(manufacturer_id, &vendor, &model, u_height)
            .await?;

        let platform_id = self.platform().await?;
        let role_id = self.role().await?;

        let rack = match record.rack_name() {
            Some(name) => Some(RackRef {
                id: self.rack(name, site_id, location_id).await?,
                name: name.to_string(),
            }),
            None => None,
        };

        Ok(Dependencies {
            site_id,
            site_name,
            location_id,
            manufacturer_id,
            device_type_id,
            model,
            u_height,
            platform_id,
            role_id,
            rack,
        })
    }

    /// Site mapped from the primary address, else the default site.
    async fn site(&mut self, record: &SourceRecord) -> SyncResult<(u64, String)> {
        let mapped = record
            .primary_address()
            .and_then(subnet_prefix)
            .and_then(|prefix| self.mapping.site_for_subnet(&prefix).map(str::to_string));

        let name = mapped.unwrap_or_else(|| {
            warn!(
                name = %record.name,
                address = ?record.primary_address(),
                site = %self.mapping.default_site,
                "No subnet mapping, using default site"
            );
            self.mapping.default_site.clone()
        });

        let key = (EntityKind::Site, name.clone());
        if let Some(id) = self.cache.get(&key) {
            return Ok((*id, name));
        }

        let site = self
            .target
            .get(EntityKind::Site, &Query::new().eq("name", &name))
            .await
            .map_err(|e| SyncError::DependencyResolution(format!("site {name}: {e}")))?
            .ok_or_else(|| SyncError::DependencyResolution(format!("site {name} not found")))?;

        self.cache.insert(key, site.id);
        Ok((site.id, name))
    }

    async fn location(&mut self, name: &str, site_id: u64) -> SyncResult<u64> {
        let slug = slugify(name);
        self.get_or_create(
            EntityKind::Location,
            format!("{site_id}/{slug}"),
            Query::new().eq("slug", &slug).eq("site_id", site_id),
            || fields(json!({"name": name, "slug": slug, "site": site_id})),
        )
        .await
    }

    async fn manufacturer(&mut self, vendor: &str) -> SyncResult<u64> {
        let slug = slugify(vendor);
        self.get_or_create(
            EntityKind::Manufacturer,
            slug.clone(),
            Query::new().eq("slug", &slug),
            || fields(json!({"name": vendor, "slug": slug})),
        )
        .await
    }

    /// Canonical model name and its rack height.
    fn model_and_height(&mut self, record: &SourceRecord, vendor: &str) -> (String, u8) {
        let mut model = record.model();
        let mut height = self.mapping.u_height(vendor, &model);

        if model == UNKNOWN || height.is_none() {
            let inventory = record.inventory();
            let text = [inventory.model.as_deref(), inventory.cpu.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            if let Some(extracted) = extract_model(&text) {
                let extracted_height = self.mapping.u_height(vendor, &extracted);
                if extracted_height.is_some() || model == UNKNOWN {
                    debug!(raw = %model, model = %extracted, "Extracted model from hardware text");
                    model = extracted;
                    height = extracted_height;
                }
            }
        }

        let height = height.unwrap_or_else(|| {
            let pair = format!("{vendor} {model}");
            if self.unmapped.insert(pair.clone()) {
                warn!(model = %pair, u_height = self.mapping.generic_u_height, "Model has no rack height mapping");
            }
            self.mapping.generic_u_height
        });
        (model, height)
    }

    async fn device_type(
        &mut self,
        manufacturer_id: u64,
        vendor: &str,
        model: &str,
        u_height: u8,
    ) -> SyncResult<u64> {
        let slug = slugify(&format!("{vendor}-{model}"));
        self.get_or_create(
            EntityKind::DeviceType,
            format!("{manufacturer_id}/{model}"),
            Query::new().eq("model", model).eq("manufacturer_id", manufacturer_id),
            || {
                fields(json!({
                    "manufacturer": manufacturer_id,
                    "model": model,
                    "slug": slug,
                    "u_height": u_height,
                }))
            },
        )
        .await
    }

    async fn platform(&mut self) -> SyncResult<u64> {
        let platform = self.mapping.platform.clone();
        let slug = slugify(&platform.name);
        if let Some(id) = self.cache.get(&(EntityKind::Platform, slug.clone())) {
            return Ok(*id);
        }
        let manufacturer_id = self.manufacturer(&platform.manufacturer).await?;
        self.get_or_create(
            EntityKind::Platform,
            slug.clone(),
            Query::new().eq("slug", &slug),
            || fields(json!({"name": platform.name, "slug": slug, "manufacturer": manufacturer_id})),
        )
        .await
    }

    async fn role(&mut self) -> SyncResult<u64> {
        let name = self.mapping.device_role.clone();
        let color = self.mapping.role_color.clone();
        let slug = slugify(&name);
        self.get_or_create(
            EntityKind::Role,
            slug.clone(),
            Query::new().eq("slug", &slug),
            || fields(json!({"name": name, "slug": slug, "color": color})),
        )
        .await
    }

    async fn rack(&mut self, name: &str, site_id: u64, location_id: Option<u64>) -> SyncResult<u64> {
        self.get_or_create(
            EntityKind::Rack,
            format!("{site_id}/{name}"),
            Query::new().eq("name", name).eq("site_id", site_id),
            || {
                let mut rack = fields(json!({"name": name, "site": site_id, "status": "active"}));
                if let Some(location) = location_id {
                    rack.insert("location".into(), json!(location));
                }
                rack
            },
        )
        .await
    }

    async fn get_or_create(
        &mut self,
        kind: EntityKind,
        key: String,
        query: Query,
        create: impl FnOnce() -> Fields + Send,
    ) -> SyncResult<u64> {
        let cache_key = (kind, key);
        if let Some(id) = self.cache.get(&cache_key) {
            return Ok(*id);
        }

        let failed = |e| SyncError::DependencyResolution(format!("{kind} {}: {e}", cache_key.1));

        let id = match self.target.get(kind, &query).await.map_err(failed)? {
            Some(existing) => existing.id,
            None => {
                let created = self.target.create(kind, create()).await.map_err(failed)?;
                info!(kind = %kind, key = %cache_key.1, id = created.id, "Created dependency");
                created.id
            }
        };

        self.cache.insert(cache_key, id);
        Ok(id)
    }
}
