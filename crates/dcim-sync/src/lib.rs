//! Monitoring → DCIM inventory reconciliation.
//!
//! This crate keeps the DCIM system of record in step with live monitoring
//! inventory: physical and virtual servers, their placement, and their custom
//! attributes. The monitoring source is authoritative for attribute values; the
//! DCIM is authoritative only for identifiers it issues.
//!
//! # Pipeline
//!
//! ```text
//! Collector ─► ChangeDetector ─► {new, changed}
//!                                    │ (per record, sequential)
//!                                    ▼
//!         EntityResolver ─► DependencyResolver ─► RackArbiter ─► UpsertEngine
//!                                                                   │ on failure
//!                                                                   ▼
//!                                                          RollbackCoordinator
//!                                    │ after the whole pass
//!                                    ▼
//!                             LifecycleManager
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dcim_sync::{SyncConfig, SyncEngine};
//! use dcim_sync::fingerprint::MemoryStore;
//! use dcim_sync::source::zabbix::Zabbix;
//! use dcim_sync::target::netbox::NetBox;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let source = Arc::new(Zabbix::new("https://zabbix.local", "api", "secret")?);
//!     let target = Arc::new(NetBox::new("https://netbox.local", "token", true)?);
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let engine = SyncEngine::new(SyncConfig::default(), source, target, store.clone(), store);
//!     let report = engine.run().await?;
//!     println!("created {} devices", report.created.len());
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod dependents;
pub mod detect;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod lifecycle;
pub mod model;
pub mod normalize;
pub mod rack;
pub mod resolve;
pub mod rollback;
pub mod source;
pub mod target;
pub mod upsert;

pub use config::SyncConfig;
pub use engine::{ExitStatus, SyncEngine, SyncReport};
pub use error::{SyncError, SyncResult};
pub use model::{Device, DeviceStatus, FieldChange, Inventory, NetworkInterface, SourceRecord, SourceStatus};
pub use source::{InventoryFilter, SourceSystem};
pub use target::{EntityKind, ObjectRef, Query, RemoteObject, TargetSystem};
