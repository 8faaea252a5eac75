//! Redis-backed fingerprint and last-seen store.
//!
//! Fingerprints live under `<prefix><external id>` as JSON with a TTL.
//! Last-seen stamps live under `<prefix>last_seen:<external id>` without
//! expiry, since the lifecycle clock must survive long absences.

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{CacheError, Fingerprint, FingerprintStore, LastSeenStore, Snapshot};

/// Redis store sharing one multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    prefix: String,
}

impl RedisStore {
    /// Connect to `url` and use `prefix` for every key.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, CacheError> {
        let client = Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        let prefix = prefix.into();
        info!(prefix = %prefix, "Connected to fingerprint cache");
        Ok(Self { connection, prefix })
    }

    fn fingerprint_key(&self, external_id: &str) -> String {
        format!("{}{external_id}", self.prefix)
    }

    fn last_seen_key(&self, external_id: &str) -> String {
        format!("{}last_seen:{external_id}", self.prefix)
    }
}

/// Decode a stored entry. Bare hashes written by older deployments carry no snapshot.
fn decode(raw: &str) -> Result<Fingerprint, CacheError> {
    if raw.trim_start().starts_with('{') {
        return Ok(serde_json::from_str(raw)?);
    }
    Ok(Fingerprint {
        hash: raw.trim().to_string(),
        snapshot: Snapshot::new(),
    })
}

#[async_trait]
impl FingerprintStore for RedisStore {
    async fn get_fingerprint(&self, external_id: &str) -> Result<Option<Fingerprint>, CacheError> {
        let mut connection = self.connection.clone();
        let raw: Option<String> = connection.get(self.fingerprint_key(external_id)).await?;
        raw.as_deref().map(decode).transpose()
    }

    async fn set_fingerprint(
        &self,
        external_id: &str,
        fingerprint: &Fingerprint,
        ttl_secs: u64,
    ) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        let payload = serde_json::to_string(fingerprint)?;
        connection
            .set_ex::<_, _, ()>(self.fingerprint_key(external_id), payload, ttl_secs)
            .await?;
        debug!(external_id, ttl_secs, "Stored fingerprint");
        Ok(())
    }

    async fn remove_fingerprint(&self, external_id: &str) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        connection.del::<_, ()>(self.fingerprint_key(external_id)).await?;
        debug!(external_id, "Removed fingerprint");
        Ok(())
    }
}

#[async_trait]
impl LastSeenStore for RedisStore {
    async fn get_last_seen(&self, external_id: &str) -> Result<Option<DateTime<Utc>>, CacheError> {
        let mut connection = self.connection.clone();
        let raw: Option<String> = connection.get(self.last_seen_key(external_id)).await?;
        raw.map(|value| {
            DateTime::parse_from_rfc3339(value.trim())
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| CacheError::Backend(format!("bad last-seen stamp {value:?}: {e}")))
        })
        .transpose()
    }

    async fn set_last_seen(&self, external_id: &str, at: DateTime<Utc>) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        connection
            .set::<_, _, ()>(self.last_seen_key(external_id), at.to_rfc3339())
            .await?;
        Ok(())
    }
}
