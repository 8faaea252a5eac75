//! In-process fingerprint and last-seen stores.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CacheError, Fingerprint, FingerprintStore, LastSeenStore};

#[derive(Default)]
struct Entries {
    /// `None` expiry: the TTL reaches past what `Instant` can represent.
    fingerprints: HashMap<String, (Fingerprint, Option<Instant>)>,
    last_seen: HashMap<String, DateTime<Utc>>,
}

/// Store held in memory for the life of the process.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
    failing: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Number of live fingerprints.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .fingerprints
            .values()
            .filter(|(_, expires)| live(*expires, now))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.failing.load(Ordering::Relaxed) {
            Err(CacheError::Backend("store unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl FingerprintStore for MemoryStore {
    async fn get_fingerprint(&self, external_id: &str) -> Result<Option<Fingerprint>, CacheError> {
        self.check()?;
        let mut entries = self.lock();
        match entries.fingerprints.get(external_id) {
            Some((fingerprint, expires)) if live(*expires, Instant::now()) => Ok(Some(fingerprint.clone())),
            Some(_) => {
                entries.fingerprints.remove(external_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_fingerprint(
        &self,
        external_id: &str,
        fingerprint: &Fingerprint,
        ttl_secs: u64,
    ) -> Result<(), CacheError> {
        self.check()?;
        let expires = Instant::now().checked_add(Duration::from_secs(ttl_secs));
        self.lock()
            .fingerprints
            .insert(external_id.to_string(), (fingerprint.clone(), expires));
        Ok(())
    }

    async fn remove_fingerprint(&self, external_id: &str) -> Result<(), CacheError> {
        self.check()?;
        self.lock().fingerprints.remove(external_id);
        Ok(())
    }
}

fn live(expires: Option<Instant>, now: Instant) -> bool {
    expires.is_none_or(|at| at > now)
}

#[async_trait]
impl LastSeenStore for MemoryStore {
    async fn get_last_seen(&self, external_id: &str) -> Result<Option<DateTime<Utc>>, CacheError> {
        self.check()?;
        Ok(self.lock().last_seen.get(external_id).copied())
    }

    async fn set_last_seen(&self, external_id: &str, at: DateTime<Utc>) -> Result<(), CacheError> {
        self.check()?;
        self.lock().last_seen.insert(external_id.to_string(), at);
        Ok(())
    }
}

/// Fingerprint store that never remembers anything, so every record reads as new.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl FingerprintStore for NullStore {
    async fn get_fingerprint(&self, _external_id: &str) -> Result<Option<Fingerprint>, CacheError> {
        Ok(None)
    }

    async fn set_fingerprint(
        &self,
        _external_id: &str,
        _fingerprint: &Fingerprint,
        _ttl_secs: u64,
    ) -> Result<(), CacheError> {
        Ok(())
    }

    async fn remove_fingerprint(&self, _external_id: &str) -> Result<(), CacheError> {
        Ok(())
    }
}
