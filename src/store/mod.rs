//! # Session Store
//!
//! Persists [`AccountRecord`]s (and the [`Session`](crate::session::Session) they
//! own) keyed by account identifier, with tiered expiration.
//!
//! ## Namespaces
//! ```text
//! PERM:{account}   permanent, never expires
//! TEMP:{account}   temporary, with or without a deadline
//! {account}        legacy unprefixed key, honored on read only
//! ```
//! Lookup order is permanent, then legacy, then temporary. Prefixes never leak
//! to callers; every operation takes the bare account id.
//!
//! ## Concurrency
//! There is no store-wide lock. [`SessionStore::modify`] and the
//! read-then-[`update`](SessionStore::update) pattern are not transactional: two
//! concurrent writers on the same account can lose one update (for example two
//! requests rotating the cookie at once). The last write wins.

pub mod backend;

pub use backend::{Clock, FileBackend, KvBackend, ManualClock, MemoryBackend, StoredValue, SystemClock};

use crate::config::{StoreBackendKind, StoreConfig};
use crate::error::{ProtocolError, Result};
use crate::session::AccountRecord;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

const PERM_PREFIX: &str = "PERM:";
const TEMP_PREFIX: &str = "TEMP:";

/// Expiry policy for [`SessionStore::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlPolicy {
    /// Permanent namespace, never expires
    Permanent,
    /// Temporary namespace, expires after the duration
    Temporary(Duration),
    /// Temporary namespace without a deadline. Nothing removes it except an
    /// explicit [`SessionStore::delete`].
    TemporaryIndefinite,
}

impl TtlPolicy {
    /// `0` is permanent, positive is a TTL in seconds, negative is temporary
    /// without a deadline
    pub fn from_seconds(ttl: i64) -> Self {
        match ttl {
            0 => TtlPolicy::Permanent,
            t if t > 0 => TtlPolicy::Temporary(Duration::from_secs(t as u64)),
            _ => TtlPolicy::TemporaryIndefinite,
        }
    }

    fn namespace(self) -> Namespace {
        match self {
            TtlPolicy::Permanent => Namespace::Permanent,
            TtlPolicy::Temporary(_) | TtlPolicy::TemporaryIndefinite => Namespace::Temporary,
        }
    }

    fn ttl(self) -> Option<Duration> {
        match self {
            TtlPolicy::Temporary(ttl) => Some(ttl),
            TtlPolicy::Permanent | TtlPolicy::TemporaryIndefinite => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Namespace {
    Permanent,
    Legacy,
    Temporary,
}

impl Namespace {
    const LOOKUP_ORDER: [Namespace; 3] = [Namespace::Permanent, Namespace::Legacy, Namespace::Temporary];

    fn key(self, account_id: &str) -> String {
        match self {
            Namespace::Permanent => format!("{PERM_PREFIX}{account_id}"),
            Namespace::Legacy => account_id.to_string(),
            Namespace::Temporary => format!("{TEMP_PREFIX}{account_id}"),
        }
    }
}

/// Account record persistence over a [`KvBackend`]
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn KvBackend>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// Store backed by a fresh [`MemoryBackend`]
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Build the backend named by `config`
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        match config.backend {
            StoreBackendKind::Memory => Ok(Self::memory()),
            StoreBackendKind::File => {
                let directory = config.directory.as_ref().ok_or_else(|| {
                    ProtocolError::ConfigError("store.directory is required for the file backend".into())
                })?;
                Ok(Self::new(Arc::new(FileBackend::open(directory)?)))
            }
        }
    }

    /// Write `record` under `account_id` in the namespace chosen by `policy`
    pub fn put(&self, record: &AccountRecord, account_id: &str, policy: TtlPolicy) -> Result<()> {
        let key = policy.namespace().key(account_id);
        let value = serde_json::to_vec(record)?;
        debug!(account = account_id, ?policy, "Storing account record");
        self.backend.set(&key, value, policy.ttl())
    }

    /// Read the record for `account_id`
    pub fn get(&self, account_id: &str) -> Result<AccountRecord> {
        let (_, stored) = self
            .locate(account_id)?
            .ok_or_else(|| ProtocolError::NotFound(account_id.to_string()))?;
        Ok(serde_json::from_slice(&stored.value)?)
    }

    /// True if any namespace holds a live record for `account_id`
    pub fn contains(&self, account_id: &str) -> Result<bool> {
        Ok(self.locate(account_id)?.is_some())
    }

    /// Rewrite an existing record in place.
    ///
    /// A temporary record keeps its remaining TTL. A legacy record is migrated
    /// into the permanent namespace.
    pub fn update(&self, account_id: &str, record: &AccountRecord) -> Result<()> {
        let (namespace, stored) = self
            .locate(account_id)?
            .ok_or_else(|| ProtocolError::NotFound(account_id.to_string()))?;
        let value = serde_json::to_vec(record)?;

        match namespace {
            Namespace::Permanent => self.backend.set(&namespace.key(account_id), value, None),
            Namespace::Temporary => {
                self.backend
                    .set(&namespace.key(account_id), value, stored.remaining)
            }
            Namespace::Legacy => {
                debug!(account = account_id, "Migrating legacy record to permanent namespace");
                self.backend
                    .set(&Namespace::Permanent.key(account_id), value, None)?;
                self.backend.delete(&Namespace::Legacy.key(account_id))
            }
        }
    }

    /// Read, mutate and write back the record. Not atomic with respect to other
    /// writers on the same account.
    pub fn modify<T, F>(&self, account_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut AccountRecord) -> Result<T>,
    {
        let mut record = self.get(account_id)?;
        let out = f(&mut record)?;
        self.update(account_id, &record)?;
        Ok(out)
    }

    /// Remove the record from every namespace
    pub fn delete(&self, account_id: &str) -> Result<()> {
        for namespace in Namespace::LOOKUP_ORDER {
            self.backend.delete(&namespace.key(account_id))?;
        }
        debug!(account = account_id, "Deleted account record");
        Ok(())
    }

    fn locate(&self, account_id: &str) -> Result<Option<(Namespace, StoredValue)>> {
        for namespace in Namespace::LOOKUP_ORDER {
            if let Some(stored) = self.backend.get(&namespace.key(account_id))? {
                trace!(account = account_id, ?namespace, "Store hit");
                return Ok(Some((namespace, stored)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn store_with_clock() -> (SessionStore, Arc<MemoryBackend>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let backend = Arc::new(MemoryBackend::with_clock(clock.clone()));
        (SessionStore::new(backend.clone()), backend, clock)
    }

    #[test]
    fn ttl_policy_from_seconds() {
        assert_eq!(TtlPolicy::from_seconds(0), TtlPolicy::Permanent);
        assert_eq!(
            TtlPolicy::from_seconds(5),
            TtlPolicy::Temporary(Duration::from_secs(5))
        );
        assert_eq!(TtlPolicy::from_seconds(-1), TtlPolicy::TemporaryIndefinite);
    }

    #[test]
    fn update_keeps_remaining_ttl() {
        let (store, _, clock) = store_with_clock();
        let mut record = AccountRecord::new("wxid_t", vec![1]);
        store
            .put(&record, "wxid_t", TtlPolicy::Temporary(Duration::from_secs(10)))
            .unwrap();

        clock.advance(Duration::from_secs(6));
        record.uin = 42;
        store.update("wxid_t", &record).unwrap();

        clock.advance(Duration::from_secs(3));
        assert_eq!(store.get("wxid_t").unwrap().uin, 42);
        clock.advance(Duration::from_secs(2));
        assert!(matches!(store.get("wxid_t"), Err(ProtocolError::NotFound(_))));
    }

    #[test]
    fn update_migrates_legacy_key() {
        let (store, backend, _) = store_with_clock();
        let record = AccountRecord::new("wxid_old", vec![2]);
        backend
            .set("wxid_old", serde_json::to_vec(&record).unwrap(), None)
            .unwrap();

        store.update("wxid_old", &record).unwrap();
        assert!(backend.get("wxid_old").unwrap().is_none());
        assert!(backend.get("PERM:wxid_old").unwrap().is_some());
    }

    #[test]
    fn modify_and_delete() {
        let (store, backend, _) = store_with_clock();
        let record = AccountRecord::new("wxid_m", vec![3]);
        store.put(&record, "wxid_m", TtlPolicy::Permanent).unwrap();
        store
            .put(&record, "wxid_m", TtlPolicy::TemporaryIndefinite)
            .unwrap();

        let uin = store
            .modify("wxid_m", |r| {
                r.uin = 7;
                Ok(r.uin)
            })
            .unwrap();
        assert_eq!(uin, 7);
        assert_eq!(store.get("wxid_m").unwrap().uin, 7);

        store.delete("wxid_m").unwrap();
        assert!(!store.contains("wxid_m").unwrap());
        assert!(backend.is_empty().unwrap());
    }

    #[test]
    fn update_of_missing_record_is_not_found() {
        let store = SessionStore::memory();
        let record = AccountRecord::new("ghost", vec![]);
        assert!(matches!(
            store.update("ghost", &record),
            Err(ProtocolError::NotFound(_))
        ));
    }
}
