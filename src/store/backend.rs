//! # Key/Value Backends
//!
//! Storage mechanics behind [`SessionStore`](super::SessionStore). A backend maps
//! string keys to opaque bytes with an optional per-key expiry. Backends are
//! synchronous; every call is a blocking operation from the caller's side.
//!
//! ## Implementations
//! - [`MemoryBackend`]: mutex-guarded map with deadlines
//! - [`FileBackend`]: one JSON envelope per key under a directory
//!
//! Both read time through a [`Clock`] so tests can advance it by hand.

use crate::error::{constants, ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// Wall-clock source in unix milliseconds
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// The system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            // A clock before the epoch expires everything, never nothing.
            .unwrap_or(u64::MAX)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A live value read from a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub value: Vec<u8>,
    /// Time left before expiry, `None` for values without a deadline
    pub remaining: Option<Duration>,
}

/// Synchronous key/value storage with per-key expiry
pub trait KvBackend: Send + Sync {
    /// Live value under `key`; expired values read as absent
    fn get(&self, key: &str) -> Result<Option<StoredValue>>;

    /// Store `value`, expiring after `ttl` when given
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
}

fn deadline(clock: &dyn Clock, ttl: Option<Duration>) -> Option<u64> {
    ttl.map(|ttl| clock.now_millis().saturating_add(ttl.as_millis() as u64))
}

/// `None` once `expires_at` has passed
fn remaining(clock: &dyn Clock, expires_at: Option<u64>) -> Option<Option<Duration>> {
    match expires_at {
        None => Some(None),
        Some(at) => {
            let now = clock.now_millis();
            if now >= at {
                None
            } else {
                Some(Some(Duration::from_millis(at - now)))
            }
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<u64>,
}

/// In-process backend
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>>> {
        self.entries
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_STORE_LOCK.into()))
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn evict_expired(&self) -> Result<usize> {
        let mut entries = self.lock()?;
        let before = entries.len();
        let clock = self.clock.as_ref();
        entries.retain(|_, entry| remaining(clock, entry.expires_at).is_some());
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, "Evicted expired store entries");
        }
        Ok(evicted)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        let mut entries = self.lock()?;
        let Some(entry) = entries.get(key) else {
            return Ok(None);
        };
        match remaining(self.clock.as_ref(), entry.expires_at) {
            Some(remaining) => Ok(Some(StoredValue {
                value: entry.value.clone(),
                remaining,
            })),
            None => {
                entries.remove(key);
                trace!(key, "Store entry expired");
                Ok(None)
            }
        }
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = deadline(self.clock.as_ref(), ttl);
        self.lock()?
            .insert(key.to_string(), MemoryEntry { value, expires_at });
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// On-disk envelope for one key
#[derive(Debug, Serialize, Deserialize)]
struct FileEnvelope {
    key: String,
    /// Hex-encoded value bytes
    value: String,
    /// Unix milliseconds, absent for values without a deadline
    expires_at: Option<u64>,
}

/// Directory-backed store that survives process restarts
pub struct FileBackend {
    directory: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FileBackend {
    /// Open (creating if needed) a store rooted at `directory`
    pub fn open(directory: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_clock(directory, Arc::new(SystemClock))
    }

    pub fn open_with_clock(directory: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;
        debug!(directory = %directory.display(), "Opened file store");
        Ok(Self { directory, clock })
    }

    /// Keys contain `:`, so file names are the hex of the key
    fn path_for(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{}.json", hex::encode(key)))
    }
}

impl KvBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        let path = self.path_for(key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope: FileEnvelope = serde_json::from_slice(&raw)?;
        match remaining(self.clock.as_ref(), envelope.expires_at) {
            Some(remaining) => {
                let value = hex::decode(&envelope.value).map_err(|e| {
                    warn!(key, error = %e, "Store file holds invalid hex");
                    ProtocolError::Custom(format!("corrupt store entry for {key}"))
                })?;
                Ok(Some(StoredValue { value, remaining }))
            }
            None => {
                self.delete(key)?;
                trace!(key, "Store file expired");
                Ok(None)
            }
        }
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let envelope = FileEnvelope {
            key: key.to_string(),
            value: hex::encode(value),
            expires_at: deadline(self.clock.as_ref(), ttl),
        };
        let path = self.path_for(key);
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, serde_json::to_vec_pretty(&envelope)?)?;
        fs::rename(&staging, &path)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
