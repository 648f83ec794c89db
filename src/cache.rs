//! Stamped memoisation cache and the size-bounded probe cache built on it.
//!
//! The memo guarantees at-most-one in-flight generation per key: the outer
//! map mutex is held only to look up or create a slot, and each slot owns
//! its own async mutex so distinct keys generate fully in parallel.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::probe::ProbeResult;

/// Default probe cache byte budget.
pub const DEFAULT_PROBE_CACHE_BUDGET: u64 = 64 * 1024 * 1024;

struct Slot<S, V> {
    state: tokio::sync::Mutex<Option<(S, V)>>,
}

impl<S, V> Default for Slot<S, V> {
    fn default() -> Self {
        Self {
            state: tokio::sync::Mutex::new(None),
        }
    }
}

/// A mapping from key to (stamp, value) with serialised per-key generation.
pub struct Cache<K, S, V> {
    slots: Mutex<HashMap<K, Arc<Slot<S, V>>>>,
}

impl<K, S, V> Default for Cache<K, S, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, S, V> Cache<K, S, V>
where
    K: Eq + Hash + Clone,
    S: PartialEq,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &K) -> Arc<Slot<S, V>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key.clone()).or_default().clone()
    }

    /// Returns the stored value when the stored stamp equals `stamp`,
    /// otherwise runs `generate` (exactly once among racing callers) and
    /// stores its result. A failed generation clears the stamp so the next
    /// caller retries.
    pub async fn get<F, Fut>(&self, key: K, stamp: S, generate: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(S, V)>>,
    {
        let slot = self.slot(&key);
        let mut state = slot.state.lock().await;
        if let Some((stored_stamp, value)) = state.as_ref() {
            if *stored_stamp == stamp {
                return Ok(value.clone());
            }
        }
        match generate().await {
            Ok((new_stamp, value)) => {
                *state = Some((new_stamp, value.clone()));
                Ok(value)
            }
            Err(e) => {
                *state = None;
                Err(e)
            }
        }
    }

    /// Stores an entry directly, bypassing generation.
    pub fn insert(&self, key: K, stamp: S, value: V) {
        let slot = self.slot(&key);
        let lock_result = slot.state.try_lock();
        if let Ok(mut state) = lock_result {
            *state = Some((stamp, value));
        }
    }

    pub fn remove(&self, key: &K) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(key);
    }

    /// Snapshot of settled entries; slots with a generation in flight are
    /// skipped.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::with_capacity(slots.len());
        for (key, slot) in slots.iter() {
            if let Ok(state) = slot.state.try_lock() {
                if let Some((_, value)) = state.as_ref() {
                    out.push((key.clone(), value.clone()));
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Probe cache key; a changed modification time yields a fresh key, which
/// implicitly invalidates the previous entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProbeKey {
    pub path: PathBuf,
    pub mtime_ns: i64,
}

/// A settled probe outcome. `None` is a remembered failure: the probe ran
/// and produced nothing useful, and is not retried for this key.
pub type CachedProbe = Option<Arc<ProbeResult>>;

/// Serialised form of one probe cache entry.
#[derive(Serialize, Deserialize)]
pub struct ProbeCacheItem {
    pub key: ProbeKey,
    pub value: Option<ProbeResult>,
}

#[derive(Default)]
struct Ledger {
    sizes: HashMap<ProbeKey, u64>,
    total: u64,
}

/// Byte-bounded probe result cache with random replacement.
pub struct ProbeCache {
    memo: Cache<ProbeKey, i64, CachedProbe>,
    ledger: Mutex<Ledger>,
    budget: u64,
}

impl ProbeCache {
    pub fn new(budget: u64) -> Self {
        Self {
            memo: Cache::new(),
            ledger: Mutex::new(Ledger::default()),
            budget,
        }
    }

    fn entry_size(key: &ProbeKey, value: &CachedProbe) -> u64 {
        let item = ProbeCacheItem {
            key: key.clone(),
            value: value.as_deref().cloned(),
        };
        serde_json::to_vec(&item).map(|v| v.len() as u64).unwrap_or(0)
    }

    fn record(&self, key: &ProbeKey, value: &CachedProbe) {
        let size = Self::entry_size(key, value);
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = ledger.sizes.insert(key.clone(), size) {
            ledger.total -= old;
        }
        ledger.total += size;
        while ledger.total > self.budget && !ledger.sizes.is_empty() {
            let victim = {
                let n = rand::thread_rng().gen_range(0..ledger.sizes.len());
                ledger.sizes.keys().nth(n).cloned()
            };
            let Some(victim) = victim else { break };
            if let Some(size) = ledger.sizes.remove(&victim) {
                ledger.total -= size;
            }
            self.memo.remove(&victim);
            debug!(path = %victim.path.display(), "evicted probe cache entry");
        }
    }

    /// Looks up or generates the probe outcome for `key`.
    pub async fn get<F, Fut>(&self, key: ProbeKey, generate: F) -> Result<CachedProbe>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedProbe>>,
    {
        let generated = AtomicBool::new(false);
        let stamp = key.mtime_ns;
        let value = self
            .memo
            .get(key.clone(), stamp, || async {
                generated.store(true, Ordering::Relaxed);
                let value = generate().await?;
                Ok((stamp, value))
            })
            .await?;
        if generated.load(Ordering::Relaxed) {
            self.record(&key, &value);
        }
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.memo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memo.is_empty()
    }

    /// Writes the cache as a JSON item array, atomically: serialise to a
    /// sibling temp file, then rename over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        let items: Vec<ProbeCacheItem> = self
            .memo
            .snapshot()
            .into_iter()
            .map(|(key, value)| ProbeCacheItem {
                key,
                value: value.as_deref().cloned(),
            })
            .collect();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating cache directory {}", parent.display()))?;
        }
        let tmp = path.with_extension("part");
        let data = serde_json::to_vec(&items).context("serialising probe cache")?;
        std::fs::write(&tmp, data)
            .with_context(|| format!("writing probe cache temp file {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming probe cache into place at {}", path.display()))?;
        debug!(entries = items.len(), path = %path.display(), "saved probe cache");
        Ok(())
    }

    /// Restores entries from a previously saved item array. A missing file
    /// is not an error.
    pub fn load(&self, path: &Path) -> Result<usize> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| format!("reading probe cache {}", path.display()))
            }
        };
        let items: Vec<ProbeCacheItem> = match serde_json::from_slice(&data) {
            Ok(items) => items,
            Err(e) => {
                warn!(path = %path.display(), "discarding unreadable probe cache: {e}");
                return Ok(0);
            }
        };
        let count = items.len();
        for item in items {
            let value: CachedProbe = item.value.map(Arc::new);
            self.memo.insert(item.key.clone(), item.key.mtime_ns, value.clone());
            self.record(&item.key, &value);
        }
        Ok(count)
    }
}
