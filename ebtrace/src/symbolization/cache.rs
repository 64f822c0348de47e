//! Process-wide cache of symbol tables.
//!
//! Entries are keyed by file identity (device + inode) *and* modification
//! token, so two processes mapping the same unchanged binary share one
//! table. An entry is dropped on the spot when a lookup arrives with a new
//! token for its file identity, or with a different file at its location
//! (path under the same process root). Different files at the same path in
//! different containers are separate entries and never displace each other.
//!
//! Building a table happens at most once per key: the first requester
//! builds while concurrent requesters for the same key wait on the slot.
//! Other keys are never blocked by a build in progress.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use log::debug;

use super::image::{FileIdentity, ImageKey, ImageLocation};
use super::symbol_table::SymbolTable;
use crate::domain::ResolveError;

/// Result of building a table. Failures are cached too (negative entries).
pub type TableResult = Result<Arc<SymbolTable>, ResolveError>;

/// Accounted size of a negative entry.
const NEGATIVE_ENTRY_SIZE: usize = 64;

#[derive(Default)]
struct Slot {
    table: OnceLock<TableResult>,
    last_used: AtomicU64,
    size: AtomicUsize,
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<ImageKey, Arc<Slot>>,
    by_identity: HashMap<FileIdentity, ImageKey>,
    by_location: HashMap<ImageLocation, ImageKey>,
    used_bytes: usize,
}

impl CacheState {
    fn remove(&mut self, key: &ImageKey) -> bool {
        let Some(slot) = self.slots.remove(key) else {
            return false;
        };
        self.used_bytes = self.used_bytes.saturating_sub(slot.size.load(Ordering::Relaxed));
        self.by_identity.retain(|_, k| k != key);
        self.by_location.retain(|_, k| k != key);
        true
    }
}

/// Counters describing cache behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub used_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub evictions: u64,
}

/// Symbol tables shared by every resolver in the process.
pub struct SymbolCache {
    state: Mutex<CacheState>,
    capacity_bytes: usize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
}

impl SymbolCache {
    /// Create a cache that evicts least recently used tables beyond `capacity_bytes`.
    #[must_use]
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity_bytes,
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the table for `key`, building it with `build` on a miss.
    ///
    /// `location` is where the image currently lives, if anywhere; a
    /// different key seen at the same location means the file there was
    /// replaced.
    pub fn get_or_build<F>(&self, location: Option<&ImageLocation>, key: ImageKey, build: F) -> TableResult
    where
        F: FnOnce() -> TableResult,
    {
        let slot = {
            let mut state = self.lock();
            let at_location = location.and_then(|loc| state.by_location.get(loc));
            let stale: Vec<ImageKey> = [state.by_identity.get(&key.identity), at_location]
                .into_iter()
                .flatten()
                .filter(|old| **old != key)
                .copied()
                .collect();
            for old in stale {
                if state.remove(&old) {
                    debug!("Invalidated symbols for inode {} (binary changed)", old.identity.inode);
                    self.invalidations.fetch_add(1, Ordering::Relaxed);
                }
            }
            state.by_identity.insert(key.identity, key);
            if let Some(loc) = location {
                state.by_location.insert(loc.clone(), key);
            }
            Arc::clone(state.slots.entry(key).or_default())
        };
        slot.last_used.store(self.clock.fetch_add(1, Ordering::Relaxed) + 1, Ordering::Relaxed);

        let mut built = false;
        let result = slot
            .table
            .get_or_init(|| {
                built = true;
                build()
            })
            .clone();

        if built {
            self.misses.fetch_add(1, Ordering::Relaxed);
            let size = match &result {
                Ok(table) => table.estimated_size(),
                Err(_) => NEGATIVE_ENTRY_SIZE,
            };
            self.account(&key, &slot, size);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn account(&self, key: &ImageKey, slot: &Arc<Slot>, size: usize) {
        let mut state = self.lock();
        // The slot may have been invalidated while it was being built.
        if !state.slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            return;
        }
        slot.size.store(size, Ordering::Relaxed);
        state.used_bytes += size;

        while state.used_bytes > self.capacity_bytes && state.slots.len() > 1 {
            let victim = state
                .slots
                .iter()
                .filter(|(k, _)| *k != key)
                .min_by_key(|(_, s)| s.last_used.load(Ordering::Relaxed))
                .map(|(k, _)| *k);
            let Some(victim) = victim else {
                break;
            };
            state.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop whatever is cached for `path`, under any root.
    pub fn invalidate(&self, path: &Path) -> bool {
        let mut state = self.lock();
        let keys: Vec<ImageKey> = state
            .by_location
            .iter()
            .filter(|(loc, _)| loc.path == path)
            .map(|(_, key)| *key)
            .collect();
        let mut removed = false;
        for key in keys {
            if state.remove(&key) {
                self.invalidations.fetch_add(1, Ordering::Relaxed);
                removed = true;
            }
        }
        removed
    }

    pub fn clear(&self) {
        *self.lock() = CacheState::default();
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entries: state.slots.len(),
            used_bytes: state.used_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
