/// Cost-bounded LRU cache of lockable entries
///
/// Entries live behind `Arc<RwLock<T>>` so a lease (an owned read or write
/// guard) keeps its entry alive and pins it: eviction only considers entries
/// nobody holds. Allocation on miss happens under the cache lock, so two
/// concurrent misses on the same key load once.

pub mod image_cache;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

pub type ReadLease<T> = ArcRwLockReadGuard<RawRwLock, T>;
pub type WriteLease<T> = ArcRwLockWriteGuard<RawRwLock, T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    Inserted,
    AlreadyPresent,
    /// The value cannot be cached under its key
    Failed,
}

struct CacheEntry<T> {
    data: Arc<RwLock<T>>,
    cost: usize,
    last_used: u64,
}

struct CacheState<T> {
    entries: HashMap<i32, CacheEntry<T>>,
    cost: usize,
    tick: u64,
}

impl<T> CacheState<T> {
    fn touch(&mut self, key: i32) -> Option<Arc<RwLock<T>>> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(&key).map(|entry| {
            entry.last_used = tick;
            Arc::clone(&entry.data)
        })
    }

    fn insert(&mut self, key: i32, value: T, cost: usize) -> Arc<RwLock<T>> {
        self.tick += 1;
        let data = Arc::new(RwLock::new(value));
        self.entries.insert(
            key,
            CacheEntry { data: Arc::clone(&data), cost, last_used: self.tick },
        );
        self.cost += cost;
        data
    }

    /// Drop least recently used, unleased entries until the cost fits.
    fn evict_to(&mut self, quota: usize, keep: i32) {
        while self.cost > quota {
            let victim = self
                .entries
                .iter()
                .filter(|(key, entry)| **key != keep && Arc::strong_count(&entry.data) == 1)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| *key);

            let Some(key) = victim else {
                tracing::debug!("[cache] over quota ({} > {}) but every entry is leased", self.cost, quota);
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.cost -= entry.cost;
                tracing::trace!("[cache] evicted {}", key);
            }
        }
    }
}

pub struct Cache<T> {
    state: Mutex<CacheState<T>>,
    quota: usize,
}

impl<T> Cache<T> {
    pub fn new(quota: usize) -> Self {
        Self {
            state: Mutex::new(CacheState { entries: HashMap::new(), cost: 0, tick: 0 }),
            quota,
        }
    }

    /// Entry for `key`, loading it with `load` on a miss.
    ///
    /// `load` returns the value and its cost, or `None` when the key has no
    /// backing data; nothing is cached in that case.
    pub fn get_or_load<E, F>(&self, key: i32, load: F) -> Result<Option<Arc<RwLock<T>>>, E>
    where
        F: FnOnce() -> Result<Option<(T, usize)>, E>,
    {
        let mut state = self.state.lock();
        if let Some(data) = state.touch(key) {
            return Ok(Some(data));
        }
        Self::allocate(&mut state, self.quota, key, load)
    }

    /// Same as [`Cache::get_or_load`] but gives up instead of waiting for the cache lock.
    pub fn try_get_or_load<E, F>(&self, key: i32, load: F) -> Result<Option<Arc<RwLock<T>>>, E>
    where
        F: FnOnce() -> Result<Option<(T, usize)>, E>,
    {
        let Some(mut state) = self.state.try_lock() else {
            return Ok(None);
        };
        if let Some(data) = state.touch(key) {
            return Ok(Some(data));
        }
        Self::allocate(&mut state, self.quota, key, load)
    }

    fn allocate<E, F>(state: &mut CacheState<T>, quota: usize, key: i32, load: F) -> Result<Option<Arc<RwLock<T>>>, E>
    where
        F: FnOnce() -> Result<Option<(T, usize)>, E>,
    {
        let Some((value, cost)) = load()? else {
            return Ok(None);
        };
        let data = state.insert(key, value, cost);
        state.evict_to(quota, key);
        Ok(Some(data))
    }

    /// Entry for `key` if cached, without loading
    pub fn lookup(&self, key: i32) -> Option<Arc<RwLock<T>>> {
        self.state.lock().touch(key)
    }

    /// Insert `value` unless `key` is already cached.
    pub fn seed(&self, key: i32, value: T, cost: usize) -> SeedOutcome {
        let mut state = self.state.lock();
        if state.entries.contains_key(&key) {
            return SeedOutcome::AlreadyPresent;
        }
        state.insert(key, value, cost);
        state.evict_to(self.quota, key);
        SeedOutcome::Inserted
    }

    /// Drop `key`, waiting for outstanding leases to be released.
    pub fn remove(&self, key: i32) -> bool {
        let entry = {
            let mut state = self.state.lock();
            let entry = state.entries.remove(&key);
            if let Some(entry) = &entry {
                state.cost -= entry.cost;
            }
            entry
        };
        match entry {
            Some(entry) => {
                // blocks until every holder is gone
                drop(entry.data.write());
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: i32) -> bool {
        self.state.lock().entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cost(&self) -> usize {
        self.state.lock().cost
    }

    pub fn quota(&self) -> usize {
        self.quota
    }
}

impl<T> std::fmt::Debug for Cache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Cache")
            .field("entries", &state.entries.len())
            .field("cost", &state.cost)
            .field("quota", &self.quota)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn load(value: &'static str) -> impl FnOnce() -> Result<Option<(String, usize)>, Infallible> {
        move || Ok(Some((value.to_string(), 10)))
    }

    #[test]
    fn test_loads_once() {
        let cache: Cache<String> = Cache::new(100);
        let first = cache.get_or_load(1, load("a")).unwrap().unwrap();
        let second = cache.get_or_load(1, load("b")).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second.read(), "a");
        assert_eq!(cache.cost(), 10);
    }

    #[test]
    fn test_missing_is_not_cached() {
        let cache: Cache<String> = Cache::new(100);
        let got = cache.get_or_load(1, || Ok::<_, Infallible>(None)).unwrap();
        assert!(got.is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction() {
        let cache: Cache<String> = Cache::new(25);
        drop(cache.get_or_load(1, load("a")).unwrap());
        drop(cache.get_or_load(2, load("b")).unwrap());
        // touch 1 so 2 becomes the oldest
        drop(cache.lookup(1));
        drop(cache.get_or_load(3, load("c")).unwrap());

        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
        assert_eq!(cache.cost(), 20);
    }

    #[test]
    fn test_leased_entries_are_pinned() {
        let cache: Cache<String> = Cache::new(15);
        let held = cache.get_or_load(1, load("a")).unwrap().unwrap();
        let _lease = held.read_arc();
        drop(cache.get_or_load(2, load("b")).unwrap());

        assert!(cache.contains(1));
        assert!(cache.contains(2));
        assert_eq!(cache.cost(), 20);
    }

    #[test]
    fn test_seed_and_remove() {
        let cache: Cache<String> = Cache::new(100);
        assert_eq!(cache.seed(4, "x".to_string(), 1), SeedOutcome::Inserted);
        assert_eq!(cache.seed(4, "y".to_string(), 1), SeedOutcome::AlreadyPresent);
        assert_eq!(*cache.lookup(4).unwrap().read(), "x");

        assert!(cache.remove(4));
        assert!(!cache.remove(4));
        assert_eq!(cache.cost(), 0);
    }
}
