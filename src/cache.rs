//! Bounded least-recently-used cache of engine resources.

use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;

use crate::error::{Error, Result};

/// Default number of cached resources
pub const DEFAULT_RESOURCE_CACHE_SIZE: usize = 8;

type Supplier<K, V> = Box<dyn Fn(&K) -> Result<V> + Send + Sync>;
type CloseHook<V> = Box<dyn Fn(V) + Send + Sync>;

/// LRU cache creating values on demand and closing them on eviction
///
/// Each value is closed exactly once: when it is evicted, or on
/// [`ResourceCache::clear`]. The close hook always runs after the lock has
/// been released.
pub struct ResourceCache<K, V> {
    entries: Mutex<LruCache<K, V>>,
    supplier: Supplier<K, V>,
    close: CloseHook<V>,
}

impl<K, V> ResourceCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a cache holding at most `max_size` values
    pub fn new<S, C>(max_size: usize, supplier: S, close: C) -> Result<Self>
    where
        S: Fn(&K) -> Result<V> + Send + Sync + 'static,
        C: Fn(V) + Send + Sync + 'static,
    {
        let capacity = NonZeroUsize::new(max_size)
            .ok_or_else(|| Error::config("Resource cache size must be greater than zero"))?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
            supplier: Box::new(supplier),
            close: Box::new(close),
        })
    }

    /// Get the value for `key`, creating it when missing
    pub fn get(&self, key: &K) -> Result<V> {
        let (value, evicted) = {
            let mut entries = self.lock();
            if let Some(value) = entries.get(key) {
                return Ok(value.clone());
            }
            let value = (self.supplier)(key)?;
            let evicted = entries.push(key.clone(), value.clone());
            (value, evicted)
        };

        if let Some((_, evicted)) = evicted {
            tracing::trace!("evicting least recently used resource");
            (self.close)(evicted);
        }
        Ok(value)
    }

    /// Check whether `key` is cached without touching its recency
    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains(key)
    }

    /// Close and remove every cached value
    pub fn clear(&self) {
        let drained = {
            let mut entries = self.lock();
            let mut drained = Vec::with_capacity(entries.len());
            while let Some((_, value)) = entries.pop_lru() {
                drained.push(value);
            }
            drained
        };
        for value in drained {
            (self.close)(value);
        }
    }

    /// Get the number of cached values
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the maximum number of cached values
    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<K, V>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> fmt::Debug for ResourceCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCache").field("len", &self.lock().len()).finish()
    }
}
