//! Fixed-capacity least-recently-used cache.
use std::{borrow::Borrow, hash::Hash, num::NonZeroUsize};

/// A cache holding at most `capacity` entries.
///
/// When a new key would exceed capacity, the least recently accessed entry is evicted. Both
/// [`get`](LruCache::get) and [`put`](LruCache::put) count as access. A capacity of zero retains
/// nothing.
#[derive(Debug)]
pub struct LruCache<K: Hash + Eq, V> {
    inner: Option<lru::LruCache<K, V>>,
}

impl<K: Hash + Eq, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> LruCache<K, V> {
        LruCache {
            inner: NonZeroUsize::new(capacity).map(lru::LruCache::new),
        }
    }

    /// Look up a value, marking it as most recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.as_mut()?.get(key)
    }

    /// Insert or replace a value, marking it as most recently used. Returns the evicted entry, if
    /// any.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        match &mut self.inner {
            Some(cache) => {
                // `push` also hands back the old entry when replacing a key.
                let displaced = cache.push(key, value);
                displaced.filter(|(k, _)| !cache.contains(k))
            }
            None => Some((key, value)),
        }
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.as_mut()?.pop(key)
    }

    pub fn clear(&mut self) {
        if let Some(cache) = &mut self.inner {
            cache.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |cache| cache.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.as_ref().map_or(0, |cache| cache.cap().get())
    }
}
