//! In-memory caching in front of a [`PersistentStore`].
//!
//! [`CachingStoreWrapper`] caches single items by kind and key, and whole collections by kind.
//! What happens when a cached entry expires is controlled by [`StalenessPolicy`]:
//!
//! - [`StalenessPolicy::Evict`]: the next read fetches from the store and blocks until the fetch
//!   completes. Store errors are returned to the caller.
//! - [`StalenessPolicy::Refresh`]: the next read fetches from the store and blocks, but if the
//!   fetch fails the expired value is returned instead of the error.
//! - [`StalenessPolicy::RefreshAsync`]: the expired value is returned right away and a fetch is
//!   scheduled on a background thread.
//! - [`StalenessPolicy::CacheForever`]: entries never expire. The cache is the source of truth
//!   and is updated even if a write to the store fails. When the store comes back, it is
//!   re-initialized from the cache.
//!
//! Only one fetch per key is in flight at a time. Readers arriving while a fetch is running
//! either wait for it (when there's nothing cached) or get the cached value.
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::Display,
    hash::Hash,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock, RwLockWriteGuard,
    },
    time::{Duration, Instant},
};

use crate::{Result, Str};

use super::{
    dependency_tracker::DependencyTracker, refresh_thread::RefreshThread, DataKind, FullDataSet,
    ItemDescriptor, KeyedItems, KindAndKey, PersistentStore,
};

/// What to do with cache entries once their TTL has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalenessPolicy {
    /// Entries never expire.
    CacheForever,
    /// Drop expired entries and fetch synchronously on the next read.
    #[default]
    Evict,
    /// Keep expired entries and fetch synchronously on the next read, falling back to the expired
    /// value if the fetch fails.
    Refresh,
    /// Keep expired entries, serve them, and fetch in the background.
    RefreshAsync,
}

/// Configuration for [`CachingStoreWrapper`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long entries stay fresh. A zero TTL disables caching, unless the policy is
    /// [`StalenessPolicy::CacheForever`], which ignores the TTL.
    ///
    /// Defaults to [`CacheConfig::DEFAULT_TTL`].
    pub ttl: Duration,
    /// Defaults to [`StalenessPolicy::Evict`].
    pub staleness: StalenessPolicy,
}

impl CacheConfig {
    /// Default value for [`CacheConfig::ttl`].
    pub const DEFAULT_TTL: Duration = Duration::from_secs(15);

    /// Create a new `CacheConfig` using default configuration.
    pub fn new() -> CacheConfig {
        CacheConfig::default()
    }

    /// Configuration for a cache that never expires.
    pub fn forever() -> CacheConfig {
        CacheConfig::default().with_staleness(StalenessPolicy::CacheForever)
    }

    /// Update TTL with `ttl`.
    pub fn with_ttl(mut self, ttl: Duration) -> CacheConfig {
        self.ttl = ttl;
        self
    }

    /// Update staleness policy with `staleness`.
    pub fn with_staleness(mut self, staleness: StalenessPolicy) -> CacheConfig {
        self.staleness = staleness;
        self
    }

    pub fn is_forever(&self) -> bool {
        self.staleness == StalenessPolicy::CacheForever
    }

    pub fn is_enabled(&self) -> bool {
        self.is_forever() || !self.ttl.is_zero()
    }

    fn expiry(&self) -> Option<Duration> {
        if self.is_forever() {
            None
        } else {
            Some(self.ttl)
        }
    }
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig {
            ttl: CacheConfig::DEFAULT_TTL,
            staleness: StalenessPolicy::default(),
        }
    }
}

/// Availability of the wrapped store, as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStatus {
    pub available: bool,
}

/// Called whenever the wrapped store goes from available to unavailable or back.
pub type StatusListener = Box<dyn Fn(StoreStatus) + Send + Sync>;

/// A [`PersistentStore`] that caches another store.
pub struct CachingStoreWrapper<S> {
    inner: Arc<Inner<S>>,
    /// Only started for [`StalenessPolicy::RefreshAsync`].
    refresher: Option<RefreshThread>,
}

impl<S: PersistentStore + 'static> CachingStoreWrapper<S> {
    /// Wrap `store`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the background refresh thread failed to start.
    pub fn new(store: S, config: CacheConfig) -> Result<CachingStoreWrapper<S>> {
        CachingStoreWrapper::build(store, config, None)
    }

    /// Wrap `store`, calling `listener` on every change of store availability.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the background refresh thread failed to start.
    pub fn new_with_listener(
        store: S,
        config: CacheConfig,
        listener: impl Fn(StoreStatus) + Send + Sync + 'static,
    ) -> Result<CachingStoreWrapper<S>> {
        CachingStoreWrapper::build(store, config, Some(Box::new(listener)))
    }

    fn build(
        store: S,
        config: CacheConfig,
        listener: Option<StatusListener>,
    ) -> Result<CachingStoreWrapper<S>> {
        let refresher = if config.is_enabled() && config.staleness == StalenessPolicy::RefreshAsync
        {
            Some(RefreshThread::start()?)
        } else {
            None
        };

        Ok(CachingStoreWrapper {
            inner: Arc::new(Inner {
                store,
                config,
                items: TtlCache::new(),
                all_items: TtlCache::new(),
                initialized: AtomicBool::new(false),
                available: AtomicBool::new(true),
                listener,
            }),
            refresher,
        })
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn status(&self) -> StoreStatus {
        StoreStatus {
            available: self.inner.available.load(Ordering::SeqCst),
        }
    }

    /// Drop the cached entry for one item, and the cached collection of its kind.
    pub fn invalidate(&self, kind: &DataKind, key: &str) {
        self.inner
            .items
            .remove(&KindAndKey::new(kind.clone(), Str::new(key)));
        self.inner.all_items.remove(kind);
    }

    /// Drop everything cached.
    pub fn invalidate_all(&self) {
        self.inner.items.clear();
        self.inner.all_items.clear();
    }

    /// Stop the background refresh thread, if any. Reads keep working afterwards, but expired
    /// entries are no longer refreshed in the background.
    ///
    /// # Errors
    ///
    /// - [`Error::RefreshThreadPanicked`](crate::Error::RefreshThreadPanicked) if the refresh
    ///   thread has panicked.
    pub fn shutdown(&mut self) -> Result<()> {
        match self.refresher.as_mut() {
            Some(refresher) => refresher.shutdown(),
            None => Ok(()),
        }
    }
}

impl<S: PersistentStore + 'static> PersistentStore for CachingStoreWrapper<S> {
    fn get(&self, kind: &DataKind, key: &str) -> Result<Option<ItemDescriptor>> {
        Inner::read(
            &self.inner,
            self.refresher.as_ref(),
            Inner::items_cache,
            Inner::fetch_item,
            KindAndKey::new(kind.clone(), Str::new(key)),
        )
    }

    fn get_all(&self, kind: &DataKind) -> Result<KeyedItems> {
        Inner::read(
            &self.inner,
            self.refresher.as_ref(),
            Inner::all_items_cache,
            Inner::fetch_all,
            kind.clone(),
        )
    }

    fn init(&self, all_data: FullDataSet) -> Result<()> {
        let inner = &self.inner;
        let cached = inner.config.is_enabled().then(|| all_data.clone());

        let result = inner.store.init(all_data);
        if let Some(all_data) = cached {
            if result.is_ok() || inner.config.is_forever() {
                inner.cache_all(all_data);
                inner.initialized.store(true, Ordering::SeqCst);
            }
        }
        if result.is_ok() {
            inner.initialized.store(true, Ordering::SeqCst);
        }

        // Observed after caching, so that a restore triggered by recovery includes this data.
        inner.observe(&result);
        result
    }

    fn upsert(&self, kind: &DataKind, key: &str, item: ItemDescriptor) -> Result<bool> {
        let inner = &self.inner;
        let result = inner.store.upsert(kind, key, item.clone());
        if inner.config.is_enabled() {
            inner.cache_upsert(kind, key, item, &result);
        }
        inner.observe(&result);
        result
    }

    fn is_initialized(&self) -> bool {
        if self.inner.initialized.load(Ordering::SeqCst) {
            return true;
        }
        let initialized = self.inner.store.is_initialized();
        if initialized {
            self.inner.initialized.store(true, Ordering::SeqCst);
        }
        initialized
    }
}

/// State shared with background refresh jobs.
struct Inner<S> {
    store: S,
    config: CacheConfig,
    items: TtlCache<KindAndKey, Option<ItemDescriptor>>,
    all_items: TtlCache<DataKind, KeyedItems>,
    initialized: AtomicBool,
    available: AtomicBool,
    listener: Option<StatusListener>,
}

type Select<S, K, V> = fn(&Inner<S>) -> &TtlCache<K, V>;
type Fetch<S, K, V> = fn(&S, &K) -> Result<V>;

impl<S: PersistentStore + 'static> Inner<S> {
    fn cache_upsert(
        &self,
        kind: &DataKind,
        key: &str,
        item: ItemDescriptor,
        result: &Result<bool>,
    ) {
        let cache_key = KindAndKey::new(kind.clone(), Str::new(key));
        match result {
            Ok(true) => self.cache_item(cache_key, item),
            Ok(false) => {
                // The store holds something newer than what we've got.
                self.items.remove(&cache_key);
                self.all_items.remove(kind);
            }
            Err(_) if self.config.is_forever() => {
                let newer = match self.items.lookup(&cache_key, None) {
                    Lookup::Fresh(Some(current)) => item.version > current.version,
                    _ => true,
                };
                if newer {
                    self.cache_item(cache_key, item);
                }
            }
            Err(_) => {}
        }
    }

    fn items_cache(&self) -> &TtlCache<KindAndKey, Option<ItemDescriptor>> {
        &self.items
    }

    fn all_items_cache(&self) -> &TtlCache<DataKind, KeyedItems> {
        &self.all_items
    }

    fn fetch_item(store: &S, key: &KindAndKey) -> Result<Option<ItemDescriptor>> {
        store.get(&key.kind, &key.key)
    }

    fn fetch_all(store: &S, kind: &DataKind) -> Result<KeyedItems> {
        store.get_all(kind)
    }

    fn read<K, V>(
        this: &Arc<Self>,
        refresher: Option<&RefreshThread>,
        select: Select<S, K, V>,
        fetch: Fetch<S, K, V>,
        key: K,
    ) -> Result<V>
    where
        K: Eq + Hash + Clone + Display + Send + 'static,
        V: Clone + Send + 'static,
    {
        if !this.config.is_enabled() {
            let result = fetch(&this.store, &key);
            this.observe(&result);
            return result;
        }

        match select(this.as_ref()).lookup(&key, this.config.expiry()) {
            Lookup::Fresh(value) => Ok(value),
            Lookup::Missing => this.load(select, fetch, key),
            Lookup::Stale(stale) => match this.config.staleness {
                StalenessPolicy::Refresh => Ok(this.refresh(select, fetch, key, stale)),
                StalenessPolicy::RefreshAsync => {
                    Inner::schedule_refresh(this, refresher, select, fetch, key);
                    Ok(stale)
                }
                StalenessPolicy::Evict | StalenessPolicy::CacheForever => {
                    this.load(select, fetch, key)
                }
            },
        }
    }

    /// Blocking fetch. Errors propagate and evict whatever was cached.
    fn load<K, V>(&self, select: Select<S, K, V>, fetch: Fetch<S, K, V>, key: K) -> Result<V>
    where
        K: Eq + Hash + Clone,
        V: Clone,
    {
        let cache = select(self);
        cache.with_load_lock(&key, || {
            // Another reader may have loaded it while we were waiting for the lock.
            if let Lookup::Fresh(value) = cache.lookup(&key, self.config.expiry()) {
                return Ok(value);
            }

            let generation = cache.generation();
            let result = fetch(&self.store, &key);
            self.observe(&result);
            let value = result.as_ref().ok().cloned();
            cache.complete_fetch(key.clone(), value, generation);
            result
        })
    }

    /// Blocking fetch that falls back to `stale` on failure. If a fetch for the same key is
    /// already running, `stale` is returned right away.
    fn refresh<K, V>(&self, select: Select<S, K, V>, fetch: Fetch<S, K, V>, key: K, stale: V) -> V
    where
        K: Eq + Hash + Clone + Display,
        V: Clone,
    {
        let cache = select(self);
        let refreshed = cache.try_with_load_lock(&key, || {
            if let Lookup::Fresh(value) = cache.lookup(&key, self.config.expiry()) {
                return Some(value);
            }

            let generation = cache.generation();
            let result = fetch(&self.store, &key);
            self.observe(&result);
            match result {
                Ok(value) => {
                    cache.complete_fetch(key.clone(), Some(value.clone()), generation);
                    Some(value)
                }
                Err(err) => {
                    log::warn!(target: "flag_engine",
                               key:display = key;
                               "failed to refresh cache entry, serving stale value: {err}");
                    None
                }
            }
        });
        refreshed.flatten().unwrap_or(stale)
    }

    fn schedule_refresh<K, V>(
        this: &Arc<Self>,
        refresher: Option<&RefreshThread>,
        select: Select<S, K, V>,
        fetch: Fetch<S, K, V>,
        key: K,
    ) where
        K: Eq + Hash + Clone + Display + Send + 'static,
        V: Send + 'static,
    {
        let Some(refresher) = refresher else {
            return;
        };
        if !select(this.as_ref()).begin_refresh(&key) {
            // Already scheduled.
            return;
        }

        log::debug!(target: "flag_engine", key:display = key; "scheduling cache refresh");
        let inner = Arc::clone(this);
        let job_key = key.clone();
        let submitted = refresher.submit(Box::new(move || {
            let cache = select(inner.as_ref());
            let _guard = RefreshGuard {
                cache,
                key: &job_key,
            };

            let generation = cache.generation();
            let result = fetch(&inner.store, &job_key);
            inner.observe(&result);
            match result {
                Ok(value) => cache.complete_fetch(job_key.clone(), Some(value), generation),
                Err(err) => {
                    log::warn!(target: "flag_engine",
                               key:display = job_key;
                               "background cache refresh failed: {err}");
                }
            }
        }));

        if !submitted {
            select(this.as_ref()).end_refresh(&key);
        }
    }

    fn cache_item(&self, key: KindAndKey, item: ItemDescriptor) {
        if self.config.is_forever() {
            self.all_items.update(&key.kind, |items| {
                match items.iter_mut().find(|(k, _)| *k == key.key) {
                    Some((_, existing)) => *existing = item.clone(),
                    None => items.push((key.key.clone(), item.clone())),
                }
            });
        } else {
            self.all_items.remove(&key.kind);
        }
        self.items.insert(key, Some(item));
    }

    fn cache_all(&self, all_data: FullDataSet) {
        self.items.clear();
        self.all_items.clear();
        for (kind, items) in all_data {
            for (key, item) in &items {
                self.items.insert(
                    KindAndKey::new(kind.clone(), key.clone()),
                    Some(item.clone()),
                );
            }
            self.all_items.insert(kind, items);
        }
    }

    /// Track store availability from the outcome of a store call.
    fn observe<T>(&self, result: &Result<T>) {
        let available = result.is_ok();
        if self.available.swap(available, Ordering::SeqCst) == available {
            return;
        }

        match result {
            Ok(_) => {
                log::warn!(target: "flag_engine", "persistent store is available again");
                if self.config.is_forever() && self.initialized.load(Ordering::SeqCst) {
                    if let Err(err) = self.restore_store() {
                        log::warn!(target: "flag_engine",
                                   "failed to restore persistent store from cache: {err}");
                        self.available.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            }
            Err(err) => {
                log::warn!(target: "flag_engine", "persistent store is unavailable: {err}");
            }
        }

        if let Some(listener) = &self.listener {
            listener(StoreStatus { available });
        }
    }

    /// Write everything cached back to the store. Only meaningful when caching forever, as the
    /// cache then holds every write, including those the store missed.
    fn restore_store(&self) -> Result<()> {
        let mut by_kind: BTreeMap<DataKind, BTreeMap<Str, ItemDescriptor>> = BTreeMap::new();
        for (kind, items) in self.all_items.snapshot() {
            by_kind
                .entry(kind)
                .or_default()
                .extend(items.into_iter());
        }
        for (key, item) in self.items.snapshot() {
            if let Some(item) = item {
                by_kind.entry(key.kind).or_default().insert(key.key, item);
            }
        }

        let all_data: FullDataSet = by_kind
            .into_iter()
            .map(|(kind, items)| (kind, items.into_iter().collect()))
            .collect();
        let all_data = DependencyTracker::sort_all_collections(all_data);
        log::debug!(target: "flag_engine", "re-initializing persistent store from cache");
        self.store.init(all_data)
    }
}

/// Clears the in-flight mark of a background refresh, even if the job panics.
struct RefreshGuard<'a, K: Eq + Hash, V> {
    cache: &'a TtlCache<K, V>,
    key: &'a K,
}

impl<K: Eq + Hash, V> Drop for RefreshGuard<'_, K, V> {
    fn drop(&mut self) {
        self.cache.end_refresh(self.key);
    }
}

enum Lookup<V> {
    Fresh(V),
    Stale(V),
    Missing,
}

struct CacheEntry<V> {
    value: V,
    loaded_at: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V) -> CacheEntry<V> {
        CacheEntry {
            value,
            loaded_at: Instant::now(),
        }
    }
}

/// A map of entries stamped with their load time, plus per-key coordination of fetches.
///
/// Values fetched from the store go through [`TtlCache::complete_fetch`], which drops them if
/// the cache was written to since the fetch started. Otherwise a fetch that read an old version
/// could overwrite a newer item cached by a concurrent write.
struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    /// Bumped by every write except completed fetches. Only changed under the `entries` write
    /// lock.
    generation: AtomicU64,
    /// Held while fetching a key. Entries are removed once nobody holds or waits for them.
    load_locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
    /// Keys with a background refresh scheduled or running.
    refreshing: Mutex<HashSet<K>>,
}

impl<K: Eq + Hash, V> TtlCache<K, V> {
    fn new() -> TtlCache<K, V> {
        TtlCache {
            entries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            load_locks: Mutex::new(HashMap::new()),
            refreshing: Mutex::new(HashSet::new()),
        }
    }

    fn lookup(&self, key: &K, ttl: Option<Duration>) -> Lookup<V>
    where
        V: Clone,
    {
        let entries = self
            .entries
            .read()
            .expect("thread holding cache lock should not panic");
        match entries.get(key) {
            None => Lookup::Missing,
            Some(entry) => match ttl {
                Some(ttl) if entry.loaded_at.elapsed() >= ttl => Lookup::Stale(entry.value.clone()),
                _ => Lookup::Fresh(entry.value.clone()),
            },
        }
    }

    /// Take the write lock for a change that invalidates fetches in flight.
    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, CacheEntry<V>>> {
        let entries = self
            .entries
            .write()
            .expect("thread holding cache lock should not panic");
        self.generation.fetch_add(1, Ordering::SeqCst);
        entries
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn insert(&self, key: K, value: V) {
        self.write().insert(key, CacheEntry::new(value));
    }

    /// Store the outcome of a fetch that started at `generation`: the fetched value, or `None`
    /// to drop the entry after a failure. Does nothing if the cache has been written since.
    fn complete_fetch(&self, key: K, value: Option<V>, generation: u64) {
        let mut entries = self
            .entries
            .write()
            .expect("thread holding cache lock should not panic");
        if self.generation() != generation {
            return;
        }
        match value {
            Some(value) => entries.insert(key, CacheEntry::new(value)),
            None => entries.remove(&key),
        };
    }

    /// Modify an entry in place if present, keeping its load time.
    fn update(&self, key: &K, f: impl FnOnce(&mut V)) {
        if let Some(entry) = self.write().get_mut(key) {
            f(&mut entry.value);
        }
    }

    fn remove(&self, key: &K) {
        self.write().remove(key);
    }

    fn clear(&self) {
        self.write().clear();
    }

    fn snapshot(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.entries
            .read()
            .expect("thread holding cache lock should not panic")
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Run `f` holding the load lock of `key`, waiting for it if needed.
    fn with_load_lock<R>(&self, key: &K, f: impl FnOnce() -> R) -> R
    where
        K: Clone,
    {
        self.load_lock_scope(key, |lock| {
            let _guard = lock
                .lock()
                .expect("thread holding load lock should not panic");
            f()
        })
    }

    /// Run `f` holding the load lock of `key`. Returns `None` without running `f` if another
    /// thread holds the lock.
    fn try_with_load_lock<R>(&self, key: &K, f: impl FnOnce() -> R) -> Option<R>
    where
        K: Clone,
    {
        self.load_lock_scope(key, |lock| {
            let _guard = lock.try_lock().ok()?;
            Some(f())
        })
    }

    fn load_lock_scope<R>(&self, key: &K, f: impl FnOnce(&Mutex<()>) -> R) -> R
    where
        K: Clone,
    {
        let lock = Arc::clone(
            self.load_locks
                .lock()
                .expect("thread holding cache lock should not panic")
                .entry(key.clone())
                .or_default(),
        );

        let result = f(&lock);

        let mut locks = self
            .load_locks
            .lock()
            .expect("thread holding cache lock should not panic");
        // One reference is in the map and one is ours. Any other belongs to a thread using the lock.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
        result
    }

    #[cfg(test)]
    fn load_lock_count(&self) -> usize {
        self.load_locks
            .lock()
            .expect("thread holding cache lock should not panic")
            .len()
    }

    /// Mark `key` as being refreshed. Returns `false` if it already was.
    fn begin_refresh(&self, key: &K) -> bool
    where
        K: Clone,
    {
        self.refreshing
            .lock()
            .expect("thread holding cache lock should not panic")
            .insert(key.clone())
    }

    fn end_refresh(&self, key: &K) {
        self.refreshing
            .lock()
            .expect("thread holding cache lock should not panic")
            .remove(key);
    }
}
