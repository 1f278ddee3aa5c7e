//! Storage of flags and segments.
//!
//! Items are addressed by [`DataKind`] and key. A [`PersistentStore`] holds [`ItemDescriptor`]s:
//! a version plus the item, or no item for deleted items (tombstones). Writes only apply when the
//! incoming version is newer than the stored one.
//!
//! [`CachingStoreWrapper`] adds an in-memory cache in front of any store, and [`StoreGetters`]
//! adapts a store for the evaluator.
use std::{fmt, sync::Arc};

use derive_more::From;
use serde_json::Value;

use crate::{
    big_segments::{BigSegmentStoreWrapper, BigSegmentsQueryResult},
    compiled::{FeatureFlag, Segment},
    eval::Getters,
    Result, Str,
};

pub mod caching_store;
pub mod dependency_tracker;
mod in_memory;
pub mod lru;
mod refresh_thread;

pub use caching_store::{CacheConfig, CachingStoreWrapper, StalenessPolicy, StoreStatus};
pub use dependency_tracker::DependencyTracker;
pub use in_memory::InMemoryStore;

/// Kind of stored item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataKind {
    Segments,
    Features,
    /// Items this crate doesn't interpret. Stored and cached like any other kind.
    Custom(Str),
}

impl DataKind {
    pub fn namespace(&self) -> &str {
        match self {
            DataKind::Segments => "segments",
            DataKind::Features => "features",
            DataKind::Custom(namespace) => namespace.as_str(),
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

/// Identifies a stored item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KindAndKey {
    pub kind: DataKind,
    pub key: Str,
}

impl KindAndKey {
    pub fn new(kind: DataKind, key: impl Into<Str>) -> KindAndKey {
        KindAndKey {
            kind,
            key: key.into(),
        }
    }
}

impl fmt::Display for KindAndKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

/// A stored item.
#[derive(Debug, Clone, PartialEq, From)]
pub enum Item {
    Flag(Arc<FeatureFlag>),
    Segment(Arc<Segment>),
    Custom(Arc<Value>),
}

/// Versioned item as held by a store. `item` is `None` for deleted items.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemDescriptor {
    pub version: u64,
    pub item: Option<Item>,
}

impl ItemDescriptor {
    pub fn new(version: u64, item: impl Into<Item>) -> ItemDescriptor {
        ItemDescriptor {
            version,
            item: Some(item.into()),
        }
    }

    /// Descriptor of a deleted item.
    pub fn tombstone(version: u64) -> ItemDescriptor {
        ItemDescriptor {
            version,
            item: None,
        }
    }

    /// Descriptor of a flag, using the flag's version. Flags marked deleted become tombstones.
    pub fn flag(flag: FeatureFlag) -> ItemDescriptor {
        if flag.deleted {
            ItemDescriptor::tombstone(flag.version)
        } else {
            ItemDescriptor::new(flag.version, Arc::new(flag))
        }
    }

    /// Descriptor of a segment, using the segment's version. Segments marked deleted become
    /// tombstones.
    pub fn segment(segment: Segment) -> ItemDescriptor {
        if segment.deleted {
            ItemDescriptor::tombstone(segment.version)
        } else {
            ItemDescriptor::new(segment.version, Arc::new(segment))
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.item.is_none()
    }

    pub fn as_flag(&self) -> Option<&Arc<FeatureFlag>> {
        match &self.item {
            Some(Item::Flag(flag)) => Some(flag),
            _ => None,
        }
    }

    pub fn as_segment(&self) -> Option<&Arc<Segment>> {
        match &self.item {
            Some(Item::Segment(segment)) => Some(segment),
            _ => None,
        }
    }
}

/// Items of one kind, by key.
pub type KeyedItems = Vec<(Str, ItemDescriptor)>;

/// Complete data set, grouped by kind.
pub type FullDataSet = Vec<(DataKind, KeyedItems)>;

/// Persistent storage of flags and segments.
///
/// `upsert` must only apply an item whose version is greater than the stored version. Tombstones
/// take part in version comparisons like any other item.
pub trait PersistentStore: Send + Sync {
    fn get(&self, kind: &DataKind, key: &str) -> Result<Option<ItemDescriptor>>;

    fn get_all(&self, kind: &DataKind) -> Result<KeyedItems>;

    /// Replace all data.
    fn init(&self, data: FullDataSet) -> Result<()>;

    /// Insert or update an item. Returns `false` if the store already had the same or a newer
    /// version.
    fn upsert(&self, kind: &DataKind, key: &str, item: ItemDescriptor) -> Result<bool>;

    fn is_initialized(&self) -> bool;
}

impl<T: PersistentStore + ?Sized> PersistentStore for Arc<T> {
    fn get(&self, kind: &DataKind, key: &str) -> Result<Option<ItemDescriptor>> {
        (**self).get(kind, key)
    }

    fn get_all(&self, kind: &DataKind) -> Result<KeyedItems> {
        (**self).get_all(kind)
    }

    fn init(&self, data: FullDataSet) -> Result<()> {
        (**self).init(data)
    }

    fn upsert(&self, kind: &DataKind, key: &str, item: ItemDescriptor) -> Result<bool> {
        (**self).upsert(kind, key, item)
    }

    fn is_initialized(&self) -> bool {
        (**self).is_initialized()
    }
}

/// [`Getters`] reading from a [`PersistentStore`].
///
/// Store errors are logged and treated as missing items, so evaluation can carry on.
pub struct StoreGetters<'a, S: ?Sized> {
    store: &'a S,
    big_segments: Option<&'a BigSegmentStoreWrapper>,
}

impl<S: ?Sized> Clone for StoreGetters<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: ?Sized> Copy for StoreGetters<'_, S> {}

impl<'a, S: PersistentStore + ?Sized> StoreGetters<'a, S> {
    pub fn new(store: &'a S) -> StoreGetters<'a, S> {
        StoreGetters {
            store,
            big_segments: None,
        }
    }

    pub fn with_big_segments(mut self, big_segments: &'a BigSegmentStoreWrapper) -> Self {
        self.big_segments = Some(big_segments);
        self
    }

    fn get_item(&self, kind: &DataKind, key: &str) -> Option<Item> {
        match self.store.get(kind, key) {
            Ok(descriptor) => descriptor?.item,
            Err(err) => {
                log::warn!(target: "flag_engine",
                           kind:display = kind,
                           key;
                           "failed to read item from store: {err}");
                None
            }
        }
    }
}

impl<S: PersistentStore + ?Sized> Getters for StoreGetters<'_, S> {
    fn get_flag(&self, key: &str) -> Option<Arc<FeatureFlag>> {
        match self.get_item(&DataKind::Features, key)? {
            Item::Flag(flag) => Some(flag),
            _ => None,
        }
    }

    fn get_segment(&self, key: &str) -> Option<Arc<Segment>> {
        match self.get_item(&DataKind::Segments, key)? {
            Item::Segment(segment) => Some(segment),
            _ => None,
        }
    }

    fn get_big_segment_membership(&self, context_hash: &str) -> Option<BigSegmentsQueryResult> {
        Some(self.big_segments?.get_membership(context_hash))
    }
}
