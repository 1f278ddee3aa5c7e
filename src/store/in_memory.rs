use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock,
};

use crate::{Result, Str};

use super::{DataKind, FullDataSet, ItemDescriptor, KeyedItems, PersistentStore};

/// `InMemoryStore` is a [`PersistentStore`] that keeps everything in process memory. It allows
/// concurrent access for readers and writers.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: RwLock<StoreData>,
}

#[derive(Debug, Default)]
struct StoreData {
    /// Only set by `init()`. Upserts alone don't make a store initialized.
    initialized: bool,
    items: HashMap<DataKind, BTreeMap<Str, ItemDescriptor>>,
}

impl InMemoryStore {
    pub fn new() -> InMemoryStore {
        InMemoryStore::default()
    }
}

impl PersistentStore for InMemoryStore {
    fn get(&self, kind: &DataKind, key: &str) -> Result<Option<ItemDescriptor>> {
        let data = self
            .data
            .read()
            .expect("thread holding store lock should not panic");
        Ok(data
            .items
            .get(kind)
            .and_then(|items| items.get(key))
            .cloned())
    }

    fn get_all(&self, kind: &DataKind) -> Result<KeyedItems> {
        let data = self
            .data
            .read()
            .expect("thread holding store lock should not panic");
        Ok(data
            .items
            .get(kind)
            .map(|items| {
                items
                    .iter()
                    .map(|(key, item)| (key.clone(), item.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn init(&self, all_data: FullDataSet) -> Result<()> {
        // Building the new map before taking the lock to minimize lock span.
        let new_data = all_data
            .into_iter()
            .map(|(kind, items)| (kind, items.into_iter().collect()))
            .collect();

        let mut data = self
            .data
            .write()
            .expect("thread holding store lock should not panic");
        *data = StoreData {
            initialized: true,
            items: new_data,
        };
        Ok(())
    }

    fn upsert(&self, kind: &DataKind, key: &str, item: ItemDescriptor) -> Result<bool> {
        let mut data = self
            .data
            .write()
            .expect("thread holding store lock should not panic");
        let items = data.items.entry(kind.clone()).or_default();
        match items.get(key) {
            Some(current) if current.version >= item.version => Ok(false),
            _ => {
                items.insert(Str::new(key), item);
                Ok(true)
            }
        }
    }

    fn is_initialized(&self) -> bool {
        self.data
            .read()
            .expect("thread holding store lock should not panic")
            .initialized
    }
}
