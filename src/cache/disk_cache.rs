//! A small key/value cache built from a [`MapIndex`] and a [`DiskStore`].
//!
//! Every put goes through the disk tier: the value stays reachable through
//! its placeholder until the worker has written it, and is read back from
//! the data file (or the cached copy of a caching marker) afterwards.

use std::sync::Arc;

use crate::cache::codec::ValueResolver;
use crate::cache::element::{now_millis, CacheKey, CacheValue, Element};
use crate::cache::index::{MapIndex, SubstituteIndex};
use crate::cache::store::{DiskStore, DiskStoreError, FlushHandle};
use crate::config::Config;
use crate::transfer::allocator::Region;

pub struct DiskCache<K, V> {
    index: Arc<MapIndex<K, V>>,
    store: DiskStore<K, V>,
}

impl<K: CacheKey, V: CacheValue> DiskCache<K, V> {
    pub fn open(config: Config) -> Result<Self, DiskStoreError> {
        Self::open_with(config, None)
    }

    pub fn open_with(
        config: Config,
        resolver: Option<Arc<dyn ValueResolver<V>>>,
    ) -> Result<Self, DiskStoreError> {
        let index = Arc::new(MapIndex::new(config.eviction.index_segments));
        let store = DiskStore::open_with(config, resolver)?;
        store.bind(index.clone())?;
        Ok(Self { index, store })
    }

    pub fn insert(&self, key: K, value: V) {
        self.put(Element::new(key, value));
    }

    /// Store `element`, replacing any previous value for its key.
    pub fn put(&self, element: Element<K, V>) {
        let key = element.key.clone();
        let substitute = self.store.create(key.clone(), element);
        if let Some(previous) = self.index.install(key.clone(), substitute.clone()) {
            self.store.free(self.index.lock_for(&key), &previous);
        }
        self.store.put(&substitute);
    }

    /// Current element for `key`. Expired entries are removed and reported
    /// as misses.
    pub fn get(&self, key: &K) -> Option<Arc<Element<K, V>>> {
        let lock = self.index.lock_for(key);
        let guard = lock.read();
        let substitute = self.index.peek(key)?;

        if substitute.is_expired(now_millis()) {
            drop(guard);
            if self.index.evict(key, &substitute) {
                self.store.free(self.index.lock_for(key), &substitute);
            }
            return None;
        }
        self.store.retrieve(key, &substitute)
    }

    pub fn remove(&self, key: &K) -> bool {
        match self.index.remove(key) {
            Some(substitute) => {
                self.store.free(self.index.lock_for(key), &substitute);
                true
            }
            None => false,
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.index.keys()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Regions held by the current markers.
    pub fn regions(&self) -> Vec<(K, Region)> {
        self.index
            .keys()
            .into_iter()
            .filter_map(|key| {
                let region = self.index.peek(&key)?.region()?;
                Some((key, region))
            })
            .collect()
    }

    pub fn flush(&self) -> FlushHandle {
        self.store.flush()
    }

    pub fn expire(&self) -> usize {
        self.store.expire_elements()
    }

    pub fn memory_resident(&self) -> usize {
        self.store.memory_count()
    }

    pub fn disk_resident(&self) -> usize {
        self.store.disk_count()
    }

    pub fn store(&self) -> &DiskStore<K, V> {
        &self.store
    }

    pub fn index(&self) -> &Arc<MapIndex<K, V>> {
        &self.index
    }

    /// Unbind the store, persisting the index in persistent mode.
    pub fn close(self) -> Result<(), DiskStoreError> {
        self.store.unbind()
    }
}
