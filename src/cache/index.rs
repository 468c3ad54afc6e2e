//! The key → substitute index the disk tier works against.
//!
//! The index is owned by the surrounding cache. The store only touches it
//! through [`SubstituteIndex`]: insert-if-absent on reload, compare-and-swap
//! "fault" when a write completes, conditional eviction, random sampling for
//! capacity enforcement, and a full clear when a persisted index turns out
//! to be corrupt.
//!
//! [`MapIndex`] is a segmented in-process implementation used by
//! [`DiskCache`](crate::cache::disk_cache::DiskCache).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;

use crate::cache::element::{hash_key, CacheKey, CacheValue};
use crate::cache::substitute::Substitute;

/// Exclusion lock guarding reads of the markers in one index segment.
///
/// Readers of a marker's bytes hold it shared; freeing a marker's region
/// takes it exclusively so the region cannot be reused under a reader.
pub type SegmentLock = Arc<RwLock<()>>;

/// Primitives the disk tier needs from the index.
pub trait SubstituteIndex<K, V>: Send + Sync {
    /// Snapshot of every key.
    fn keys(&self) -> Vec<K>;

    /// Current substitute without counting an access.
    fn peek(&self, key: &K) -> Option<Substitute<K, V>>;

    /// Insert unless the key is present. Returns `true` if inserted.
    fn insert_if_absent(&self, key: K, substitute: Substitute<K, V>) -> bool;

    /// Replace `expected` with `replacement` if `expected` is still mapped.
    fn fault(&self, key: &K, expected: &Substitute<K, V>, replacement: Substitute<K, V>) -> bool;

    /// Remove the key if it still maps to `expected`.
    fn evict(&self, key: &K, expected: &Substitute<K, V>) -> bool;

    /// Up to `size` entries accepted by `filter`, starting from a random
    /// position (or the segment of `key_hint`).
    fn random_sample(
        &self,
        filter: &dyn Fn(&Substitute<K, V>) -> bool,
        size: usize,
        key_hint: Option<&K>,
    ) -> Vec<(K, Substitute<K, V>)>;

    /// Exclusion lock for the segment holding `key`.
    fn lock_for(&self, key: &K) -> SegmentLock;

    /// Drop every entry.
    fn clear(&self);
}

struct Segment<K, V> {
    lock: SegmentLock,
    entries: RwLock<HashMap<K, Substitute<K, V>>>,
}

/// Segmented hash map index.
pub struct MapIndex<K, V> {
    segments: Box<[Segment<K, V>]>,
    mask: usize,
}

impl<K: CacheKey, V: CacheValue> MapIndex<K, V> {
    /// Create an index with `segments` segments, rounded up to a power of two.
    pub fn new(segments: usize) -> Self {
        let count = segments.max(1).next_power_of_two();
        let segments = (0..count)
            .map(|_| Segment {
                lock: Arc::new(RwLock::new(())),
                entries: RwLock::new(HashMap::new()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            segments,
            mask: count - 1,
        }
    }

    fn segment(&self, key: &K) -> &Segment<K, V> {
        &self.segments[self.segment_index(key)]
    }

    fn segment_index(&self, key: &K) -> usize {
        (hash_key(key) as usize) & self.mask
    }

    /// Map `key` to `substitute`, returning the previous substitute.
    pub fn install(&self, key: K, substitute: Substitute<K, V>) -> Option<Substitute<K, V>> {
        self.segment(&key).entries.write().insert(key, substitute)
    }

    /// Unconditionally remove `key`.
    pub fn remove(&self, key: &K) -> Option<Substitute<K, V>> {
        self.segment(key).entries.write().remove(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.segment(key).entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.entries.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.entries.read().is_empty())
    }
}

impl<K: CacheKey, V: CacheValue> SubstituteIndex<K, V> for MapIndex<K, V> {
    fn keys(&self) -> Vec<K> {
        self.segments
            .iter()
            .flat_map(|s| s.entries.read().keys().cloned().collect::<Vec<_>>())
            .collect()
    }

    fn peek(&self, key: &K) -> Option<Substitute<K, V>> {
        self.segment(key).entries.read().get(key).cloned()
    }

    fn insert_if_absent(&self, key: K, substitute: Substitute<K, V>) -> bool {
        let mut entries = self.segment(&key).entries.write();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, substitute);
        true
    }

    fn fault(&self, key: &K, expected: &Substitute<K, V>, replacement: Substitute<K, V>) -> bool {
        let mut entries = self.segment(key).entries.write();
        match entries.get_mut(key) {
            Some(current) if current.same(expected) => {
                *current = replacement;
                true
            }
            _ => false,
        }
    }

    fn evict(&self, key: &K, expected: &Substitute<K, V>) -> bool {
        let mut entries = self.segment(key).entries.write();
        if entries.get(key).is_some_and(|current| current.same(expected)) {
            entries.remove(key);
            true
        } else {
            false
        }
    }

    fn random_sample(
        &self,
        filter: &dyn Fn(&Substitute<K, V>) -> bool,
        size: usize,
        key_hint: Option<&K>,
    ) -> Vec<(K, Substitute<K, V>)> {
        let mut sample = Vec::with_capacity(size);
        if size == 0 {
            return sample;
        }

        let mut rng = rand::thread_rng();
        let count = self.segments.len();
        let start = match key_hint {
            Some(key) => self.segment_index(key),
            None => rng.gen_range(0..count),
        };

        for i in 0..count {
            let entries = self.segments[(start + i) & self.mask].entries.read();
            if entries.is_empty() {
                continue;
            }
            let skip = rng.gen_range(0..entries.len());
            for (key, substitute) in entries.iter().skip(skip).chain(entries.iter().take(skip)) {
                if filter(substitute) {
                    sample.push((key.clone(), substitute.clone()));
                    if sample.len() >= size {
                        return sample;
                    }
                }
            }
        }
        sample
    }

    fn lock_for(&self, key: &K) -> SegmentLock {
        self.segment(key).lock.clone()
    }

    fn clear(&self) {
        for segment in self.segments.iter() {
            segment.entries.write().clear();
        }
    }
}
