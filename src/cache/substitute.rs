//! Substitutes: what the index holds for an entry owned by the disk tier.
//!
//! An entry is either a [`Placeholder`] (value still in memory, write
//! pending) or a marker pointing at its bytes in the data file. Persistent
//! stores use [`CachingMarker`], which can additionally keep the decoded
//! element around as a read-through copy.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::element::Element;
use crate::transfer::allocator::Region;

/// Identity of the store that owns a substitute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(Uuid);

impl OwnerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Marker metadata as stored in the index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerMeta {
    pub region: Region,
    pub hit_count: u64,
    pub last_accessed_at: u64,
    pub expires_at: Option<u64>,
}

/// Access statistics consulted by eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStats {
    pub hit_count: u64,
    pub last_accessed_at: u64,
    pub expires_at: Option<u64>,
}

const PENDING: u8 = 0;
const CLAIMED: u8 = 1;
const CANCELLED: u8 = 2;

/// An element queued for its disk write.
#[derive(Debug)]
pub struct Placeholder<K, V> {
    element: Arc<Element<K, V>>,
    owner: OwnerId,
    state: AtomicU8,
}

impl<K, V> Placeholder<K, V> {
    pub fn new(element: Element<K, V>, owner: OwnerId) -> Self {
        Self {
            element: Arc::new(element),
            owner,
            state: AtomicU8::new(PENDING),
        }
    }

    pub fn key(&self) -> &K {
        &self.element.key
    }

    pub fn element(&self) -> &Arc<Element<K, V>> {
        &self.element
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Claim the write. Only the first caller gets `true`.
    pub fn begin_write(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Cancel a write that has not started yet.
    pub fn cancel(&self) {
        let _ = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

/// Location and metadata of an element in the data file.
#[derive(Debug)]
pub struct Marker<K> {
    key: K,
    region: Region,
    owner: OwnerId,
    hit_count: AtomicU64,
    last_accessed_at: AtomicU64,
    expires_at: Option<u64>,
}

impl<K> Marker<K> {
    pub fn new<V>(element: &Element<K, V>, region: Region, owner: OwnerId) -> Self
    where
        K: Clone,
    {
        Self {
            key: element.key.clone(),
            region,
            owner,
            hit_count: AtomicU64::new(element.hit_count),
            last_accessed_at: AtomicU64::new(element.last_accessed_at),
            expires_at: element.expires_at,
        }
    }

    /// Rebuild a marker from persisted metadata, owned by `owner`.
    pub fn from_meta(key: K, meta: MarkerMeta, owner: OwnerId) -> Self {
        Self {
            key,
            region: meta.region,
            owner,
            hit_count: AtomicU64::new(meta.hit_count),
            last_accessed_at: AtomicU64::new(meta.last_accessed_at),
            expires_at: meta.expires_at,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub fn last_accessed_at(&self) -> u64 {
        self.last_accessed_at.load(Ordering::Relaxed)
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.expires_at
    }

    /// Record a read.
    pub fn hit(&self, now: u64) -> u64 {
        self.last_accessed_at.store(now, Ordering::Relaxed);
        self.hit_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn meta(&self) -> MarkerMeta {
        MarkerMeta {
            region: self.region,
            hit_count: self.hit_count(),
            last_accessed_at: self.last_accessed_at(),
            expires_at: self.expires_at,
        }
    }
}

/// A marker that can hold a decoded copy of its element.
#[derive(Debug)]
pub struct CachingMarker<K, V> {
    marker: Marker<K>,
    cached: Mutex<Option<Arc<Element<K, V>>>>,
    retired: AtomicBool,
}

impl<K, V> CachingMarker<K, V> {
    pub fn new(marker: Marker<K>, cached: Option<Arc<Element<K, V>>>) -> Self {
        Self {
            marker,
            cached: Mutex::new(cached),
            retired: AtomicBool::new(false),
        }
    }

    pub fn marker(&self) -> &Marker<K> {
        &self.marker
    }

    /// The cached copy, if any. The returned `Arc` stays valid after the
    /// slot is cleared.
    pub fn cached(&self) -> Option<Arc<Element<K, V>>> {
        self.cached.lock().clone()
    }

    pub fn is_cached(&self) -> bool {
        self.cached.lock().is_some()
    }

    /// Fill the slot. Returns `true` if it was empty. A retired marker
    /// never takes a copy.
    pub fn cache(&self, element: Arc<Element<K, V>>) -> bool {
        let mut slot = self.cached.lock();
        if self.retired.load(Ordering::Acquire) {
            return false;
        }
        slot.replace(element).is_none()
    }

    /// Empty the slot for good once the marker has left the index.
    pub fn retire(&self) -> Option<Arc<Element<K, V>>> {
        let mut slot = self.cached.lock();
        self.retired.store(true, Ordering::Release);
        slot.take()
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Empty the slot, returning what it held.
    pub fn flush(&self) -> Option<Arc<Element<K, V>>> {
        self.cached.lock().take()
    }

    /// The cached copy is authoritative for expiration while present.
    pub fn expires_at(&self) -> Option<u64> {
        match self.cached.lock().as_ref() {
            Some(element) => element.expires_at,
            None => self.marker.expires_at(),
        }
    }

    pub fn meta(&self) -> MarkerMeta {
        MarkerMeta {
            expires_at: self.expires_at(),
            ..self.marker.meta()
        }
    }
}

/// What the index stores for a disk-tier entry.
#[derive(Debug)]
pub enum Substitute<K, V> {
    Placeholder(Arc<Placeholder<K, V>>),
    Marker(Arc<Marker<K>>),
    Caching(Arc<CachingMarker<K, V>>),
}

impl<K, V> Clone for Substitute<K, V> {
    fn clone(&self) -> Self {
        match self {
            Substitute::Placeholder(p) => Substitute::Placeholder(p.clone()),
            Substitute::Marker(m) => Substitute::Marker(m.clone()),
            Substitute::Caching(c) => Substitute::Caching(c.clone()),
        }
    }
}

impl<K, V> Substitute<K, V> {
    /// Identity comparison: both sides refer to the same substitute instance.
    pub fn same(&self, other: &Substitute<K, V>) -> bool {
        match (self, other) {
            (Substitute::Placeholder(a), Substitute::Placeholder(b)) => Arc::ptr_eq(a, b),
            (Substitute::Marker(a), Substitute::Marker(b)) => Arc::ptr_eq(a, b),
            (Substitute::Caching(a), Substitute::Caching(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn key(&self) -> &K {
        match self {
            Substitute::Placeholder(p) => p.key(),
            Substitute::Marker(m) => m.key(),
            Substitute::Caching(c) => c.marker().key(),
        }
    }

    pub fn owner(&self) -> OwnerId {
        match self {
            Substitute::Placeholder(p) => p.owner(),
            Substitute::Marker(m) => m.owner(),
            Substitute::Caching(c) => c.marker().owner(),
        }
    }

    /// The on-disk marker, if the entry has been written.
    pub fn marker(&self) -> Option<&Marker<K>> {
        match self {
            Substitute::Placeholder(_) => None,
            Substitute::Marker(m) => Some(m),
            Substitute::Caching(c) => Some(c.marker()),
        }
    }

    pub fn region(&self) -> Option<Region> {
        self.marker().map(Marker::region)
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Substitute::Placeholder(_))
    }

    /// Counted against the in-memory capacity.
    pub fn is_memory_resident(&self) -> bool {
        match self {
            Substitute::Placeholder(_) => true,
            Substitute::Marker(_) => false,
            Substitute::Caching(c) => c.is_cached(),
        }
    }

    /// A marker whose value lives only on disk.
    pub fn is_disk_only(&self) -> bool {
        match self {
            Substitute::Placeholder(_) => false,
            Substitute::Marker(_) => true,
            Substitute::Caching(c) => !c.is_cached(),
        }
    }

    pub fn expires_at(&self) -> Option<u64> {
        match self {
            Substitute::Placeholder(p) => p.element().expires_at,
            Substitute::Marker(m) => m.expires_at(),
            Substitute::Caching(c) => c.expires_at(),
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }

    pub fn stats(&self) -> EntryStats {
        match self {
            Substitute::Placeholder(p) => EntryStats {
                hit_count: p.element().hit_count,
                last_accessed_at: p.element().last_accessed_at,
                expires_at: p.element().expires_at,
            },
            Substitute::Marker(m) => EntryStats {
                hit_count: m.hit_count(),
                last_accessed_at: m.last_accessed_at(),
                expires_at: m.expires_at(),
            },
            Substitute::Caching(c) => EntryStats {
                hit_count: c.marker().hit_count(),
                last_accessed_at: c.marker().last_accessed_at(),
                expires_at: c.expires_at(),
            },
        }
    }

    /// Metadata for the index file; `None` for placeholders.
    pub fn meta(&self) -> Option<MarkerMeta> {
        match self {
            Substitute::Placeholder(_) => None,
            Substitute::Marker(m) => Some(m.meta()),
            Substitute::Caching(c) => Some(c.meta()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(key: &str) -> Element<String, u32> {
        Element::new(key.to_string(), 7).with_hit_count(3)
    }

    #[test]
    fn test_placeholder_write_claim() {
        let p = Placeholder::new(element("a"), OwnerId::new());
        assert!(p.begin_write());
        assert!(!p.begin_write());

        // Cancelling after the write was claimed has no effect.
        p.cancel();
        assert!(!p.is_cancelled());

        let q = Placeholder::new(element("b"), OwnerId::new());
        q.cancel();
        assert!(q.is_cancelled());
        assert!(!q.begin_write());
    }

    #[test]
    fn test_identity_comparison() {
        let owner = OwnerId::new();
        let a: Substitute<String, u32> =
            Substitute::Placeholder(Arc::new(Placeholder::new(element("a"), owner)));
        let b: Substitute<String, u32> =
            Substitute::Placeholder(Arc::new(Placeholder::new(element("a"), owner)));

        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
    }

    #[test]
    fn test_marker_hits() {
        let e = element("a");
        let marker = Marker::new(&e, Region::new(0, 10), OwnerId::new());
        assert_eq!(marker.hit_count(), 3);
        assert_eq!(marker.hit(42), 4);
        assert_eq!(marker.last_accessed_at(), 42);
        assert_eq!(marker.meta().hit_count, 4);
    }

    #[test]
    fn test_cached_slot_is_authoritative_for_expiry() {
        let stored = element("a").with_expiry(Some(1_000));
        let refreshed = Arc::new(element("a").with_expiry(Some(5_000)));
        let caching = CachingMarker::new(
            Marker::new(&stored, Region::new(0, 10), OwnerId::new()),
            Some(refreshed),
        );
        assert_eq!(caching.expires_at(), Some(5_000));
        assert_eq!(caching.meta().expires_at, Some(5_000));

        let flushed = caching.flush().unwrap();
        assert_eq!(flushed.expires_at, Some(5_000));
        assert_eq!(caching.expires_at(), Some(1_000));
    }

    #[test]
    fn test_residency_classification() {
        let e = element("a");
        let owner = OwnerId::new();
        let caching = Arc::new(CachingMarker::new(
            Marker::new(&e, Region::new(0, 10), owner),
            None,
        ));
        let sub: Substitute<String, u32> = Substitute::Caching(caching.clone());
        assert!(sub.is_disk_only());
        assert!(!sub.is_memory_resident());

        assert!(caching.cache(Arc::new(e.clone())));
        assert!(!caching.cache(Arc::new(e)));
        assert!(sub.is_memory_resident());
        assert!(!sub.is_disk_only());
    }

    #[test]
    fn test_retired_marker_refuses_copies() {
        let e = element("a");
        let caching = CachingMarker::new(
            Marker::new(&e, Region::new(0, 10), OwnerId::new()),
            Some(Arc::new(e.clone())),
        );

        assert!(caching.retire().is_some());
        assert!(caching.is_retired());
        assert!(!caching.cache(Arc::new(e)));
        assert!(!caching.is_cached());
        assert!(caching.retire().is_none());
    }
}
