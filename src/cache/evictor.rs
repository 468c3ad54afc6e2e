//! Sampling eviction: picks victims from a bounded random sample instead of
//! maintaining a global ordering touched on every access.
//!
//! - Memory victims: caching markers holding a decoded copy, ranked by a
//!   pluggable [`EvictionPolicy`]. The victim is demoted, not removed.
//! - Disk victims: markers with no cached copy, lowest hit count first
//!   (ties keep sample order). The victim is removed from the index.

use std::cmp::Ordering;
use std::fmt::Debug;

use crate::cache::substitute::{EntryStats, Substitute};
use crate::config::EvictionConfig;

/// Ranks two entries for eviction. `Ordering::Less` means `a` is the better
/// victim.
pub trait EvictionPolicy: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn compare(&self, a: &EntryStats, b: &EntryStats) -> Ordering;
}

/// Evict the entry that was read longest ago.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastRecentlyUsed;

impl EvictionPolicy for LeastRecentlyUsed {
    fn name(&self) -> &'static str {
        "LRU"
    }

    fn compare(&self, a: &EntryStats, b: &EntryStats) -> Ordering {
        a.last_accessed_at.cmp(&b.last_accessed_at)
    }
}

/// A sampled entry chosen for eviction.
#[derive(Debug)]
pub struct EvictionCandidate<K, V> {
    pub key: K,
    pub substitute: Substitute<K, V>,
}

/// Sampling parameters shared by both eviction paths.
#[derive(Debug, Clone)]
pub struct Evictor {
    config: EvictionConfig,
}

impl Evictor {
    pub fn new(config: EvictionConfig) -> Self {
        Self { config }
    }

    /// Sample size for a population of `population` eligible entries.
    pub fn sample_size(&self, population: usize) -> usize {
        self.config.sample_size.min(population)
    }

    /// Eviction attempts allowed per capacity check.
    pub fn max_attempts(&self) -> usize {
        self.config.max_evictions_per_put
    }

    /// Entries eligible for memory eviction.
    pub fn memory_eligible<K, V>(substitute: &Substitute<K, V>) -> bool {
        matches!(substitute, Substitute::Caching(c) if c.is_cached())
    }

    /// Entries eligible for disk eviction.
    pub fn disk_eligible<K, V>(substitute: &Substitute<K, V>) -> bool {
        substitute.is_disk_only()
    }

    /// Least valuable member of `sample` according to `policy`.
    pub fn select_memory_victim<K, V>(
        &self,
        policy: &dyn EvictionPolicy,
        sample: Vec<(K, Substitute<K, V>)>,
    ) -> Option<EvictionCandidate<K, V>> {
        sample
            .into_iter()
            .filter(|(_, s)| Self::memory_eligible(s))
            .map(|(key, substitute)| (substitute.stats(), key, substitute))
            .reduce(|best, next| {
                if policy.compare(&next.0, &best.0) == Ordering::Less {
                    next
                } else {
                    best
                }
            })
            .map(|(_, key, substitute)| EvictionCandidate { key, substitute })
    }

    /// Member of `sample` with the lowest hit count; the earliest wins ties.
    pub fn select_disk_victim<K, V>(
        &self,
        sample: Vec<(K, Substitute<K, V>)>,
    ) -> Option<EvictionCandidate<K, V>> {
        sample
            .into_iter()
            .filter(|(_, s)| Self::disk_eligible(s))
            .min_by_key(|(_, s)| s.stats().hit_count)
            .map(|(key, substitute)| EvictionCandidate { key, substitute })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cache::element::Element;
    use crate::cache::substitute::{CachingMarker, Marker, OwnerId, Placeholder};
    use crate::transfer::allocator::Region;

    fn marker(key: u32, hits: u64) -> (u32, Substitute<u32, u32>) {
        let e = Element::new(key, key).with_hit_count(hits);
        let m = Marker::new(&e, Region::new(key as u64 * 10, 10), OwnerId::new());
        (key, Substitute::Marker(Arc::new(m)))
    }

    fn cached(key: u32, last_access: u64) -> (u32, Substitute<u32, u32>) {
        let mut e = Element::new(key, key);
        e.last_accessed_at = last_access;
        let m = Marker::new(&e, Region::new(key as u64 * 10, 10), OwnerId::new());
        let c = CachingMarker::new(m, Some(Arc::new(e)));
        (key, Substitute::Caching(Arc::new(c)))
    }

    #[test]
    fn test_disk_victim_lowest_hits() {
        let evictor = Evictor::new(EvictionConfig::default());
        let sample = vec![marker(0, 5), marker(1, 1), marker(2, 3)];

        let victim = evictor.select_disk_victim(sample).unwrap();
        assert_eq!(victim.key, 1);
    }

    #[test]
    fn test_disk_victim_ties_keep_sample_order() {
        let evictor = Evictor::new(EvictionConfig::default());
        let sample = vec![marker(7, 2), marker(3, 2), marker(9, 2)];

        assert_eq!(evictor.select_disk_victim(sample).unwrap().key, 7);
    }

    #[test]
    fn test_disk_victim_skips_cached_entries() {
        let evictor = Evictor::new(EvictionConfig::default());
        let sample = vec![cached(0, 0), marker(1, 100)];

        assert_eq!(evictor.select_disk_victim(sample).unwrap().key, 1);
    }

    #[test]
    fn test_memory_victim_uses_policy() {
        let evictor = Evictor::new(EvictionConfig::default());
        let sample = vec![cached(0, 300), cached(1, 100), cached(2, 200), marker(3, 0)];

        let victim = evictor
            .select_memory_victim(&LeastRecentlyUsed, sample)
            .unwrap();
        assert_eq!(victim.key, 1);
    }

    #[test]
    fn test_memory_victim_ignores_placeholders() {
        let evictor = Evictor::new(EvictionConfig::default());
        let p = Substitute::Placeholder(Arc::new(Placeholder::new(
            Element::new(5u32, 5u32),
            OwnerId::new(),
        )));

        assert!(evictor
            .select_memory_victim(&LeastRecentlyUsed, vec![(5, p)])
            .is_none());
    }

    #[test]
    fn test_sample_size_bounded_by_population() {
        let evictor = Evictor::new(EvictionConfig::default());
        assert_eq!(evictor.sample_size(3), 3);
        assert_eq!(evictor.sample_size(1_000), 30);
    }
}
